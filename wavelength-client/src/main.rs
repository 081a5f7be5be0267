use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;
use uuid::Uuid;
use wavelength_client::{
    EventSubscription, SessionEvent, SessionHandle,
    config::{self, ClientConfig},
    events::FileProgressStage,
    ptt::{NullAudio, PttState},
    spawn_session,
    transport::WebSocketConnector,
};

#[derive(Parser, Debug)]
#[command(name = "wavelength-client", about = "Headless wavelength chat client")]
struct ClientArgs {
    /// Defaults to `client.json` in the data directory.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    relay_host: Option<String>,
    #[arg(long)]
    relay_port: Option<u16>,
    /// Log to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a new wavelength.
    Create {
        frequency: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Join an existing wavelength.
    Join {
        frequency: String,
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

fn init_logging(log_file: Option<&PathBuf>) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .init();
}

fn resolve_config(args: &ClientArgs) -> ClientConfig {
    let path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let mut config = config::load_or_default(&path);
    if let Some(host) = &args.relay_host {
        config.relay_host = host.clone();
    }
    if let Some(port) = args.relay_port {
        config.relay_port = port;
    }
    config
}

fn describe(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::WavelengthCreated { frequency } => format!("* created wavelength {frequency}"),
        SessionEvent::WavelengthJoined { frequency } => format!("* joined wavelength {frequency}"),
        SessionEvent::WavelengthLeft { frequency } => format!("* left wavelength {frequency}"),
        SessionEvent::WavelengthClosed { frequency } => format!("* wavelength {frequency} closed"),
        SessionEvent::ConnectionError { frequency, error } => {
            format!("! connection error on {frequency}: {error}")
        }
        SessionEvent::AuthenticationFailed { frequency, reason } => {
            format!("! authentication failed on {frequency}: {reason:?}")
        }
        SessionEvent::UserKicked { frequency, reason } => format!(
            "! removed from {frequency}: {}",
            reason.as_deref().unwrap_or("no reason given")
        ),
        SessionEvent::MessageReceived { message, .. } => {
            let marker = if message.is_self { " (you)" } else { "" };
            match &message.attachment {
                Some(attachment) => format!(
                    "<{}{marker}> [{} {}]",
                    message.sender_label,
                    attachment.kind,
                    attachment.name.as_deref().unwrap_or("attachment")
                ),
                None => format!("<{}{marker}> {}", message.sender_label, message.content),
            }
        }
        SessionEvent::PresenceChanged {
            user_id, joined, ..
        } => {
            let who = user_id.as_deref().unwrap_or("someone");
            if *joined {
                format!("* {who} joined")
            } else {
                format!("* {who} left")
            }
        }
        SessionEvent::SystemNotice { message, .. } => format!("! relay: {message}"),
        SessionEvent::FileProgress { progress_id, stage } => match stage {
            FileProgressStage::Sent => format!("* file {progress_id} sent"),
            FileProgressStage::Failed(reason) => format!("! file {progress_id} failed: {reason}"),
            _ => return None,
        },
        SessionEvent::PttGranted { .. } => "* you have the floor".to_owned(),
        SessionEvent::PttDenied { reason, .. } => format!("! floor denied: {reason}"),
        SessionEvent::PttStartReceiving { sender, .. } => format!("* {sender} is talking"),
        SessionEvent::PttStopReceiving { .. } => "* floor is free".to_owned(),
        SessionEvent::MessageSent { .. }
        | SessionEvent::LocalAmplitude { .. }
        | SessionEvent::RemoteAmplitude { .. }
        | SessionEvent::AudioReceived { .. }
        | SessionEvent::Registry(_) => return None,
    };
    Some(line)
}

async fn print_events(mut events: EventSubscription) {
    while let Some(event) = events.recv().await {
        if let Some(line) = describe(&event) {
            println!("{line}");
        }
    }
}

/// Returns false when the user asked to quit.
async fn run_command(session: &SessionHandle, line: &str) -> bool {
    let (command, rest) = line
        .split_once(' ')
        .map(|(command, rest)| (command, rest.trim()))
        .unwrap_or((line, ""));

    let result = match command {
        "/quit" => return false,
        "/file" if !rest.is_empty() => {
            let progress_id = Uuid::new_v4().to_string();
            session.send_file(rest, &progress_id).await
        }
        "/ptt" => match session.ptt_state().await {
            Ok(PttState::Idle) => session.press_ptt().await,
            Ok(_) => session.release_ptt().await,
            Err(err) => Err(err),
        },
        "/leave" | "/close" => match session.active_wavelength().await {
            Ok(Some(frequency)) if command == "/leave" => session.leave_wavelength(&frequency).await,
            Ok(Some(frequency)) => session.close_wavelength(&frequency).await,
            Ok(None) => {
                println!("! no active wavelength");
                Ok(())
            }
            Err(err) => Err(err),
        },
        _ if command.starts_with('/') => {
            println!("! commands: /file <path>, /ptt, /leave, /close, /quit");
            Ok(())
        }
        _ => session.send_text(line).await.map(|_| ()),
    };

    if let Err(err) = result {
        println!("! {err}");
    }
    true
}

#[tokio::main]
async fn main() {
    let args = ClientArgs::parse();
    init_logging(args.log_file.as_ref());

    let config = resolve_config(&args);
    info!(relay = %config.relay_url(), "wavelength client starting");

    let connector = Arc::new(WebSocketConnector::new(&config));
    let (session, events, task) = spawn_session(config, connector, Box::new(NullAudio));
    let printer = tokio::spawn(print_events(events.subscribe()));

    let started = match &args.command {
        Command::Create {
            frequency,
            password,
        } => session.create_wavelength(frequency, password.as_deref()).await,
        Command::Join {
            frequency,
            password,
        } => session.join_wavelength(frequency, password.as_deref()).await,
    };
    if let Err(err) = started {
        error!("could not start session: {err}");
        std::process::exit(1);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if !run_command(&session, line).await {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("stdin read failed: {err}");
                break;
            }
        }
    }

    if let Err(err) = session.shutdown().await {
        warn!("shutdown: {err}");
    }
    let _ = task.await;
    printer.abort();
}
