use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info};
use wavelength_core::{Frequency, MessageId};

use crate::{
    config::ClientConfig,
    coordinator::{CoordinatorInbox, SessionCoordinator},
    error::SessionError,
    events::EventBus,
    ptt::{AudioBackend, PttState},
    transport::Connector,
};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

#[derive(Debug)]
enum SessionCommand {
    Create {
        frequency: String,
        password: Option<String>,
        reply: Reply<()>,
    },
    Join {
        frequency: String,
        password: Option<String>,
        reply: Reply<()>,
    },
    Leave {
        frequency: String,
        reply: Reply<()>,
    },
    Close {
        frequency: String,
        reply: Reply<()>,
    },
    SetActive {
        frequency: Option<String>,
        reply: Reply<()>,
    },
    Active {
        reply: oneshot::Sender<Option<Frequency>>,
    },
    Frequencies {
        reply: oneshot::Sender<Vec<Frequency>>,
    },
    SendText {
        content: String,
        reply: Reply<MessageId>,
    },
    SendFile {
        path: PathBuf,
        progress_id: String,
        reply: Reply<()>,
    },
    PressPtt {
        reply: Reply<()>,
    },
    ReleasePtt {
        reply: Reply<()>,
    },
    PttState {
        reply: oneshot::Sender<PttState>,
    },
    CapturedAudio {
        pcm: Bytes,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap to clone. Every call fails with [`SessionError::Stopped`] once the
/// loop has exited.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

/// Starts the session loop on the current runtime.
pub fn spawn_session(
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    audio: Box<dyn AudioBackend>,
) -> (SessionHandle, EventBus, JoinHandle<()>) {
    let events = EventBus::new();
    let (coordinator, inbox) =
        SessionCoordinator::new(config, connector, audio, events.clone(), Handle::current());
    let (commands, command_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_session(coordinator, inbox, command_rx));
    (SessionHandle { commands }, events, task)
}

async fn run_session(
    mut coordinator: SessionCoordinator,
    mut inbox: CoordinatorInbox,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) {
    info!(relay = %coordinator.config().relay_url(), "session loop started");
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    coordinator.shutdown();
                    break;
                };
                if let Some(done) = dispatch(&mut coordinator, command) {
                    let _ = done.send(());
                    break;
                }
            }
            Some(event) = inbox.transport.recv() => coordinator.handle_transport_event(event),
            Some(prepared) = inbox.deliveries.recv() => coordinator.deliver_file(prepared),
        }
    }
    info!("session loop stopped");
}

/// Returns the shutdown acknowledgement once the loop should exit.
fn dispatch(
    coordinator: &mut SessionCoordinator,
    command: SessionCommand,
) -> Option<oneshot::Sender<()>> {
    match command {
        SessionCommand::Create {
            frequency,
            password,
            reply,
        } => {
            let _ = reply.send(coordinator.create_wavelength(&frequency, password.as_deref()));
        }
        SessionCommand::Join {
            frequency,
            password,
            reply,
        } => {
            let _ = reply.send(coordinator.join_wavelength(&frequency, password.as_deref()));
        }
        SessionCommand::Leave { frequency, reply } => {
            let _ = reply.send(coordinator.leave_wavelength(&frequency));
        }
        SessionCommand::Close { frequency, reply } => {
            let _ = reply.send(coordinator.close_wavelength(&frequency));
        }
        SessionCommand::SetActive { frequency, reply } => {
            let _ = reply.send(coordinator.set_active_wavelength(frequency.as_deref()));
        }
        SessionCommand::Active { reply } => {
            let _ = reply.send(coordinator.active_wavelength());
        }
        SessionCommand::Frequencies { reply } => {
            let _ = reply.send(coordinator.registry().frequencies());
        }
        SessionCommand::SendText { content, reply } => {
            let _ = reply.send(coordinator.send_text(&content));
        }
        SessionCommand::SendFile {
            path,
            progress_id,
            reply,
        } => {
            let _ = reply.send(coordinator.send_file(path, progress_id));
        }
        SessionCommand::PressPtt { reply } => {
            let _ = reply.send(coordinator.press_ptt());
        }
        SessionCommand::ReleasePtt { reply } => {
            let _ = reply.send(coordinator.release_ptt());
        }
        SessionCommand::PttState { reply } => {
            let _ = reply.send(coordinator.ptt_state().clone());
        }
        SessionCommand::CapturedAudio { pcm } => {
            if let Err(err) = coordinator.push_captured_audio(pcm) {
                debug!("captured audio dropped: {err}");
            }
        }
        SessionCommand::Shutdown { reply } => {
            coordinator.shutdown();
            return Some(reply);
        }
    }
    None
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::Stopped)?;
        response.await.map_err(|_| SessionError::Stopped)
    }

    pub async fn create_wavelength(
        &self,
        frequency: &str,
        password: Option<&str>,
    ) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Create {
            frequency: frequency.to_owned(),
            password: password.map(str::to_owned),
            reply,
        })
        .await?
    }

    pub async fn join_wavelength(
        &self,
        frequency: &str,
        password: Option<&str>,
    ) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Join {
            frequency: frequency.to_owned(),
            password: password.map(str::to_owned),
            reply,
        })
        .await?
    }

    pub async fn leave_wavelength(&self, frequency: &str) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Leave {
            frequency: frequency.to_owned(),
            reply,
        })
        .await?
    }

    pub async fn close_wavelength(&self, frequency: &str) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Close {
            frequency: frequency.to_owned(),
            reply,
        })
        .await?
    }

    pub async fn set_active_wavelength(&self, frequency: Option<&str>) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::SetActive {
            frequency: frequency.map(str::to_owned),
            reply,
        })
        .await?
    }

    pub async fn active_wavelength(&self) -> Result<Option<Frequency>, SessionError> {
        self.request(|reply| SessionCommand::Active { reply }).await
    }

    pub async fn frequencies(&self) -> Result<Vec<Frequency>, SessionError> {
        self.request(|reply| SessionCommand::Frequencies { reply })
            .await
    }

    pub async fn send_text(&self, content: &str) -> Result<MessageId, SessionError> {
        self.request(|reply| SessionCommand::SendText {
            content: content.to_owned(),
            reply,
        })
        .await?
    }

    pub async fn send_file(
        &self,
        path: impl Into<PathBuf>,
        progress_id: &str,
    ) -> Result<(), SessionError> {
        let path = path.into();
        self.request(|reply| SessionCommand::SendFile {
            path,
            progress_id: progress_id.to_owned(),
            reply,
        })
        .await?
    }

    pub async fn press_ptt(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::PressPtt { reply })
            .await?
    }

    pub async fn release_ptt(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::ReleasePtt { reply })
            .await?
    }

    pub async fn ptt_state(&self) -> Result<PttState, SessionError> {
        self.request(|reply| SessionCommand::PttState { reply })
            .await
    }

    /// Fire and forget; audio that arrives while not transmitting is dropped.
    pub fn push_captured_audio(&self, pcm: Bytes) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::CapturedAudio { pcm })
            .map_err(|_| SessionError::Stopped)
    }

    /// Leaves every wavelength and stops the loop.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Shutdown { reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::{
        events::{EventKind, SessionEvent},
        ptt::NullAudio,
        transport::MemoryConnector,
    };

    #[tokio::test]
    async fn handle_drives_the_loop() {
        let connector = Arc::new(MemoryConnector::new());
        let (handle, events, task) =
            spawn_session(ClientConfig::default(), connector.clone(), Box::new(NullAudio));
        let mut lifecycle = events.subscribe_kinds(&[EventKind::Lifecycle]);

        handle
            .create_wavelength("42", None)
            .await
            .expect("create accepted");
        assert!(matches!(
            handle.create_wavelength("42", None).await,
            Err(SessionError::DuplicateRequest(_))
        ));

        let connection = connector.last().expect("connection opened");
        connection.emit_connected();
        connection.emit_text(r#"{"type":"register_result","success":true}"#);

        let event = timeout(Duration::from_secs(5), lifecycle.recv())
            .await
            .expect("event in time");
        assert_eq!(
            event,
            Some(SessionEvent::WavelengthCreated {
                frequency: "42".to_owned()
            })
        );
        assert_eq!(
            handle.active_wavelength().await.expect("loop alive").as_deref(),
            Some("42")
        );
        assert_eq!(
            handle.frequencies().await.expect("loop alive"),
            vec!["42".to_owned()]
        );

        handle.shutdown().await.expect("shutdown acknowledged");
        timeout(Duration::from_secs(5), task)
            .await
            .expect("loop exits")
            .expect("loop did not panic");
        assert!(connection.is_closed());
        assert!(matches!(
            handle.send_text("late").await,
            Err(SessionError::Stopped)
        ));
    }
}
