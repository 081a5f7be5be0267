use std::{
    fs::File,
    io::Read,
    path::PathBuf,
    sync::{Arc, Weak},
};

use base64::Engine as _;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wavelength_core::{
    ChatMessage, Envelope, Frequency, FrequencyRef, MessageId, Timestamp, classify_extension,
    encode_envelope,
};

use crate::{
    attachment_queue::AttachmentQueueManager,
    context::SessionContext,
    error::SessionError,
    events::{EventBus, FileProgressStage, SessionEvent},
    transport::{Connection, ConnectionId},
};

pub const FILE_CHUNK_BYTES: usize = 1024 * 1024;
pub const MAX_ATTACHMENT_BYTES: u64 = 16 * 1024 * 1024;
const PROGRESS_STEP_PERCENT: u64 = 5;

/// An encoded `send_file` frame waiting for the session loop to transmit it.
#[derive(Debug)]
pub struct PreparedFile {
    pub frequency: Frequency,
    pub connection_id: ConnectionId,
    pub progress_id: String,
    pub message_id: MessageId,
    pub text: String,
}

#[derive(Debug, Clone)]
struct FileJob {
    frequency: Frequency,
    connection_id: ConnectionId,
    sender_id: String,
    message_id: MessageId,
    progress_id: String,
    path: PathBuf,
}

#[derive(Debug)]
pub struct MessageService {
    queue: AttachmentQueueManager,
    deliveries: mpsc::UnboundedSender<PreparedFile>,
}

struct Target {
    sender_id: String,
    connection: Arc<dyn Connection>,
}

fn target(ctx: &SessionContext, frequency: &str) -> Result<Target, SessionError> {
    let info = ctx
        .registry
        .get(frequency)
        .ok_or_else(|| SessionError::UnknownWavelength(frequency.to_owned()))?;
    let connection = info
        .connection
        .as_ref()
        .and_then(Weak::upgrade)
        .filter(|connection| connection.is_valid())
        .ok_or_else(|| SessionError::InvalidTransport(frequency.to_owned()))?;
    let sender_id = if info.is_host {
        info.host_id.clone()
    } else {
        info.client_id.clone()
    };
    Ok(Target {
        sender_id,
        connection,
    })
}

fn active_frequency(ctx: &SessionContext) -> Result<Frequency, SessionError> {
    ctx.registry
        .active()
        .map(str::to_owned)
        .ok_or(SessionError::NoActiveWavelength)
}

impl MessageService {
    pub fn new(
        queue: AttachmentQueueManager,
        deliveries: mpsc::UnboundedSender<PreparedFile>,
    ) -> Self {
        Self {
            queue,
            deliveries,
        }
    }

    pub fn send_text(
        &mut self,
        ctx: &mut SessionContext,
        content: &str,
    ) -> Result<MessageId, SessionError> {
        let frequency = active_frequency(ctx)?;
        let target = target(ctx, &frequency)?;
        let message_id = ctx.handler.generate_message_id();

        let envelope = Envelope::SendMessage(ChatMessage {
            frequency: Some(frequency.clone()),
            sender_id: Some(target.sender_id),
            message_id: Some(message_id.clone()),
            timestamp: Some(Timestamp::Millis(Utc::now().timestamp_millis())),
            content: Some(content.to_owned()),
            ..ChatMessage::default()
        });
        ctx.send_envelope(target.connection.as_ref(), &envelope)?;

        ctx.handler.remember_sent(&message_id, content);

        debug!(frequency = %frequency, message_id = %message_id, "message sent");
        ctx.events.publish(SessionEvent::MessageSent {
            frequency,
            message_id: message_id.clone(),
        });
        Ok(message_id)
    }

    /// Queues `path` for reading and encoding off the session loop. Progress is
    /// reported as `FileProgress` events tagged with `progress_id`.
    pub fn send_file(
        &mut self,
        ctx: &mut SessionContext,
        path: PathBuf,
        progress_id: String,
    ) -> Result<(), SessionError> {
        let frequency = active_frequency(ctx)?;
        let target = target(ctx, &frequency)?;
        let job = FileJob {
            frequency,
            connection_id: target.connection.id(),
            sender_id: target.sender_id,
            message_id: ctx.handler.generate_message_id(),
            progress_id,
            path,
        };

        info!(frequency = %job.frequency, path = %job.path.display(), "file queued");
        let events = ctx.events.clone();
        let deliveries = self.deliveries.clone();
        self.queue.add_task(move || {
            let progress = |stage: FileProgressStage| {
                events.publish(SessionEvent::FileProgress {
                    progress_id: job.progress_id.clone(),
                    stage,
                })
            };
            match prepare_file(&job, &events) {
                Ok(text) => {
                    progress(FileProgressStage::Sending);
                    let prepared = PreparedFile {
                        frequency: job.frequency.clone(),
                        connection_id: job.connection_id,
                        progress_id: job.progress_id.clone(),
                        message_id: job.message_id.clone(),
                        text,
                    };
                    if deliveries.send(prepared).is_err() {
                        progress(FileProgressStage::Failed("session stopped".to_owned()));
                    }
                }
                Err(reason) => {
                    warn!(path = %job.path.display(), "file not sent: {reason}");
                    progress(FileProgressStage::Failed(reason));
                }
            }
        });
        Ok(())
    }

    /// Transmits a prepared file if its wavelength is still on the same connection.
    pub fn deliver(&mut self, ctx: &mut SessionContext, prepared: PreparedFile) {
        let connection = ctx
            .registry
            .get(&prepared.frequency)
            .filter(|info| info.connection_id == Some(prepared.connection_id))
            .and_then(|info| info.connection.as_ref())
            .and_then(Weak::upgrade)
            .filter(|connection| connection.is_valid());

        let stage = match connection {
            None => {
                debug!(frequency = %prepared.frequency, "wavelength gone, prepared file discarded");
                FileProgressStage::Failed("wavelength is no longer connected".to_owned())
            }
            Some(connection) => match connection.send_text(prepared.text) {
                Ok(()) => {
                    ctx.events.publish(SessionEvent::MessageSent {
                        frequency: prepared.frequency.clone(),
                        message_id: prepared.message_id,
                    });
                    FileProgressStage::Sent
                }
                Err(err) => FileProgressStage::Failed(err.to_string()),
            },
        };
        ctx.events.publish(SessionEvent::FileProgress {
            progress_id: prepared.progress_id,
            stage,
        });
    }

    pub fn send_ptt_request(
        &self,
        ctx: &SessionContext,
        frequency: &str,
    ) -> Result<(), SessionError> {
        let target = target(ctx, frequency)?;
        ctx.send_envelope(
            target.connection.as_ref(),
            &Envelope::RequestPtt(FrequencyRef::new(frequency)),
        )
    }

    pub fn send_ptt_release(
        &self,
        ctx: &SessionContext,
        frequency: &str,
    ) -> Result<(), SessionError> {
        let target = target(ctx, frequency)?;
        ctx.send_envelope(
            target.connection.as_ref(),
            &Envelope::ReleasePtt(FrequencyRef::new(frequency)),
        )
    }

    /// One binary frame of raw PCM.
    pub fn send_audio(
        &self,
        ctx: &SessionContext,
        frequency: &str,
        pcm: Bytes,
    ) -> Result<(), SessionError> {
        let target = target(ctx, frequency)?;
        target
            .connection
            .send_binary(pcm)
            .map_err(|err| SessionError::Connection(err.to_string()))
    }
}

fn prepare_file(job: &FileJob, events: &EventBus) -> Result<String, String> {
    let progress = |stage: FileProgressStage| {
        events.publish(SessionEvent::FileProgress {
            progress_id: job.progress_id.clone(),
            stage,
        })
    };
    progress(FileProgressStage::Preparing);

    let mut file = File::open(&job.path).map_err(|err| format!("cannot open file: {err}"))?;
    let total = file
        .metadata()
        .map_err(|err| format!("cannot read file metadata: {err}"))?
        .len();
    if total == 0 {
        return Err("file is empty".to_owned());
    }
    if total > MAX_ATTACHMENT_BYTES {
        return Err(format!(
            "file is {total} bytes, the limit is {MAX_ATTACHMENT_BYTES} bytes"
        ));
    }
    let name = job
        .path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| "file name is not valid UTF-8".to_owned())?
        .to_owned();
    let extension = job
        .path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();

    let mut data = Vec::with_capacity(total as usize);
    let mut chunk = vec![0_u8; FILE_CHUNK_BYTES];
    let mut reported = 0_u64;
    loop {
        let read = file
            .read(&mut chunk)
            .map_err(|err| format!("read failed: {err}"))?;
        if read == 0 {
            break;
        }
        data.extend_from_slice(&chunk[..read]);
        let percent = (data.len() as u64 * 100 / total).min(100);
        if percent >= reported + PROGRESS_STEP_PERCENT {
            reported = percent;
            progress(FileProgressStage::Processing(percent as u8));
        }
    }

    progress(FileProgressStage::Encoding);
    let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
    let (kind, mime_type) = classify_extension(extension);

    let envelope = Envelope::SendFile(ChatMessage {
        frequency: Some(job.frequency.clone()),
        sender_id: Some(job.sender_id.clone()),
        message_id: Some(job.message_id.clone()),
        timestamp: Some(Timestamp::Millis(Utc::now().timestamp_millis())),
        has_attachment: true,
        attachment_type: Some(kind.as_str().to_owned()),
        attachment_mime_type: Some(mime_type),
        attachment_name: Some(name),
        attachment_data: Some(encoded),
        ..ChatMessage::default()
    });
    encode_envelope(&envelope).map_err(|err| err.to_string())
}
