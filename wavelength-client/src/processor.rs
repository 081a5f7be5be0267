use bytes::Bytes;
use tracing::{debug, warn};
use wavelength_core::{ChatMessage, Envelope, SystemCommand, UNKNOWN_SENDER, frequencies_match};

use crate::{
    attachment_store::AttachmentPayload,
    context::SessionContext,
    events::{AttachmentRef, ChatEvent, SessionEvent},
    ptt::PttController,
};

/// Work the coordinator must do after a frame was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Followup {
    WavelengthClosed,
    Kicked(Option<String>),
    /// An unexpected floor grant that has to be handed back.
    ReturnFloor(String),
}

pub fn process_text(
    ctx: &mut SessionContext,
    ptt: &mut PttController,
    frequency: &str,
    text: &str,
) -> Option<Followup> {
    let envelope = match ctx.handler.parse_message(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(frequency, "dropping frame: {err}");
            return None;
        }
    };

    if !frequencies_match(frequency, envelope.frequency()) {
        debug!(
            frequency,
            received = ?envelope.frequency(),
            kind = envelope.kind(),
            "dropping frame for another frequency"
        );
        return None;
    }

    if let Some(message_id) = envelope.message_id() {
        if ctx.handler.is_processed(message_id) {
            debug!(frequency, message_id, "duplicate message dropped");
            return None;
        }
        let message_id = message_id.to_owned();
        ctx.handler.mark_processed(&message_id);
    }

    match envelope {
        Envelope::Message(chat) | Envelope::SendMessage(chat) => {
            deliver_chat(ctx, frequency, chat);
            None
        }
        Envelope::SystemCommand(command) => system_command(ctx, frequency, command),
        Envelope::UserJoined(presence) => {
            ctx.events.publish(SessionEvent::PresenceChanged {
                frequency: frequency.to_owned(),
                user_id: presence.user_id,
                joined: true,
            });
            None
        }
        Envelope::UserLeft(presence) => {
            ctx.events.publish(SessionEvent::PresenceChanged {
                frequency: frequency.to_owned(),
                user_id: presence.user_id,
                joined: false,
            });
            None
        }
        Envelope::WavelengthClosed(_) => Some(Followup::WavelengthClosed),
        Envelope::PttGranted(_) => ptt.on_granted(frequency).map(Followup::ReturnFloor),
        Envelope::PttDenied(notice) => {
            ptt.on_denied(frequency, notice.reason.as_deref());
            None
        }
        Envelope::PttStartReceiving(notice) => {
            ptt.on_start_receiving(frequency, notice.sender_id.as_deref());
            None
        }
        Envelope::PttStopReceiving(_) => {
            ptt.on_stop_receiving(frequency);
            None
        }
        Envelope::AudioAmplitude(update) => {
            ptt.on_remote_amplitude(frequency, update.amplitude);
            None
        }
        Envelope::Error(notice) => {
            warn!(frequency, "relay reported an error: {}", notice.error);
            ctx.events.publish(SessionEvent::SystemNotice {
                frequency: frequency.to_owned(),
                message: notice.error,
            });
            None
        }
        other => {
            debug!(frequency, kind = other.kind(), "unexpected frame dropped");
            None
        }
    }
}

/// Binary frames are always raw PCM from the current speaker.
pub fn process_binary(ptt: &mut PttController, frequency: &str, data: Bytes) {
    ptt.on_remote_audio(frequency, data);
}

/// Display name for a chat sender.
pub fn sender_label(explicit: Option<&str>, sender_id: Option<&str>, host_id: &str) -> String {
    if let Some(name) = explicit.filter(|name| !name.trim().is_empty()) {
        return name.to_owned();
    }
    match sender_id.filter(|id| !id.is_empty()) {
        Some(id) if !host_id.is_empty() && id == host_id => "Host".to_owned(),
        Some(id) => format!("User {}", id.chars().take(5).collect::<String>()),
        None => UNKNOWN_SENDER.to_owned(),
    }
}

fn deliver_chat(ctx: &mut SessionContext, frequency: &str, mut chat: ChatMessage) {
    let host_id = ctx
        .registry
        .get(frequency)
        .map(|info| info.host_id.clone())
        .unwrap_or_default();

    let attachment = if chat.has_attachment {
        let inline = chat.has_inline_payload();
        let reference_id = chat.attachment_data.take().map(|data| {
            if inline {
                ctx.store.store(AttachmentPayload::Base64(data))
            } else {
                data
            }
        });
        Some(AttachmentRef {
            kind: chat
                .attachment_type
                .take()
                .unwrap_or_else(|| "file".to_owned()),
            mime_type: chat.attachment_mime_type.take(),
            name: chat.attachment_name.take(),
            reference_id,
        })
    } else {
        None
    };

    let sender_label = sender_label(chat.sender.as_deref(), chat.sender_id.as_deref(), &host_id);
    let is_self = chat.is_self
        || chat
            .message_id
            .as_deref()
            .is_some_and(|id| ctx.handler.sent_by_us(id));
    ctx.events.publish(SessionEvent::MessageReceived {
        frequency: frequency.to_owned(),
        message: ChatEvent {
            message_id: chat.message_id,
            sender_id: chat.sender_id,
            sender_label,
            content: chat.content.unwrap_or_default(),
            timestamp: chat.timestamp,
            is_self,
            attachment,
        },
    });
}

fn system_command(
    ctx: &mut SessionContext,
    frequency: &str,
    command: SystemCommand,
) -> Option<Followup> {
    match command.command.as_str() {
        "close_wavelength" => Some(Followup::WavelengthClosed),
        "kick_user" => {
            let own_id = ctx.registry.get(frequency).map(|info| info.client_id.as_str());
            match command.user_id {
                Some(target) if own_id != Some(target.as_str()) => {
                    ctx.events.publish(SessionEvent::PresenceChanged {
                        frequency: frequency.to_owned(),
                        user_id: Some(target),
                        joined: false,
                    });
                    None
                }
                _ => Some(Followup::Kicked(command.reason)),
            }
        }
        "ping" => None,
        other => {
            debug!(frequency, command = other, "unknown system command ignored");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ClientConfig,
        events::{EventBus, EventKind},
        ptt::{NullAudio, PttState},
        registry::WavelengthInfo,
    };

    fn context() -> (SessionContext, PttController) {
        let events = EventBus::new();
        let mut ctx = SessionContext::new(ClientConfig::default(), events.clone());
        let mut info = WavelengthInfo::new("7");
        info.host_id = "host-abcdef".to_owned();
        info.client_id = "guest-123456".to_owned();
        ctx.registry.add(info);
        (ctx, PttController::new(Box::new(NullAudio), events))
    }

    fn chat_frame(id: &str, frequency: &str, sender_id: &str) -> String {
        format!(
            r#"{{"type":"message","frequency":"{frequency}","senderId":"{sender_id}","messageId":"{id}","content":"hello"}}"#
        )
    }

    #[test]
    fn labels_prefer_explicit_sender() {
        assert_eq!(sender_label(Some("Alice"), Some("host"), "host"), "Alice");
        assert_eq!(sender_label(Some("  "), Some("host"), "host"), "Host");
        assert_eq!(sender_label(None, Some("abcdefgh"), "host"), "User abcde");
        assert_eq!(sender_label(None, Some("abc"), ""), "User abc");
        assert_eq!(sender_label(None, None, "host"), "Unknown");
    }

    #[test]
    fn duplicate_messages_are_delivered_once() {
        let (mut ctx, mut ptt) = context();
        let mut chat = ctx.events.subscribe_kinds(&[EventKind::Chat]);

        let frame = chat_frame("m-1", "7", "host-abcdef");
        assert_eq!(process_text(&mut ctx, &mut ptt, "7", &frame), None);
        assert_eq!(process_text(&mut ctx, &mut ptt, "7", &frame), None);

        let events = chat.drain();
        assert_eq!(events.len(), 1);
        let SessionEvent::MessageReceived { message, .. } = &events[0] else {
            panic!("expected a chat message, got {events:?}");
        };
        assert_eq!(message.sender_label, "Host");
        assert_eq!(message.content, "hello");
    }

    #[test]
    fn echo_of_our_own_message_is_flagged() {
        let (mut ctx, mut ptt) = context();
        let mut chat = ctx.events.subscribe_kinds(&[EventKind::Chat]);
        ctx.handler.remember_sent("m-mine", "hello");

        process_text(&mut ctx, &mut ptt, "7", &chat_frame("m-mine", "7", "guest-123456"));
        process_text(&mut ctx, &mut ptt, "7", &chat_frame("m-theirs", "7", "host-abcdef"));

        let flags: Vec<bool> = chat
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::MessageReceived { message, .. } => Some(message.is_self),
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![true, false]);
    }

    #[test]
    fn foreign_and_malformed_frames_are_dropped() {
        let (mut ctx, mut ptt) = context();
        let mut all = ctx.events.subscribe();

        process_text(&mut ctx, &mut ptt, "7", &chat_frame("m-1", "8", "x"));
        process_text(&mut ctx, &mut ptt, "7", "{not json");
        process_text(&mut ctx, &mut ptt, "7", r#"{"type":"mystery"}"#);
        assert!(all.drain().is_empty());

        // Numeric frequencies and the broadcast marker still match.
        process_text(
            &mut ctx,
            &mut ptt,
            "7",
            r#"{"type":"message","frequency":7,"messageId":"m-2","content":"n"}"#,
        );
        process_text(&mut ctx, &mut ptt, "7", &chat_frame("m-3", "-1", "x"));
        assert_eq!(all.drain().len(), 2);
    }

    #[test]
    fn inline_attachments_move_into_the_store() {
        let (mut ctx, mut ptt) = context();
        let mut chat = ctx.events.subscribe_kinds(&[EventKind::Chat]);
        let payload = "A".repeat(400);
        let frame = format!(
            r#"{{"type":"message","frequency":"7","messageId":"f-1","hasAttachment":true,"attachmentType":"image","attachmentMimeType":"image/png","attachmentName":"a.png","attachmentData":"{payload}"}}"#
        );

        process_text(&mut ctx, &mut ptt, "7", &frame);

        let events = chat.drain();
        let SessionEvent::MessageReceived { message, .. } = &events[0] else {
            panic!("expected a chat message, got {events:?}");
        };
        let attachment = message.attachment.as_ref().expect("attachment present");
        assert_eq!(attachment.kind, "image");
        let id = attachment.reference_id.as_deref().expect("store id");
        assert_ne!(id, payload);
        assert_eq!(
            ctx.store.get(id),
            Some(AttachmentPayload::Base64(payload))
        );
        assert_eq!(message.sender_label, "Unknown");
    }

    #[test]
    fn short_attachment_data_is_kept_as_reference() {
        let (mut ctx, mut ptt) = context();
        let mut chat = ctx.events.subscribe_kinds(&[EventKind::Chat]);
        let frame = r#"{"type":"message","frequency":"7","messageId":"f-2","hasAttachment":true,"attachmentData":"ref-42"}"#;

        process_text(&mut ctx, &mut ptt, "7", frame);

        let events = chat.drain();
        let SessionEvent::MessageReceived { message, .. } = &events[0] else {
            panic!("expected a chat message, got {events:?}");
        };
        let attachment = message.attachment.as_ref().expect("attachment present");
        assert_eq!(attachment.reference_id.as_deref(), Some("ref-42"));
        assert_eq!(attachment.kind, "file");
        assert!(ctx.store.is_empty());
    }

    #[test]
    fn kick_targets_only_this_client() {
        let (mut ctx, mut ptt) = context();
        let other = r#"{"type":"system_command","command":"kick_user","frequency":"7","userId":"someone"}"#;
        let own = r#"{"type":"system_command","command":"kick_user","frequency":"7","userId":"guest-123456","reason":"bye"}"#;
        let anyone = r#"{"type":"system_command","command":"kick_user","frequency":"7"}"#;

        assert_eq!(process_text(&mut ctx, &mut ptt, "7", other), None);
        assert_eq!(
            process_text(&mut ctx, &mut ptt, "7", own),
            Some(Followup::Kicked(Some("bye".to_owned())))
        );
        assert_eq!(
            process_text(&mut ctx, &mut ptt, "7", anyone),
            Some(Followup::Kicked(None))
        );
    }

    #[test]
    fn close_signals_end_the_wavelength() {
        let (mut ctx, mut ptt) = context();
        let command = r#"{"type":"system_command","command":"close_wavelength","frequency":"7"}"#;
        let notice = r#"{"type":"wavelength_closed","frequency":"7"}"#;
        let ping = r#"{"type":"system_command","command":"ping"}"#;

        assert_eq!(
            process_text(&mut ctx, &mut ptt, "7", command),
            Some(Followup::WavelengthClosed)
        );
        assert_eq!(
            process_text(&mut ctx, &mut ptt, "7", notice),
            Some(Followup::WavelengthClosed)
        );
        assert_eq!(process_text(&mut ctx, &mut ptt, "7", ping), None);
    }

    #[test]
    fn unsolicited_grant_is_returned() {
        let (mut ctx, mut ptt) = context();
        let grant = r#"{"type":"ptt_granted","frequency":"7"}"#;

        assert_eq!(
            process_text(&mut ctx, &mut ptt, "7", grant),
            Some(Followup::ReturnFloor("7".to_owned()))
        );

        ptt.press("7").expect("idle controller accepts a press");
        assert_eq!(process_text(&mut ctx, &mut ptt, "7", grant), None);
        assert_eq!(
            ptt.state(),
            &PttState::Transmitting {
                frequency: "7".to_owned()
            }
        );
    }

    #[test]
    fn remote_audio_reaches_playback_while_receiving() {
        let (mut ctx, mut ptt) = context();
        let mut audio = ctx.events.subscribe_kinds(&[EventKind::Audio]);
        let start = r#"{"type":"ptt_start_receiving","frequency":"7","senderId":"host-abcdef"}"#;

        process_text(&mut ctx, &mut ptt, "7", start);
        process_binary(&mut ptt, "7", Bytes::from_static(&[0, 64, 0, 64]));

        let kinds: Vec<_> = audio.drain().iter().map(SessionEvent::kind).collect();
        assert_eq!(kinds, vec![EventKind::Audio, EventKind::Audio]);
    }
}
