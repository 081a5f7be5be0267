use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Wire value meaning "deliver regardless of the bound frequency".
pub const BROADCAST_FREQUENCY: &str = "-1";
/// Inline `attachmentData` longer than this is treated as a payload, not a reference id.
pub const INLINE_ATTACHMENT_THRESHOLD: usize = 100;
pub const DEFAULT_PTT_DENIED_REASON: &str = "Transmission slot is busy.";
pub const UNKNOWN_SENDER: &str = "Unknown";
pub const ERR_PASSWORD_REQUIRED: &str = "Password required";
pub const ERR_INVALID_PASSWORD: &str = "Invalid password";
pub const ERR_WAVELENGTH_EXISTS: &str = "Wavelength already exists";
pub const ERR_WAVELENGTH_MISSING: &str = "Wavelength does not exist";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";
const PCM_FULL_SCALE: f32 = 32767.0;

pub type Frequency = String;
pub type MessageId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWavelength {
    pub frequency: Frequency,
    pub is_password_protected: bool,
    pub password: String,
    pub host_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResult {
    #[serde(default)]
    pub success: bool,
    #[serde(
        default,
        deserialize_with = "lenient_frequency",
        skip_serializing_if = "Option::is_none"
    )]
    pub frequency: Option<Frequency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinWavelength {
    pub frequency: Frequency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FrequencyRef {
    #[serde(
        default,
        deserialize_with = "lenient_frequency",
        skip_serializing_if = "Option::is_none"
    )]
    pub frequency: Option<Frequency>,
}

impl FrequencyRef {
    pub fn new(frequency: impl Into<Frequency>) -> Self {
        Self {
            frequency: Some(frequency.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(
        default,
        deserialize_with = "lenient_frequency",
        skip_serializing_if = "Option::is_none"
    )]
    pub frequency: Option<Frequency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// Display name chosen by the relay, when it provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub has_attachment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_data: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_self: bool,
}

impl ChatMessage {
    /// True when `attachment_data` carries the payload itself rather than a store id.
    pub fn has_inline_payload(&self) -> bool {
        self.has_attachment
            && self
                .attachment_data
                .as_ref()
                .is_some_and(|data| data.len() > INLINE_ATTACHMENT_THRESHOLD)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemCommand {
    pub command: String,
    #[serde(
        default,
        deserialize_with = "lenient_frequency",
        skip_serializing_if = "Option::is_none"
    )]
    pub frequency: Option<Frequency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_frequency",
        skip_serializing_if = "Option::is_none"
    )]
    pub frequency: Option<Frequency>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PttNotice {
    #[serde(
        default,
        deserialize_with = "lenient_frequency",
        skip_serializing_if = "Option::is_none"
    )]
    pub frequency: Option<Frequency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AmplitudeUpdate {
    #[serde(
        default,
        deserialize_with = "lenient_frequency",
        skip_serializing_if = "Option::is_none"
    )]
    pub frequency: Option<Frequency>,
    #[serde(default)]
    pub amplitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ErrorNotice {
    #[serde(default)]
    pub error: String,
}

/// Every JSON text frame exchanged with the relay, tagged by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    RegisterWavelength(RegisterWavelength),
    RegisterResult(HandshakeResult),
    JoinWavelength(JoinWavelength),
    JoinResult(HandshakeResult),
    LeaveWavelength(FrequencyRef),
    CloseWavelength(FrequencyRef),
    SendMessage(ChatMessage),
    SendFile(ChatMessage),
    Message(ChatMessage),
    SystemCommand(SystemCommand),
    UserJoined(Presence),
    UserLeft(Presence),
    WavelengthClosed(FrequencyRef),
    RequestPtt(FrequencyRef),
    ReleasePtt(FrequencyRef),
    PttGranted(PttNotice),
    PttDenied(PttNotice),
    PttStartReceiving(PttNotice),
    PttStopReceiving(PttNotice),
    AudioAmplitude(AmplitudeUpdate),
    Error(ErrorNotice),
}

impl Envelope {
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "register_wavelength",
        "register_result",
        "join_wavelength",
        "join_result",
        "leave_wavelength",
        "close_wavelength",
        "send_message",
        "send_file",
        "message",
        "system_command",
        "user_joined",
        "user_left",
        "wavelength_closed",
        "request_ptt",
        "release_ptt",
        "ptt_granted",
        "ptt_denied",
        "ptt_start_receiving",
        "ptt_stop_receiving",
        "audio_amplitude",
        "error",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::RegisterWavelength(_) => "register_wavelength",
            Envelope::RegisterResult(_) => "register_result",
            Envelope::JoinWavelength(_) => "join_wavelength",
            Envelope::JoinResult(_) => "join_result",
            Envelope::LeaveWavelength(_) => "leave_wavelength",
            Envelope::CloseWavelength(_) => "close_wavelength",
            Envelope::SendMessage(_) => "send_message",
            Envelope::SendFile(_) => "send_file",
            Envelope::Message(_) => "message",
            Envelope::SystemCommand(_) => "system_command",
            Envelope::UserJoined(_) => "user_joined",
            Envelope::UserLeft(_) => "user_left",
            Envelope::WavelengthClosed(_) => "wavelength_closed",
            Envelope::RequestPtt(_) => "request_ptt",
            Envelope::ReleasePtt(_) => "release_ptt",
            Envelope::PttGranted(_) => "ptt_granted",
            Envelope::PttDenied(_) => "ptt_denied",
            Envelope::PttStartReceiving(_) => "ptt_start_receiving",
            Envelope::PttStopReceiving(_) => "ptt_stop_receiving",
            Envelope::AudioAmplitude(_) => "audio_amplitude",
            Envelope::Error(_) => "error",
        }
    }

    pub fn frequency(&self) -> Option<&str> {
        let frequency = match self {
            Envelope::RegisterWavelength(register) => return Some(register.frequency.as_str()),
            Envelope::JoinWavelength(join) => return Some(join.frequency.as_str()),
            Envelope::RegisterResult(result) | Envelope::JoinResult(result) => &result.frequency,
            Envelope::LeaveWavelength(r)
            | Envelope::CloseWavelength(r)
            | Envelope::WavelengthClosed(r)
            | Envelope::RequestPtt(r)
            | Envelope::ReleasePtt(r) => &r.frequency,
            Envelope::SendMessage(chat) | Envelope::SendFile(chat) | Envelope::Message(chat) => {
                &chat.frequency
            }
            Envelope::SystemCommand(command) => &command.frequency,
            Envelope::UserJoined(presence) | Envelope::UserLeft(presence) => &presence.frequency,
            Envelope::PttGranted(notice)
            | Envelope::PttDenied(notice)
            | Envelope::PttStartReceiving(notice)
            | Envelope::PttStopReceiving(notice) => &notice.frequency,
            Envelope::AudioAmplitude(update) => &update.frequency,
            Envelope::Error(_) => return None,
        };
        frequency.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Envelope::SendMessage(chat) | Envelope::SendFile(chat) | Envelope::Message(chat) => {
                chat.message_id.as_deref().filter(|id| !id.is_empty())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("envelope is not a json object")]
    NotAnObject,
    #[error("envelope has no type field")]
    MissingType,
    #[error("unknown envelope type {0}")]
    UnknownType(String),
    #[error("malformed {kind} envelope: {reason}")]
    Malformed { kind: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub fn encode_envelope(envelope: &Envelope) -> Result<String, ProtocolError> {
    serde_json::to_string(envelope).map_err(|err| ProtocolError::Serialization(err.to_string()))
}

pub fn decode_envelope(text: &str) -> Result<Envelope, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;
    let kind = match &value {
        Value::Object(object) => object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_owned(),
        _ => return Err(ProtocolError::NotAnObject),
    };

    if !Envelope::KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|err| ProtocolError::Malformed {
        kind,
        reason: err.to_string(),
    })
}

/// Inbound frequency check. Absent, empty and [`BROADCAST_FREQUENCY`] values always match.
pub fn frequencies_match(expected: &str, received: Option<&str>) -> bool {
    match received.map(str::trim) {
        None | Some("") | Some(BROADCAST_FREQUENCY) => true,
        Some(received) => received == expected.trim(),
    }
}

/// RMS of little-endian signed 16-bit mono PCM, normalized to 0.0..=1.0.
///
/// A trailing odd byte is ignored.
pub fn pcm_rms_amplitude(pcm: &[u8]) -> f32 {
    let samples = pcm.len() / 2;
    if samples == 0 {
        return 0.0;
    }

    let sum_squares: f64 = pcm
        .chunks_exact(2)
        .map(|pair| {
            let normalized = f64::from(i16::from_le_bytes([pair[0], pair[1]])) / f64::from(PCM_FULL_SCALE);
            normalized * normalized
        })
        .sum();

    let rms = (sum_squares / samples as f64).sqrt() as f32;
    rms.min(1.0)
}

pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    File,
}

impl AttachmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Audio => "audio",
            AttachmentKind::Video => "video",
            AttachmentKind::File => "file",
        }
    }
}

/// Maps a file extension to the attachment kind and MIME type used on the wire.
pub fn classify_extension(extension: &str) -> (AttachmentKind, String) {
    let extension = extension.trim().to_ascii_lowercase();
    match extension.as_str() {
        "jpg" => (AttachmentKind::Image, "image/jpeg".to_owned()),
        "jpeg" | "png" | "gif" => (AttachmentKind::Image, format!("image/{extension}")),
        "mp3" | "wav" | "ogg" => (AttachmentKind::Audio, format!("audio/{extension}")),
        "mp4" | "webm" | "avi" | "mov" => (AttachmentKind::Video, format!("video/{extension}")),
        _ => (AttachmentKind::File, MIME_OCTET_STREAM.to_owned()),
    }
}

fn lenient_frequency<'de, D>(deserializer: D) -> Result<Option<Frequency>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_uses_camel_case_fields() {
        let envelope = Envelope::RegisterWavelength(RegisterWavelength {
            frequency: "101.5".to_owned(),
            is_password_protected: true,
            password: "hunter2".to_owned(),
            host_id: "host-1".to_owned(),
        });
        let json: Value = serde_json::from_str(&encode_envelope(&envelope).unwrap()).unwrap();
        assert_eq!(json["type"], "register_wavelength");
        assert_eq!(json["isPasswordProtected"], true);
        assert_eq!(json["hostId"], "host-1");
    }

    #[test]
    fn numeric_frequency_is_normalized_to_string() {
        let envelope = decode_envelope(r#"{"type":"wavelength_closed","frequency":101.5}"#).unwrap();
        assert_eq!(envelope.frequency(), Some("101.5"));
    }

    #[test]
    fn join_result_keeps_error_text() {
        let envelope =
            decode_envelope(r#"{"type":"join_result","success":false,"error":"Invalid password"}"#)
                .unwrap();
        match envelope {
            Envelope::JoinResult(result) => {
                assert!(!result.success);
                assert_eq!(result.error.as_deref(), Some(ERR_INVALID_PASSWORD));
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn unknown_and_malformed_envelopes_are_distinguished() {
        assert_eq!(
            decode_envelope(r#"{"type":"teleport"}"#),
            Err(ProtocolError::UnknownType("teleport".to_owned()))
        );
        assert_eq!(decode_envelope("[1,2]"), Err(ProtocolError::NotAnObject));
        assert_eq!(decode_envelope(r#"{"frequency":"1"}"#), Err(ProtocolError::MissingType));
        assert!(matches!(
            decode_envelope(r#"{"type":"system_command"}"#),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(decode_envelope("{nope"), Err(ProtocolError::InvalidJson(_))));
    }

    #[test]
    fn relay_timestamps_accept_both_forms() {
        let iso = decode_envelope(
            r#"{"type":"message","messageId":"m1","timestamp":"2024-01-01T00:00:00.000Z"}"#,
        )
        .unwrap();
        let millis = decode_envelope(r#"{"type":"message","messageId":"m2","timestamp":1700000000000}"#)
            .unwrap();
        match (iso, millis) {
            (Envelope::Message(a), Envelope::Message(b)) => {
                assert!(matches!(a.timestamp, Some(Timestamp::Text(_))));
                assert_eq!(b.timestamp, Some(Timestamp::Millis(1_700_000_000_000)));
            }
            other => panic!("unexpected envelopes {other:?}"),
        }
    }

    #[test]
    fn broadcast_sentinel_and_absent_frequency_always_match() {
        assert!(frequencies_match("101.5", Some("101.5")));
        assert!(frequencies_match("101.5", Some(BROADCAST_FREQUENCY)));
        assert!(frequencies_match("101.5", None));
        assert!(frequencies_match("101.5", Some("")));
        assert!(!frequencies_match("101.5", Some("99.1")));
    }

    #[test]
    fn rms_of_silence_and_full_scale() {
        assert_eq!(pcm_rms_amplitude(&[]), 0.0);
        assert_eq!(pcm_rms_amplitude(&[0, 0, 0, 0]), 0.0);

        let full: Vec<u8> = [i16::MAX, i16::MAX]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert!((pcm_rms_amplitude(&full) - 1.0).abs() < 1e-6);

        let half: Vec<u8> = [16384_i16, -16384].iter().flat_map(|s| s.to_le_bytes()).collect();
        let expected = 16384.0 / 32767.0;
        assert!((pcm_rms_amplitude(&half) - expected).abs() < 1e-4);
    }

    #[test]
    fn inline_payload_detection_uses_threshold() {
        let mut chat = ChatMessage {
            has_attachment: true,
            attachment_data: Some("a".repeat(INLINE_ATTACHMENT_THRESHOLD)),
            ..ChatMessage::default()
        };
        assert!(!chat.has_inline_payload());
        chat.attachment_data = Some("a".repeat(INLINE_ATTACHMENT_THRESHOLD + 1));
        assert!(chat.has_inline_payload());
    }

    #[test]
    fn extension_classification() {
        assert_eq!(classify_extension("JPG"), (AttachmentKind::Image, "image/jpeg".to_owned()));
        assert_eq!(classify_extension("ogg"), (AttachmentKind::Audio, "audio/ogg".to_owned()));
        assert_eq!(classify_extension("mov").0, AttachmentKind::Video);
        assert_eq!(
            classify_extension("tar"),
            (AttachmentKind::File, MIME_OCTET_STREAM.to_owned())
        );
    }
}
