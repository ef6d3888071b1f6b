//! JSON protocol types for communication between the recorder and the wa-bridge
//! subprocess.
//!
//! The bridge writes one JSON event per line to stdout and reads one JSON
//! command per line from stdin. Binary fields (media keys, hashes, payloads)
//! travel as standard base64.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::{MediaInfo, MediaType};

/// Events sent from the bridge (via stdout)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// QR code data for pairing
    Qr { data: String },

    /// Logged in; `phone` is our own user part
    Connected {
        phone: String,
        name: String,
        platform: Option<String>,
    },

    ConnectionState { state: ConnectionState },

    /// A live message
    Message(Message),

    /// Bulk backfill of older conversations
    HistorySync(HistorySync),

    /// Session logged out (need to re-scan QR)
    LoggedOut { reason: String },

    Log { level: String, message: String },

    Error { code: String, message: String },

    GroupInfo {
        request_id: i32,
        name: Option<String>,
        error: Option<String>,
    },

    ContactInfo {
        request_id: i32,
        full_name: Option<String>,
        push_name: Option<String>,
        error: Option<String>,
    },

    SendResult {
        request_id: i32,
        success: bool,
        message_id: Option<String>,
        timestamp: Option<i64>,
        error: Option<String>,
    },

    UploadResult {
        request_id: i32,
        #[serde(flatten)]
        upload: Option<UploadedMedia>,
        error: Option<String>,
    },

    MediaDownloaded {
        request_id: i32,
        /// Base64 encoded decrypted payload
        data: Option<String>,
        error: Option<String>,
    },
}

/// Closed set of event kinds, used to key the dispatch table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Qr,
    Connected,
    ConnectionChanged,
    MessageReceived,
    HistorySync,
    LoggedOut,
    Log,
    Error,
    /// Answer to a command carrying a `request_id`
    Reply,
}

impl BridgeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BridgeEvent::Qr { .. } => EventKind::Qr,
            BridgeEvent::Connected { .. } => EventKind::Connected,
            BridgeEvent::ConnectionState { .. } => EventKind::ConnectionChanged,
            BridgeEvent::Message(_) => EventKind::MessageReceived,
            BridgeEvent::HistorySync(_) => EventKind::HistorySync,
            BridgeEvent::LoggedOut { .. } => EventKind::LoggedOut,
            BridgeEvent::Log { .. } => EventKind::Log,
            BridgeEvent::Error { .. } => EventKind::Error,
            BridgeEvent::GroupInfo { .. }
            | BridgeEvent::ContactInfo { .. }
            | BridgeEvent::SendResult { .. }
            | BridgeEvent::UploadResult { .. }
            | BridgeEvent::MediaDownloaded { .. } => EventKind::Reply,
        }
    }

    /// Correlation id for replies
    pub fn request_id(&self) -> Option<i32> {
        match self {
            BridgeEvent::GroupInfo { request_id, .. }
            | BridgeEvent::ContactInfo { request_id, .. }
            | BridgeEvent::SendResult { request_id, .. }
            | BridgeEvent::UploadResult { request_id, .. }
            | BridgeEvent::MediaDownloaded { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    LoggedOut,
}

/// A live message as decoded by the bridge
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub id: String,

    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,

    pub chat_jid: String,

    /// User part of the sender address
    pub sender: String,

    pub is_from_me: bool,

    /// Display name set by the sender
    pub push_name: Option<String>,

    #[serde(default)]
    pub content: MessageBody,
}

/// Message payload fields the store cares about
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageBody {
    /// Plain text body
    pub conversation: Option<String>,
    /// Text of an extended-text message (links, quotes)
    pub extended_text: Option<String>,
    pub media: Option<MediaPayload>,
}

impl MessageBody {
    pub fn text(&self) -> String {
        self.conversation
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.extended_text.as_deref())
            .unwrap_or_default()
            .to_string()
    }

    /// Media descriptor with a filename derived from the message time
    pub fn media_info(&self, timestamp: DateTime<Utc>) -> MediaInfo {
        match &self.media {
            Some(media) => media.to_media_info(timestamp),
            None => MediaInfo::default(),
        }
    }
}

/// Download handles of an image, video, audio or document message
#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    #[serde(rename = "type")]
    pub media_type: MediaType,
    /// Documents carry their own name
    pub file_name: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub media_key: String,
    #[serde(default)]
    pub file_sha256: String,
    #[serde(default)]
    pub file_enc_sha256: String,
    #[serde(default)]
    pub file_length: u64,
}

impl MediaPayload {
    pub fn to_media_info(&self, timestamp: DateTime<Utc>) -> MediaInfo {
        MediaInfo {
            media_type: Some(self.media_type),
            filename: media_filename(self.media_type, self.file_name.as_deref(), timestamp),
            url: self.url.clone(),
            media_key: decode_b64("media_key", &self.media_key),
            file_sha256: decode_b64("file_sha256", &self.file_sha256),
            file_enc_sha256: decode_b64("file_enc_sha256", &self.file_enc_sha256),
            file_length: self.file_length,
        }
    }
}

/// Local file name for a media message: `image_20240119_183000.jpg` etc.
pub fn media_filename(media_type: MediaType, own_name: Option<&str>, timestamp: DateTime<Utc>) -> String {
    let stamp = timestamp.format("%Y%m%d_%H%M%S");
    match media_type {
        MediaType::Image => format!("image_{stamp}.jpg"),
        MediaType::Video => format!("video_{stamp}.mp4"),
        MediaType::Audio => format!("audio_{stamp}.ogg"),
        MediaType::Document => match own_name.filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("document_{stamp}"),
        },
    }
}

fn decode_b64(field: &str, value: &str) -> Vec<u8> {
    if value.is_empty() {
        return Vec::new();
    }
    match BASE64.decode(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Ignoring malformed {}: {}", field, e);
            Vec::new()
        }
    }
}

pub fn encode_b64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_payload(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data)
}

/// History sync payload, decoded once at the boundary
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistorySync {
    #[serde(default)]
    pub conversations: Vec<Conversation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Conversation {
    /// Chat address; conversations without one are ignored
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub name: Option<String>,
    /// Newest first
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
}

impl Conversation {
    /// Name carried by the sync metadata itself
    pub fn metadata_name(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or_else(|| self.name.as_deref().filter(|n| !n.is_empty()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryMessage {
    pub key: Option<MessageKey>,
    /// Unix seconds; 0 means unknown
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub message: MessageBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageKey {
    pub id: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    /// Sender address inside a group
    pub participant: Option<String>,
}

/// Upload handles returned by the bridge, echoed back when sending
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UploadedMedia {
    pub url: String,
    pub direct_path: String,
    pub media_key: String,
    pub file_sha256: String,
    pub file_enc_sha256: String,
    pub file_length: u64,
}

/// Voice-note playback metadata sent with push-to-talk audio
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceNote {
    pub seconds: u32,
    /// Base64 encoded waveform samples
    pub waveform: String,
}

/// Commands sent to the bridge (via stdin)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeCommand {
    SendText {
        request_id: i32,
        to: String,
        text: String,
    },

    /// Encrypt and upload a payload; answered by `upload_result`
    UploadMedia {
        request_id: i32,
        media_type: MediaType,
        /// Base64 encoded payload
        data: String,
    },

    SendMedia {
        request_id: i32,
        to: String,
        media_type: MediaType,
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        upload: UploadedMedia,
        #[serde(skip_serializing_if = "Option::is_none")]
        voice: Option<VoiceNote>,
    },

    DownloadMedia {
        request_id: i32,
        media_type: MediaType,
        direct_path: String,
        url: String,
        media_key: String,
        file_sha256: String,
        file_enc_sha256: String,
        file_length: u64,
    },

    GetGroupInfo { request_id: i32, jid: String },

    GetContact { request_id: i32, jid: String },

    RequestHistorySync,

    Disconnect,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_qr_event() {
        let json = r#"{"type": "qr", "data": "2@ABC123"}"#;
        let event: BridgeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind(), EventKind::Qr);
        assert!(matches!(event, BridgeEvent::Qr { data } if data == "2@ABC123"));
    }

    #[test]
    fn test_parse_media_message() {
        let json = r#"{
            "type": "message",
            "id": "3EB0C767D26A",
            "timestamp": 1705689600,
            "chat_jid": "1234567890@s.whatsapp.net",
            "sender": "1234567890",
            "is_from_me": false,
            "push_name": "John",
            "content": {
                "conversation": "",
                "media": {
                    "type": "document",
                    "file_name": "report.pdf",
                    "url": "https://mmg.whatsapp.net/d/f/abc.enc",
                    "media_key": "AQID",
                    "file_length": 2048
                }
            }
        }"#;
        let event: BridgeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind(), EventKind::MessageReceived);
        let BridgeEvent::Message(msg) = event else {
            panic!("expected message");
        };
        assert_eq!(msg.content.text(), "");

        let info = msg.content.media_info(msg.timestamp);
        assert_eq!(info.media_type, Some(MediaType::Document));
        assert_eq!(info.filename, "report.pdf");
        assert_eq!(info.media_key, vec![1, 2, 3]);
        assert!(info.file_sha256.is_empty());
        assert_eq!(info.file_length, 2048);
    }

    #[test]
    fn test_extended_text_fallback() {
        let body = MessageBody {
            conversation: Some(String::new()),
            extended_text: Some("see https://example.com".to_string()),
            media: None,
        };
        assert_eq!(body.text(), "see https://example.com");
        assert!(body.media_info(Utc::now()).media_type.is_none());
    }

    #[test]
    fn test_media_filenames() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 19, 18, 30, 0).unwrap();
        assert_eq!(media_filename(MediaType::Image, None, ts), "image_20240119_183000.jpg");
        assert_eq!(media_filename(MediaType::Audio, None, ts), "audio_20240119_183000.ogg");
        assert_eq!(media_filename(MediaType::Document, Some(""), ts), "document_20240119_183000");
    }

    #[test]
    fn test_parse_history_sync() {
        let json = r#"{
            "type": "history_sync",
            "conversations": [
                {"id": "120363@g.us", "name": "Hiking", "messages": [
                    {"key": {"id": "A1", "from_me": false, "participant": "555@s.whatsapp.net"},
                     "timestamp": 1705689600,
                     "message": {"conversation": "hi"}}
                ]},
                {"messages": []}
            ]
        }"#;
        let event: BridgeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind(), EventKind::HistorySync);
        let BridgeEvent::HistorySync(sync) = event else {
            panic!("expected history sync");
        };
        assert_eq!(sync.conversations.len(), 2);
        assert_eq!(sync.conversations[0].metadata_name(), Some("Hiking"));
        assert!(sync.conversations[1].id.is_none());
    }

    #[test]
    fn test_replies_carry_request_id() {
        let json = r#"{"type": "upload_result", "request_id": 7, "url": "u", "direct_path": "/d",
            "media_key": "", "file_sha256": "", "file_enc_sha256": "", "file_length": 3}"#;
        let event: BridgeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind(), EventKind::Reply);
        assert_eq!(event.request_id(), Some(7));

        let json = r#"{"type": "log", "level": "info", "message": "x"}"#;
        let event: BridgeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.request_id(), None);
    }

    #[test]
    fn test_serialize_command() {
        let cmd = BridgeCommand::GetGroupInfo {
            request_id: 3,
            jid: "120363@g.us".to_string(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "get_group_info");
        assert_eq!(json["request_id"], 3);

        let json = serde_json::to_value(BridgeCommand::RequestHistorySync).unwrap();
        assert_eq!(json["type"], "request_history_sync");
    }
}
