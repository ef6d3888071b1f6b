//! Row and result types for chats, messages and contacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server part of a group (multi-party) address
pub const GROUP_SUFFIX: &str = "@g.us";

/// Server used for one-to-one addresses
pub const USER_SERVER: &str = "s.whatsapp.net";

pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with(GROUP_SUFFIX)
}

/// User part of an address ("1234" for "1234@s.whatsapp.net")
pub fn jid_user(jid: &str) -> &str {
    match jid.find('@') {
        Some(idx) if idx > 0 => &jid[..idx],
        _ => jid,
    }
}

/// Kind of media attached to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Document => "document",
        }
    }

    /// Parse the stored column value; empty or unknown means "no media"
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(MediaType::Image),
            "video" => Some(MediaType::Video),
            "audio" => Some(MediaType::Audio),
            "document" => Some(MediaType::Document),
            _ => None,
        }
    }
}

/// Everything needed to later fetch and decrypt a media payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub media_type: Option<MediaType>,
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub media_key: Vec<u8>,
    #[serde(default)]
    pub file_sha256: Vec<u8>,
    #[serde(default)]
    pub file_enc_sha256: Vec<u8>,
    #[serde(default)]
    pub file_length: u64,
}

impl MediaInfo {
    /// All handles required by the download call are present
    pub fn is_downloadable(&self) -> bool {
        !self.url.is_empty()
            && !self.media_key.is_empty()
            && !self.file_sha256.is_empty()
            && !self.file_enc_sha256.is_empty()
            && self.file_length > 0
    }
}

/// A message as written to the `messages` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
    #[serde(default)]
    pub media: MediaInfo,
}

impl StoredMessage {
    /// Neither text nor media: nothing worth keeping
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.media.media_type.is_none()
    }
}

/// A message as returned by read queries, joined with its chat
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub content: String,
    pub is_from_me: bool,
    pub chat_jid: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// A chat row, optionally enriched with its last message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredChat {
    pub jid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_is_from_me: Option<bool>,
}

/// Contact from the bridge's own contact table (read only)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contact {
    pub phone_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub jid: String,
}

/// A message with its neighbours in the same chat.
///
/// `before` is nearest-first (newest to oldest), `after` is oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct MessageContext {
    pub message: ChatMessage,
    pub before: Vec<ChatMessage>,
    pub after: Vec<ChatMessage>,
}

impl MessageContext {
    /// before + anchor + after in ascending time order
    pub fn chronological(self) -> Vec<ChatMessage> {
        let mut out: Vec<ChatMessage> = self.before.into_iter().rev().collect();
        out.push(self.message);
        out.extend(self.after);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jid_helpers() {
        assert_eq!(jid_user("1234@s.whatsapp.net"), "1234");
        assert_eq!(jid_user("plain"), "plain");
        assert_eq!(jid_user("@odd"), "@odd");
        assert!(is_group_jid("120363@g.us"));
        assert!(!is_group_jid("1234@s.whatsapp.net"));
    }

    #[test]
    fn test_media_type_parse() {
        assert_eq!(MediaType::parse("audio"), Some(MediaType::Audio));
        assert_eq!(MediaType::parse(""), None);
        assert_eq!(MediaType::Document.as_str(), "document");
    }

    #[test]
    fn test_chronological_reverses_before() {
        let msg = |id: &str, secs: i64| ChatMessage {
            timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
            sender: "s".into(),
            content: id.into(),
            is_from_me: false,
            chat_jid: "c".into(),
            id: id.into(),
            chat_name: None,
            media_type: None,
        };
        let ctx = MessageContext {
            message: msg("anchor", 10),
            before: vec![msg("b1", 9), msg("b2", 8)],
            after: vec![msg("a1", 11), msg("a2", 12)],
        };
        let ids: Vec<String> = ctx.chronological().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["b2", "b1", "anchor", "a1", "a2"]);
    }
}
