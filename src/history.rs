//! Merging history-sync backfills and live messages into the store.
//!
//! Everything here writes through [`MessageStore`] upserts, so replaying a
//! batch (or receiving overlapping batches) converges on the same rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::bridge::protocol::{Conversation, HistoryMessage, HistorySync, Message};
use crate::storage::{is_group_jid, jid_user, MessageStore, StoredMessage};

/// Name lookups supplied by the protocol client
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn group_name(&self, jid: &str) -> Option<String>;

    /// Full name from the address book
    async fn contact_name(&self, jid: &str) -> Option<String>;

    /// User part of our own address, once logged in
    async fn own_user(&self) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub conversations: usize,
    pub skipped_conversations: usize,
    pub messages_stored: usize,
    pub messages_skipped: usize,
}

/// A chat address is usable when it is non-blank, has no whitespace and at
/// most one `@` with something on both sides
pub fn is_valid_jid(jid: &str) -> bool {
    if jid.is_empty() || jid.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = jid.split('@');
    let user = parts.next().unwrap_or_default();
    match (parts.next(), parts.next()) {
        (None, _) => true,
        (Some(server), None) => !user.is_empty() && !server.is_empty(),
        _ => false,
    }
}

/// Display name for a chat, first hit wins:
/// stored name, sync metadata, group info or contact lookup, sender, address.
pub async fn resolve_chat_name(
    store: &MessageStore,
    resolver: &dyn NameResolver,
    jid: &str,
    conversation: Option<&Conversation>,
    sender: Option<&str>,
) -> String {
    match store.chat_name(jid) {
        Ok(Some(name)) => return name,
        Ok(None) => {}
        Err(e) => warn!("Failed to read stored name for {}: {}", jid, e),
    }

    if let Some(name) = conversation.and_then(Conversation::metadata_name) {
        return name.to_string();
    }

    if is_group_jid(jid) {
        return match resolver.group_name(jid).await {
            Some(name) => name,
            None => format!("Group {}", jid_user(jid)),
        };
    }

    if let Some(name) = resolver.contact_name(jid).await {
        return name;
    }

    match sender.filter(|s| !s.is_empty()) {
        Some(sender) => sender.to_string(),
        None => jid_user(jid).to_string(),
    }
}

fn unix_time(secs: u64) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    DateTime::from_timestamp(i64::try_from(secs).ok()?, 0)
}

/// Merge one history-sync batch into the store
pub async fn reconcile(
    store: &MessageStore,
    resolver: &dyn NameResolver,
    batch: &HistorySync,
) -> ReconcileStats {
    info!(
        "Received history sync with {} conversations",
        batch.conversations.len()
    );
    let own_user = resolver.own_user().await;
    let mut stats = ReconcileStats::default();

    for conversation in &batch.conversations {
        stats.conversations += 1;

        let Some(chat_jid) = conversation.id.as_deref().filter(|id| is_valid_jid(id)) else {
            debug!("Skipping conversation without a usable id: {:?}", conversation.id);
            stats.skipped_conversations += 1;
            continue;
        };

        // Newest message first; its time becomes the chat's last activity
        let Some(latest) = conversation
            .messages
            .first()
            .and_then(|m| unix_time(m.timestamp))
        else {
            stats.skipped_conversations += 1;
            continue;
        };

        let name = resolve_chat_name(store, resolver, chat_jid, Some(conversation), None).await;
        if let Err(e) = store.upsert_chat(chat_jid, &name, latest) {
            warn!("Failed to store chat {}: {}", chat_jid, e);
            stats.skipped_conversations += 1;
            continue;
        }

        for msg in &conversation.messages {
            match history_message(chat_jid, own_user.as_deref(), msg) {
                Some(stored) => match store.upsert_message(&stored) {
                    Ok(true) => stats.messages_stored += 1,
                    Ok(false) => stats.messages_skipped += 1,
                    Err(e) => {
                        warn!("Failed to store history message {}: {}", stored.id, e);
                        stats.messages_skipped += 1;
                    }
                },
                None => stats.messages_skipped += 1,
            }
        }
    }

    info!(
        "History sync complete. Stored {} messages ({} skipped, {} conversations skipped)",
        stats.messages_stored, stats.messages_skipped, stats.skipped_conversations
    );
    stats
}

/// Row for one historical message, or `None` when it has no id or time
fn history_message(chat_jid: &str, own_user: Option<&str>, msg: &HistoryMessage) -> Option<StoredMessage> {
    let timestamp = unix_time(msg.timestamp)?;
    let key = msg.key.as_ref();
    let id = key.and_then(|k| k.id.as_deref()).filter(|id| !id.is_empty())?;
    let is_from_me = key.map(|k| k.from_me).unwrap_or(false);

    let participant = key
        .and_then(|k| k.participant.as_deref())
        .filter(|p| !p.is_empty());
    let sender = match (is_from_me, participant, own_user) {
        (false, Some(participant), _) => jid_user(participant),
        (true, _, Some(me)) => me,
        _ => jid_user(chat_jid),
    };

    Some(StoredMessage {
        id: id.to_string(),
        chat_jid: chat_jid.to_string(),
        sender: sender.to_string(),
        content: msg.message.text(),
        timestamp,
        is_from_me,
        media: msg.message.media_info(timestamp),
    })
}

/// What happened to a live message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveOutcome {
    Stored { chat_name: String },
    /// Neither text nor media
    Empty,
}

/// Store a live message and its chat
pub async fn record_live_message(
    store: &MessageStore,
    resolver: &dyn NameResolver,
    msg: &Message,
) -> crate::error::Result<LiveOutcome> {
    let chat_name =
        resolve_chat_name(store, resolver, &msg.chat_jid, None, Some(&msg.sender)).await;
    store.upsert_chat(&msg.chat_jid, &chat_name, msg.timestamp)?;

    let stored = StoredMessage {
        id: msg.id.clone(),
        chat_jid: msg.chat_jid.clone(),
        sender: msg.sender.clone(),
        content: msg.content.text(),
        timestamp: msg.timestamp,
        is_from_me: msg.is_from_me,
        media: msg.content.media_info(msg.timestamp),
    };
    if store.upsert_message(&stored)? {
        Ok(LiveOutcome::Stored { chat_name })
    } else {
        Ok(LiveOutcome::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{MediaPayload, MessageBody, MessageKey};
    use crate::storage::{ListMessagesParams, MediaType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubResolver {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl NameResolver for StubResolver {
        async fn group_name(&self, jid: &str) -> Option<String> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            (jid == "120363@g.us").then(|| "Hiking".to_string())
        }

        async fn contact_name(&self, jid: &str) -> Option<String> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            (jid == "111@s.whatsapp.net").then(|| "Alice".to_string())
        }

        async fn own_user(&self) -> Option<String> {
            Some("999".to_string())
        }
    }

    fn text(id: &str, ts: u64, from_me: bool, participant: Option<&str>, body: &str) -> HistoryMessage {
        HistoryMessage {
            key: Some(MessageKey {
                id: Some(id.to_string()),
                from_me,
                participant: participant.map(str::to_string),
            }),
            timestamp: ts,
            message: MessageBody {
                conversation: Some(body.to_string()),
                ..Default::default()
            },
        }
    }

    fn batch() -> HistorySync {
        HistorySync {
            conversations: vec![
                Conversation {
                    id: Some("111@s.whatsapp.net".to_string()),
                    messages: vec![
                        text("a3", 1_705_000_300, true, None, "see you"),
                        text("a2", 1_705_000_200, false, None, "dinner?"),
                        text("a1", 1_705_000_100, false, None, ""),
                    ],
                    ..Default::default()
                },
                Conversation {
                    id: Some("120363@g.us".to_string()),
                    messages: vec![text("g1", 1_705_000_400, false, Some("222@s.whatsapp.net"), "trail?")],
                    ..Default::default()
                },
                Conversation {
                    id: Some("333@s.whatsapp.net".to_string()),
                    display_name: Some("Carol".to_string()),
                    messages: vec![HistoryMessage {
                        key: Some(MessageKey {
                            id: Some("c1".to_string()),
                            ..Default::default()
                        }),
                        timestamp: 1_705_000_500,
                        message: MessageBody {
                            media: Some(MediaPayload {
                                media_type: MediaType::Image,
                                file_name: None,
                                url: "https://mmg.whatsapp.net/v/t62/img.enc".to_string(),
                                media_key: "AQID".to_string(),
                                file_sha256: String::new(),
                                file_enc_sha256: String::new(),
                                file_length: 1234,
                            }),
                            ..Default::default()
                        },
                    }],
                    ..Default::default()
                },
                // No id, bad id, and a conversation whose newest entry has no time
                Conversation::default(),
                Conversation {
                    id: Some("not a jid".to_string()),
                    messages: vec![text("x", 1, false, None, "x")],
                    ..Default::default()
                },
                Conversation {
                    id: Some("444@s.whatsapp.net".to_string()),
                    messages: vec![text("d1", 0, false, None, "undated")],
                    ..Default::default()
                },
            ],
        }
    }

    fn snapshot(store: &MessageStore) -> String {
        store
            .list_messages(&ListMessagesParams {
                limit: 100,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_is_valid_jid() {
        assert!(is_valid_jid("111@s.whatsapp.net"));
        assert!(is_valid_jid("status"));
        assert!(!is_valid_jid(""));
        assert!(!is_valid_jid("a b@x"));
        assert!(!is_valid_jid("@x"));
        assert!(!is_valid_jid("a@b@c"));
    }

    #[tokio::test]
    async fn test_reconcile_stores_and_skips() {
        let store = MessageStore::open_in_memory().unwrap();
        let resolver = StubResolver::default();
        let stats = reconcile(&store, &resolver, &batch()).await;

        assert_eq!(stats.conversations, 6);
        assert_eq!(stats.skipped_conversations, 3);
        assert_eq!(stats.messages_stored, 4);
        assert_eq!(stats.messages_skipped, 1);

        assert_eq!(store.chat_name("111@s.whatsapp.net").unwrap().as_deref(), Some("Alice"));
        assert_eq!(store.chat_name("120363@g.us").unwrap().as_deref(), Some("Hiking"));
        assert_eq!(store.chat_name("333@s.whatsapp.net").unwrap().as_deref(), Some("Carol"));
        assert!(store.get_chat("444@s.whatsapp.net", false).unwrap().is_none());

        // Chat time comes from the newest message
        let chat = store.get_chat("111@s.whatsapp.net", true).unwrap().unwrap();
        assert_eq!(chat.last_message.as_deref(), Some("see you"));
        assert_eq!(chat.last_sender.as_deref(), Some("999"));

        let group = store.last_interaction("222@s.whatsapp.net").unwrap().unwrap();
        assert_eq!(group.id, "g1");
        assert_eq!(group.sender, "222");

        let media = store.get_media_info("c1", "333@s.whatsapp.net").unwrap();
        assert_eq!(media.filename, "image_20240111_191500.jpg");
        assert_eq!(media.media_key, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reconcile_twice_is_idempotent() {
        let store = MessageStore::open_in_memory().unwrap();
        let resolver = StubResolver::default();

        reconcile(&store, &resolver, &batch()).await;
        let once = snapshot(&store);
        let counts = store.stats().unwrap();

        let lookups_before = resolver.lookups.load(Ordering::SeqCst);
        reconcile(&store, &resolver, &batch()).await;
        assert_eq!(snapshot(&store), once);
        assert_eq!(store.stats().unwrap(), counts);
        // Stored names short-circuit the bridge lookups
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), lookups_before);
    }

    #[tokio::test]
    async fn test_chat_name_fallbacks() {
        let store = MessageStore::open_in_memory().unwrap();
        let resolver = StubResolver::default();

        let name = resolve_chat_name(&store, &resolver, "777-1@g.us", None, None).await;
        assert_eq!(name, "Group 777-1");

        let name = resolve_chat_name(&store, &resolver, "888@s.whatsapp.net", None, Some("888")).await;
        assert_eq!(name, "888");

        let name = resolve_chat_name(&store, &resolver, "889@s.whatsapp.net", None, None).await;
        assert_eq!(name, "889");
    }

    #[tokio::test]
    async fn test_record_live_message() {
        let store = MessageStore::open_in_memory().unwrap();
        let resolver = StubResolver::default();
        let json = r#"{
            "id": "L1", "timestamp": 1705689600, "chat_jid": "111@s.whatsapp.net",
            "sender": "111", "is_from_me": false,
            "content": {"extended_text": "https://example.com"}
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        let outcome = record_live_message(&store, &resolver, &msg).await.unwrap();
        assert_eq!(
            outcome,
            LiveOutcome::Stored {
                chat_name: "Alice".to_string()
            }
        );

        let mut empty = msg.clone();
        empty.id = "L2".to_string();
        empty.content = MessageBody::default();
        assert_eq!(
            record_live_message(&store, &resolver, &empty).await.unwrap(),
            LiveOutcome::Empty
        );
        assert_eq!(store.stats().unwrap(), (1, 1));
    }
}
