//! Read queries over the message store.
//!
//! Every query goes through [`QueryBuilder`] so placeholder numbering and
//! parameter order stay in sync for both dialects. Rows that fail to decode
//! are logged and skipped; the rest of the result is still returned.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tracing::warn;

use super::backend::{parse_timestamp_text, Row};
use super::dialect::QueryBuilder;
use super::models::{jid_user, ChatMessage, Contact, MessageContext, StoredChat, GROUP_SUFFIX};
use super::MessageStore;
use crate::error::{Error, Result};

/// Rows fetched by single-result lookups so an unreadable newest row
/// does not hide the next one
const FIRST_ROW_WINDOW: i64 = 10;

/// Hard cap on contact search results
pub const CONTACT_SEARCH_LIMIT: i64 = 50;

const MESSAGE_SELECT: &str = "SELECT m.timestamp, m.sender, c.name, m.content, m.is_from_me, \
     c.jid, m.id, m.media_type FROM messages m JOIN chats c ON m.chat_jid = c.jid";

const CHAT_SELECT: &str = "SELECT c.jid, c.name, c.last_message_time, m.content, m.sender, \
     m.is_from_me FROM chats c LEFT JOIN messages m \
     ON c.jid = m.chat_jid AND c.last_message_time = m.timestamp";

const CHAT_SELECT_BARE: &str = "SELECT c.jid, c.name, c.last_message_time, NULL, NULL, NULL \
     FROM chats c";

/// Filters and paging for [`MessageStore::list_messages`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListMessagesParams {
    /// Inclusive lower bound
    pub after: Option<String>,
    /// Exclusive upper bound
    pub before: Option<String>,
    pub sender: Option<String>,
    pub chat_jid: Option<String>,
    /// Case-insensitive substring of the content
    pub query: Option<String>,
    pub limit: i64,
    pub page: i64,
    pub include_context: bool,
    pub context_before: i64,
    pub context_after: i64,
}

impl Default for ListMessagesParams {
    fn default() -> Self {
        Self {
            after: None,
            before: None,
            sender: None,
            chat_jid: None,
            query: None,
            limit: 20,
            page: 0,
            include_context: false,
            context_before: 1,
            context_after: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    LastActive,
    Name,
}

impl SortBy {
    fn order_clause(self) -> &'static str {
        match self {
            SortBy::LastActive => "c.last_message_time DESC",
            SortBy::Name => "c.name",
        }
    }
}

/// Filters and paging for [`MessageStore::list_chats`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListChatsParams {
    #[serde(alias = "q")]
    pub query: Option<String>,
    pub limit: i64,
    pub page: i64,
    pub include_last_message: bool,
    #[serde(alias = "sort")]
    pub sort_by: SortBy,
}

impl Default for ListChatsParams {
    fn default() -> Self {
        Self {
            query: None,
            limit: 30,
            page: 0,
            include_last_message: true,
            sort_by: SortBy::LastActive,
        }
    }
}

/// Row offset for a zero-based page
pub fn page_offset(page: i64, limit: i64) -> Result<i64> {
    if page < 0 || limit < 0 {
        return Err(Error::Validation(format!(
            "page and limit must be non-negative (page={page}, limit={limit})"
        )));
    }
    page.checked_mul(limit)
        .ok_or_else(|| Error::Validation("page * limit overflows".to_string()))
}

/// Parse a timestamp filter: RFC 3339, "YYYY-MM-DD HH:MM:SS" or a bare date
pub fn parse_filter_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Some(ts) = parse_timestamp_text(value) {
        return Ok(ts);
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    Err(Error::Validation(format!(
        "{field}: '{value}' is not a valid timestamp"
    )))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn like_pattern(s: &str) -> String {
    format!("%{}%", s)
}

/// Decode every row, skipping (and logging) the ones that do not fit
fn decode_rows<T>(rows: &[Row], what: &str, decode: impl Fn(&Row) -> Result<T>) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match decode(row) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Skipping unreadable {} row: {}", what, e);
                None
            }
        })
        .collect()
}

fn message_from_row(row: &Row) -> Result<ChatMessage> {
    Ok(ChatMessage {
        timestamp: row.timestamp(0)?,
        sender: row.opt_text(1)?.unwrap_or_default(),
        chat_name: row.opt_text(2)?.filter(|n| !n.is_empty()),
        content: row.opt_text(3)?.unwrap_or_default(),
        is_from_me: row.opt_bool(4)?.unwrap_or(false),
        chat_jid: row.text(5)?,
        id: row.text(6)?,
        media_type: row.opt_text(7)?.filter(|t| !t.is_empty()),
    })
}

fn chat_from_row(row: &Row) -> Result<StoredChat> {
    Ok(StoredChat {
        jid: row.text(0)?,
        name: row.opt_text(1)?.filter(|n| !n.is_empty()),
        last_message_time: row.opt_timestamp(2)?,
        last_message: row.opt_text(3)?,
        last_sender: row.opt_text(4)?,
        last_is_from_me: row.opt_bool(5)?,
    })
}

impl MessageStore {
    fn select(&self, sql: &str) -> QueryBuilder {
        QueryBuilder::new(self.dialect(), sql)
    }

    fn run(&self, q: QueryBuilder) -> Result<Vec<Row>> {
        let (sql, params) = q.build();
        self.backend().query(&sql, &params)
    }

    /// Matching messages, newest first, with optional context windows.
    ///
    /// With context, every match is replaced by its window in chronological
    /// order and the windows are concatenated in match order.
    pub fn find_messages(&self, params: &ListMessagesParams) -> Result<Vec<ChatMessage>> {
        let offset = page_offset(params.page, params.limit)?;
        let after = non_empty(&params.after)
            .map(|v| parse_filter_timestamp("after", v))
            .transpose()?;
        let before = non_empty(&params.before)
            .map(|v| parse_filter_timestamp("before", v))
            .transpose()?;

        let mut q = self.select(MESSAGE_SELECT);
        if let Some(after) = after {
            let p = q.bind(after);
            q.filter(format!("m.timestamp >= {p}"));
        }
        if let Some(before) = before {
            let p = q.bind(before);
            q.filter(format!("m.timestamp < {p}"));
        }
        if let Some(sender) = non_empty(&params.sender) {
            let p = q.bind(sender);
            q.filter(format!("m.sender = {p}"));
        }
        if let Some(chat_jid) = non_empty(&params.chat_jid) {
            let p = q.bind(chat_jid);
            q.filter(format!("m.chat_jid = {p}"));
        }
        if let Some(text) = non_empty(&params.query) {
            let p = q.bind(like_pattern(text));
            q.filter(format!("LOWER(m.content) LIKE LOWER({p})"));
        }
        q.order_by("m.timestamp DESC").limit(params.limit).offset(offset);

        let matches = decode_rows(&self.run(q)?, "message", message_from_row);
        if !params.include_context {
            return Ok(matches);
        }

        let mut out = Vec::new();
        for msg in matches {
            match self.context_in_chat(msg.clone(), params.context_before, params.context_after) {
                Ok(ctx) => out.extend(ctx.chronological()),
                Err(e) => {
                    warn!("Could not expand context for {}: {}", msg.id, e);
                    out.push(msg);
                }
            }
        }
        Ok(out)
    }

    /// [`find_messages`](Self::find_messages) rendered as a transcript
    pub fn list_messages(&self, params: &ListMessagesParams) -> Result<String> {
        let messages = self.find_messages(params)?;
        self.format_messages(&messages)
    }

    /// A message plus up to `before`/`after` neighbours in the same chat.
    ///
    /// `before` is nearest-first; use [`MessageContext::chronological`] for a
    /// transcript-ordered list.
    pub fn get_message_context(&self, id: &str, before: i64, after: i64) -> Result<MessageContext> {
        if id.is_empty() {
            return Err(Error::Validation("message id is required".to_string()));
        }
        let mut q = self.select(MESSAGE_SELECT);
        let p = q.bind(id);
        q.filter(format!("m.id = {p}"));
        q.order_by("m.timestamp DESC").limit(FIRST_ROW_WINDOW);

        let anchor = decode_rows(&self.run(q)?, "message", message_from_row)
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("message {id}")))?;
        self.context_in_chat(anchor, before, after)
    }

    fn context_in_chat(&self, anchor: ChatMessage, before: i64, after: i64) -> Result<MessageContext> {
        let before = self.neighbours(&anchor, before.max(0), "<", "DESC")?;
        let after = self.neighbours(&anchor, after.max(0), ">", "ASC")?;
        Ok(MessageContext {
            message: anchor,
            before,
            after,
        })
    }

    fn neighbours(&self, anchor: &ChatMessage, count: i64, cmp: &str, dir: &str) -> Result<Vec<ChatMessage>> {
        // A negative LIMIT means "no limit" to SQLite
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut q = self.select(MESSAGE_SELECT);
        let p = q.bind(anchor.chat_jid.as_str());
        q.filter(format!("m.chat_jid = {p}"));
        let p = q.bind(anchor.timestamp);
        q.filter(format!("m.timestamp {cmp} {p}"));
        q.order_by(&format!("m.timestamp {dir}")).limit(count);
        Ok(decode_rows(&self.run(q)?, "message", message_from_row))
    }

    pub fn list_chats(&self, params: &ListChatsParams) -> Result<Vec<StoredChat>> {
        let offset = page_offset(params.page, params.limit)?;
        let mut q = self.select(if params.include_last_message {
            CHAT_SELECT
        } else {
            CHAT_SELECT_BARE
        });
        if let Some(text) = non_empty(&params.query) {
            let pattern = like_pattern(text);
            let by_name = q.bind(pattern.as_str());
            let by_jid = q.bind(pattern);
            q.filter(format!(
                "(LOWER(c.name) LIKE LOWER({by_name}) OR c.jid LIKE {by_jid})"
            ));
        }
        q.order_by(params.sort_by.order_clause())
            .limit(params.limit)
            .offset(offset);
        Ok(decode_rows(&self.run(q)?, "chat", chat_from_row))
    }

    pub fn get_chat(&self, jid: &str, include_last_message: bool) -> Result<Option<StoredChat>> {
        let mut q = self.select(if include_last_message {
            CHAT_SELECT
        } else {
            CHAT_SELECT_BARE
        });
        let p = q.bind(jid);
        q.filter(format!("c.jid = {p}"));
        q.limit(1);
        Ok(decode_rows(&self.run(q)?, "chat", chat_from_row).into_iter().next())
    }

    /// Most recently active one-to-one chat whose address contains `phone`
    pub fn get_direct_chat_by_contact(&self, phone: &str) -> Result<Option<StoredChat>> {
        let phone = phone.trim();
        if phone.is_empty() {
            return Err(Error::Validation("phone number is required".to_string()));
        }
        let mut q = self.select(CHAT_SELECT);
        let p = q.bind(like_pattern(phone));
        q.filter(format!("c.jid LIKE {p}"));
        let p = q.bind(like_pattern(GROUP_SUFFIX));
        q.filter(format!("c.jid NOT LIKE {p}"));
        q.order_by("c.last_message_time DESC").limit(2);

        let chats = decode_rows(&self.run(q)?, "chat", chat_from_row);
        if chats.len() > 1 {
            warn!(
                "'{}' matches several direct chats ({}, {}, ...); using the most recent",
                phone, chats[0].jid, chats[1].jid
            );
        }
        Ok(chats.into_iter().next())
    }

    /// Chats the contact took part in: its own chat plus any chat it sent to
    pub fn get_contact_chats(&self, jid: &str, limit: i64, page: i64) -> Result<Vec<StoredChat>> {
        let offset = page_offset(page, limit)?;
        let mut q = self.select(CHAT_SELECT);
        let own = q.bind(jid);
        let sender_jid = q.bind(jid);
        let sender_user = q.bind(jid_user(jid));
        q.filter(format!(
            "(c.jid = {own} OR EXISTS (SELECT 1 FROM messages s WHERE s.chat_jid = c.jid \
             AND s.sender IN ({sender_jid}, {sender_user})))"
        ));
        q.order_by("c.last_message_time DESC").limit(limit).offset(offset);
        Ok(decode_rows(&self.run(q)?, "chat", chat_from_row))
    }

    /// Contacts from the bridge's contact table, groups excluded
    pub fn search_contacts(&self, query: &str) -> Result<Vec<Contact>> {
        let mut q = self.select(
            "SELECT DISTINCT their_jid, \
             COALESCE(NULLIF(full_name, ''), NULLIF(push_name, ''), first_name) AS name \
             FROM whatsmeow_contacts",
        );
        let pattern = like_pattern(query.trim());
        let by_full = q.bind(pattern.as_str());
        let by_first = q.bind(pattern.as_str());
        let by_jid = q.bind(pattern);
        q.filter(format!(
            "(LOWER(COALESCE(full_name, '')) LIKE LOWER({by_full}) \
             OR LOWER(COALESCE(first_name, '')) LIKE LOWER({by_first}) \
             OR LOWER(their_jid) LIKE LOWER({by_jid}))"
        ));
        let p = q.bind(like_pattern(GROUP_SUFFIX));
        q.filter(format!("their_jid NOT LIKE {p}"));
        q.order_by("name, their_jid").limit(CONTACT_SEARCH_LIMIT);

        Ok(decode_rows(&self.run(q)?, "contact", |row| {
            let jid = row.text(0)?;
            Ok(Contact {
                phone_number: jid_user(&jid).to_string(),
                name: row.opt_text(1)?.filter(|n| !n.is_empty()),
                jid,
            })
        }))
    }

    /// Newest message sent by the contact or in its chat
    pub fn last_interaction(&self, jid: &str) -> Result<Option<ChatMessage>> {
        let mut q = self.select(MESSAGE_SELECT);
        let sender_jid = q.bind(jid);
        let sender_user = q.bind(jid_user(jid));
        let chat = q.bind(jid);
        q.filter(format!(
            "(m.sender IN ({sender_jid}, {sender_user}) OR m.chat_jid = {chat})"
        ));
        q.order_by("m.timestamp DESC").limit(FIRST_ROW_WINDOW);
        Ok(decode_rows(&self.run(q)?, "message", message_from_row).into_iter().next())
    }

    /// Best-effort display name for a sender address.
    ///
    /// Exact chat address first, then any chat whose address contains the
    /// phone part, else the identifier itself.
    pub fn sender_name(&self, sender: &str) -> Result<String> {
        let mut q = self.select("SELECT name FROM chats");
        let p = q.bind(sender);
        q.filter(format!("jid = {p}"));
        q.limit(1);
        if let Some(name) = self.first_name(q)? {
            return Ok(name);
        }

        let phone = jid_user(sender);
        if !phone.is_empty() {
            let mut q = self.select("SELECT name FROM chats");
            let p = q.bind(like_pattern(phone));
            q.filter(format!("jid LIKE {p}"));
            q.filter("name IS NOT NULL AND name <> ''");
            q.limit(1);
            if let Some(name) = self.first_name(q)? {
                return Ok(name);
            }
        }
        Ok(sender.to_string())
    }

    fn first_name(&self, q: QueryBuilder) -> Result<Option<String>> {
        Ok(match self.run(q)?.first() {
            Some(row) => row.opt_text(0)?.filter(|n| !n.is_empty()),
            None => None,
        })
    }

    pub fn format_messages(&self, messages: &[ChatMessage]) -> Result<String> {
        if messages.is_empty() {
            return Ok("No messages to display.\n".to_string());
        }
        let mut names: HashMap<&str, String> = HashMap::new();
        let mut out = String::new();
        for msg in messages {
            let sender = if msg.is_from_me {
                "Me".to_string()
            } else if let Some(name) = names.get(msg.sender.as_str()) {
                name.clone()
            } else {
                let name = self.sender_name(&msg.sender)?;
                names.insert(&msg.sender, name.clone());
                name
            };
            out.push_str(&render_line(msg, &sender));
        }
        Ok(out)
    }
}

fn render_line(msg: &ChatMessage, sender: &str) -> String {
    let mut line = format!("[{}] ", msg.timestamp.format("%Y-%m-%d %H:%M:%S"));
    if let Some(name) = &msg.chat_name {
        line.push_str(&format!("Chat: {} ", name));
    }
    line.push_str(&format!("From: {}: ", sender));
    if let Some(media) = &msg.media_type {
        line.push_str(&format!(
            "[{} - Message ID: {} - Chat JID: {}] ",
            media, msg.id, msg.chat_jid
        ));
    }
    line.push_str(&msg.content);
    line.push('\n');
    line
}
