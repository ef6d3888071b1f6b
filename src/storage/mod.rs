//! Message store: the `chats` and `messages` tables.
//!
//! Writes are single idempotent statements (upserts keyed by the table's
//! primary key), so the store needs no locking of its own. Read queries
//! live in [`query`].

pub mod backend;
pub mod dialect;
pub mod models;
pub mod query;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{Error, Result};
use backend::{Backend, SqlValue, SqliteBackend};
use dialect::{dialect_for, SqlDialect};

pub use models::{
    is_group_jid, jid_user, ChatMessage, Contact, MediaInfo, MediaType, MessageContext,
    StoredChat, StoredMessage, USER_SERVER,
};
pub use query::{ListChatsParams, ListMessagesParams};

/// Where the message database lives
#[derive(Debug, Clone)]
pub enum DatabaseConfig {
    Sqlite {
        path: PathBuf,
        /// Bridge session database holding the contact table
        contacts_db: Option<PathBuf>,
    },
    Postgres {
        url: String,
    },
}

impl DatabaseConfig {
    pub fn is_postgres(&self) -> bool {
        matches!(self, DatabaseConfig::Postgres { .. })
    }
}

/// Chat/message repository shared by the event loop and the API
#[derive(Clone)]
pub struct MessageStore {
    backend: Arc<dyn Backend>,
    dialect: &'static dyn SqlDialect,
}

impl MessageStore {
    /// Open the configured database and make sure the schema exists
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let backend: Arc<dyn Backend> = match config {
            DatabaseConfig::Sqlite { path, contacts_db } => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                let contacts_db = contacts_db.as_deref().filter(|p| p.exists());
                Arc::new(SqliteBackend::open(path, contacts_db)?)
            }
            #[cfg(feature = "postgres")]
            DatabaseConfig::Postgres { url } => Arc::new(backend::PostgresBackend::connect(url)?),
            #[cfg(not(feature = "postgres"))]
            DatabaseConfig::Postgres { .. } => {
                return Err(Error::Validation(
                    "this build has no postgres support (enable the `postgres` feature)"
                        .to_string(),
                ))
            }
        };

        Self::with_backend(backend, dialect_for(config.is_postgres()))
    }

    /// Private in-memory SQLite store
    pub fn open_in_memory() -> Result<Self> {
        Self::with_backend(Arc::new(SqliteBackend::open_in_memory()?), dialect_for(false))
    }

    pub fn with_backend(backend: Arc<dyn Backend>, dialect: &'static dyn SqlDialect) -> Result<Self> {
        let store = Self { backend, dialect };
        store.init_schema()?;
        info!("Message store ready ({})", dialect.name());
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.backend.execute_batch(&self.dialect.schema())
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub(crate) fn dialect(&self) -> &'static dyn SqlDialect {
        self.dialect
    }

    /// Insert or replace a chat. An empty `name` never clears a stored one.
    pub fn upsert_chat(&self, jid: &str, name: &str, last_message_time: DateTime<Utc>) -> Result<()> {
        if jid.is_empty() {
            return Err(Error::Validation("chat jid is required".to_string()));
        }
        self.backend.execute(
            &self.dialect.upsert_chat(),
            &[jid.into(), name.into(), jid.into(), last_message_time.into()],
        )?;
        Ok(())
    }

    /// Insert or replace a message keyed by (id, chat_jid).
    ///
    /// Returns `false` without touching the database when the message has
    /// neither content nor media.
    pub fn upsert_message(&self, msg: &StoredMessage) -> Result<bool> {
        if msg.is_empty() {
            return Ok(false);
        }
        if msg.id.is_empty() || msg.chat_jid.is_empty() {
            return Err(Error::Validation(
                "message id and chat jid are required".to_string(),
            ));
        }

        let media = &msg.media;
        let params: Vec<SqlValue> = vec![
            msg.id.as_str().into(),
            msg.chat_jid.as_str().into(),
            msg.sender.as_str().into(),
            msg.content.as_str().into(),
            msg.timestamp.into(),
            msg.is_from_me.into(),
            media.media_type.map(|t| t.as_str()).unwrap_or_default().into(),
            media.filename.as_str().into(),
            media.url.as_str().into(),
            media.media_key.clone().into(),
            media.file_sha256.clone().into(),
            media.file_enc_sha256.clone().into(),
            file_length_value(media.file_length),
        ];
        self.backend.execute(&self.dialect.upsert_message(), &params)?;
        debug!("Stored message {} in {}", msg.id, msg.chat_jid);
        Ok(true)
    }

    /// Fill in download handles for a message stored before they were known
    pub fn update_media_info(&self, id: &str, chat_jid: &str, media: &MediaInfo) -> Result<()> {
        let d = self.dialect;
        let sql = format!(
            "UPDATE messages SET url = {}, media_key = {}, file_sha256 = {}, file_enc_sha256 = {}, \
             file_length = {} WHERE id = {} AND chat_jid = {}",
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4),
            d.placeholder(5),
            d.placeholder(6),
            d.placeholder(7),
        );
        let changed = self.backend.execute(
            &sql,
            &[
                media.url.as_str().into(),
                media.media_key.clone().into(),
                media.file_sha256.clone().into(),
                media.file_enc_sha256.clone().into(),
                file_length_value(media.file_length),
                id.into(),
                chat_jid.into(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("message {id} in {chat_jid}")));
        }
        Ok(())
    }

    pub fn get_media_info(&self, id: &str, chat_jid: &str) -> Result<MediaInfo> {
        let d = self.dialect;
        let sql = format!(
            "SELECT media_type, filename, url, media_key, file_sha256, file_enc_sha256, file_length \
             FROM messages WHERE id = {} AND chat_jid = {}",
            d.placeholder(1),
            d.placeholder(2),
        );
        let rows = self.backend.query(&sql, &[id.into(), chat_jid.into()])?;
        let row = rows
            .first()
            .ok_or_else(|| Error::NotFound(format!("message {id} in {chat_jid}")))?;

        Ok(MediaInfo {
            media_type: row.opt_text(0)?.as_deref().and_then(MediaType::parse),
            filename: row.opt_text(1)?.unwrap_or_default(),
            url: row.opt_text(2)?.unwrap_or_default(),
            media_key: row.blob(3)?,
            file_sha256: row.blob(4)?,
            file_enc_sha256: row.blob(5)?,
            file_length: row.opt_integer(6)?.unwrap_or(0).max(0) as u64,
        })
    }

    /// Stored display name of a chat, if any
    pub fn chat_name(&self, jid: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT name FROM chats WHERE jid = {}",
            self.dialect.placeholder(1)
        );
        let rows = self.backend.query(&sql, &[jid.into()])?;
        match rows.first() {
            Some(row) => Ok(row.opt_text(0)?.filter(|n| !n.is_empty())),
            None => Ok(None),
        }
    }

    /// (message count, chat count)
    pub fn stats(&self) -> Result<(i64, i64)> {
        let count = |table: &str| -> Result<i64> {
            let rows = self
                .backend
                .query(&format!("SELECT COUNT(*) FROM {table}"), &[])?;
            Ok(rows
                .first()
                .map(|r| r.opt_integer(0))
                .transpose()?
                .flatten()
                .unwrap_or(0))
        };
        Ok((count("messages")?, count("chats")?))
    }
}

fn file_length_value(len: u64) -> SqlValue {
    if len == 0 {
        SqlValue::Null
    } else {
        SqlValue::Integer(i64::try_from(len).unwrap_or(i64::MAX))
    }
}
