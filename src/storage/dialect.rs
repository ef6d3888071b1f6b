//! SQL dialect adapter.
//!
//! Everything that differs between SQLite and PostgreSQL text lives behind
//! [`SqlDialect`]: placeholder tokens, the upsert form and a couple of
//! column types. Query code never branches on the backend itself.

use super::backend::SqlValue;

/// Dialect-specific SQL generation. Implementations must be pure.
pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Placeholder token for the 1-based parameter `index`
    fn placeholder(&self, index: usize) -> String;

    /// Full upsert statement for `table`, replacing every column on a
    /// conflict over `key`. `values` are the already-rendered value
    /// expressions, one per column.
    fn upsert(&self, table: &str, columns: &[&str], key: &[&str], values: &[String]) -> String;

    fn blob_type(&self) -> &'static str;

    /// Column type wide enough for a u32+ file length
    fn big_integer_type(&self) -> &'static str;

    fn schema(&self) -> String {
        let blob = self.blob_type();
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS chats (
                jid TEXT PRIMARY KEY,
                name TEXT,
                last_message_time TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT,
                chat_jid TEXT,
                sender TEXT,
                content TEXT,
                timestamp TIMESTAMP,
                is_from_me BOOLEAN,
                media_type TEXT,
                filename TEXT,
                url TEXT,
                media_key {blob},
                file_sha256 {blob},
                file_enc_sha256 {blob},
                file_length {int},
                PRIMARY KEY (id, chat_jid),
                FOREIGN KEY (chat_jid) REFERENCES chats(jid)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat_timestamp ON messages(chat_jid, timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender);
            CREATE INDEX IF NOT EXISTS idx_chats_last_message ON chats(last_message_time);
            "#,
            int = self.big_integer_type(),
        )
    }

    /// Upsert for a chat row. An empty incoming name keeps the stored one.
    ///
    /// Parameters: jid, name, jid, last_message_time.
    fn upsert_chat(&self) -> String {
        let name = format!(
            "COALESCE(NULLIF(CAST({} AS TEXT), ''), (SELECT name FROM chats WHERE jid = {}), '')",
            self.placeholder(2),
            self.placeholder(3)
        );
        self.upsert(
            "chats",
            &["jid", "name", "last_message_time"],
            &["jid"],
            &[self.placeholder(1), name, self.placeholder(4)],
        )
    }

    /// Upsert for a message row, parameters in [`MESSAGE_COLUMNS`] order.
    fn upsert_message(&self) -> String {
        let values: Vec<String> = (1..=MESSAGE_COLUMNS.len())
            .map(|i| self.placeholder(i))
            .collect();
        self.upsert("messages", MESSAGE_COLUMNS, &["id", "chat_jid"], &values)
    }
}

pub const MESSAGE_COLUMNS: &[&str] = &[
    "id",
    "chat_jid",
    "sender",
    "content",
    "timestamp",
    "is_from_me",
    "media_type",
    "filename",
    "url",
    "media_key",
    "file_sha256",
    "file_enc_sha256",
    "file_length",
];

pub struct Sqlite;

pub struct Postgres;

impl SqlDialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn upsert(&self, table: &str, columns: &[&str], _key: &[&str], values: &[String]) -> String {
        format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            values.join(", ")
        )
    }

    fn blob_type(&self) -> &'static str {
        "BLOB"
    }

    fn big_integer_type(&self) -> &'static str {
        "INTEGER"
    }
}

impl SqlDialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn upsert(&self, table: &str, columns: &[&str], key: &[&str], values: &[String]) -> String {
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !key.contains(c))
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
            table,
            columns.join(", "),
            values.join(", "),
            key.join(", "),
            updates.join(", ")
        )
    }

    fn blob_type(&self) -> &'static str {
        "BYTEA"
    }

    fn big_integer_type(&self) -> &'static str {
        "BIGINT"
    }
}

/// Pick the dialect once, at startup.
pub fn dialect_for(is_postgres: bool) -> &'static dyn SqlDialect {
    if is_postgres {
        &Postgres
    } else {
        &Sqlite
    }
}

/// Incrementally builds a SELECT with numbered parameters.
///
/// Conditions are joined with AND; placeholders are handed out in bind
/// order so the parameter list always lines up with the SQL text.
pub struct QueryBuilder {
    dialect: &'static dyn SqlDialect,
    sql: String,
    conditions: Vec<String>,
    conditions_flushed: bool,
    params: Vec<SqlValue>,
}

impl QueryBuilder {
    pub fn new(dialect: &'static dyn SqlDialect, select: &str) -> Self {
        Self {
            dialect,
            sql: select.trim().to_string(),
            conditions: Vec::new(),
            conditions_flushed: false,
            params: Vec::new(),
        }
    }

    /// Register a parameter and return its placeholder
    pub fn bind(&mut self, value: impl Into<SqlValue>) -> String {
        self.params.push(value.into());
        self.dialect.placeholder(self.params.len())
    }

    pub fn filter(&mut self, condition: impl Into<String>) -> &mut Self {
        self.conditions.push(condition.into());
        self
    }

    pub fn order_by(&mut self, order: &str) -> &mut Self {
        self.flush_conditions();
        self.sql.push_str(" ORDER BY ");
        self.sql.push_str(order);
        self
    }

    pub fn limit(&mut self, limit: i64) -> &mut Self {
        self.flush_conditions();
        let p = self.bind(limit);
        self.sql.push_str(" LIMIT ");
        self.sql.push_str(&p);
        self
    }

    pub fn offset(&mut self, offset: i64) -> &mut Self {
        self.flush_conditions();
        let p = self.bind(offset);
        self.sql.push_str(" OFFSET ");
        self.sql.push_str(&p);
        self
    }

    pub fn build(mut self) -> (String, Vec<SqlValue>) {
        self.flush_conditions();
        (self.sql, self.params)
    }

    fn flush_conditions(&mut self) {
        if self.conditions_flushed {
            return;
        }
        self.conditions_flushed = true;
        if !self.conditions.is_empty() {
            self.sql.push_str(" WHERE ");
            self.sql.push_str(&self.conditions.join(" AND "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(Sqlite.placeholder(1), "?");
        assert_eq!(Sqlite.placeholder(7), "?");
        assert_eq!(Postgres.placeholder(1), "$1");
        assert_eq!(Postgres.placeholder(12), "$12");
    }

    #[test]
    fn test_upsert_message_sqlite() {
        let sql = Sqlite.upsert_message();
        assert!(sql.starts_with("INSERT OR REPLACE INTO messages"));
        assert_eq!(sql.matches('?').count(), MESSAGE_COLUMNS.len());
        assert!(!sql.contains("ON CONFLICT"));
    }

    #[test]
    fn test_upsert_message_postgres() {
        let sql = Postgres.upsert_message();
        assert!(sql.contains("ON CONFLICT (id, chat_jid) DO UPDATE SET"));
        assert!(sql.contains("content = EXCLUDED.content"));
        assert!(sql.contains("$13"));
        // key columns are never rewritten
        assert!(!sql.contains("id = EXCLUDED.id"));
        assert!(!sql.contains("chat_jid = EXCLUDED.chat_jid"));
    }

    #[test]
    fn test_upsert_chat_keeps_name_expression() {
        let sql = Postgres.upsert_chat();
        assert!(sql.contains("NULLIF(CAST($2 AS TEXT), '')"));
        assert!(sql.contains("SELECT name FROM chats WHERE jid = $3"));
        assert!(sql.contains("ON CONFLICT (jid)"));
        assert_eq!(Sqlite.upsert_chat().matches('?').count(), 4);
    }

    #[test]
    fn test_schema_types() {
        assert!(Sqlite.schema().contains("media_key BLOB"));
        assert!(Postgres.schema().contains("media_key BYTEA"));
        assert!(Postgres.schema().contains("file_length BIGINT"));
    }

    #[test]
    fn test_builder_numbers_params_in_order() {
        let mut q = QueryBuilder::new(&Postgres, "SELECT * FROM messages m");
        let p = q.bind("a@s.whatsapp.net");
        q.filter(format!("m.sender = {p}"));
        let p = q.bind("%hi%");
        q.filter(format!("LOWER(m.content) LIKE LOWER({p})"));
        q.order_by("m.timestamp DESC").limit(10).offset(20);
        let (sql, params) = q.build();
        assert_eq!(
            sql,
            "SELECT * FROM messages m WHERE m.sender = $1 AND LOWER(m.content) LIKE LOWER($2) \
             ORDER BY m.timestamp DESC LIMIT $3 OFFSET $4"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_builder_without_conditions() {
        let mut q = QueryBuilder::new(&Sqlite, "SELECT jid FROM chats");
        q.limit(5);
        let (sql, params) = q.build();
        assert_eq!(sql, "SELECT jid FROM chats LIMIT ?");
        assert_eq!(params.len(), 1);
    }
}
