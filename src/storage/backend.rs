//! Pooled database handles.
//!
//! The store talks to the database through [`Backend`], which only knows
//! how to run SQL text with a list of [`SqlValue`] parameters and hand rows
//! back as [`Row`]s. SQL text itself comes from the dialect adapter.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, ToSql};
use tracing::info;

use crate::error::{Error, Result};

/// A bindable / readable column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

/// Canonical text form for timestamps stored as TEXT.
///
/// Fixed width (millisecond precision, `Z` suffix) so that lexical order in
/// SQLite matches chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp_text(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    // Written by older tooling: "2006-01-02 15:04:05-07:00" and friends
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(ts) = DateTime::parse_from_str(s, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}

/// One result row, already detached from the driver
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    fn value(&self, index: usize) -> Result<&SqlValue> {
        self.values.get(index).ok_or_else(|| Error::Column {
            index,
            message: "out of range".to_string(),
        })
    }

    fn mismatch<T>(index: usize, expected: &str, got: &SqlValue) -> Result<T> {
        Err(Error::Column {
            index,
            message: format!("expected {expected}, got {got:?}"),
        })
    }

    pub fn opt_text(&self, index: usize) -> Result<Option<String>> {
        match self.value(index)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            other => Self::mismatch(index, "text", other),
        }
    }

    pub fn text(&self, index: usize) -> Result<String> {
        match self.opt_text(index)? {
            Some(s) => Ok(s),
            None => Self::mismatch(index, "text", &SqlValue::Null),
        }
    }

    pub fn opt_bool(&self, index: usize) -> Result<Option<bool>> {
        match self.value(index)? {
            SqlValue::Null => Ok(None),
            SqlValue::Bool(b) => Ok(Some(*b)),
            SqlValue::Integer(i) => Ok(Some(*i != 0)),
            other => Self::mismatch(index, "bool", other),
        }
    }

    pub fn opt_integer(&self, index: usize) -> Result<Option<i64>> {
        match self.value(index)? {
            SqlValue::Null => Ok(None),
            SqlValue::Integer(i) => Ok(Some(*i)),
            other => Self::mismatch(index, "integer", other),
        }
    }

    pub fn blob(&self, index: usize) -> Result<Vec<u8>> {
        match self.value(index)? {
            SqlValue::Null => Ok(Vec::new()),
            SqlValue::Blob(b) => Ok(b.clone()),
            other => Self::mismatch(index, "blob", other),
        }
    }

    pub fn opt_timestamp(&self, index: usize) -> Result<Option<DateTime<Utc>>> {
        match self.value(index)? {
            SqlValue::Null => Ok(None),
            SqlValue::Timestamp(ts) => Ok(Some(*ts)),
            SqlValue::Integer(secs) => Ok(DateTime::from_timestamp(*secs, 0)),
            SqlValue::Text(s) => match parse_timestamp_text(s) {
                Some(ts) => Ok(Some(ts)),
                None => Self::mismatch(index, "timestamp", &SqlValue::Text(s.clone())),
            },
            other => Self::mismatch(index, "timestamp", other),
        }
    }

    pub fn timestamp(&self, index: usize) -> Result<DateTime<Utc>> {
        match self.opt_timestamp(index)? {
            Some(ts) => Ok(ts),
            None => Self::mismatch(index, "timestamp", &SqlValue::Null),
        }
    }
}

/// Database handle shared by the repository and the query engine.
///
/// Every call checks a connection out of the pool, runs one statement and
/// returns it; atomicity comes from the statement itself.
pub trait Backend: Send + Sync {
    fn execute_batch(&self, sql: &str) -> Result<()>;

    /// Returns the number of affected rows
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            SqlValue::Timestamp(ts) => ToSqlOutput::Owned(Value::Text(format_timestamp(ts))),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

/// SQLite through an r2d2 pool
#[derive(Clone)]
pub struct SqliteBackend {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteBackend {
    /// Open (or create) the database file.
    ///
    /// `contacts_db` is the bridge's session database; when given it is
    /// attached to every connection so its contact table can be queried.
    pub fn open(path: &Path, contacts_db: Option<&Path>) -> Result<Self> {
        let attach = contacts_db.map(|p| p.to_string_lossy().into_owned());
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
            if let Some(db) = &attach {
                conn.execute("ATTACH DATABASE ?1 AS bridge", [db])?;
            }
            Ok(())
        });
        let pool = Pool::builder().max_size(8).build(manager)?;

        pool.get()?.execute_batch("PRAGMA journal_mode=WAL;")?;

        info!("SQLite message database at {:?}", path);
        Ok(Self { pool })
    }

    /// Private in-memory database. The pool holds a single connection, since
    /// every SQLite in-memory connection is its own database.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;
        Ok(Self { pool })
    }
}

impl Backend for SqliteBackend {
    fn execute_batch(&self, sql: &str) -> Result<()> {
        self.pool.get()?.execute_batch(sql)?;
        Ok(())
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let conn = self.pool.get()?;
        let changed = conn.execute(sql, params_from_iter(params.iter()))?;
        Ok(changed)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns);
            for i in 0..columns {
                values.push(SqlValue::from(row.get_ref(i)?));
            }
            out.push(Row::new(values));
        }
        Ok(out)
    }
}

#[cfg(feature = "postgres")]
pub use self::pg::PostgresBackend;

#[cfg(feature = "postgres")]
mod pg {
    use std::error::Error as StdError;

    use bytes::BytesMut;
    use chrono::{DateTime, NaiveDateTime, Utc};
    use postgres::types::{to_sql_checked, IsNull, ToSql, Type};
    use postgres::NoTls;
    use r2d2::Pool;
    use r2d2_postgres::PostgresConnectionManager;
    use tracing::{info, warn};

    use super::{Backend, Row, SqlValue};
    use crate::error::Result;

    /// PostgreSQL through an r2d2 pool
    #[derive(Clone)]
    pub struct PostgresBackend {
        pool: Pool<PostgresConnectionManager<NoTls>>,
    }

    impl PostgresBackend {
        pub fn connect(url: &str) -> Result<Self> {
            let config: postgres::Config = url.parse()?;
            let manager = PostgresConnectionManager::new(config, NoTls);
            let pool = Pool::builder().max_size(8).build(manager)?;
            info!("Connected to postgres");
            Ok(Self { pool })
        }
    }

    impl ToSql for SqlValue {
        fn to_sql(
            &self,
            ty: &Type,
            out: &mut BytesMut,
        ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
            match self {
                SqlValue::Null => Ok(IsNull::Yes),
                SqlValue::Integer(i) => match *ty {
                    Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                    Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                    _ => i.to_sql(ty, out),
                },
                SqlValue::Real(f) => f.to_sql(ty, out),
                SqlValue::Text(s) => s.to_sql(ty, out),
                SqlValue::Blob(b) => b.to_sql(ty, out),
                SqlValue::Bool(b) => b.to_sql(ty, out),
                SqlValue::Timestamp(ts) => {
                    if *ty == Type::TIMESTAMP {
                        ts.naive_utc().to_sql(ty, out)
                    } else {
                        ts.to_sql(ty, out)
                    }
                }
            }
        }

        fn accepts(_ty: &Type) -> bool {
            true
        }

        to_sql_checked!();
    }

    fn read_row(row: &postgres::Row) -> Row {
        let values = row
            .columns()
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let value = match *column.type_() {
                    Type::BOOL => row.try_get::<_, Option<bool>>(i).map(|v| v.map(SqlValue::Bool)),
                    Type::INT2 => row
                        .try_get::<_, Option<i16>>(i)
                        .map(|v| v.map(|n| SqlValue::Integer(n.into()))),
                    Type::INT4 => row
                        .try_get::<_, Option<i32>>(i)
                        .map(|v| v.map(|n| SqlValue::Integer(n.into()))),
                    Type::INT8 => row
                        .try_get::<_, Option<i64>>(i)
                        .map(|v| v.map(SqlValue::Integer)),
                    Type::FLOAT8 => row
                        .try_get::<_, Option<f64>>(i)
                        .map(|v| v.map(SqlValue::Real)),
                    Type::BYTEA => row
                        .try_get::<_, Option<Vec<u8>>>(i)
                        .map(|v| v.map(SqlValue::Blob)),
                    Type::TIMESTAMP => row
                        .try_get::<_, Option<NaiveDateTime>>(i)
                        .map(|v| v.map(|n| SqlValue::Timestamp(n.and_utc()))),
                    Type::TIMESTAMPTZ => row
                        .try_get::<_, Option<DateTime<Utc>>>(i)
                        .map(|v| v.map(SqlValue::Timestamp)),
                    _ => row
                        .try_get::<_, Option<String>>(i)
                        .map(|v| v.map(SqlValue::Text)),
                };
                match value {
                    Ok(Some(v)) => v,
                    Ok(None) => SqlValue::Null,
                    Err(e) => {
                        warn!("Unreadable column {} ({}): {}", column.name(), column.type_(), e);
                        SqlValue::Null
                    }
                }
            })
            .collect();
        Row::new(values)
    }

    impl Backend for PostgresBackend {
        fn execute_batch(&self, sql: &str) -> Result<()> {
            self.pool.get()?.batch_execute(sql)?;
            Ok(())
        }

        fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
            let mut conn = self.pool.get()?;
            let refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            let changed = conn.execute(sql, &refs)?;
            Ok(changed as usize)
        }

        fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
            let mut conn = self.pool.get()?;
            let refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            let rows = conn.query(sql, &refs)?;
            Ok(rows.iter().map(read_row).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(500);
        let c = a + chrono::Duration::seconds(61);
        let (fa, fb, fc) = (format_timestamp(&a), format_timestamp(&b), format_timestamp(&c));
        assert_eq!(fa, "2024-01-01T10:00:00.000Z");
        assert!(fa < fb && fb < fc);
    }

    #[test]
    fn test_row_accessors() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 8, 30, 0).unwrap();
        let row = Row::new(vec![
            SqlValue::Text("hello".into()),
            SqlValue::Integer(1),
            SqlValue::Text(format_timestamp(&ts)),
            SqlValue::Null,
            SqlValue::Text("2024-03-05 08:30:00+00:00".into()),
        ]);
        assert_eq!(row.text(0).unwrap(), "hello");
        assert_eq!(row.opt_bool(1).unwrap(), Some(true));
        assert_eq!(row.timestamp(2).unwrap(), ts);
        assert_eq!(row.opt_text(3).unwrap(), None);
        assert!(row.blob(3).unwrap().is_empty());
        assert_eq!(row.timestamp(4).unwrap(), ts);
        assert!(row.text(1).is_err());
        assert!(row.text(9).is_err());
    }

    #[test]
    fn test_sqlite_roundtrip_values() {
        let db = SqliteBackend::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (a TEXT, b BLOB, c BOOLEAN, d TIMESTAMP)")
            .unwrap();
        let ts = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        let changed = db
            .execute(
                "INSERT INTO t VALUES (?, ?, ?, ?)",
                &["x".into(), vec![1u8, 2, 3].into(), true.into(), ts.into()],
            )
            .unwrap();
        assert_eq!(changed, 1);

        let rows = db.query("SELECT a, b, c, d FROM t", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text(0).unwrap(), "x");
        assert_eq!(rows[0].blob(1).unwrap(), vec![1, 2, 3]);
        assert_eq!(rows[0].opt_bool(2).unwrap(), Some(true));
        assert_eq!(rows[0].timestamp(3).unwrap(), ts);
    }
}
