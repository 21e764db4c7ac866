//! SQLite backend
//!
//! One connection behind a mutex; every call runs on tokio's blocking pool
//! so the socket tasks never stall on the engine.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::backend::{Backend, BackendError, Row, SqlValue};

/// A [`Backend`] over an embedded SQLite database
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Ok(Self::from_connection(conn))
    }

    /// A private in-memory database
    pub fn open_in_memory() -> Result<Self, BackendError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    /// Open a file when a path is given, else an in-memory database
    pub fn open_optional(path: Option<&Path>) -> Result<Self, BackendError> {
        match path {
            Some(path) => Self::open(path),
            None => Self::open_in_memory(),
        }
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| BackendError::Other(format!("backend task failed: {}", e)))?;

        result.map_err(BackendError::from)
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, BackendError> {
        debug!(sql, params = params.len(), "query");
        let sql = sql.to_string();
        let params: Vec<SqliteValue> = params.iter().map(to_sqlite).collect();

        self.run(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns = stmt.column_count();
            let rows = stmt.query_map(params_from_iter(params), |row| {
                (0..columns)
                    .map(|i| row.get_ref(i).map(from_sqlite))
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map(Row::new)
            })?;
            let collected = rows.collect::<rusqlite::Result<Vec<_>>>();
            collected
        })
        .await
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, BackendError> {
        debug!(sql, params = params.len(), "execute");
        let sql = sql.to_string();
        let params: Vec<SqliteValue> = params.iter().map(to_sqlite).collect();

        self.run(move |conn| conn.execute(&sql, params_from_iter(params)).map(|n| n as u64))
            .await
    }
}

fn to_sqlite(value: &SqlValue) -> SqliteValue {
    match value {
        SqlValue::Null => SqliteValue::Null,
        SqlValue::Integer(i) => SqliteValue::Integer(*i),
        SqlValue::Real(f) => SqliteValue::Real(*f),
        SqlValue::Text(s) => SqliteValue::Text(s.clone()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) | ValueRef::Blob(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
                BackendError::ConstraintViolation(msg.clone().unwrap_or_else(|| err.to_string()))
            }
            rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.starts_with("no such table") => {
                BackendError::NoSuchTable(msg.trim_start_matches("no such table:").trim().to_string())
            }
            _ => BackendError::Other(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_and_query() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .execute("CREATE TABLE t (id TEXT PRIMARY KEY, doc JSON)", &[])
            .await
            .unwrap();
        let n = backend
            .execute(
                "INSERT INTO t (id, doc) VALUES (?, ?)",
                &[SqlValue::Text("a".into()), SqlValue::Text(r#"{"field":3}"#.into())],
            )
            .await
            .unwrap();
        assert_eq!(n, 1);

        let rows = backend
            .query(
                "SELECT id, json_extract(doc, '$.field') FROM t WHERE json_extract(doc, '$.field') = ?",
                &[SqlValue::Integer(3)],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text(0), Some("a"));
        assert_eq!(rows[0].integer(1), Some(3));
    }

    #[tokio::test]
    async fn test_error_classification() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let missing = backend.query("SELECT * FROM nope", &[]).await.unwrap_err();
        assert!(matches!(missing, BackendError::NoSuchTable(ref t) if t == "nope"));

        backend.execute("CREATE TABLE t (id TEXT PRIMARY KEY)", &[]).await.unwrap();
        backend.execute("INSERT INTO t VALUES ('x')", &[]).await.unwrap();
        let dup = backend.execute("INSERT INTO t VALUES ('x')", &[]).await.unwrap_err();
        assert!(matches!(dup, BackendError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_file_backend_persists() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("data.db");
        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.execute("CREATE TABLE t (id TEXT)", &[]).await.unwrap();
            backend.execute("INSERT INTO t VALUES ('kept')", &[]).await.unwrap();
        }
        let reopened = SqliteBackend::open(&path).unwrap();
        let rows = reopened.query("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(rows[0].text(0), Some("kept"));
    }
}
