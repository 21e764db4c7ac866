//! Collection - a group of documents stored in one table
//!
//! Collections are tables with two columns: the canonical `_id` key and the
//! document as JSON text.
//!
//! ```text
//! CREATE TABLE "mongo" (
//!     "id"  TEXT PRIMARY KEY,
//!     "doc" JSON NOT NULL
//! )
//! ```
//!
//! A collection that was never written to has no table. Reads, counts,
//! updates and deletes against it see an empty collection.

use super::backend::{Backend, BackendError, SqlValue};
use crate::config::TableSchema;
use crate::error::{Error, Result};
use crate::query::{quote_ident, Predicate};
use crate::validation::{validate_collection_name, validate_database_name};

/// A stored row: the identifier key and the JSON payload
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub key: String,
    pub json: String,
}

/// Paging applied to a select
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub skip: u64,
    pub limit: Option<u64>,
}

/// A collection of documents
pub struct Collection<'a> {
    /// Database the client addressed
    pub database: String,
    /// Name of the collection (table name)
    pub name: String,
    table: String,
    backend: &'a dyn Backend,
    schema: &'a TableSchema,
}

impl<'a> Collection<'a> {
    /// Open a collection; the name is validated before any SQL uses it
    pub fn open(
        database: &str,
        name: &str,
        backend: &'a dyn Backend,
        schema: &'a TableSchema,
    ) -> Result<Self> {
        validate_database_name(database)?;
        validate_collection_name(name)?;
        Ok(Self {
            database: database.to_string(),
            name: name.to_string(),
            table: quote_ident(name),
            backend,
            schema,
        })
    }

    /// `<database>.<collection>`
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }

    fn id(&self) -> String {
        quote_ident(&self.schema.id_column)
    }

    fn doc(&self) -> String {
        quote_ident(&self.schema.doc_column)
    }

    /// Create the table if it doesn't exist
    pub async fn ensure_exists(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY, {} JSON NOT NULL)",
            self.table,
            self.id(),
            self.doc()
        );
        self.backend.execute(&sql, &[]).await?;
        Ok(())
    }

    /// Drop the table; a missing table is not an error
    pub async fn drop(&self) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.table);
        self.backend.execute(&sql, &[]).await?;
        Ok(())
    }

    /// Insert one row; a key already present is a duplicate key error
    pub async fn insert(&self, key: &str, json: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES (?, ?)",
            self.table,
            self.id(),
            self.doc()
        );
        let params = [SqlValue::Text(key.to_string()), SqlValue::Text(json.to_string())];

        match self.backend.execute(&sql, &params).await {
            Ok(_) => Ok(()),
            Err(BackendError::ConstraintViolation(_)) => Err(Error::DuplicateKey {
                namespace: self.namespace(),
                key: format!("{:?}", key),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Rows matching a predicate, optionally ordered and paged
    pub async fn select(
        &self,
        predicate: &Predicate,
        order_by: &str,
        window: Window,
    ) -> Result<Vec<StoredDocument>> {
        let mut sql = format!(
            "SELECT {}, {} FROM {} WHERE {}",
            self.id(),
            self.doc(),
            self.table,
            predicate.sql
        );
        if !order_by.is_empty() {
            sql.push(' ');
            sql.push_str(order_by);
        }

        let mut params = predicate.params.clone();
        if window.limit.is_some() || window.skip > 0 {
            // SQLite needs a LIMIT before OFFSET; -1 means unbounded
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(SqlValue::Integer(window.limit.map(clamp).unwrap_or(-1)));
            params.push(SqlValue::Integer(clamp(window.skip)));
        }

        let rows = match self.backend.query(&sql, &params).await {
            Ok(rows) => rows,
            Err(BackendError::NoSuchTable(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        rows.into_iter()
            .map(|row| match (row.text(0), row.text(1)) {
                (Some(key), Some(json)) => Ok(StoredDocument {
                    key: key.to_string(),
                    json: json.to_string(),
                }),
                _ => Err(Error::codec(format!(
                    "row in '{}' is missing its key or payload",
                    self.name
                ))),
            })
            .collect()
    }

    /// Number of rows matching a predicate
    pub async fn count(&self, predicate: &Predicate, window: Window) -> Result<u64> {
        let inner = format!(
            "SELECT 1 FROM {} WHERE {} LIMIT ? OFFSET ?",
            self.table, predicate.sql
        );
        let sql = format!("SELECT COUNT(*) FROM ({})", inner);
        let mut params = predicate.params.clone();
        params.push(SqlValue::Integer(window.limit.map(clamp).unwrap_or(-1)));
        params.push(SqlValue::Integer(clamp(window.skip)));

        match self.backend.query(&sql, &params).await {
            Ok(rows) => Ok(rows.first().and_then(|r| r.integer(0)).unwrap_or(0) as u64),
            Err(BackendError::NoSuchTable(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite the payload of the row with the given key
    pub async fn update(&self, key: &str, json: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET {} = ? WHERE {} = ?",
            self.table,
            self.doc(),
            self.id()
        );
        let params = [SqlValue::Text(json.to_string()), SqlValue::Text(key.to_string())];
        match self.backend.execute(&sql, &params).await {
            Ok(n) => Ok(n > 0),
            Err(BackendError::NoSuchTable(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete rows matching a predicate; `limit` bounds how many
    pub async fn delete(&self, predicate: &Predicate, limit: Option<u64>) -> Result<u64> {
        let mut params = predicate.params.clone();
        let sql = match limit {
            None => format!("DELETE FROM {} WHERE {}", self.table, predicate.sql),
            Some(n) => {
                params.push(SqlValue::Integer(clamp(n)));
                format!(
                    "DELETE FROM {table} WHERE {id} IN (SELECT {id} FROM {table} WHERE {pred} LIMIT ?)",
                    table = self.table,
                    id = self.id(),
                    pred = predicate.sql
                )
            }
        };

        match self.backend.execute(&sql, &params).await {
            Ok(n) => Ok(n),
            Err(BackendError::NoSuchTable(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

fn clamp(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::translate_filter;
    use crate::storage::SqliteBackend;
    use mql::Document;

    fn pred(filter: Document) -> Predicate {
        translate_filter(&filter, &TableSchema::default()).unwrap()
    }

    #[tokio::test]
    async fn test_collection_crud() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let schema = TableSchema::default();
        let collection = Collection::open("test", "todos", &backend, &schema).unwrap();
        assert_eq!(collection.namespace(), "test.todos");

        // Create
        collection.ensure_exists().await.unwrap();
        collection.insert("a", r#"{"_id":"a","done":false}"#).await.unwrap();
        collection.insert("b", r#"{"_id":"b","done":true}"#).await.unwrap();

        // Read
        let rows = collection
            .select(&pred(Document::new().with("done", true)), "", Window::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "b");

        // Update
        assert!(collection.update("a", r#"{"_id":"a","done":true}"#).await.unwrap());
        assert!(!collection.update("zzz", "{}").await.unwrap());
        assert_eq!(collection.count(&Predicate::all(), Window::default()).await.unwrap(), 2);

        // Delete one
        let deleted = collection.delete(&Predicate::all(), Some(1)).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(collection.count(&Predicate::all(), Window::default()).await.unwrap(), 1);

        // Drop
        collection.drop().await.unwrap();
        collection.drop().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_key() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let schema = TableSchema::default();
        let collection = Collection::open("test", "mongo", &backend, &schema).unwrap();
        collection.ensure_exists().await.unwrap();
        collection.insert("k", "{}").await.unwrap();
        let err = collection.insert("k", "{}").await.unwrap_err();
        assert_eq!(err.code(), 11000);
        assert!(err.to_string().contains("test.mongo"));
    }

    #[tokio::test]
    async fn test_missing_table_reads_as_empty() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let schema = TableSchema::default();
        let collection = Collection::open("test", "ghost", &backend, &schema).unwrap();
        let all = Predicate::all();
        assert!(collection.select(&all, "", Window::default()).await.unwrap().is_empty());
        assert_eq!(collection.count(&all, Window::default()).await.unwrap(), 0);
        assert_eq!(collection.delete(&all, None).await.unwrap(), 0);
        assert!(!collection.update("x", "{}").await.unwrap());
    }

    #[tokio::test]
    async fn test_paging() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let schema = TableSchema::default();
        let collection = Collection::open("test", "nums", &backend, &schema).unwrap();
        collection.ensure_exists().await.unwrap();
        for i in 0..10 {
            collection
                .insert(&i.to_string(), &format!(r#"{{"n":{}}}"#, i))
                .await
                .unwrap();
        }
        let order = r#"ORDER BY json_extract("doc", '$.n') DESC"#;
        let rows = collection
            .select(&Predicate::all(), order, Window { skip: 2, limit: Some(3) })
            .await
            .unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["7", "6", "5"]);

        let skipped = collection
            .select(&Predicate::all(), "", Window { skip: 8, limit: None })
            .await
            .unwrap();
        assert_eq!(skipped.len(), 2);
        assert_eq!(
            collection.count(&Predicate::all(), Window { skip: 8, limit: None }).await.unwrap(),
            2
        );
    }

    #[test]
    fn test_invalid_names_rejected() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let schema = TableSchema::default();
        assert!(Collection::open("test", "x\"; DROP TABLE y", &backend, &schema).is_err());
        assert!(Collection::open("bad.db", "x", &backend, &schema).is_err());
    }
}
