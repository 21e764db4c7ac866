//! The relational backend capability
//!
//! Everything the gateway needs from a database engine: run a query and get
//! rows back, or run a statement and get the affected-row count. Both are
//! the only blocking points besides the socket.

use async_trait::async_trait;
use thiserror::Error;

/// A bound parameter or a column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// One result row, columns in select-list order
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn text(&self, index: usize) -> Option<&str> {
        match self.values.get(index) {
            Some(SqlValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, index: usize) -> Option<i64> {
        match self.values.get(index) {
            Some(SqlValue::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Failures reported by a backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("no such table: {0}")]
    NoSuchTable(String),

    #[error("{0}")]
    Other(String),
}

/// A relational engine the gateway can drive
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run a query and return all of its rows
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, BackendError>;

    /// Run a statement and return the number of affected rows
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, BackendError>;
}
