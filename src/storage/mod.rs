//! Storage layer for nosqlgate
//!
//! Collections live in relational tables reached through the [`Backend`]
//! capability. The gateway never talks to a database engine directly.

pub mod backend;
pub mod collection;
pub mod sqlite;

pub use backend::{Backend, BackendError, Row, SqlValue};
pub use collection::Collection;
pub use sqlite::SqliteBackend;
