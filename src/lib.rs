//! nosqlgate - a MongoDB wire-protocol gateway over a relational database
//!
//! Stock MongoDB drivers connect to the gateway; documents are stored as
//! JSON text in one table per collection and filters become SQL predicates.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          nosqlgate                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │              Server / Session (one task per client)         ││
//! │  │        OP_MSG, OP_QUERY framing, cursors, timeouts          ││
//! │  └──────────────────────────┬──────────────────────────────────┘│
//! │                             │                                   │
//! │                             ▼                                   │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │                   Command Dispatcher                        ││
//! │  │  (insert, find, findOne, getMore, update, delete, drop, ..) ││
//! │  └───────┬──────────────────┬──────────────────────┬───────────┘│
//! │          │                  │                      │            │
//! │          ▼                  ▼                      ▼            │
//! │  ┌─────────────┐  ┌───────────────────┐  ┌───────────────────┐  │
//! │  │  Document   │  │  Query Translator │  │  Result           │  │
//! │  │  Codec      │  │  (MQL -> SQL)     │  │  Materializer     │  │
//! │  └─────────────┘  └─────────┬─────────┘  └─────────▲─────────┘  │
//! │                             │                      │            │
//! │                             ▼                      │            │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │                 Collection / Backend trait                  ││
//! │  │        ("id" TEXT PRIMARY KEY, "doc" JSON) per table        ││
//! │  └──────────────────────────┬──────────────────────────────────┘│
//! │                             ▼                                   │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │                  SQLite (json_extract)                      ││
//! │  └─────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod materialize;
pub mod query;
pub mod server;
pub mod storage;
pub mod validation;

pub use command::{Command, Executor};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use server::Server;
pub use storage::{Backend, SqliteBackend};

use std::sync::Arc;

/// The main gateway handle
pub struct Gateway {
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
}

impl Gateway {
    /// Open the SQLite database named by the configuration
    /// (in memory when no path is configured)
    pub fn open(config: Config) -> Result<Self> {
        let backend = SqliteBackend::open_optional(config.database_path.as_deref())?;
        Ok(Self::with_backend(config, Arc::new(backend)))
    }

    /// Use an already-constructed backend
    pub fn with_backend(config: Config, backend: Arc<dyn Backend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A command executor sharing this gateway's backend
    pub fn executor(&self) -> Executor {
        Executor::new(Arc::clone(&self.backend), Arc::clone(&self.config))
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<Server> {
        Server::bind(self.executor()).await
    }
}
