//! Command dispatch
//!
//! A request body is a command document whose first key names the command.
//! Parsing turns it into a [`Command`]; the [`Executor`] runs it against the
//! backend and [`reply`] shapes the answer.
//!
//! ```text
//! { insert: "mongo", documents: [ {...}, ... ], $db: "test" }
//! { find: "mongo", filter: { field: { $eq: 3 } }, limit: 1, $db: "test" }
//! { getMore: 8127, collection: "mongo", $db: "test" }
//! ```

pub mod cursor;
mod executor;
pub mod reply;

pub use cursor::CursorTable;
pub use executor::{Executor, RequestPhase, SessionState};

use mql::{Document, Value};

use crate::error::{Error, Result};

/// Commands that exist in MongoDB but that the gateway does not implement
const UNSUPPORTED: &[&str] = &[
    "aggregate",
    "distinct",
    "findAndModify",
    "findandmodify",
    "mapReduce",
    "createIndexes",
    "dropIndexes",
    "listCollections",
    "listIndexes",
    "listDatabases",
    "create",
    "collMod",
    "renameCollection",
    "dropDatabase",
    "saslStart",
    "saslContinue",
    "authenticate",
    "logout",
    "getnonce",
    "startSession",
    "refreshSessions",
    "abortTransaction",
    "commitTransaction",
    "explain",
    "getLastError",
    "getLog",
    "getParameter",
    "serverStatus",
    "hostInfo",
    "connectionStatus",
    "dbStats",
    "collStats",
    "validate",
    "currentOp",
    "killOp",
    "replSetGetStatus",
    "shardCollection",
];

/// A parsed client command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Insert(InsertCommand),
    Find(FindCommand),
    FindOne(FindOneCommand),
    GetMore(GetMoreCommand),
    KillCursors { collection: String, cursor_ids: Vec<i64> },
    Update(UpdateCommand),
    Delete(DeleteCommand),
    Drop { collection: String },
    Count(CountCommand),
    Ping,
    Hello,
    BuildInfo,
    EndSessions,
    WhatsMyUri,
    /// Known to MongoDB, not implemented here
    Unsupported { name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertCommand {
    pub collection: String,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindCommand {
    pub collection: String,
    pub filter: Document,
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: u64,
    /// Negative means a single batch of `|limit|` documents
    pub limit: Option<i64>,
    pub batch_size: Option<u64>,
    pub single_batch: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindOneCommand {
    pub collection: String,
    pub filter: Document,
    pub projection: Option<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreCommand {
    pub cursor_id: i64,
    pub collection: String,
    pub batch_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCommand {
    pub collection: String,
    pub updates: Vec<UpdateStatement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub query: Document,
    pub update: Document,
    pub multi: bool,
    pub upsert: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteCommand {
    pub collection: String,
    pub deletes: Vec<DeleteStatement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub query: Document,
    /// 0 deletes every match, 1 at most one
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountCommand {
    pub collection: String,
    pub query: Document,
    pub skip: u64,
    pub limit: Option<u64>,
}

impl Command {
    /// Parse a command document
    pub fn parse(body: &Document) -> Result<Self> {
        let (name, _) = body
            .first()
            .ok_or_else(|| Error::bad_command("empty command document"))?;

        Ok(match name.as_str() {
            "insert" => Command::Insert(InsertCommand {
                collection: collection_arg(body, name)?,
                documents: documents(body, "documents")?,
            }),
            "find" => Command::Find(FindCommand {
                collection: collection_arg(body, name)?,
                filter: opt_document(body, "filter")?.unwrap_or_default(),
                projection: opt_document(body, "projection")?,
                sort: opt_document(body, "sort")?,
                skip: opt_u64(body, "skip")?.unwrap_or(0),
                limit: opt_i64(body, "limit")?.filter(|l| *l != 0),
                batch_size: opt_u64(body, "batchSize")?,
                single_batch: opt_bool(body, "singleBatch")?,
            }),
            "findOne" => Command::FindOne(FindOneCommand {
                collection: collection_arg(body, name)?,
                filter: opt_document(body, "filter")?.unwrap_or_default(),
                projection: opt_document(body, "projection")?,
            }),
            "getMore" => Command::GetMore(GetMoreCommand {
                cursor_id: opt_i64(body, name)?
                    .ok_or_else(|| Error::bad_command("getMore requires a cursor id"))?,
                collection: required_str(body, "collection")?,
                batch_size: opt_u64(body, "batchSize")?,
            }),
            "killCursors" => Command::KillCursors {
                collection: collection_arg(body, name)?,
                cursor_ids: array(body, "cursors")?
                    .iter()
                    .map(|v| integer(v).ok_or_else(|| Error::bad_command("cursor ids must be integers")))
                    .collect::<Result<_>>()?,
            },
            "update" => Command::Update(UpdateCommand {
                collection: collection_arg(body, name)?,
                updates: documents(body, "updates")?
                    .iter()
                    .map(|statement| -> Result<UpdateStatement> {
                        Ok(UpdateStatement {
                            query: opt_document(statement, "q")?.unwrap_or_default(),
                            update: opt_document(statement, "u")?
                                .ok_or_else(|| Error::bad_command("update statement requires 'u'"))?,
                            multi: opt_bool(statement, "multi")?,
                            upsert: opt_bool(statement, "upsert")?,
                        })
                    })
                    .collect::<Result<_>>()?,
            }),
            "delete" => Command::Delete(DeleteCommand {
                collection: collection_arg(body, name)?,
                deletes: documents(body, "deletes")?
                    .iter()
                    .map(|statement| -> Result<DeleteStatement> {
                        let limit = opt_u64(statement, "limit")?
                            .ok_or_else(|| Error::bad_command("delete statement requires 'limit'"))?;
                        if limit > 1 {
                            return Err(Error::bad_command("delete limit must be 0 or 1"));
                        }
                        Ok(DeleteStatement {
                            query: opt_document(statement, "q")?.unwrap_or_default(),
                            limit,
                        })
                    })
                    .collect::<Result<_>>()?,
            }),
            "drop" => Command::Drop {
                collection: collection_arg(body, name)?,
            },
            "count" => Command::Count(CountCommand {
                collection: collection_arg(body, name)?,
                query: opt_document(body, "query")?.unwrap_or_default(),
                skip: opt_u64(body, "skip")?.unwrap_or(0),
                limit: opt_i64(body, "limit")?.filter(|l| *l != 0).map(i64::unsigned_abs),
            }),
            "ping" => Command::Ping,
            "hello" | "isMaster" | "ismaster" => Command::Hello,
            "buildInfo" | "buildinfo" => Command::BuildInfo,
            "endSessions" => Command::EndSessions,
            "whatsmyuri" => Command::WhatsMyUri,
            other if UNSUPPORTED.contains(&other) => Command::Unsupported {
                name: other.to_string(),
            },
            other => {
                return Err(Error::CommandNotFound {
                    command: other.to_string(),
                })
            }
        })
    }

    /// The command name, for logging
    pub fn name(&self) -> &str {
        match self {
            Command::Insert(_) => "insert",
            Command::Find(_) => "find",
            Command::FindOne(_) => "findOne",
            Command::GetMore(_) => "getMore",
            Command::KillCursors { .. } => "killCursors",
            Command::Update(_) => "update",
            Command::Delete(_) => "delete",
            Command::Drop { .. } => "drop",
            Command::Count(_) => "count",
            Command::Ping => "ping",
            Command::Hello => "hello",
            Command::BuildInfo => "buildInfo",
            Command::EndSessions => "endSessions",
            Command::WhatsMyUri => "whatsmyuri",
            Command::Unsupported { name } => name,
        }
    }

    /// Whether a command body only reads, so a run can be abandoned without
    /// leaving partial writes behind
    pub fn is_read_only(body: &Document) -> bool {
        matches!(
            body.first().map(|(name, _)| name.as_str()),
            Some("find" | "findOne" | "count" | "getMore")
        )
    }

    /// The collection the command targets, if any
    pub fn collection(&self) -> Option<&str> {
        match self {
            Command::Insert(c) => Some(&c.collection),
            Command::Find(c) => Some(&c.collection),
            Command::FindOne(c) => Some(&c.collection),
            Command::GetMore(c) => Some(&c.collection),
            Command::Update(c) => Some(&c.collection),
            Command::Delete(c) => Some(&c.collection),
            Command::Count(c) => Some(&c.collection),
            Command::KillCursors { collection, .. } | Command::Drop { collection } => Some(collection),
            _ => None,
        }
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

fn collection_arg(body: &Document, name: &str) -> Result<String> {
    match body.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(Error::bad_command(format!(
            "collection name has invalid type {}",
            other.type_name()
        ))),
        None => Err(Error::bad_command(format!("{} requires a collection name", name))),
    }
}

fn required_str(body: &Document, key: &str) -> Result<String> {
    body.get_str(key)
        .map(str::to_string)
        .ok_or_else(|| Error::bad_command(format!("'{}' must be a string", key)))
}

fn opt_document(body: &Document, key: &str) -> Result<Option<Document>> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Document(doc)) => Ok(Some(doc.clone())),
        Some(other) => Err(Error::bad_command(format!(
            "'{}' must be a document, not {}",
            key,
            other.type_name()
        ))),
    }
}

fn array<'a>(body: &'a Document, key: &str) -> Result<&'a [Value]> {
    body.get_array(key)
        .map(Vec::as_slice)
        .ok_or_else(|| Error::bad_command(format!("'{}' must be an array", key)))
}

fn documents(body: &Document, key: &str) -> Result<Vec<Document>> {
    array(body, key)?
        .iter()
        .map(|v| {
            v.as_document()
                .cloned()
                .ok_or_else(|| Error::bad_command(format!("'{}' must contain only documents", key)))
        })
        .collect()
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Double(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
        _ => None,
    }
}

fn opt_i64(body: &Document, key: &str) -> Result<Option<i64>> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => integer(value)
            .map(Some)
            .ok_or_else(|| Error::bad_command(format!("'{}' must be an integer", key))),
    }
}

fn opt_u64(body: &Document, key: &str) -> Result<Option<u64>> {
    match opt_i64(body, key)? {
        Some(n) if n < 0 => Err(Error::bad_command(format!("'{}' must not be negative", key))),
        other => Ok(other.map(|n| n as u64)),
    }
}

fn opt_bool(body: &Document, key: &str) -> Result<bool> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(value @ (Value::Bool(_) | Value::Int(_) | Value::Double(_))) => Ok(value.truthy()),
        Some(other) => Err(Error::bad_command(format!(
            "'{}' must be a boolean, not {}",
            key,
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_commands() {
        assert!(Command::is_read_only(&Document::new().with("find", "c")));
        assert!(Command::is_read_only(&Document::new().with("getMore", 5i64).with("collection", "c")));
        assert!(!Command::is_read_only(&Document::new().with("update", "c")));
        assert!(!Command::is_read_only(&Document::new().with("insert", "c")));
        assert!(!Command::is_read_only(&Document::new()));
    }

    #[test]
    fn test_parse_insert() {
        let body = Document::new()
            .with("insert", "mongo")
            .with("documents", vec![Value::Document(Document::new().with("field", 1i64))])
            .with("$db", "test");
        match Command::parse(&body).unwrap() {
            Command::Insert(insert) => {
                assert_eq!(insert.collection, "mongo");
                assert_eq!(insert.documents.len(), 1);
            }
            other => panic!("Expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_find_defaults() {
        let body = Document::new().with("find", "mongo").with("limit", 0i64);
        let Command::Find(find) = Command::parse(&body).unwrap() else {
            panic!("Expected find");
        };
        assert!(find.filter.is_empty());
        assert_eq!(find.limit, None);
        assert_eq!(find.skip, 0);
        assert!(!find.single_batch);
    }

    #[test]
    fn test_parse_handshake_aliases() {
        for name in ["hello", "isMaster", "ismaster"] {
            let body = Document::new().with(name, 1i64);
            assert_eq!(Command::parse(&body).unwrap(), Command::Hello);
        }
    }

    #[test]
    fn test_unsupported_and_unknown() {
        let aggregate = Document::new().with("aggregate", "mongo");
        assert_eq!(
            Command::parse(&aggregate).unwrap(),
            Command::Unsupported { name: "aggregate".into() }
        );

        let err = Command::parse(&Document::new().with("frobnicate", 1i64)).unwrap_err();
        assert_eq!(err.code(), 59);
    }

    #[test]
    fn test_bad_arguments() {
        let no_docs = Document::new().with("insert", "mongo");
        assert_eq!(Command::parse(&no_docs).unwrap_err().code(), 9);

        let bad_filter = Document::new().with("find", "mongo").with("filter", 3i64);
        assert_eq!(Command::parse(&bad_filter).unwrap_err().code(), 9);

        let bad_limit = Document::new()
            .with("delete", "mongo")
            .with("deletes", vec![Value::Document(Document::new().with("q", Document::new()).with("limit", 5i64))]);
        assert!(Command::parse(&bad_limit).is_err());

        assert!(Command::parse(&Document::new()).is_err());
    }

    #[test]
    fn test_parse_update_statements() {
        let body = Document::new().with("update", "mongo").with(
            "updates",
            vec![Value::Document(
                Document::new()
                    .with("q", Document::new().with("a", 1i64))
                    .with("u", Document::new().with("$set", Document::new().with("b", 2i64)))
                    .with("multi", true),
            )],
        );
        let Command::Update(update) = Command::parse(&body).unwrap() else {
            panic!("Expected update");
        };
        assert!(update.updates[0].multi);
        assert!(!update.updates[0].upsert);
    }
}
