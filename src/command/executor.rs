//! Command execution engine

use mql::{Document, Update, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::cursor::{Cursor, CursorTable};
use super::{
    reply, Command, CountCommand, DeleteCommand, DeleteStatement, FindCommand, FindOneCommand,
    GetMoreCommand, InsertCommand, UpdateCommand, UpdateStatement,
};
use crate::codec::{binary, id_key, json, new_object_id};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::materialize::{decode_row, materialize};
use crate::query::{projection, translate_filter, translate_sort};
use crate::storage::collection::{Collection, Window};
use crate::storage::Backend;

/// Where a request is in its lifecycle, for log correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Parsed,
    Routed,
    Executed,
    Replied,
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestPhase::Received => "received",
            RequestPhase::Parsed => "parsed",
            RequestPhase::Routed => "routed",
            RequestPhase::Executed => "executed",
            RequestPhase::Replied => "replied",
        };
        f.write_str(name)
    }
}

/// State one connection carries between requests
#[derive(Debug)]
pub struct SessionState {
    /// Database selected by the last `$db` (or the configured default)
    pub database: String,
    pub cursors: CursorTable,
    /// Client address as reported by `whatsmyuri`
    pub peer: String,
}

impl SessionState {
    pub fn new(database: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            cursors: CursorTable::new(),
            peer: peer.into(),
        }
    }
}

/// Runs commands against the backend; shared by every connection
#[derive(Clone)]
pub struct Executor {
    backend: Arc<dyn Backend>,
    config: Arc<Config>,
}

impl Executor {
    pub fn new(backend: Arc<dyn Backend>, config: Arc<Config>) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Parse, route and execute one command document.
    ///
    /// Always produces a reply; failures become `{ok: 0, ...}` documents.
    pub async fn handle(&self, state: &mut SessionState, body: &Document) -> Document {
        if let Some(db) = body.get_str("$db") {
            state.database = db.to_string();
        }

        let command = match Command::parse(body) {
            Ok(command) => command,
            Err(err) => {
                warn!(phase = %RequestPhase::Parsed, code = err.code(), error = %err, "rejected command");
                return reply::error(&err);
            }
        };

        let name = command.name().to_string();
        debug!(
            phase = %RequestPhase::Routed,
            command = %name,
            database = %state.database,
            collection = command.collection().unwrap_or(""),
            "dispatching"
        );

        match self.execute(state, command).await {
            Ok(reply) => {
                debug!(phase = %RequestPhase::Executed, command = %name);
                reply
            }
            Err(err) => {
                warn!(phase = %RequestPhase::Executed, command = %name, code = err.code(), error = %err, "command failed");
                reply::error(&err)
            }
        }
    }

    /// Execute a parsed command
    pub async fn execute(&self, state: &mut SessionState, command: Command) -> Result<Document> {
        let deadline = self.config.command_timeout().map(|t| Instant::now() + t);

        match command {
            Command::Insert(cmd) => self.insert(&state.database, cmd, deadline).await,
            Command::Find(cmd) => self.find(state, cmd, deadline).await,
            Command::FindOne(cmd) => self.find_one(&state.database, cmd, deadline).await,
            Command::GetMore(cmd) => self.get_more(state, cmd, deadline).await,
            Command::KillCursors { cursor_ids, .. } => Ok(kill_cursors(&mut state.cursors, &cursor_ids)),
            Command::Update(cmd) => self.update(&state.database, cmd, deadline).await,
            Command::Delete(cmd) => self.delete(&state.database, cmd, deadline).await,
            Command::Drop { collection } => {
                let collection = self.collection(&state.database, &collection)?;
                collection.drop().await?;
                Ok(reply::ok(Document::new().with("ns", collection.namespace())))
            }
            Command::Count(cmd) => self.count(&state.database, cmd, deadline).await,
            Command::Ping | Command::EndSessions => Ok(reply::ok(Document::new())),
            Command::Hello => Ok(reply::hello(&self.config, now_millis())),
            Command::BuildInfo => Ok(reply::build_info()),
            Command::WhatsMyUri => Ok(reply::ok(Document::new().with("you", state.peer.clone()))),
            Command::Unsupported { name } => Err(Error::NotSupported { command: name }),
        }
    }

    fn collection<'a>(&'a self, database: &str, name: &str) -> Result<Collection<'a>> {
        Collection::open(database, name, self.backend.as_ref(), &self.config.table)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    async fn insert(&self, database: &str, cmd: InsertCommand, deadline: Option<Instant>) -> Result<Document> {
        let collection = self.collection(database, &cmd.collection)?;
        collection.ensure_exists().await?;

        let mut inserted = 0i64;
        let mut write_errors = Vec::new();
        for (index, doc) in cmd.documents.into_iter().enumerate() {
            // Documents after the deadline are reported, never attempted
            let outcome = if expired(deadline) {
                Err(Error::Timeout)
            } else {
                self.insert_one(&collection, doc).await
            };
            match outcome {
                Ok(()) => inserted += 1,
                Err(err) => {
                    debug!(index, code = err.code(), error = %err, "insert failed");
                    write_errors.push(reply::write_error(index, &err));
                }
            }
        }

        let mut body = Document::new().with("n", inserted);
        if !write_errors.is_empty() {
            body.insert("writeErrors", write_errors);
        }
        Ok(reply::ok(body))
    }

    async fn insert_one(&self, collection: &Collection<'_>, mut doc: Document) -> Result<()> {
        let id = doc.remove("_id").unwrap_or_else(new_object_id);
        let key = id_key(&id).ok_or_else(|| Error::Translation {
            message: format!("_id of type {} is not supported", id.type_name()),
        })?;
        doc.insert_first("_id", id);

        self.check_size(&doc)?;
        collection.insert(&key, &json::encode(&doc)?).await
    }

    fn check_size(&self, doc: &Document) -> Result<()> {
        let size = binary::encoded_size(doc)?;
        if size > self.config.max_document_size {
            return Err(Error::DocumentTooLarge {
                size,
                max: self.config.max_document_size,
            });
        }
        Ok(())
    }

    async fn update(&self, database: &str, cmd: UpdateCommand, deadline: Option<Instant>) -> Result<Document> {
        let collection = self.collection(database, &cmd.collection)?;

        let mut totals = UpdateTotals::default();
        let mut write_errors = Vec::new();
        for (index, statement) in cmd.updates.iter().enumerate() {
            let outcome = if expired(deadline) {
                Err(Error::Timeout)
            } else {
                self.update_statement(&collection, statement, &mut totals).await
            };
            if let Err(err) = outcome {
                write_errors.push(reply::write_error(index, &err));
            }
        }

        let mut body = Document::new()
            .with("n", totals.matched as i64)
            .with("nModified", totals.modified as i64);
        if !write_errors.is_empty() {
            body.insert("writeErrors", write_errors);
        }
        Ok(reply::ok(body))
    }

    /// Apply one update statement.
    ///
    /// Every matched row is updated in memory and checked before the first
    /// write, so a bad row fails the statement with nothing written. Rows
    /// that do get written are counted in `totals` as they commit.
    async fn update_statement(
        &self,
        collection: &Collection<'_>,
        statement: &UpdateStatement,
        totals: &mut UpdateTotals,
    ) -> Result<()> {
        if statement.upsert {
            return Err(Error::NotSupported {
                command: "update with upsert".to_string(),
            });
        }
        let update = mql::parse_update(&statement.update)?;
        if statement.multi && matches!(update, Update::Replace(_)) {
            return Err(Error::bad_command("multi update is not supported for replacement-style update"));
        }

        let predicate = translate_filter(&statement.query, &self.config.table)?;
        let window = Window {
            skip: 0,
            limit: (!statement.multi).then_some(1),
        };
        let rows = collection.select(&predicate, "", window).await?;
        let limits = self.config.codec_limits();

        let mut pending = Vec::new();
        for row in &rows {
            let original = decode_row(row, &limits)?;
            let updated = mql::apply_update(&update, &original)?;
            if updated.get("_id") != original.get("_id") {
                return Err(Error::ImmutableField);
            }
            if updated == original {
                continue;
            }
            self.check_size(&updated)?;
            pending.push((row.key.as_str(), json::encode(&updated)?));
        }

        totals.matched += rows.len() as u64;
        for (key, json) in pending {
            if collection.update(key, &json).await? {
                totals.modified += 1;
            }
        }
        Ok(())
    }

    async fn delete(&self, database: &str, cmd: DeleteCommand, deadline: Option<Instant>) -> Result<Document> {
        let collection = self.collection(database, &cmd.collection)?;

        let mut deleted = 0u64;
        let mut write_errors = Vec::new();
        for (index, statement) in cmd.deletes.iter().enumerate() {
            let outcome = if expired(deadline) {
                Err(Error::Timeout)
            } else {
                self.delete_statement(&collection, statement).await
            };
            match outcome {
                Ok(n) => deleted += n,
                Err(err) => write_errors.push(reply::write_error(index, &err)),
            }
        }

        let mut body = Document::new().with("n", deleted as i64);
        if !write_errors.is_empty() {
            body.insert("writeErrors", write_errors);
        }
        Ok(reply::ok(body))
    }

    async fn delete_statement(&self, collection: &Collection<'_>, statement: &DeleteStatement) -> Result<u64> {
        let predicate = translate_filter(&statement.query, &self.config.table)?;
        let limit = (statement.limit == 1).then_some(1);
        collection.delete(&predicate, limit).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    async fn find(&self, state: &mut SessionState, cmd: FindCommand, deadline: Option<Instant>) -> Result<Document> {
        let collection = self.collection(&state.database, &cmd.collection)?;
        let namespace = collection.namespace();
        let schema = &self.config.table;

        let predicate = translate_filter(&cmd.filter, schema)?;
        let order_by = match &cmd.sort {
            Some(sort) => translate_sort(&mql::parse_sort(sort)?, schema),
            None => String::new(),
        };
        let projection = cmd.projection.as_ref().map(mql::parse_projection).transpose()?;

        let single_batch = cmd.single_batch || cmd.limit.map_or(false, |l| l < 0);
        let mut cursor = Cursor::new(
            state.database.clone(),
            cmd.collection,
            predicate,
            paging_order(order_by),
            projection,
            cmd.skip,
            cmd.limit.map(i64::unsigned_abs),
        );
        let first_batch_size = if single_batch {
            None
        } else {
            Some(cmd.batch_size.map(to_usize).unwrap_or(self.config.default_batch_size))
        };
        let batch = self.fetch_page(&mut cursor, first_batch_size, deadline).await?;

        let id = if cursor.is_exhausted() {
            0
        } else {
            state.cursors.register(cursor)
        };
        Ok(reply::cursor("firstBatch", batch, id, &namespace))
    }

    /// Read the cursor's next page from its collection
    async fn fetch_page(
        &self,
        cursor: &mut Cursor,
        batch: Option<usize>,
        deadline: Option<Instant>,
    ) -> Result<Vec<Document>> {
        let collection = self.collection(&cursor.database, &cursor.collection)?;
        let window = cursor.page_window(batch);
        let rows = within(
            deadline,
            collection.select(cursor.predicate(), cursor.order_by(), window),
        )
        .await?;
        cursor.accept_page(rows, batch, self.config.codec_limits())
    }

    async fn find_one(&self, database: &str, cmd: FindOneCommand, deadline: Option<Instant>) -> Result<Document> {
        let collection = self.collection(database, &cmd.collection)?;
        let predicate = translate_filter(&cmd.filter, &self.config.table)?;
        let projection = cmd.projection.as_ref().map(mql::parse_projection).transpose()?;

        let window = Window { skip: 0, limit: Some(1) };
        let rows = within(deadline, collection.select(&predicate, "", window)).await?;

        let found = match materialize(rows, self.config.codec_limits()).next() {
            Some(doc) => {
                let doc = doc?;
                Value::Document(match &projection {
                    Some(p) => projection::apply(p, doc),
                    None => doc,
                })
            }
            None => Value::Null,
        };
        Ok(reply::ok(Document::new().with("document", found)))
    }

    async fn get_more(&self, state: &mut SessionState, cmd: GetMoreCommand, deadline: Option<Instant>) -> Result<Document> {
        let expected = format!("{}.{}", state.database, cmd.collection);
        let cursor = state
            .cursors
            .get_mut(cmd.cursor_id)
            .ok_or(Error::CursorNotFound { id: cmd.cursor_id })?;
        let namespace = cursor.namespace();
        if namespace != expected {
            return Err(Error::bad_command(format!(
                "cursor {} belongs to {}, not {}",
                cmd.cursor_id, namespace, expected
            )));
        }

        let batch = self.fetch_page(cursor, cmd.batch_size.map(to_usize), deadline).await?;
        let id = if cursor.is_exhausted() {
            state.cursors.remove(cmd.cursor_id);
            0
        } else {
            cmd.cursor_id
        };
        Ok(reply::cursor("nextBatch", batch, id, &expected))
    }

    async fn count(&self, database: &str, cmd: CountCommand, deadline: Option<Instant>) -> Result<Document> {
        let collection = self.collection(database, &cmd.collection)?;
        let predicate = translate_filter(&cmd.query, &self.config.table)?;
        let window = Window {
            skip: cmd.skip,
            limit: cmd.limit,
        };
        let n = within(deadline, collection.count(&predicate, window)).await?;
        Ok(reply::ok(Document::new().with("n", n as i64)))
    }
}

/// Rows matched and rewritten across the statements of one update command
#[derive(Debug, Default)]
struct UpdateTotals {
    matched: u64,
    modified: u64,
}

fn kill_cursors(cursors: &mut CursorTable, ids: &[i64]) -> Document {
    let (killed, not_found): (Vec<i64>, Vec<i64>) =
        ids.iter().copied().partition(|id| cursors.remove(*id).is_some());
    let list = |v: Vec<i64>| Value::Array(v.into_iter().map(Value::Int).collect());
    reply::ok(
        Document::new()
            .with("cursorsKilled", list(killed))
            .with("cursorsNotFound", list(not_found))
            .with("cursorsAlive", Vec::<Value>::new())
            .with("cursorsUnknown", Vec::<Value>::new()),
    )
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.map_or(false, |d| Instant::now() >= d)
}

/// Bound a read by the command deadline
async fn within<T>(deadline: Option<Instant>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| Error::Timeout)?,
        None => fut.await,
    }
}

/// Pages of one cursor need a total order; rowid breaks ties
fn paging_order(order_by: String) -> String {
    if order_by.is_empty() {
        "ORDER BY rowid".to_string()
    } else {
        format!("{}, rowid", order_by)
    }
}

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
