//! Per-connection cursor table
//!
//! A cursor remembers the query behind a find and where the client is in
//! it. Each batch is fetched as its own page (`LIMIT ? OFFSET ?` with one
//! row of look-ahead), so an open cursor holds no rows between requests.
//! Cursors belong to the connection that opened them and are dropped with
//! it, reaped after sitting idle, or evicted oldest-first when a connection
//! opens too many.

use mql::{Document, Projection};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::CodecLimits;
use crate::error::Result;
use crate::materialize::materialize;
use crate::query::{projection, Predicate};
use crate::storage::collection::{StoredDocument, Window};

/// Process-wide, so ids never repeat across connections
static NEXT_CURSOR_ID: AtomicI64 = AtomicI64::new(1);

pub const DEFAULT_MAX_OPEN_CURSORS: usize = 100;
pub const DEFAULT_CURSOR_TIMEOUT: Duration = Duration::from_secs(600);

/// A result set read one page at a time
#[derive(Debug)]
pub struct Cursor {
    pub database: String,
    pub collection: String,
    predicate: Predicate,
    order_by: String,
    projection: Option<Projection>,
    /// Offset of the next unread row
    position: u64,
    /// Rows the find's limit still allows
    remaining: Option<u64>,
    exhausted: bool,
    last_used: Instant,
}

impl Cursor {
    pub fn new(
        database: impl Into<String>,
        collection: impl Into<String>,
        predicate: Predicate,
        order_by: String,
        projection: Option<Projection>,
        skip: u64,
        limit: Option<u64>,
    ) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            predicate,
            order_by,
            projection,
            position: skip,
            remaining: limit,
            exhausted: limit == Some(0),
            last_used: Instant::now(),
        }
    }

    /// `<database>.<collection>`
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn order_by(&self) -> &str {
        &self.order_by
    }

    /// Rows the next page hands out; `None` means everything left
    fn want(&self, batch: Option<usize>) -> Option<u64> {
        match (batch.map(|b| b as u64), self.remaining) {
            (Some(b), Some(r)) => Some(b.min(r)),
            (Some(b), None) => Some(b),
            (None, r) => r,
        }
    }

    /// Rows to select for a page of at most `batch` documents
    pub fn page_window(&self, batch: Option<usize>) -> Window {
        let want = self.want(batch);
        // One extra row tells whether anything follows, unless the limit ends here
        let look_ahead = match (want, self.remaining) {
            (Some(w), Some(r)) => w < r,
            (Some(_), None) => true,
            (None, _) => false,
        };
        Window {
            skip: self.position,
            limit: want.map(|w| if look_ahead { w + 1 } else { w }),
        }
    }

    /// Consume rows selected with [`Cursor::page_window`] and decode the batch
    pub fn accept_page(
        &mut self,
        mut rows: Vec<StoredDocument>,
        batch: Option<usize>,
        limits: CodecLimits,
    ) -> Result<Vec<Document>> {
        let want = self.want(batch);
        let more = want.map_or(false, |w| rows.len() as u64 > w);
        if let Some(w) = want {
            rows.truncate(usize::try_from(w).unwrap_or(usize::MAX));
        }

        let taken = rows.len() as u64;
        self.position += taken;
        if let Some(r) = self.remaining.as_mut() {
            *r -= taken.min(*r);
        }
        self.exhausted = !more;
        self.last_used = Instant::now();

        materialize(rows, limits)
            .map(|doc| {
                doc.map(|doc| match &self.projection {
                    Some(p) => projection::apply(p, doc),
                    None => doc,
                })
            })
            .collect()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

/// Open cursors of one connection
#[derive(Debug)]
pub struct CursorTable {
    cursors: HashMap<i64, Cursor>,
    max_open: usize,
    idle_timeout: Option<Duration>,
}

impl Default for CursorTable {
    fn default() -> Self {
        Self::with_limits(DEFAULT_MAX_OPEN_CURSORS, Some(DEFAULT_CURSOR_TIMEOUT))
    }
}

impl CursorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding at most `max_open` cursors, each dropped after
    /// `idle_timeout` without a `getMore`
    pub fn with_limits(max_open: usize, idle_timeout: Option<Duration>) -> Self {
        Self {
            cursors: HashMap::new(),
            max_open: max_open.max(1),
            idle_timeout,
        }
    }

    /// Park a cursor and return its id
    pub fn register(&mut self, cursor: Cursor) -> i64 {
        self.reap(Instant::now());
        while self.cursors.len() >= self.max_open {
            let oldest = self
                .cursors
                .iter()
                .min_by_key(|(id, c)| (c.last_used, **id))
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    debug!(cursor_id = id, "evicting least recently used cursor");
                    self.cursors.remove(&id);
                }
                None => break,
            }
        }

        let id = NEXT_CURSOR_ID.fetch_add(1, Ordering::Relaxed);
        self.cursors.insert(id, cursor);
        id
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut Cursor> {
        self.reap(Instant::now());
        self.cursors.get_mut(&id)
    }

    pub fn remove(&mut self, id: i64) -> Option<Cursor> {
        self.cursors.remove(&id)
    }

    /// Drop cursors idle longer than the timeout; returns how many went
    pub fn reap(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.idle_timeout else { return 0 };
        let before = self.cursors.len();
        self.cursors
            .retain(|_, c| now.saturating_duration_since(c.last_used) < timeout);
        let reaped = before - self.cursors.len();
        if reaped > 0 {
            debug!(reaped, "reaped idle cursors");
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
