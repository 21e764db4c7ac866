//! Result materializer
//!
//! Turns stored rows into documents one at a time. Cursors fetch a page of
//! rows per batch and decode it here on the way out.

use mql::{Document, Value};
use std::collections::VecDeque;

use crate::codec::json;
use crate::config::CodecLimits;
use crate::error::Result;
use crate::storage::collection::StoredDocument;

/// Lazily decoded rows of one result set
#[derive(Debug)]
pub struct Materialized {
    rows: VecDeque<StoredDocument>,
    limits: CodecLimits,
}

/// Wrap fetched rows for lazy decoding
pub fn materialize(rows: Vec<StoredDocument>, limits: CodecLimits) -> Materialized {
    Materialized {
        rows: rows.into(),
        limits,
    }
}

impl Materialized {
    /// Rows not yet handed out
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Iterator for Materialized {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.rows.pop_front()?;
        Some(decode_row(&row, &self.limits))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.rows.len(), Some(self.rows.len()))
    }
}

/// Decode a single stored row
pub fn decode_row(row: &StoredDocument, limits: &CodecLimits) -> Result<Document> {
    let mut doc = json::decode(&row.json, limits)?;
    // Rows written outside the gateway may lack `_id`
    if !doc.contains_key("_id") {
        doc.insert_first("_id", Value::String(row.key.clone()));
    }
    Ok(doc)
}
