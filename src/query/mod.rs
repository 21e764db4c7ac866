//! Query translation for nosqlgate
//!
//! Turns parsed filters and sorts into SQL fragments over the JSON payload
//! column, and applies projections to the documents that come back.

pub mod projection;
mod translate;

pub use translate::{quote_ident, translate, translate_filter, translate_sort, Predicate};
