//! MQL - MongoDB query documents for the nosqlgate gateway
//!
//! Filters, updates, projections and sorts arrive as documents rather than
//! text. This crate owns the document value model and turns those documents
//! into an AST the gateway can translate to SQL.
//!
//! # Syntax Overview
//!
//! ```text
//! // Equality, implicit or explicit
//! { field: 3 }
//! { field: { $eq: 3 } }
//!
//! // Comparison over nested paths
//! { "address.zip": { $gte: 10000 } }
//!
//! // Membership
//! { status: { $in: ["open", "blocked", null] } }
//!
//! // Logical combinators
//! { $or: [ { a: 1 }, { $not: { b: { $lt: 2 } } } ] }
//!
//! // Updates
//! { $set: { done: true }, $inc: { attempts: 1 } }
//!
//! // Projections and sorts
//! { title: 1, _id: 0 }
//! { priority: -1 }
//! ```
//!
//! Operator documents carry exactly one operator. Unknown operators are
//! rejected rather than ignored.

mod ast;
mod error;
pub mod eval;
mod parser;
mod update;
mod value;

pub use ast::*;
pub use error::ParseError;
pub use parser::{parse_field_path, parse_projection, parse_sort, parse_update};
pub use update::apply_update;
pub use value::{Document, Value};

/// Parse a filter document into a [`Filter`]
pub fn parse(filter: &Document) -> Result<Filter, ParseError> {
    parser::parse_filter(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse(&Document::new()).unwrap(), Filter::All);
    }

    #[test]
    fn test_parse_eq() {
        let filter = parse(&Document::new().with("field", Document::new().with("$eq", 4i64))).unwrap();
        if let Filter::Compare { path, op, value } = filter {
            assert_eq!(path.to_string(), "field");
            assert_eq!(op, CmpOp::Eq);
            assert_eq!(value, Value::Int(4));
        } else {
            panic!("Expected Compare filter");
        }
    }

    #[test]
    fn test_parse_or() {
        let filter = parse(&Document::new().with(
            "$or",
            vec![
                Value::Document(Document::new().with("a", 1i64)),
                Value::Document(Document::new().with("b", 2i64)),
            ],
        ))
        .unwrap();
        assert!(matches!(filter, Filter::Or(ref items) if items.len() == 2));
    }

    #[test]
    fn test_eval_matches_parsed() {
        let doc = Document::new().with("field", 7i64);
        let filter = parse(&Document::new().with("field", 7i64)).unwrap();
        assert!(eval::matches(&filter, &doc));
    }
}
