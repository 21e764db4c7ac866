//! In-memory filter evaluation
//!
//! Evaluates a [`Filter`] against a [`Document`] with SQL three-valued logic,
//! so a missing or null field behaves the way `json_extract` returning NULL
//! does in the generated predicate. Ordering comparisons only succeed between
//! values of the same kind. Equality additionally treats a boolean field as
//! 0 or 1 against a numeric comparand, the way SQLite reads JSON booleans.

use crate::ast::{CmpOp, FieldPath, Filter};
use crate::value::{Document, Value};
use std::cmp::Ordering;

/// Evaluate a filter against a document
pub fn matches(filter: &Filter, doc: &Document) -> bool {
    evaluate(filter, doc) == Some(true)
}

/// Three-valued evaluation: `None` is SQL's UNKNOWN
pub fn evaluate(filter: &Filter, doc: &Document) -> Option<bool> {
    match filter {
        Filter::All => Some(true),

        Filter::Compare { path, op, value } => {
            let field = fetch(doc, path);
            compare(field, *op, value)
        }

        Filter::In { path, values } => {
            let field = fetch(doc, path);
            let mut result = Some(false);
            for value in values {
                let arm = if value.is_null() {
                    Some(field.is_none())
                } else {
                    compare(field, CmpOp::Eq, value)
                };
                result = match (result, arm) {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (None, _) | (_, None) => None,
                    _ => Some(false),
                };
            }
            result
        }

        Filter::And(items) => {
            let mut unknown = false;
            for item in items {
                match evaluate(item, doc) {
                    Some(false) => return Some(false),
                    None => unknown = true,
                    Some(true) => {}
                }
            }
            if unknown { None } else { Some(true) }
        }

        Filter::Or(items) => {
            let mut unknown = false;
            for item in items {
                match evaluate(item, doc) {
                    Some(true) => return Some(true),
                    None => unknown = true,
                    Some(false) => {}
                }
            }
            if unknown { None } else { Some(false) }
        }

        Filter::Not(inner) => evaluate(inner, doc).map(|b| !b),
    }
}

fn fetch<'a>(doc: &'a Document, path: &FieldPath) -> Option<&'a Value> {
    doc.lookup(path.segments()).filter(|v| !v.is_null())
}

fn compare(field: Option<&Value>, op: CmpOp, value: &Value) -> Option<bool> {
    if value.is_null() {
        return match op {
            CmpOp::Eq => Some(field.is_none()),
            CmpOp::Ne => Some(field.is_some()),
            _ => None,
        };
    }

    let field = field?;

    // Wrapped scalars are read through a sub-path; other kinds read as NULL there
    if matches!(value, Value::ObjectId(_) | Value::DateTime(_))
        && std::mem::discriminant(field) != std::mem::discriminant(value)
    {
        return None;
    }

    let ord = match op {
        CmpOp::Eq | CmpOp::Ne => loose_ordering(field, value),
        _ => ordering(field, value),
    };

    Some(match op {
        CmpOp::Eq => ord == Some(Ordering::Equal),
        CmpOp::Ne => ord != Some(Ordering::Equal),
        CmpOp::Gt => ord == Some(Ordering::Greater),
        CmpOp::Gte => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Lt => ord == Some(Ordering::Less),
        CmpOp::Lte => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
    })
}

/// Order two values of the same kind; `None` for mismatched kinds
fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::ObjectId(a), Value::ObjectId(b)) => Some(a.cmp(b)),
        (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn loose_ordering(field: &Value, comparand: &Value) -> Option<Ordering> {
    match (field, comparand) {
        (Value::Bool(b), Value::Int(_) | Value::Double(_)) => {
            (*b as i64 as f64).partial_cmp(&comparand.as_f64()?)
        }
        _ => ordering(field, comparand),
    }
}
