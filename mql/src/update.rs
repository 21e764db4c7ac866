//! In-memory update application

use crate::ast::{Update, UpdateOp};
use crate::error::ParseError;
use crate::value::{Document, Value};

/// Apply an update to a copy of `doc`
///
/// Replacement documents keep the original `_id` when they don't carry one.
pub fn apply_update(update: &Update, doc: &Document) -> Result<Document, ParseError> {
    match update {
        Update::Replace(replacement) => {
            let mut out = replacement.clone();
            if !out.contains_key("_id") {
                if let Some(id) = doc.get("_id") {
                    out.insert_first("_id", id.clone());
                }
            }
            Ok(out)
        }
        Update::Operators(ops) => {
            let mut out = doc.clone();
            for op in ops {
                apply_op(op, &mut out)?;
            }
            Ok(out)
        }
    }
}

fn apply_op(op: &UpdateOp, doc: &mut Document) -> Result<(), ParseError> {
    match op {
        UpdateOp::Set(path, value) => set(doc, path.segments(), value.clone()),
        UpdateOp::Unset(path) => {
            doc.remove_path(path.segments());
            Ok(())
        }
        UpdateOp::Inc(path, by) => {
            let next = match doc.lookup(path.segments()) {
                None => by.clone(),
                Some(current) => increment(current, by).ok_or_else(|| {
                    ParseError::new(format!(
                        "Cannot apply $inc to a value of non-numeric type {}",
                        current.type_name()
                    ))
                    .with_path(path.to_string())
                })?,
            };
            set(doc, path.segments(), next)
        }
    }
}

fn set(doc: &mut Document, segments: &[String], value: Value) -> Result<(), ParseError> {
    doc.set_path(segments, value).map_err(|blocked| {
        ParseError::new(format!(
            "Cannot create field '{}' in a non-document element",
            segments.last().map(String::as_str).unwrap_or_default()
        ))
        .with_path(blocked)
    })
}

fn increment(current: &Value, by: &Value) -> Option<Value> {
    match (current, by) {
        (Value::Int(a), Value::Int(b)) => match a.checked_add(*b) {
            Some(sum) => Some(Value::Int(sum)),
            None => Some(Value::Double(*a as f64 + *b as f64)),
        },
        (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
            Some(Value::Double(current.as_f64()? + by.as_f64()?))
        }
        _ => None,
    }
}
