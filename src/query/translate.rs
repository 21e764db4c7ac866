//! Filter -> SQL predicate translation
//!
//! Each comparison reads the field with `json_extract` on the document
//! column and binds the comparand as a parameter:
//!
//! ```text
//! { field: { $eq: 3 } }        json_extract("doc", '$.field') = ?          [3]
//! { "a.b": { $gt: 1 } }        (json_type("doc", '$.a.b') IN ('integer', 'real')
//!                               AND json_extract("doc", '$.a.b') > ?)      [1]
//! { a: null }                  json_extract("doc", '$.a') IS NULL
//! { a: { $in: [1, 2] } }       json_extract("doc", '$.a') IN (?, ?)        [1, 2]
//! {}                           TRUE
//! ```
//!
//! Ordering operators carry a `json_type` guard so they only match fields of
//! the comparand's kind. Booleans compare on `json_type` because
//! `json_extract` reports JSON `true` as the integer 1.

use mql::{CmpOp, Document, FieldPath, Filter, SortKey, Value};

use crate::codec::{id_key, oid_hex};
use crate::config::TableSchema;
use crate::error::{Error, Result};
use crate::storage::SqlValue;

/// A parameterized SQL boolean expression
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Predicate {
    /// The predicate matching every row
    pub fn all() -> Self {
        Self {
            sql: "TRUE".to_string(),
            params: Vec::new(),
        }
    }
}

/// Translate a parsed filter
pub fn translate(filter: &Filter, schema: &TableSchema) -> Result<Predicate> {
    let mut translator = Translator {
        schema,
        params: Vec::new(),
    };
    let sql = translator.filter(filter)?;
    Ok(Predicate {
        sql,
        params: translator.params,
    })
}

/// Parse and translate a filter document
pub fn translate_filter(filter: &Document, schema: &TableSchema) -> Result<Predicate> {
    translate(&mql::parse(filter)?, schema)
}

/// Build an `ORDER BY` clause; empty when there are no keys
pub fn translate_sort(keys: &[SortKey], schema: &TableSchema) -> String {
    if keys.is_empty() {
        return String::new();
    }
    let terms: Vec<String> = keys
        .iter()
        .map(|key| {
            format!(
                "{} {}",
                extract(schema, &json_path(&key.path, None)),
                key.direction.sql()
            )
        })
        .collect();
    format!("ORDER BY {}", terms.join(", "))
}

/// Quote a table or column name
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a field path as an SQLite JSON path literal, e.g. `'$.a."b c"'`
fn json_path(path: &FieldPath, suffix: Option<&str>) -> String {
    let mut out = String::from("'$");
    for segment in path.segments().iter().map(String::as_str).chain(suffix) {
        out.push('.');
        let plain = segment
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
            && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if plain {
            out.push_str(segment);
        } else {
            out.push('"');
            out.push_str(segment);
            out.push('"');
        }
    }
    out.push('\'');
    out
}

fn extract(schema: &TableSchema, json_path: &str) -> String {
    format!("json_extract({}, {})", quote_ident(&schema.doc_column), json_path)
}

fn json_type(schema: &TableSchema, json_path: &str) -> String {
    format!("json_type({}, {})", quote_ident(&schema.doc_column), json_path)
}

/// Left-hand side, type guards and bound parameter for one comparand
struct Operand {
    lhs: String,
    /// Restricts ordering operators to fields of the comparand's kind
    guard: String,
    /// Restricts equality too, where `json_extract` text could collide
    eq_guard: Option<String>,
    param: SqlValue,
}

struct Translator<'a> {
    schema: &'a TableSchema,
    params: Vec<SqlValue>,
}

impl Translator<'_> {
    fn filter(&mut self, filter: &Filter) -> Result<String> {
        match filter {
            Filter::All => Ok("TRUE".to_string()),
            Filter::Compare { path, op, value } => self.compare(path, *op, value),
            Filter::In { path, values } => self.in_list(path, values),
            Filter::And(items) => self.join(items, "AND", "$and"),
            Filter::Or(items) => self.join(items, "OR", "$or"),
            Filter::Not(inner) => Ok(format!("NOT ({})", self.filter(inner)?)),
        }
    }

    fn join(&mut self, items: &[Filter], sep: &str, op: &str) -> Result<String> {
        if items.is_empty() {
            return Err(Error::Translation {
                message: format!("{} must be a nonempty array", op),
            });
        }
        let parts = items
            .iter()
            .map(|item| self.filter(item).map(|sql| format!("({})", sql)))
            .collect::<Result<Vec<_>>>()?;
        Ok(parts.join(&format!(" {} ", sep)))
    }

    fn bind(&mut self, value: SqlValue) -> &'static str {
        self.params.push(value);
        "?"
    }

    fn operand(&self, path: &FieldPath, value: &Value) -> Result<Operand> {
        let schema = self.schema;
        let plain = json_path(path, None);
        let numeric = |param| Operand {
            lhs: extract(schema, &plain),
            guard: format!("{} IN ('integer', 'real')", json_type(schema, &plain)),
            eq_guard: None,
            param,
        };

        Ok(match value {
            Value::Int(i) => numeric(SqlValue::Integer(*i)),
            Value::Double(f) => numeric(SqlValue::Real(*f)),
            // Arrays and objects come back from json_extract as JSON text
            Value::String(s) => Operand {
                lhs: extract(schema, &plain),
                guard: format!("{} = 'text'", json_type(schema, &plain)),
                eq_guard: Some(format!("nullif({}, 'null') = 'text'", json_type(schema, &plain))),
                param: SqlValue::Text(s.clone()),
            },
            Value::Bool(b) => Operand {
                // JSON null reads as SQL NULL, like json_extract does
                lhs: format!("nullif({}, 'null')", json_type(schema, &plain)),
                guard: format!("{} IN ('true', 'false')", json_type(schema, &plain)),
                eq_guard: None,
                param: SqlValue::Text(if *b { "true" } else { "false" }.to_string()),
            },
            Value::ObjectId(oid) => {
                let sub = json_path(path, Some("$oid"));
                Operand {
                    lhs: extract(schema, &sub),
                    guard: format!("{} = 'text'", json_type(schema, &sub)),
                    eq_guard: None,
                    param: SqlValue::Text(oid_hex(oid)),
                }
            }
            Value::DateTime(ms) => {
                let sub = json_path(path, Some("$date"));
                Operand {
                    lhs: extract(schema, &sub),
                    guard: format!("{} = 'integer'", json_type(schema, &sub)),
                    eq_guard: None,
                    param: SqlValue::Integer(*ms),
                }
            }
            other => {
                return Err(Error::Translation {
                    message: format!(
                        "cannot compare field '{}' against a value of type {}",
                        path,
                        other.type_name()
                    ),
                })
            }
        })
    }

    fn compare(&mut self, path: &FieldPath, op: CmpOp, value: &Value) -> Result<String> {
        if value.is_null() {
            let lhs = extract(self.schema, &json_path(path, None));
            return match op {
                CmpOp::Eq => Ok(format!("{} IS NULL", lhs)),
                CmpOp::Ne => Ok(format!("{} IS NOT NULL", lhs)),
                _ => Err(Error::Translation {
                    message: format!("cannot order field '{}' against null", path),
                }),
            };
        }

        if path.is_id() && matches!(op, CmpOp::Eq | CmpOp::Ne) {
            if let Some(matched) = self.id_match(path, &[value]) {
                return Ok(match op {
                    CmpOp::Eq => matched,
                    _ => format!("NOT {}", matched),
                });
            }
        }

        let operand = self.operand(path, value)?;
        let placeholder = self.bind(operand.param);
        Ok(match (op, operand.eq_guard) {
            (CmpOp::Eq, Some(guard)) => format!("({} AND {} = {})", guard, operand.lhs, placeholder),
            (CmpOp::Ne, Some(guard)) => format!("NOT ({} AND {} = {})", guard, operand.lhs, placeholder),
            (CmpOp::Eq | CmpOp::Ne, None) => format!("{} {} {}", operand.lhs, op.sql(), placeholder),
            _ => format!("({} AND {} {} {})", operand.guard, operand.lhs, op.sql(), placeholder),
        })
    }

    /// Match `_id` values on the key column; `None` when a value has no key.
    ///
    /// Strings also match untagged keys of rows whose payload has no `_id`,
    /// since those rows read back with the raw key as a string `_id`.
    fn id_match(&mut self, path: &FieldPath, values: &[&Value]) -> Option<String> {
        let keys = values.iter().map(|v| id_key(v)).collect::<Option<Vec<_>>>()?;
        if keys.is_empty() {
            return None;
        }
        let raw: Vec<String> = values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();

        let tagged = self.key_list(keys);
        if raw.is_empty() {
            return Some(tagged);
        }
        let untagged = self.key_list(raw);
        Some(format!(
            "({} OR ({} AND {} IS NULL))",
            tagged,
            untagged,
            extract(self.schema, &json_path(path, None))
        ))
    }

    fn key_list(&mut self, keys: Vec<String>) -> String {
        let column = quote_ident(&self.schema.id_column);
        let placeholders: Vec<&str> = keys.into_iter().map(|k| self.bind(SqlValue::Text(k))).collect();
        match placeholders.as_slice() {
            [single] => format!("{} = {}", column, single),
            _ => format!("{} IN ({})", column, placeholders.join(", ")),
        }
    }

    fn in_list(&mut self, path: &FieldPath, values: &[Value]) -> Result<String> {
        let has_null = values.iter().any(Value::is_null);
        let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();

        let mut arms = Vec::new();

        let id_arm = if path.is_id() && !present.is_empty() {
            self.id_match(path, &present)
        } else {
            None
        };

        if let Some(arm) = id_arm {
            arms.push(arm);
        } else {
            // Group by left-hand side and guard so mixed-kind lists stay one IN per kind
            let mut groups: Vec<(String, Option<String>, Vec<SqlValue>)> = Vec::new();
            for value in present {
                let operand = self.operand(path, value)?;
                match groups
                    .iter_mut()
                    .find(|(lhs, guard, _)| *lhs == operand.lhs && *guard == operand.eq_guard)
                {
                    Some((_, _, params)) => params.push(operand.param),
                    None => groups.push((operand.lhs, operand.eq_guard, vec![operand.param])),
                }
            }
            for (lhs, guard, params) in groups {
                let placeholders: Vec<&str> = params.into_iter().map(|p| self.bind(p)).collect();
                let list = format!("{} IN ({})", lhs, placeholders.join(", "));
                arms.push(match guard {
                    Some(guard) => format!("({} AND {})", guard, list),
                    None => list,
                });
            }
        }

        if has_null {
            arms.push(format!("{} IS NULL", extract(self.schema, &json_path(path, None))));
        }

        Ok(match arms.len() {
            0 => "FALSE".to_string(),
            1 => arms.remove(0),
            _ => format!("({})", arms.join(" OR ")),
        })
    }
}
