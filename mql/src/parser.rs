//! MQL parser
//!
//! Turns filter, update, projection and sort documents into AST nodes.
//! Field paths are parsed with nom; everything else walks the document tree.

use nom::{
    IResult,
    bytes::complete::take_while1,
    character::complete::char,
    combinator::{all_consuming, map, verify},
    multi::separated_list1,
};

use crate::ast::*;
use crate::error::ParseError;
use crate::value::{Document, Value};

// ============================================================================
// Field paths
// ============================================================================

/// Parse a dotted field path
pub fn parse_field_path(input: &str) -> Result<FieldPath, ParseError> {
    let (_, segments) = all_consuming(field_path)(input)?;
    Ok(FieldPath::from_segments(segments))
}

fn field_path(input: &str) -> IResult<&str, Vec<String>> {
    separated_list1(char('.'), map(segment, str::to_string))(input)
}

fn segment(input: &str) -> IResult<&str, &str> {
    verify(take_while1(is_segment_char), |s: &str| !s.starts_with('$'))(input)
}

fn is_segment_char(c: char) -> bool {
    !matches!(c, '.' | '\'' | '"' | '\\' | '\0')
}

fn path_for(key: &str) -> Result<FieldPath, ParseError> {
    parse_field_path(key).map_err(|e| e.with_path(key))
}

// ============================================================================
// Filters
// ============================================================================

/// Parse a filter document
pub fn parse_filter(doc: &Document) -> Result<Filter, ParseError> {
    if doc.is_empty() {
        return Ok(Filter::All);
    }

    let mut clauses = Vec::with_capacity(doc.len());
    for (key, value) in doc {
        clauses.push(clause(key, value)?);
    }

    Ok(match clauses.len() {
        1 => clauses.remove(0),
        _ => Filter::And(clauses),
    })
}

fn clause(key: &str, value: &Value) -> Result<Filter, ParseError> {
    match key {
        "$and" => Ok(Filter::And(filter_list(key, value)?)),
        "$or" => Ok(Filter::Or(filter_list(key, value)?)),
        "$not" => match value {
            Value::Document(inner) => Ok(Filter::Not(Box::new(parse_filter(inner)?))),
            other => Err(ParseError::new(format!(
                "$not needs a document, got {}",
                other.type_name()
            ))),
        },
        op if op.starts_with('$') => Err(ParseError::unknown_operator(op)),
        field => {
            let path = path_for(field)?;
            field_condition(path, value)
        }
    }
}

fn filter_list(op: &str, value: &Value) -> Result<Vec<Filter>, ParseError> {
    let items = value
        .as_array()
        .ok_or_else(|| ParseError::new(format!("{} must be an array", op)))?;

    if items.is_empty() {
        return Err(ParseError::new(format!("{} must be a nonempty array", op)));
    }

    items
        .iter()
        .map(|item| match item {
            Value::Document(doc) => parse_filter(doc),
            other => Err(ParseError::new(format!(
                "{} entries must be documents, got {}",
                op,
                other.type_name()
            ))),
        })
        .collect()
}

fn is_operator_document(value: &Value) -> bool {
    value
        .as_document()
        .and_then(Document::first)
        .map(|(k, _)| k.starts_with('$'))
        .unwrap_or(false)
}

fn field_condition(path: FieldPath, value: &Value) -> Result<Filter, ParseError> {
    if let Value::Document(ops) = value {
        if is_operator_document(value) {
            if ops.len() != 1 {
                return Err(ParseError::new(
                    "operator document must contain exactly one operator",
                )
                .with_path(path.to_string()));
            }
            if let Some((op, arg)) = ops.first() {
                return operator(path, op, arg);
            }
        }
    }

    comparison(path, CmpOp::Eq, value)
}

fn operator(path: FieldPath, op: &str, arg: &Value) -> Result<Filter, ParseError> {
    if let Some(cmp) = CmpOp::from_operator(op) {
        return comparison(path, cmp, arg);
    }

    match op {
        "$in" => {
            let items = arg.as_array().ok_or_else(|| {
                ParseError::new(format!("$in needs an array, got {}", arg.type_name()))
                    .with_path(path.to_string())
            })?;
            if let Some(bad) = items.iter().find(|v| !v.is_comparable()) {
                return Err(ParseError::new(format!(
                    "$in cannot compare against a value of type {}",
                    bad.type_name()
                ))
                .with_path(path.to_string()));
            }
            Ok(Filter::In {
                path,
                values: items.clone(),
            })
        }
        "$not" => {
            if !is_operator_document(arg) {
                return Err(ParseError::new("$not needs an operator document")
                    .with_path(path.to_string()));
            }
            Ok(Filter::Not(Box::new(field_condition(path, arg)?)))
        }
        _ => Err(ParseError::unknown_operator(op).with_path(path.to_string())),
    }
}

fn comparison(path: FieldPath, op: CmpOp, value: &Value) -> Result<Filter, ParseError> {
    if !value.is_comparable() {
        return Err(ParseError::new(format!(
            "cannot compare against a value of type {}",
            value.type_name()
        ))
        .with_path(path.to_string()));
    }

    if value.is_null() && !matches!(op, CmpOp::Eq | CmpOp::Ne) {
        return Err(ParseError::new(format!("cannot order against null with {:?}", op))
            .with_path(path.to_string()));
    }

    Ok(Filter::Compare {
        path,
        op,
        value: value.clone(),
    })
}

// ============================================================================
// Updates
// ============================================================================

/// Parse an update document: either operators or a replacement
pub fn parse_update(doc: &Document) -> Result<Update, ParseError> {
    let operator_keys = doc.keys().filter(|k| k.starts_with('$')).count();

    if operator_keys == 0 {
        return Ok(Update::Replace(doc.clone()));
    }
    if operator_keys != doc.len() {
        return Err(ParseError::new(
            "update document mixes operators and replacement fields",
        ));
    }

    let mut ops = Vec::new();
    for (op, fields) in doc {
        let fields = fields.as_document().ok_or_else(|| {
            ParseError::new(format!(
                "Modifiers operate on fields but we found type {} instead",
                fields.type_name()
            ))
            .with_path(op.clone())
        })?;

        for (field, value) in fields {
            let path = path_for(field)?;
            let update = match op.as_str() {
                "$set" => UpdateOp::Set(path, value.clone()),
                "$unset" => UpdateOp::Unset(path),
                "$inc" => {
                    if !matches!(value, Value::Int(_) | Value::Double(_)) {
                        return Err(ParseError::new(format!(
                            "Cannot increment with non-numeric argument of type {}",
                            value.type_name()
                        ))
                        .with_path(field.clone()));
                    }
                    UpdateOp::Inc(path, value.clone())
                }
                other => return Err(ParseError::unknown_operator(other)),
            };
            ops.push(update);
        }
    }

    check_conflicts(&ops)?;
    Ok(Update::Operators(ops))
}

fn check_conflicts(ops: &[UpdateOp]) -> Result<(), ParseError> {
    for (i, a) in ops.iter().enumerate() {
        for b in &ops[i + 1..] {
            if a.path().starts_with(b.path()) || b.path().starts_with(a.path()) {
                return Err(ParseError::new(format!(
                    "Updating the path '{}' would create a conflict at '{}'",
                    b.path(),
                    a.path()
                )));
            }
        }
    }
    Ok(())
}

// ============================================================================
// Projections and sorts
// ============================================================================

/// Parse a find projection
pub fn parse_projection(doc: &Document) -> Result<Projection, ParseError> {
    let mut explicit_id: Option<bool> = None;
    let mut included = Vec::new();
    let mut excluded = Vec::new();

    for (key, value) in doc {
        let keep = match value {
            Value::Bool(_) | Value::Int(_) | Value::Double(_) => value.truthy(),
            other => {
                return Err(ParseError::new(format!(
                    "unsupported projection value of type {}",
                    other.type_name()
                ))
                .with_path(key.clone()))
            }
        };
        let path = path_for(key)?;
        if path.is_id() {
            explicit_id = Some(keep);
        } else if keep {
            included.push(path);
        } else {
            excluded.push(path);
        }
    }

    if !included.is_empty() && !excluded.is_empty() {
        return Err(ParseError::new(format!(
            "Cannot do exclusion on field {} in inclusion projection",
            excluded[0]
        )));
    }

    if !included.is_empty() || (explicit_id == Some(true) && excluded.is_empty()) {
        return Ok(Projection::Include {
            paths: included,
            include_id: explicit_id.unwrap_or(true),
        });
    }

    if explicit_id == Some(false) {
        excluded.insert(0, FieldPath::from_segments(vec!["_id".to_string()]));
    }
    Ok(Projection::Exclude { paths: excluded })
}

/// Parse a sort document
pub fn parse_sort(doc: &Document) -> Result<Vec<SortKey>, ParseError> {
    doc.iter()
        .map(|(key, value)| {
            let direction = match value.as_f64() {
                Some(d) if d == 1.0 => SortDirection::Asc,
                Some(d) if d == -1.0 => SortDirection::Desc,
                _ => {
                    return Err(ParseError::new(format!("bad sort specification: {}", value))
                        .with_path(key.clone()))
                }
            };
            Ok(SortKey {
                path: path_for(key)?,
                direction,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> FieldPath {
        parse_field_path(s).unwrap()
    }

    #[test]
    fn test_parse_field_path() {
        assert_eq!(path("a.b.c").segments(), &["a", "b", "c"]);
        assert_eq!(path("my field").segments(), &["my field"]);
        assert!(parse_field_path("").is_err());
        assert!(parse_field_path("a..b").is_err());
        assert!(parse_field_path("a.").is_err());
        assert!(parse_field_path("a.$b").is_err());
        assert!(parse_field_path("it's").is_err());
    }

    #[test]
    fn test_empty_filter() {
        assert_eq!(parse_filter(&Document::new()).unwrap(), Filter::All);
    }

    #[test]
    fn test_implicit_equality() {
        let filter = parse_filter(&Document::new().with("field", 3i64)).unwrap();
        assert_eq!(
            filter,
            Filter::Compare { path: path("field"), op: CmpOp::Eq, value: Value::Int(3) }
        );
    }

    #[test]
    fn test_operator_document() {
        let doc = Document::new().with("field", Document::new().with("$gte", 5i64));
        let filter = parse_filter(&doc).unwrap();
        assert!(matches!(filter, Filter::Compare { op: CmpOp::Gte, .. }));
    }

    #[test]
    fn test_multiple_keys_are_conjunction() {
        let doc = Document::new().with("a", 1i64).with("b", "x");
        match parse_filter(&doc).unwrap() {
            Filter::And(clauses) => assert_eq!(clauses.len(), 2),
            other => panic!("Expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_operator_must_be_sole_key() {
        let doc = Document::new().with(
            "a",
            Document::new().with("$gt", 1i64).with("$lt", 5i64),
        );
        assert!(parse_filter(&doc).is_err());
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let doc = Document::new().with("a", Document::new().with("$regex", "x"));
        let err = parse_filter(&doc).unwrap_err();
        assert!(err.message.contains("unknown operator: $regex"));

        let top = Document::new().with("$where", "1");
        assert!(parse_filter(&top).is_err());
    }

    #[test]
    fn test_in_requires_array() {
        let doc = Document::new().with("a", Document::new().with("$in", 1i64));
        assert!(parse_filter(&doc).is_err());

        let ok = Document::new().with(
            "a",
            Document::new().with("$in", vec![Value::Int(1), Value::Null]),
        );
        assert!(matches!(parse_filter(&ok).unwrap(), Filter::In { .. }));
    }

    #[test]
    fn test_empty_and_rejected() {
        let doc = Document::new().with("$and", Vec::<Value>::new());
        assert!(parse_filter(&doc).is_err());
    }

    #[test]
    fn test_not_forms() {
        let top = Document::new().with("$not", Document::new().with("a", 1i64));
        assert!(matches!(parse_filter(&top).unwrap(), Filter::Not(_)));

        let field = Document::new().with(
            "a",
            Document::new().with("$not", Document::new().with("$gt", 1i64)),
        );
        assert!(matches!(parse_filter(&field).unwrap(), Filter::Not(_)));

        let bad = Document::new().with("a", Document::new().with("$not", 1i64));
        assert!(parse_filter(&bad).is_err());
    }

    #[test]
    fn test_non_comparable_rejected() {
        let doc = Document::new().with("a", Document::new().with("b", 1i64));
        assert!(parse_filter(&doc).is_err());

        let arr = Document::new().with("a", vec![Value::Int(1)]);
        assert!(parse_filter(&arr).is_err());

        let null_order = Document::new().with("a", Document::new().with("$lt", Value::Null));
        assert!(parse_filter(&null_order).is_err());
    }

    #[test]
    fn test_parse_update_operators() {
        let doc = Document::new()
            .with("$set", Document::new().with("a", 1i64))
            .with("$inc", Document::new().with("n", 2i64));
        match parse_update(&doc).unwrap() {
            Update::Operators(ops) => assert_eq!(ops.len(), 2),
            other => panic!("Expected Operators, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_update_rejects_bad_input() {
        let unknown = Document::new().with("$push", Document::new().with("a", 1i64));
        assert!(parse_update(&unknown).is_err());

        let mixed = Document::new().with("$set", Document::new()).with("a", 1i64);
        assert!(parse_update(&mixed).is_err());

        let conflict = Document::new()
            .with("$set", Document::new().with("a", 1i64))
            .with("$unset", Document::new().with("a.b", 1i64));
        assert!(parse_update(&conflict).is_err());

        let inc = Document::new().with("$inc", Document::new().with("a", "x"));
        assert!(parse_update(&inc).is_err());
    }

    #[test]
    fn test_parse_update_replacement() {
        let doc = Document::new().with("a", 1i64);
        assert_eq!(parse_update(&doc).unwrap(), Update::Replace(doc));
    }

    #[test]
    fn test_parse_projection() {
        let include = Document::new().with("a", 1i64).with("_id", 0i64);
        assert_eq!(
            parse_projection(&include).unwrap(),
            Projection::Include { paths: vec![path("a")], include_id: false }
        );

        let exclude = Document::new().with("a", false);
        assert_eq!(
            parse_projection(&exclude).unwrap(),
            Projection::Exclude { paths: vec![path("a")] }
        );

        let id_only = Document::new().with("_id", 1i64);
        assert_eq!(
            parse_projection(&id_only).unwrap(),
            Projection::Include { paths: vec![], include_id: true }
        );

        let mixed = Document::new().with("a", 1i64).with("b", 0i64);
        assert!(parse_projection(&mixed).is_err());
    }

    #[test]
    fn test_parse_sort() {
        let doc = Document::new().with("a", 1i64).with("b.c", -1i64);
        let keys = parse_sort(&doc).unwrap();
        assert_eq!(keys[0].direction, SortDirection::Asc);
        assert_eq!(keys[1].direction, SortDirection::Desc);
        assert!(parse_sort(&Document::new().with("a", 2i64)).is_err());
    }
}
