//! Find projections
//!
//! Projections run on decoded documents after the rows come back; the SQL
//! always selects the whole payload.

use mql::{Document, FieldPath, Projection, Value};

/// Apply a projection, keeping the original field order
pub fn apply(projection: &Projection, doc: Document) -> Document {
    match projection {
        Projection::Include { paths, include_id } => {
            let segments: Vec<&[String]> = paths.iter().map(FieldPath::segments).collect();
            let mut out = include(&doc, &segments);
            if *include_id {
                if let Some(id) = doc.get("_id") {
                    out.insert_first("_id", id.clone());
                }
            }
            out
        }
        Projection::Exclude { paths } => {
            let mut out = doc;
            for path in paths {
                out.remove_path(path.segments());
            }
            out
        }
    }
}

fn include(doc: &Document, paths: &[&[String]]) -> Document {
    let mut out = Document::new();
    for (key, value) in doc {
        let tails: Vec<&[String]> = paths
            .iter()
            .filter(|p| p.first() == Some(key))
            .map(|p| &p[1..])
            .collect();
        if tails.is_empty() {
            continue;
        }
        if tails.iter().any(|t| t.is_empty()) {
            out.insert(key.clone(), value.clone());
            continue;
        }
        match value {
            Value::Document(inner) => {
                out.insert(key.clone(), include(inner, &tails));
            }
            Value::Array(items) => {
                let projected: Vec<Value> = items
                    .iter()
                    .filter_map(Value::as_document)
                    .map(|inner| Value::Document(include(inner, &tails)))
                    .collect();
                out.insert(key.clone(), projected);
            }
            _ => {}
        }
    }
    out
}
