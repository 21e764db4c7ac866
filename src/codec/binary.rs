//! BSON wire form <-> [`Document`]
//!
//! Byte layout is handled by the `bson` crate; this module enforces the
//! gateway's size and depth limits and maps BSON types onto [`Value`].

use bson::spec::BinarySubtype;
use bson::Bson;
use mql::{Document, Value};
use std::io::Cursor;

use crate::config::CodecLimits;
use crate::error::{Error, Result};

/// Decode one complete BSON document
pub fn decode_document(bytes: &[u8], limits: &CodecLimits) -> Result<Document> {
    if bytes.len() > limits.max_document_size {
        return Err(Error::DocumentTooLarge {
            size: bytes.len(),
            max: limits.max_document_size,
        });
    }

    let declared = declared_length(bytes)?;
    if declared != bytes.len() {
        return Err(Error::codec(format!(
            "length prefix says {} bytes but {} are present",
            declared,
            bytes.len()
        )));
    }

    let raw = bson::Document::from_reader(Cursor::new(bytes))?;
    from_bson_document(raw, 1, limits.max_nesting_depth)
}

/// Read the little-endian length prefix of a BSON document
pub fn declared_length(bytes: &[u8]) -> Result<usize> {
    let prefix: [u8; 4] = bytes
        .get(..4)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| Error::codec("truncated length prefix"))?;

    let len = i32::from_le_bytes(prefix);
    if len < 5 {
        return Err(Error::codec(format!("invalid document length {}", len)));
    }
    Ok(len as usize)
}

/// Encode a document to BSON bytes
pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    to_bson_document(doc).to_writer(&mut buf)?;
    Ok(buf)
}

/// Size of the document in its BSON form
pub fn encoded_size(doc: &Document) -> Result<usize> {
    encode_document(doc).map(|b| b.len())
}

fn from_bson_document(raw: bson::Document, depth: usize, max_depth: usize) -> Result<Document> {
    if depth > max_depth {
        return Err(Error::DepthExceeded { max: max_depth });
    }

    let mut doc = Document::new();
    for (key, value) in raw {
        doc.insert(key, from_bson(value, depth, max_depth)?);
    }
    Ok(doc)
}

fn from_bson(value: Bson, depth: usize, max_depth: usize) -> Result<Value> {
    Ok(match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::Int(i as i64),
        Bson::Int64(i) => Value::Int(i),
        Bson::Double(f) => Value::Double(f),
        Bson::String(s) => Value::String(s),
        Bson::Binary(bin) => Value::Binary {
            subtype: u8::from(bin.subtype),
            bytes: bin.bytes,
        },
        Bson::ObjectId(oid) => Value::ObjectId(oid.bytes()),
        Bson::DateTime(dt) => Value::DateTime(dt.timestamp_millis()),
        Bson::Array(items) => {
            if depth + 1 > max_depth {
                return Err(Error::DepthExceeded { max: max_depth });
            }
            Value::Array(
                items
                    .into_iter()
                    .map(|item| from_bson(item, depth + 1, max_depth))
                    .collect::<Result<_>>()?,
            )
        }
        Bson::Document(inner) => Value::Document(from_bson_document(inner, depth + 1, max_depth)?),
        other => {
            return Err(Error::codec(format!(
                "unsupported BSON type {:?}",
                other.element_type()
            )))
        }
    })
}

fn to_bson_document(doc: &Document) -> bson::Document {
    doc.iter()
        .map(|(k, v)| (k.clone(), to_bson(v)))
        .collect()
}

fn to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(i) => match i32::try_from(*i) {
            Ok(small) => Bson::Int32(small),
            Err(_) => Bson::Int64(*i),
        },
        Value::Double(f) => Bson::Double(*f),
        Value::String(s) => Bson::String(s.clone()),
        Value::Binary { subtype, bytes } => Bson::Binary(bson::Binary {
            subtype: BinarySubtype::from(*subtype),
            bytes: bytes.clone(),
        }),
        Value::ObjectId(oid) => Bson::ObjectId(bson::oid::ObjectId::from_bytes(*oid)),
        Value::DateTime(ms) => Bson::DateTime(bson::DateTime::from_millis(*ms)),
        Value::Array(items) => Bson::Array(items.iter().map(to_bson).collect()),
        Value::Document(inner) => Bson::Document(to_bson_document(inner)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> CodecLimits {
        CodecLimits::default()
    }

    fn sample() -> Document {
        Document::new()
            .with("_id", Value::ObjectId([7; 12]))
            .with("field", 19i64)
            .with("big", i64::MAX)
            .with("ratio", 0.5f64)
            .with("whole", 2.0f64)
            .with("name", "caf\u{e9}")
            .with("flag", true)
            .with("none", Value::Null)
            .with("blob", Value::Binary { subtype: 4, bytes: vec![1, 2, 3] })
            .with("when", Value::DateTime(1_700_000_000_000))
            .with("tags", vec![Value::from("a"), Value::Int(1)])
            .with("nested", Document::new().with("x", 1i64))
    }

    #[test]
    fn test_scalar_types_survive_the_wire() {
        let doc = sample();
        let bytes = encode_document(&doc).unwrap();
        let decoded = decode_document(&bytes, &limits()).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(decoded.get("whole"), Some(&Value::Double(2.0)));
        assert_eq!(decoded.get("big"), Some(&Value::Int(i64::MAX)));
    }

    #[test]
    fn test_int32_and_int64_both_decode_to_int() {
        let raw = bson::doc! { "a": 5i32, "b": 5i64 };
        let mut bytes = Vec::new();
        raw.to_writer(&mut bytes).unwrap();
        let doc = decode_document(&bytes, &limits()).unwrap();
        assert_eq!(doc.get("a"), Some(&Value::Int(5)));
        assert_eq!(doc.get("b"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_truncated_document() {
        let bytes = encode_document(&sample()).unwrap();
        assert!(matches!(
            decode_document(&bytes[..bytes.len() - 3], &limits()),
            Err(Error::Codec { .. })
        ));
        assert!(matches!(decode_document(&bytes[..2], &limits()), Err(Error::Codec { .. })));
    }

    #[test]
    fn test_unsupported_type() {
        let raw = bson::doc! { "ts": bson::Timestamp { time: 1, increment: 1 } };
        let mut bytes = Vec::new();
        raw.to_writer(&mut bytes).unwrap();
        let err = decode_document(&bytes, &limits()).unwrap_err();
        assert!(err.to_string().contains("unsupported BSON type"));
    }

    #[test]
    fn test_depth_limit() {
        let mut doc = Document::new().with("leaf", 1i64);
        for _ in 0..5 {
            doc = Document::new().with("child", doc);
        }
        let bytes = encode_document(&doc).unwrap();
        let tight = CodecLimits { max_nesting_depth: 3, ..limits() };
        assert!(matches!(
            decode_document(&bytes, &tight),
            Err(Error::DepthExceeded { max: 3 })
        ));
        assert!(decode_document(&bytes, &limits()).is_ok());
    }

    #[test]
    fn test_size_limit() {
        let bytes = encode_document(&sample()).unwrap();
        let tight = CodecLimits { max_document_size: 16, ..limits() };
        assert!(matches!(
            decode_document(&bytes, &tight),
            Err(Error::DocumentTooLarge { .. })
        ));
    }
}
