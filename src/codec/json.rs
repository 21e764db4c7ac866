//! [`Document`] <-> JSON text stored in the `doc` column
//!
//! Scalars JSON cannot express are wrapped the way MongoDB extended JSON
//! does it:
//!
//! | Value            | JSON                                              |
//! |------------------|---------------------------------------------------|
//! | ObjectId         | `{"$oid": "<24 hex>"}`                            |
//! | DateTime         | `{"$date": <millis>}`                             |
//! | Binary           | `{"$binary": {"base64": "..", "subType": "hh"}}`  |
//! | NaN / +-Infinity | `{"$numberDouble": "NaN" \| "Infinity" \| ...}`   |
//!
//! Doubles are always written with a fractional part (`2.0`), so they read
//! back as doubles and integers read back as integers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use mql::{Document, Value};
use serde_json::{Map, Number, Value as Json};

use crate::config::CodecLimits;
use crate::error::{Error, Result};

/// Encode a document as JSON text
pub fn encode(doc: &Document) -> Result<String> {
    Ok(serde_json::to_string(&Json::Object(to_json_object(doc)))?)
}

/// Decode JSON text into a document
pub fn decode(text: &str, limits: &CodecLimits) -> Result<Document> {
    match serde_json::from_str::<Json>(text)? {
        Json::Object(map) => from_json_object(map, 1, limits.max_nesting_depth),
        other => Err(Error::codec(format!(
            "stored payload is not a JSON object: {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn to_json_object(doc: &Document) -> Map<String, Json> {
    doc.iter().map(|(k, v)| (k.clone(), to_json(v))).collect()
}

fn wrapper(key: &str, value: Json) -> Json {
    let mut map = Map::with_capacity(1);
    map.insert(key.to_string(), value);
    Json::Object(map)
}

fn to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::Number((*i).into()),
        Value::Double(f) => match Number::from_f64(*f) {
            Some(n) => Json::Number(n),
            None => {
                let text = if f.is_nan() {
                    "NaN"
                } else if *f > 0.0 {
                    "Infinity"
                } else {
                    "-Infinity"
                };
                wrapper("$numberDouble", Json::String(text.to_string()))
            }
        },
        Value::String(s) => Json::String(s.clone()),
        Value::Binary { subtype, bytes } => {
            let mut inner = Map::with_capacity(2);
            inner.insert("base64".to_string(), Json::String(STANDARD.encode(bytes)));
            inner.insert("subType".to_string(), Json::String(format!("{:02x}", subtype)));
            wrapper("$binary", Json::Object(inner))
        }
        Value::ObjectId(oid) => wrapper("$oid", Json::String(super::oid_hex(oid))),
        Value::DateTime(ms) => wrapper("$date", Json::Number((*ms).into())),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Document(inner) => Json::Object(to_json_object(inner)),
    }
}

// ============================================================================
// Decoding
// ============================================================================

fn from_json_object(map: Map<String, Json>, depth: usize, max_depth: usize) -> Result<Document> {
    if depth > max_depth {
        return Err(Error::DepthExceeded { max: max_depth });
    }

    let mut doc = Document::new();
    for (key, value) in map {
        doc.insert(key, from_json(value, depth, max_depth)?);
    }
    Ok(doc)
}

fn from_json(value: Json, depth: usize, max_depth: usize) -> Result<Value> {
    Ok(match value {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => number(&n)?,
        Json::String(s) => Value::String(s),
        Json::Array(items) => {
            if depth + 1 > max_depth {
                return Err(Error::DepthExceeded { max: max_depth });
            }
            Value::Array(
                items
                    .into_iter()
                    .map(|item| from_json(item, depth + 1, max_depth))
                    .collect::<Result<_>>()?,
            )
        }
        Json::Object(map) => match extended(&map)? {
            Some(scalar) => scalar,
            None => Value::Document(from_json_object(map, depth + 1, max_depth)?),
        },
    })
}

fn number(n: &Number) -> Result<Value> {
    if let Some(i) = n.as_i64() {
        return Ok(Value::Int(i));
    }
    if n.is_u64() {
        return Err(Error::codec(format!("integer {} is out of 64-bit range", n)));
    }
    n.as_f64()
        .map(Value::Double)
        .ok_or_else(|| Error::codec(format!("unrepresentable number {}", n)))
}

/// Recognize a single-key extended JSON wrapper
fn extended(map: &Map<String, Json>) -> Result<Option<Value>> {
    if map.len() != 1 {
        return Ok(None);
    }
    let Some((key, inner)) = map.iter().next() else {
        return Ok(None);
    };

    let value = match (key.as_str(), inner) {
        ("$oid", Json::String(hex)) => {
            let oid = bson::oid::ObjectId::parse_str(hex)
                .map_err(|e| Error::codec(format!("invalid $oid '{}': {}", hex, e)))?;
            Value::ObjectId(oid.bytes())
        }
        ("$date", Json::Number(ms)) => match ms.as_i64() {
            Some(ms) => Value::DateTime(ms),
            None => return Err(Error::codec(format!("invalid $date {}", ms))),
        },
        ("$numberDouble", Json::String(text)) => match text.as_str() {
            "NaN" => Value::Double(f64::NAN),
            "Infinity" => Value::Double(f64::INFINITY),
            "-Infinity" => Value::Double(f64::NEG_INFINITY),
            other => other
                .parse()
                .map(Value::Double)
                .map_err(|_| Error::codec(format!("invalid $numberDouble '{}'", other)))?,
        },
        ("$binary", Json::Object(fields)) => {
            let data = fields.get("base64").and_then(Json::as_str);
            let subtype = fields.get("subType").and_then(Json::as_str);
            match (data, subtype) {
                (Some(data), Some(subtype)) => Value::Binary {
                    subtype: u8::from_str_radix(subtype, 16)
                        .map_err(|_| Error::codec(format!("invalid binary subType '{}'", subtype)))?,
                    bytes: STANDARD
                        .decode(data)
                        .map_err(|e| Error::codec(format!("invalid base64 payload: {}", e)))?,
                },
                _ => return Err(Error::codec("$binary needs base64 and subType")),
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> CodecLimits {
        CodecLimits::default()
    }

    fn roundtrip(doc: &Document) -> Document {
        decode(&encode(doc).unwrap(), &limits()).unwrap()
    }

    #[test]
    fn test_integers_stay_integers() {
        let doc = Document::new()
            .with("field", 7i64)
            .with("max", i64::MAX)
            .with("min", i64::MIN)
            .with("whole", 7.0f64);
        let text = encode(&doc).unwrap();
        assert_eq!(text, format!(r#"{{"field":7,"max":{},"min":{},"whole":7.0}}"#, i64::MAX, i64::MIN));
        let back = roundtrip(&doc);
        assert_eq!(back.get("field"), Some(&Value::Int(7)));
        assert_eq!(back.get("whole"), Some(&Value::Double(7.0)));
        assert_eq!(back, doc);
    }

    #[test]
    fn test_doubles_roundtrip_exactly() {
        let doc = Document::new().with("a", 0.1f64).with("b", 1e300f64).with("c", -2.5e-8f64);
        assert_eq!(roundtrip(&doc), doc);
    }

    #[test]
    fn test_extended_scalars() {
        let doc = Document::new()
            .with("_id", Value::ObjectId([0xab; 12]))
            .with("when", Value::DateTime(-1))
            .with("blob", Value::Binary { subtype: 0x80, bytes: b"hello".to_vec() })
            .with("nan", f64::INFINITY);
        let text = encode(&doc).unwrap();
        assert!(text.contains(r#""_id":{"$oid":"abababababababababababab"}"#));
        assert!(text.contains(r#""when":{"$date":-1}"#));
        assert!(text.contains(r#""subType":"80""#));
        assert_eq!(roundtrip(&doc), doc);
    }

    #[test]
    fn test_key_order_is_preserved() {
        let doc = Document::new().with("z", 1i64).with("a", 2i64).with("m", Document::new().with("y", 1i64).with("b", 2i64));
        assert_eq!(encode(&doc).unwrap(), r#"{"z":1,"a":2,"m":{"y":1,"b":2}}"#);
        assert_eq!(roundtrip(&doc), doc);
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(decode("[1,2]", &limits()).is_err());
        assert!(decode("not json", &limits()).is_err());
        assert!(decode(r#"{"a": 18446744073709551615}"#, &limits()).is_err());
    }

    #[test]
    fn test_decode_depth_limit() {
        let tight = CodecLimits { max_nesting_depth: 2, ..limits() };
        assert!(decode(r#"{"a":{"b":1}}"#, &tight).is_ok());
        assert!(matches!(
            decode(r#"{"a":{"b":{"c":1}}}"#, &tight),
            Err(Error::DepthExceeded { max: 2 })
        ));
    }
}
