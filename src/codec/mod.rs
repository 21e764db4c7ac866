//! Document codec
//!
//! Converts documents between three forms:
//! - the BSON bytes carried on the wire ([`binary`])
//! - the [`Document`] tree used everywhere inside the gateway
//! - the JSON text stored in the relational `doc` column ([`json`])
//!
//! Integers stay integers across every conversion; doubles stay doubles.

pub mod binary;
pub mod json;

use mql::Value;

/// Hex form of an ObjectId, as used in identifier keys and JSON storage
pub fn oid_hex(bytes: &[u8; 12]) -> String {
    bson::oid::ObjectId::from_bytes(*bytes).to_hex()
}

/// A fresh ObjectId for documents inserted without `_id`
pub fn new_object_id() -> Value {
    Value::ObjectId(bson::oid::ObjectId::new().bytes())
}

/// Canonical text key of an `_id` value, stored in the table's id column.
///
/// The key carries a type tag (`o:` ObjectId hex, `s:` string, `i:` decimal
/// integer) so ids of different types never share a key. Only
/// identifier-capable values have a key; everything else is rejected by the
/// insert path.
pub fn id_key(id: &Value) -> Option<String> {
    match id {
        Value::ObjectId(oid) => Some(format!("o:{}", oid_hex(oid))),
        Value::String(s) => Some(format!("s:{}", s)),
        Value::Int(i) => Some(format!("i:{}", i)),
        _ => None,
    }
}
