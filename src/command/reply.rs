//! Reply documents
//!
//! Success replies end with `ok: 1.0`; failures carry
//! `{ok: 0.0, errmsg, code, codeName}`.

use mql::{Document, Value};

use crate::config::Config;
use crate::error::Error;

/// Highest wire version the gateway speaks (MongoDB 5.0)
pub const MAX_WIRE_VERSION: i64 = 13;

/// Version reported by `buildInfo`
pub const SERVER_VERSION: &str = "5.0.0";

/// Append `ok: 1`
pub fn ok(mut body: Document) -> Document {
    body.insert("ok", 1.0f64);
    body
}

/// The failure reply for an error
pub fn error(err: &Error) -> Document {
    Document::new()
        .with("ok", 0.0f64)
        .with("errmsg", err.to_string())
        .with("code", err.code() as i64)
        .with("codeName", err.code_name())
}

/// One entry of a `writeErrors` array
pub fn write_error(index: usize, err: &Error) -> Value {
    Value::Document(
        Document::new()
            .with("index", index as i64)
            .with("code", err.code() as i64)
            .with("errmsg", err.to_string()),
    )
}

/// `{cursor: {<batch_key>: [...], id, ns}, ok: 1}`
pub fn cursor(batch_key: &str, docs: Vec<Document>, id: i64, namespace: &str) -> Document {
    let batch: Vec<Value> = docs.into_iter().map(Value::Document).collect();
    ok(Document::new().with(
        "cursor",
        Document::new()
            .with(batch_key, batch)
            .with("id", id)
            .with("ns", namespace),
    ))
}

/// Handshake answer for `hello` / `isMaster`
pub fn hello(config: &Config, now_millis: i64) -> Document {
    ok(Document::new()
        .with("helloOk", true)
        .with("ismaster", true)
        .with("isWritablePrimary", true)
        .with("maxBsonObjectSize", config.max_document_size as i64)
        .with("maxMessageSizeBytes", config.max_message_size as i64)
        .with("maxWriteBatchSize", 100_000i64)
        .with("localTime", Value::DateTime(now_millis))
        .with("logicalSessionTimeoutMinutes", 30i64)
        .with("minWireVersion", 0i64)
        .with("maxWireVersion", MAX_WIRE_VERSION)
        .with("readOnly", false))
}

/// Answer for `buildInfo`
pub fn build_info() -> Document {
    let parts: Vec<Value> = SERVER_VERSION
        .split('.')
        .filter_map(|p| p.parse::<i64>().ok())
        .map(Value::Int)
        .collect();
    ok(Document::new()
        .with("version", SERVER_VERSION)
        .with("gitVersion", concat!("nosqlgate-", env!("CARGO_PKG_VERSION")))
        .with("versionArray", parts)
        .with("bits", 64i64)
        .with("maxBsonObjectSize", 16i64 * 1024 * 1024))
}
