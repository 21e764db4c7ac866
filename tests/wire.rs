//! Wire protocol tests
//!
//! Talks to a real listener over TCP with hand-built OP_MSG and OP_QUERY
//! frames, the way a driver would.

use mql::{Document, Value};
use nosqlgate::codec::{binary, json};
use nosqlgate::config::CodecLimits;
use nosqlgate::server::wire::{self, Header, HEADER_LEN, MORE_TO_COME, OP_MSG, OP_QUERY, OP_REPLY};
use nosqlgate::storage::{BackendError, Row, SqlValue};
use nosqlgate::{Backend, Config, Gateway, Server, SqliteBackend};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<nosqlgate::Result<()>>,
}

/// Helper to start a server on a free port
async fn start_server() -> Running {
    start_server_with(Config::default()).await
}

async fn start_server_with(config: Config) -> Running {
    let backend = SqliteBackend::open_in_memory().expect("Failed to open database");
    start_server_on(config, Arc::new(backend)).await
}

async fn start_server_on(config: Config, backend: Arc<dyn Backend>) -> Running {
    let gateway = Gateway::with_backend(config, backend);
    let server = Server::bind_to("127.0.0.1:0".parse().unwrap(), gateway.executor())
        .await
        .expect("Failed to bind");
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_token();
    let handle = tokio::spawn(server.run());
    Running { addr, shutdown, handle }
}

fn doc(text: &str) -> Document {
    json::decode(text, &CodecLimits::default()).expect(&format!("Bad JSON: {}", text))
}

fn frame(op_code: i32, request_id: i32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&((HEADER_LEN + payload.len()) as i32).to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&op_code.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// OP_MSG payload: flags, a body section, then optional document sequences
fn msg_payload(flags: u32, body: &Document, sequences: &[(&str, Vec<Document>)]) -> Vec<u8> {
    let mut payload = flags.to_le_bytes().to_vec();
    payload.push(0);
    payload.extend(binary::encode_document(body).unwrap());
    for (identifier, docs) in sequences {
        let mut section = Vec::new();
        section.extend_from_slice(identifier.as_bytes());
        section.push(0);
        for d in docs {
            section.extend(binary::encode_document(d).unwrap());
        }
        payload.push(1);
        payload.extend_from_slice(&((section.len() + 4) as i32).to_le_bytes());
        payload.extend(section);
    }
    payload
}

/// OP_QUERY payload against `<database>.$cmd`
fn query_payload(database: &str, query: &Document) -> Vec<u8> {
    let mut payload = 0i32.to_le_bytes().to_vec();
    payload.extend_from_slice(format!("{}.$cmd", database).as_bytes());
    payload.push(0);
    payload.extend_from_slice(&0i32.to_le_bytes());
    payload.extend_from_slice(&(-1i32).to_le_bytes());
    payload.extend(binary::encode_document(query).unwrap());
    payload
}

struct Client {
    stream: TcpStream,
    next_request_id: i32,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = timeout(WAIT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("Failed to connect");
        Self {
            stream,
            next_request_id: 1,
        }
    }

    fn request_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write failed");
    }

    /// Next reply frame, or `None` once the server has closed the connection
    async fn read(&mut self) -> Option<(Header, Vec<u8>)> {
        timeout(WAIT, wire::read_frame(&mut self.stream, 48_000_000))
            .await
            .expect("read timed out")
            .expect("bad reply frame")
    }

    async fn read_reply(&mut self) -> (Header, Document) {
        let (header, payload) = self.read().await.expect("connection closed");
        let body = match header.op_code {
            OP_MSG => {
                assert_eq!(&payload[..5], &[0, 0, 0, 0, 0]);
                binary::decode_document(&payload[5..], &CodecLimits::default()).unwrap()
            }
            OP_REPLY => binary::decode_document(&payload[20..], &CodecLimits::default()).unwrap(),
            other => panic!("unexpected reply opcode {}", other),
        };
        (header, body)
    }

    /// Send an OP_MSG command and wait for its reply
    async fn command(&mut self, body: &str) -> Document {
        let id = self.request_id();
        let bytes = frame(OP_MSG, id, &msg_payload(0, &doc(body), &[]));
        self.send(&bytes).await;
        let (header, reply) = self.read_reply().await;
        assert_eq!(header.response_to, id);
        reply
    }
}

fn is_ok(reply: &Document) -> bool {
    reply.get("ok") == Some(&Value::Double(1.0))
}

fn cursor(reply: &Document) -> (Vec<Value>, i64) {
    let cursor = reply.get_document("cursor").expect("reply has no cursor");
    let batch = cursor
        .get_array("firstBatch")
        .or_else(|| cursor.get_array("nextBatch"))
        .cloned()
        .expect("cursor has no batch");
    let id = cursor.get("id").and_then(Value::as_i64).expect("cursor has no id");
    (batch, id)
}

// =============================================================================
// OP_MSG
// =============================================================================

#[tokio::test]
async fn test_document_sequence_insert_then_find_one_each() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await;

    let reply = client.command(r#"{"drop": "mongo", "$db": "test"}"#).await;
    assert!(is_ok(&reply));

    let docs: Vec<Document> = (0..20i64).map(|i| Document::new().with("field", i)).collect();
    let body = doc(r#"{"insert": "mongo", "$db": "test"}"#);
    let id = client.request_id();
    client
        .send(&frame(OP_MSG, id, &msg_payload(0, &body, &[("documents", docs)])))
        .await;
    let (header, reply) = client.read_reply().await;
    assert_eq!(header.response_to, id);
    assert!(is_ok(&reply), "{:?}", reply);
    assert_eq!(reply.get("n"), Some(&Value::Int(20)));

    for i in 0..20i64 {
        let reply = client
            .command(&format!(
                r#"{{"findOne": "mongo", "filter": {{"field": {{"$eq": {}}}}}, "$db": "test"}}"#,
                i
            ))
            .await;
        let found = reply.get_document("document").expect("no document found");
        assert_eq!(found.get("field"), Some(&Value::Int(i)));
        assert!(matches!(found.get("_id"), Some(Value::ObjectId(_))));
    }

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_get_more_over_the_wire() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await;

    let docs: Vec<String> = (0..7).map(|i| format!(r#"{{"_id": {}}}"#, i)).collect();
    client
        .command(&format!(r#"{{"insert": "paged", "documents": [{}], "$db": "test"}}"#, docs.join(", ")))
        .await;

    let reply = client
        .command(r#"{"find": "paged", "batchSize": 3, "sort": {"_id": 1}, "$db": "test"}"#)
        .await;
    let (mut seen, id) = cursor(&reply);
    assert_eq!(seen.len(), 3);
    assert_ne!(id, 0);

    loop {
        let reply = client
            .command(&format!(
                r#"{{"getMore": {}, "collection": "paged", "batchSize": 3, "$db": "test"}}"#,
                id
            ))
            .await;
        let (batch, next) = cursor(&reply);
        seen.extend(batch);
        if next == 0 {
            break;
        }
        assert_eq!(next, id);
    }

    let ids: Vec<i64> = seen
        .iter()
        .filter_map(|d| d.as_document().and_then(|d| d.get("_id")).and_then(Value::as_i64))
        .collect();
    assert_eq!(ids, (0..7).collect::<Vec<_>>());

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_duplicate_id_over_the_wire() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await;

    let reply = client
        .command(r#"{"insert": "dups", "documents": [{"_id": "a"}, {"_id": "a"}], "$db": "test"}"#)
        .await;
    assert!(is_ok(&reply));
    assert_eq!(reply.get("n"), Some(&Value::Int(1)));
    let errors = reply.get_array("writeErrors").expect("no writeErrors");
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].as_document().and_then(|e| e.get("code")),
        Some(&Value::Int(11000))
    );

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_more_to_come_gets_no_reply() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await;

    let body = doc(r#"{"insert": "quiet", "documents": [{"_id": 1}], "$db": "test"}"#);
    let silent = client.request_id();
    client
        .send(&frame(OP_MSG, silent, &msg_payload(MORE_TO_COME, &body, &[])))
        .await;

    // The next frame on the wire answers the count, not the insert
    let reply = client.command(r#"{"count": "quiet", "$db": "test"}"#).await;
    assert_eq!(reply.get("n"), Some(&Value::Int(1)));

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_command_errors_keep_the_connection() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await;

    let reply = client.command(r#"{"noSuchCommand": 1, "$db": "test"}"#).await;
    assert_eq!(reply.get("ok"), Some(&Value::Double(0.0)));
    assert_eq!(reply.get("code"), Some(&Value::Int(59)));

    let reply = client.command(r#"{"ping": 1, "$db": "admin"}"#).await;
    assert!(is_ok(&reply));

    server.shutdown.cancel();
}

// =============================================================================
// OP_QUERY handshake
// =============================================================================

#[tokio::test]
async fn test_legacy_is_master_gets_op_reply() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await;

    let id = client.request_id();
    client
        .send(&frame(OP_QUERY, id, &query_payload("admin", &doc(r#"{"isMaster": 1}"#))))
        .await;
    let (header, reply) = client.read_reply().await;
    assert_eq!(header.op_code, OP_REPLY);
    assert_eq!(header.response_to, id);
    assert!(is_ok(&reply));
    assert_eq!(reply.get("ismaster"), Some(&Value::Bool(true)));
    assert!(reply.get("maxWireVersion").and_then(Value::as_i64).unwrap_or(0) >= 6);

    // A wrapped query is unwrapped
    let id = client.request_id();
    client
        .send(&frame(
            OP_QUERY,
            id,
            &query_payload("admin", &doc(r#"{"$query": {"ping": 1}, "$readPreference": {"mode": "primary"}}"#)),
        ))
        .await;
    let (_, reply) = client.read_reply().await;
    assert!(is_ok(&reply), "{:?}", reply);

    // Later OP_MSG commands still work on the same connection
    let reply = client.command(r#"{"hello": 1, "$db": "admin"}"#).await;
    assert_eq!(reply.get("isWritablePrimary"), Some(&Value::Bool(true)));

    server.shutdown.cancel();
}

// =============================================================================
// Framing errors and connection lifecycle
// =============================================================================

#[tokio::test]
async fn test_truncated_frame_closes_connection() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await;

    let full = frame(OP_MSG, 1, &msg_payload(0, &doc(r#"{"ping": 1, "$db": "test"}"#), &[]));
    client.send(&full[..full.len() - 4]).await;
    client.stream.shutdown().await.unwrap();

    assert!(client.read().await.is_none());

    // Other clients are unaffected
    let mut other = Client::connect(server.addr).await;
    assert!(is_ok(&other.command(r#"{"ping": 1, "$db": "test"}"#).await));

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_opcode_is_answered_then_closed() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await;

    client.send(&frame(2010, 5, &[0u8; 8])).await;

    let (header, reply) = client.read_reply().await;
    assert_eq!(header.response_to, 5);
    assert_eq!(reply.get("ok"), Some(&Value::Double(0.0)));
    assert!(client.read().await.is_none());

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_required_flag_is_a_protocol_error() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await;

    let body = doc(r#"{"ping": 1, "$db": "test"}"#);
    client.send(&frame(OP_MSG, 9, &msg_payload(1 << 4, &body, &[]))).await;

    let (_, reply) = client.read_reply().await;
    assert_eq!(reply.get("ok"), Some(&Value::Double(0.0)));
    assert!(client.read().await.is_none());

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let config = Config {
        max_message_size: 1024,
        ..Config::default()
    };
    let server = start_server_with(config).await;
    let mut client = Client::connect(server.addr).await;

    let mut header = Vec::new();
    header.extend_from_slice(&4096i32.to_le_bytes());
    header.extend_from_slice(&1i32.to_le_bytes());
    header.extend_from_slice(&0i32.to_le_bytes());
    header.extend_from_slice(&OP_MSG.to_le_bytes());
    client.send(&header).await;

    assert!(client.read().await.is_none());

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let config = Config {
        idle_timeout_secs: 1,
        ..Config::default()
    };
    let server = start_server_with(config).await;
    let mut client = Client::connect(server.addr).await;

    assert!(is_ok(&client.command(r#"{"ping": 1, "$db": "test"}"#).await));
    assert!(client.read().await.is_none());

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_stops_listener_and_sessions() {
    let server = start_server().await;
    let mut client = Client::connect(server.addr).await;
    assert!(is_ok(&client.command(r#"{"ping": 1, "$db": "test"}"#).await));

    server.shutdown.cancel();

    let result = timeout(WAIT, server.handle).await.expect("server did not stop");
    assert!(result.unwrap().is_ok());
    assert!(client.read().await.is_none());
}

/// Answers writes at once but takes a minute over every query
struct SlowReads {
    inner: SqliteBackend,
}

#[async_trait::async_trait]
impl Backend for SlowReads {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, BackendError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        self.inner.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, BackendError> {
        self.inner.execute(sql, params).await
    }
}

#[tokio::test]
async fn test_shutdown_interrupts_running_read() {
    let backend = SlowReads {
        inner: SqliteBackend::open_in_memory().expect("Failed to open database"),
    };
    let server = start_server_on(Config::default(), Arc::new(backend)).await;
    let mut client = Client::connect(server.addr).await;

    let id = client.request_id();
    let find = frame(OP_MSG, id, &msg_payload(0, &doc(r#"{"find": "slow", "$db": "test"}"#), &[]));
    client.send(&find).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.shutdown.cancel();
    // The session closes without waiting out the query
    assert!(client.read().await.is_none());
}

#[tokio::test]
async fn test_connections_share_storage() {
    let server = start_server().await;
    let mut writer = Client::connect(server.addr).await;
    let mut reader = Client::connect(server.addr).await;

    writer
        .command(r#"{"insert": "shared", "documents": [{"_id": 1, "v": "x"}], "$db": "test"}"#)
        .await;
    let reply = reader
        .command(r#"{"findOne": "shared", "filter": {"_id": 1}, "$db": "test"}"#)
        .await;
    assert_eq!(
        reply.get_document("document").and_then(|d| d.get_str("v")),
        Some("x")
    );

    server.shutdown.cancel();
}
