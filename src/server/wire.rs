//! MongoDB wire protocol framing
//!
//! Every message starts with a 16-byte little-endian header:
//!
//! ```text
//! ┌───────────────┬───────────┬────────────┬────────┐
//! │ messageLength │ requestID │ responseTo │ opCode │
//! │      i32      │    i32    │    i32     │  i32   │
//! └───────────────┴───────────┴────────────┴────────┘
//! ```
//!
//! Supported requests are OP_MSG (2013) and OP_QUERY (2004) against
//! `<db>.$cmd`. OP_MSG is answered with OP_MSG, OP_QUERY with OP_REPLY (1).
//!
//! Framing problems (bad length, unknown opcode, a section running past the
//! end of the message) are protocol errors and end the connection. A
//! malformed document inside a well-framed message is a codec error and only
//! fails that request.

use bytes::{BufMut, BytesMut};
use mql::{Document, Value};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::binary;
use crate::config::CodecLimits;
use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 16;

pub const OP_REPLY: i32 = 1;
pub const OP_QUERY: i32 = 2004;
pub const OP_MSG: i32 = 2013;

/// OP_MSG flag bits
pub const CHECKSUM_PRESENT: u32 = 1;
pub const MORE_TO_COME: u32 = 1 << 1;
pub const EXHAUST_ALLOWED: u32 = 1 << 16;

/// Bits a receiver must understand; anything else in the low 16 bits is an error
const KNOWN_REQUIRED_BITS: u32 = CHECKSUM_PRESENT | MORE_TO_COME;

/// Message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl Header {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Self {
        let field = |i: usize| i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            message_length: field(0),
            request_id: field(4),
            response_to: field(8),
            op_code: field(12),
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code);
    }
}

/// A decoded client request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// OP_MSG; kind-1 sequences are already merged into `body`
    Msg {
        header: Header,
        body: Document,
        more_to_come: bool,
    },
    /// Legacy OP_QUERY on `<database>.$cmd`
    Query {
        header: Header,
        database: String,
        body: Document,
    },
}

impl Request {
    pub fn header(&self) -> &Header {
        match self {
            Request::Msg { header, .. } | Request::Query { header, .. } => header,
        }
    }

    pub fn body(&self) -> &Document {
        match self {
            Request::Msg { body, .. } | Request::Query { body, .. } => body,
        }
    }

    /// True when the client asked for no reply
    pub fn more_to_come(&self) -> bool {
        matches!(self, Request::Msg { more_to_come: true, .. })
    }
}

// ============================================================================
// Reading
// ============================================================================

/// Read one complete message.
///
/// Returns `Ok(None)` when the peer closes the connection between messages.
pub async fn read_frame<R>(reader: &mut R, max_message_size: usize) -> Result<Option<(Header, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut raw[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::protocol(format!("connection closed after {} header bytes", filled)));
        }
        filled += n;
    }

    let header = Header::parse(&raw);
    let length = header.message_length;
    if length < HEADER_LEN as i32 {
        return Err(Error::protocol(format!("message length {} is below the header size", length)));
    }
    if length as usize > max_message_size {
        return Err(Error::protocol(format!(
            "message length {} exceeds the maximum of {}",
            length, max_message_size
        )));
    }

    let mut payload = vec![0u8; length as usize - HEADER_LEN];
    reader.read_exact(&mut payload).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::protocol(format!(
            "message truncated: expected {} bytes",
            length
        )),
        _ => Error::Io(e),
    })?;

    Ok(Some((header, payload)))
}

/// Decode the payload of a message whose header has been read
pub fn parse_request(header: Header, payload: &[u8], limits: &CodecLimits) -> Result<Request> {
    match header.op_code {
        OP_MSG => parse_msg(header, payload, limits),
        OP_QUERY => parse_query(header, payload, limits),
        other => Err(Error::protocol(format!("unsupported opcode {}", other))),
    }
}

/// Cursor over a message payload; running off the end is a protocol error
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::protocol(format!(
                "section needs {} bytes but only {} remain",
                n,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstring(&mut self) -> Result<String> {
        let rest = &self.bytes[self.pos..];
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::protocol("unterminated string"))?;
        let text = std::str::from_utf8(&rest[..end])
            .map_err(|_| Error::protocol("string is not valid UTF-8"))?
            .to_string();
        self.pos += end + 1;
        Ok(text)
    }

    /// The raw bytes of the next BSON document, framed by its length prefix
    fn document_bytes(&mut self) -> Result<&'a [u8]> {
        let rest = &self.bytes[self.pos..];
        let length = binary::declared_length(rest).map_err(|_| Error::protocol("truncated document length"))?;
        self.take(length)
    }
}

fn parse_msg(header: Header, payload: &[u8], limits: &CodecLimits) -> Result<Request> {
    let mut reader = Reader::new(payload);
    let flags = reader.i32()? as u32;

    let unknown = flags & 0xffff & !KNOWN_REQUIRED_BITS;
    if unknown != 0 {
        return Err(Error::protocol(format!("unknown required OP_MSG flag bits {:#x}", unknown)));
    }

    let mut sections = payload;
    if flags & CHECKSUM_PRESENT != 0 {
        if payload.len() < 8 {
            return Err(Error::protocol("checksum flag set but message is too short"));
        }
        sections = &payload[..payload.len() - 4];
    }
    let mut reader = Reader::new(&sections[4..]);

    let mut body: Option<Document> = None;
    let mut sequences: Vec<(String, Vec<Value>)> = Vec::new();

    while reader.remaining() > 0 {
        match reader.u8()? {
            0 => {
                let bytes = reader.document_bytes()?;
                if body.is_some() {
                    return Err(Error::protocol("OP_MSG carries more than one body section"));
                }
                body = Some(binary::decode_document(bytes, limits)?);
            }
            1 => {
                let size = reader.i32()?;
                if size < 4 {
                    return Err(Error::protocol(format!("invalid document sequence size {}", size)));
                }
                let mut section = Reader::new(reader.take(size as usize - 4)?);
                let identifier = section.cstring()?;
                let mut docs = Vec::new();
                while section.remaining() > 0 {
                    let bytes = section.document_bytes()?;
                    docs.push(Value::Document(binary::decode_document(bytes, limits)?));
                }
                sequences.push((identifier, docs));
            }
            kind => return Err(Error::protocol(format!("unknown OP_MSG section kind {}", kind))),
        }
    }

    let mut body = body.ok_or_else(|| Error::protocol("OP_MSG has no body section"))?;
    for (identifier, docs) in sequences {
        body.insert(identifier, docs);
    }

    Ok(Request::Msg {
        header,
        body,
        more_to_come: flags & MORE_TO_COME != 0,
    })
}

fn parse_query(header: Header, payload: &[u8], limits: &CodecLimits) -> Result<Request> {
    let mut reader = Reader::new(payload);
    let _flags = reader.i32()?;
    let namespace = reader.cstring()?;
    let _skip = reader.i32()?;
    let _return = reader.i32()?;
    let query = binary::decode_document(reader.document_bytes()?, limits)?;

    let database = namespace
        .strip_suffix(".$cmd")
        .ok_or_else(|| Error::NotSupported {
            command: format!("OP_QUERY on '{}'", namespace),
        })?
        .to_string();

    // Legacy drivers wrap the command as {$query: {...}, $readPreference: ...}
    let body = match query.get_document("$query") {
        Some(inner) => inner.clone(),
        None => query,
    };

    Ok(Request::Query { header, database, body })
}

// ============================================================================
// Writing
// ============================================================================

/// Frame a reply as OP_MSG with a single body section
pub fn encode_msg(request_id: i32, response_to: i32, body: &Document) -> Result<BytesMut> {
    let doc = binary::encode_document(body)?;
    let length = HEADER_LEN + 4 + 1 + doc.len();

    let mut buf = BytesMut::with_capacity(length);
    Header {
        message_length: length as i32,
        request_id,
        response_to,
        op_code: OP_MSG,
    }
    .write(&mut buf);
    buf.put_u32_le(0);
    buf.put_u8(0);
    buf.put_slice(&doc);
    Ok(buf)
}

/// Frame a reply as legacy OP_REPLY carrying one document
pub fn encode_reply(request_id: i32, response_to: i32, body: &Document) -> Result<BytesMut> {
    let doc = binary::encode_document(body)?;
    let length = HEADER_LEN + 4 + 8 + 4 + 4 + doc.len();

    let mut buf = BytesMut::with_capacity(length);
    Header {
        message_length: length as i32,
        request_id,
        response_to,
        op_code: OP_REPLY,
    }
    .write(&mut buf);
    buf.put_i32_le(0); // responseFlags
    buf.put_i64_le(0); // cursorID
    buf.put_i32_le(0); // startingFrom
    buf.put_i32_le(1); // numberReturned
    buf.put_slice(&doc);
    Ok(buf)
}

/// Frame a reply in the style the request arrived in
pub fn encode_response(op_code: i32, request_id: i32, response_to: i32, body: &Document) -> Result<BytesMut> {
    if op_code == OP_QUERY {
        encode_reply(request_id, response_to, body)
    } else {
        encode_msg(request_id, response_to, body)
    }
}
