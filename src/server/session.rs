//! One client connection
//!
//! Requests on a connection are handled strictly in order: read a frame,
//! run its command, write the reply. The session owns its socket and cursor
//! table, so every exit path releases both.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::wire::{self, Header, Request};
use crate::command::{reply, Command, CursorTable, Executor, RequestPhase, SessionState};
use crate::error::{Error, Result};

/// A connected client
pub struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    executor: Executor,
    state: SessionState,
    shutdown: CancellationToken,
    next_request_id: i32,
}

impl Session {
    pub fn new(stream: TcpStream, peer: SocketAddr, executor: Executor, shutdown: CancellationToken) -> Self {
        let config = executor.config();
        let mut state = SessionState::new(config.default_database.clone(), peer.to_string());
        state.cursors = CursorTable::with_limits(config.max_open_cursors, config.cursor_timeout());
        Self {
            stream,
            peer,
            executor,
            state,
            shutdown,
            next_request_id: 1,
        }
    }

    /// Serve requests until the client leaves, the connection idles out,
    /// the server shuts down, or a protocol error occurs
    pub async fn run(mut self) -> Result<()> {
        self.stream.set_nodelay(true)?;
        let idle = self.executor.config().idle_timeout();
        let max_message_size = self.executor.config().max_message_size;

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(peer = %self.peer, "closing for shutdown");
                    return Ok(());
                }
                frame = read_with_idle(&mut self.stream, max_message_size, idle) => frame,
            };

            let (header, payload) = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(Error::Timeout) => {
                    info!(peer = %self.peer, "closing idle connection");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            if self.handle_frame(header, &payload).await?.is_break() {
                return Ok(());
            }
        }
    }

    /// Answer one request; `Break` ends the session
    async fn handle_frame(&mut self, header: Header, payload: &[u8]) -> Result<ControlFlow<()>> {
        debug!(
            phase = %RequestPhase::Received,
            peer = %self.peer,
            request_id = header.request_id,
            op_code = header.op_code,
            length = header.message_length,
            "request received"
        );

        let limits = self.executor.config().codec_limits();
        let request = match wire::parse_request(header, payload, &limits) {
            Ok(request) => request,
            Err(err) => {
                warn!(peer = %self.peer, code = err.code(), error = %err, "undecodable request");
                // Best effort: the client may still be listening
                let sent = self.send(header, &reply::error(&err)).await;
                if err.is_fatal() {
                    return Err(err);
                }
                return sent.map(ControlFlow::Continue);
            }
        };

        debug!(phase = %RequestPhase::Parsed, request_id = header.request_id, "request decoded");

        if let Request::Query { database, .. } = &request {
            self.state.database = database.clone();
        }

        let reply = if Command::is_read_only(request.body()) {
            // Reads give way to shutdown and to a client that hung up
            tokio::select! {
                reply = self.executor.handle(&mut self.state, request.body()) => reply,
                _ = self.shutdown.cancelled() => {
                    debug!(peer = %self.peer, request_id = header.request_id, "abandoning read for shutdown");
                    return Ok(ControlFlow::Break(()));
                }
                _ = peer_closed(&self.stream) => {
                    debug!(peer = %self.peer, request_id = header.request_id, "client left mid-read");
                    return Ok(ControlFlow::Break(()));
                }
            }
        } else {
            self.executor.handle(&mut self.state, request.body()).await
        };

        if request.more_to_come() {
            return Ok(ControlFlow::Continue(()));
        }
        self.send(header, &reply).await?;
        debug!(phase = %RequestPhase::Replied, request_id = header.request_id, "reply sent");
        Ok(ControlFlow::Continue(()))
    }

    async fn send(&mut self, request: Header, body: &mql::Document) -> Result<()> {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        let frame = match wire::encode_response(request.op_code, request_id, request.request_id, body) {
            Ok(frame) => frame,
            // A reply the codec refuses is replaced by an error the client can read
            Err(err) => wire::encode_response(request.op_code, request_id, request.request_id, &reply::error(&err))?,
        };
        self.stream.write_all(&frame).await?;
        Ok(())
    }
}

/// Resolves once the client has closed its end of the connection
async fn peer_closed(stream: &TcpStream) {
    let mut byte = [0u8; 1];
    match stream.peek(&mut byte).await {
        Ok(0) | Err(_) => {}
        // A pipelined request is waiting; the client is still there
        Ok(_) => std::future::pending::<()>().await,
    }
}

async fn read_with_idle(
    stream: &mut TcpStream,
    max_message_size: usize,
    idle: Option<Duration>,
) -> Result<Option<(Header, Vec<u8>)>> {
    match idle {
        Some(limit) => tokio::time::timeout(limit, wire::read_frame(stream, max_message_size))
            .await
            .map_err(|_| Error::Timeout)?,
        None => wire::read_frame(stream, max_message_size).await,
    }
}
