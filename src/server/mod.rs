//! Wire-protocol listener
//!
//! Accepts TCP connections and hands each one to its own [`Session`] task.
//! Connections share nothing but the [`Executor`] and, through it, the
//! backend.

mod session;
pub mod wire;

pub use session::Session;

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::Executor;
use crate::error::Result;

/// A bound listener
pub struct Server {
    listener: TcpListener,
    executor: Executor,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the configured listen address
    pub async fn bind(executor: Executor) -> Result<Self> {
        Self::bind_to(executor.config().listen, executor).await
    }

    /// Bind an explicit address; port 0 picks a free one
    pub async fn bind_to(addr: SocketAddr, executor: Executor) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            executor,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Cancelling this token stops the accept loop and every session
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "listening");

        loop {
            let (socket, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let session = Session::new(socket, peer, self.executor.clone(), self.shutdown.child_token());
            tokio::spawn(async move {
                debug!(%peer, "connection opened");
                match session.run().await {
                    Ok(()) => debug!(%peer, "connection closed"),
                    Err(e) => warn!(%peer, code = e.code(), error = %e, "connection closed with error"),
                }
            });
        }

        info!("listener stopped");
        Ok(())
    }
}
