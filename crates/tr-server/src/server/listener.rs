//! Agent server listener
//!
//! Accepts incoming agent connections and spawns a handler for each one.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::server::handler::ConnectionHandler;
use crate::service::AgentService;

/// Server that listens for capture agent connections
pub struct AgentServer {
    /// Shared service
    service: Arc<AgentService>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl AgentServer {
    /// Create a new agent server
    pub fn new(service: Arc<AgentService>, cancel: CancellationToken) -> Self {
        Self { service, cancel }
    }

    /// Bind `bind_addr` and serve until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Agent server listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Agent server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::info!("New agent connection from {}", peer_addr);

        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let handler = ConnectionHandler::new(
            Arc::clone(&self.service),
            peer_addr,
            self.cancel.child_token(),
        );

        tokio::spawn(async move {
            match handler.run(socket).await {
                Ok(()) => {
                    tracing::info!("Connection from {} closed normally", peer_addr);
                }
                Err(e) => {
                    tracing::warn!("Connection from {} closed with error: {:#}", peer_addr, e);
                }
            }
        });
    }
}
