//! WebSocket server implementation
//!
//! Provides a WebSocket server that listens on a configurable port and runs
//! one message loop per connected client.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::protocol::{ClientMessage, ServerMessage};
use crate::session::{ManagerConfig, SessionManager};

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self { bind, port }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server brokering client access to agent sessions
pub struct BridgeServer {
    config: ServerConfig,
    manager: Arc<SessionManager>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BridgeServer {
    /// Create a new bridge server
    pub fn new(config: ServerConfig, manager_config: ManagerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            manager: SessionManager::new(manager_config),
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the WebSocket server
    ///
    /// Listens for incoming connections and handles them concurrently until
    /// a shutdown signal is received.
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Bridge server listening on ws://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let manager = Arc::clone(&self.manager);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, manager, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let session_count = self.manager.session_count().await;
        if session_count > 0 {
            info!("{} agent sessions still live at shutdown", session_count);
        }

        Ok(())
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    manager: Arc<SessionManager>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let client_id = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    manager.register_client(client_id, outbound_tx).await;

    loop {
        tokio::select! {
            // Messages broadcast by the client's session
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    break;
                };
                let json = message.to_json()?;
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            // Requests from the client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let message = match ClientMessage::from_json(&text) {
                            Ok(message) => message,
                            Err(_) => {
                                // Malformed input is ignored outright
                                debug!("Ignoring malformed message from {}", peer_addr);
                                continue;
                            }
                        };

                        if let Some(reply) = handle_client_message(client_id, message, &manager).await {
                            let json = reply.to_json()?;
                            ws_sender.send(Message::Text(json)).await?;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pong messages
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {
                        // Raw frame, ignore
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    manager.disconnect(client_id).await;
    info!("Connection from {} closed", peer_addr);
    Ok(())
}

/// Handle a client request, returning a direct reply when one is due
///
/// Attach/detach/command results flow back asynchronously through the
/// session's broadcast channel; only keepalives and recoverable errors are
/// answered inline.
async fn handle_client_message(
    client_id: Uuid,
    message: ClientMessage,
    manager: &SessionManager,
) -> Option<ServerMessage> {
    match message {
        ClientMessage::Ping => Some(ServerMessage::Pong),
        ClientMessage::StartSession { cwd, session_file } => {
            debug!("start_session: cwd={}, sessionFile={:?}", cwd, session_file);
            match manager.attach(client_id, &cwd, session_file.as_deref()).await {
                Ok(()) => None,
                Err(e) => Some(ServerMessage::error(e.to_string())),
            }
        }
        ClientMessage::DetachSession => {
            manager.detach(client_id).await;
            None
        }
        ClientMessage::RpcCommand { command } => {
            match manager.command(client_id, command).await {
                Ok(()) => None,
                Err(e) => Some(ServerMessage::error(e.to_string())),
            }
        }
    }
}
