//! WebSocket transport for control clients.
//!
//! Listens on a TCP port and upgrades connections on path `/ws`. Each
//! client gets a write pump (draining its hub-registered outbound queue)
//! and an inline read loop that dispatches parsed messages. Malformed or
//! unknown frames are logged and ignored; the session continues. A failed
//! or closed connection unregisters the client and affects nothing else.

use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::hub::HubHandle;
use super::protocol::InboundMessage;
use super::state::SharedState;
use crate::proxy::hold::DecisionRegistry;

/// Upgrade path control clients must request.
const CONTROL_PATH: &str = "/ws";

/// Depth of a client's outbound queue; overflowing it gets the client
/// evicted by the hub.
const CLIENT_QUEUE: usize = 256;

/// Errors from the control listener.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Binding or accepting on the control port failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// WebSocket handshake or framing failed.
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The control-channel listener.
pub struct ControlServer {
    listener: TcpListener,
    hub: HubHandle,
    registry: Arc<DecisionRegistry>,
    state: Arc<SharedState>,
    launch_tx: mpsc::Sender<serde_json::Value>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    /// Bind the control listener.
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        addr: SocketAddr,
        hub: HubHandle,
        registry: Arc<DecisionRegistry>,
        state: Arc<SharedState>,
        launch_tx: mpsc::Sender<serde_json::Value>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, ControlError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Control channel listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            hub,
            registry,
            state,
            launch_tx,
            shutdown_rx,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ControlError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept control clients until shutdown is signaled.
    pub async fn run(mut self) {
        let mut next_client_id: u64 = 0;

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            next_client_id += 1;
                            let id = next_client_id;
                            debug!("Control connection {} from {}", id, peer);

                            let hub = self.hub.clone();
                            let registry = self.registry.clone();
                            let state = self.state.clone();
                            let launch_tx = self.launch_tx.clone();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_client(stream, id, hub, registry, state, launch_tx)
                                        .await
                                {
                                    debug!("Control client {} ended: {}", id, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept control connection: {}", e);
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Control channel shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Serve one control client: handshake, register, pump until it goes away.
async fn handle_client(
    stream: TcpStream,
    id: u64,
    hub: HubHandle,
    registry: Arc<DecisionRegistry>,
    state: Arc<SharedState>,
    launch_tx: mpsc::Sender<serde_json::Value>,
) -> Result<(), ControlError> {
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        if req.uri().path() == CONTROL_PATH {
            Ok(resp)
        } else {
            let mut reject = ErrorResponse::new(Some("no such endpoint".to_string()));
            *reject.status_mut() = http::StatusCode::NOT_FOUND;
            Err(reject)
        }
    })
    .await?;

    let (mut sink, mut reader) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(CLIENT_QUEUE);
    hub.register(id, out_tx).await;
    info!("Control client {} connected", id);

    // Write pump: drain the hub-registered queue into the socket. Ends when
    // the hub drops the sender (eviction) or the socket dies.
    let write_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Read loop: dispatch inbound frames until the client disconnects.
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                dispatch(&text, id, &registry, &state, &launch_tx);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // binary/ping/pong: nothing to do
            Err(e) => {
                debug!("Control client {} read error: {}", id, e);
                break;
            }
        }
    }

    hub.unregister(id).await;
    write_task.abort();
    info!("Control client {} disconnected", id);
    Ok(())
}

/// Parse and act on one inbound frame.
fn dispatch(
    text: &str,
    client_id: u64,
    registry: &DecisionRegistry,
    state: &SharedState,
    launch_tx: &mpsc::Sender<serde_json::Value>,
) {
    let message: InboundMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Malformed control message from client {}: {}", client_id, e);
            return;
        }
    };

    match message {
        InboundMessage::Pause { data } => state.set_paused(data),
        InboundMessage::ResumeAll => state.set_paused(false),
        InboundMessage::ModifyRequest { data } => {
            let id = data.id;
            let outcome = registry.deliver(data);
            debug!("Decision for request {}: {:?}", id, outcome);
        }
        InboundMessage::LaunchBrowser { data } => {
            let payload = data.unwrap_or(serde_json::Value::Null);
            if launch_tx.try_send(payload).is_err() {
                warn!("Browser launch request dropped (no collaborator draining the queue)");
            }
        }
        InboundMessage::Unknown => {
            debug!("Ignoring unknown control message type from client {}", client_id);
        }
    }
}
