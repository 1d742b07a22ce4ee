//! Client hub: membership and broadcast fan-out.
//!
//! The hub runs as a single task; registration, unregistration, and
//! broadcasts all arrive over one command channel, so the client set is
//! only ever touched from one place and needs no locking. Delivery to a
//! client is non-blocking: a client whose outbound queue is full is evicted
//! rather than allowed to stall the fan-out for everyone else.

use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::protocol::OutboundMessage;

/// Depth of the hub's command queue.
const COMMAND_QUEUE: usize = 64;

/// Commands processed by the hub loop.
enum HubCommand {
    /// A new control client connected.
    Register {
        id: u64,
        sender: mpsc::Sender<String>,
    },
    /// A control client disconnected.
    Unregister { id: u64 },
    /// Fan a serialized frame out to every client.
    Broadcast(String),
    /// Report the number of connected clients.
    ClientCount(oneshot::Sender<usize>),
}

/// The hub task. Create with [`Hub::new`], then `tokio::spawn(hub.run())`.
pub struct Hub {
    rx: mpsc::Receiver<HubCommand>,
    clients: HashMap<u64, mpsc::Sender<String>>,
}

/// Cheap handle for talking to the hub from other tasks.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl Hub {
    /// Create the hub and a handle to it.
    pub fn new() -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        (
            Self {
                rx,
                clients: HashMap::new(),
            },
            HubHandle { tx },
        )
    }

    /// Run the hub loop until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                HubCommand::Register { id, sender } => {
                    debug!("Control client {} registered", id);
                    self.clients.insert(id, sender);
                }
                HubCommand::Unregister { id } => {
                    if self.clients.remove(&id).is_some() {
                        debug!("Control client {} unregistered", id);
                    }
                }
                HubCommand::Broadcast(frame) => self.broadcast(frame),
                HubCommand::ClientCount(reply) => {
                    let _ = reply.send(self.clients.len());
                }
            }
        }
        debug!("Hub loop stopped");
    }

    /// Deliver `frame` to every client, evicting any whose queue is full.
    fn broadcast(&mut self, frame: String) {
        let mut evicted = Vec::new();

        for (id, sender) in &self.clients {
            if let Err(e) = sender.try_send(frame.clone()) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!("Control client {} outbound queue full, evicting", id);
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        debug!("Control client {} gone, evicting", id);
                    }
                }
                evicted.push(*id);
            }
        }

        // Dropping the sender ends the client's write pump and closes the
        // connection.
        for id in evicted {
            self.clients.remove(&id);
        }
    }
}

impl HubHandle {
    /// Register a client's outbound queue under `id`.
    pub async fn register(&self, id: u64, sender: mpsc::Sender<String>) {
        if self
            .tx
            .send(HubCommand::Register { id, sender })
            .await
            .is_err()
        {
            warn!("Hub is gone, cannot register client {}", id);
        }
    }

    /// Remove the client registered under `id`.
    pub async fn unregister(&self, id: u64) {
        let _ = self.tx.send(HubCommand::Unregister { id }).await;
    }

    /// Broadcast a message to all connected clients.
    pub async fn broadcast(&self, message: &OutboundMessage) {
        let Some(frame) = message.to_json() else {
            warn!("Dropping unserializable broadcast");
            return;
        };
        if self.tx.send(HubCommand::Broadcast(frame)).await.is_err() {
            warn!("Hub is gone, dropping broadcast");
        }
    }

    /// Number of currently connected clients.
    pub async fn client_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(HubCommand::ClientCount(reply_tx))
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::protocol::{RequestNotice, RequestStatus};
    use std::collections::HashMap as StdHashMap;
    use uuid::Uuid;

    fn notice() -> OutboundMessage {
        let id = Uuid::new_v4();
        OutboundMessage::Request {
            id,
            data: RequestNotice {
                id,
                method: "GET".to_string(),
                url: "http://example.com/".to_string(),
                headers: StdHashMap::new(),
                body: String::new(),
                status: RequestStatus::Pending,
            },
        }
    }

    #[tokio::test]
    async fn test_register_broadcast_unregister() {
        let (hub, handle) = Hub::new();
        tokio::spawn(hub.run());

        let (tx, mut rx) = mpsc::channel(8);
        handle.register(1, tx).await;
        assert_eq!(handle.client_count().await, 1);

        handle.broadcast(&notice()).await;
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("\"type\":\"request\""));

        handle.unregister(1).await;
        assert_eq!(handle.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_only_that_client() {
        let (hub, handle) = Hub::new();
        tokio::spawn(hub.run());

        // Client 1 has a single-slot queue that is already full.
        let (full_tx, _full_rx) = mpsc::channel(1);
        full_tx.send("stuck".to_string()).await.unwrap();
        handle.register(1, full_tx).await;

        let (ok_tx, mut ok_rx) = mpsc::channel(8);
        handle.register(2, ok_tx).await;
        assert_eq!(handle.client_count().await, 2);

        handle.broadcast(&notice()).await;

        // The healthy client still gets the frame; the stuck one is gone.
        let frame = ok_rx.recv().await.unwrap();
        assert!(frame.contains("request"));
        assert_eq!(handle.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_closed_client_is_evicted_on_broadcast() {
        let (hub, handle) = Hub::new();
        tokio::spawn(hub.run());

        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        handle.register(1, tx).await;

        handle.broadcast(&notice()).await;
        assert_eq!(handle.client_count().await, 0);
    }
}
