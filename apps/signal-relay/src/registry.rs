use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use axum::extract::ws::Message;
use metrics::counter;
use signal_envelope::{encode_notice, RelayNotice};
use slab::Slab;
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    RwLock,
};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_CHANNEL_DEPTH: usize = 64;

pub type ConnectionId = Uuid;

/// Flat set of live client connections.
///
/// Registration and removal take the write lock; a broadcast copies the
/// recipient senders under the read lock and delivers outside of it, so every
/// broadcast sees one consistent membership snapshot.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    connections: RwLock<Connections>,
    per_connection_buffer: usize,
}

#[derive(Default)]
struct Connections {
    slab: Slab<ClientConnection>,
    index: HashMap<ConnectionId, usize>,
}

struct ClientConnection {
    id: ConnectionId,
    sender: mpsc::Sender<Message>,
    alive: AtomicBool,
    remote_addr: Option<SocketAddr>,
}

pub struct Registration {
    pub connection_id: ConnectionId,
    pub receiver: mpsc::Receiver<Message>,
    pub active_connections: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub bytes: usize,
    pub dropped: usize,
    pub closed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub connection_id: ConnectionId,
    pub remote_addr: Option<SocketAddr>,
}

/// Failure to hand a frame to one recipient. Never aborts the rest of a broadcast.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("recipient queue is full")]
    Backpressure,
    #[error("recipient connection is closed")]
    Closed,
}

impl ConnectionRegistry {
    pub fn new(per_connection_buffer: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: RwLock::new(Connections::default()),
                per_connection_buffer: per_connection_buffer.max(1),
            }),
        }
    }

    /// Adds a connection and queues its `connected` acknowledgement.
    ///
    /// The acknowledgement is queued before the connection becomes visible to
    /// broadcasts, so it is always the first frame the client receives.
    pub async fn register(&self, remote_addr: Option<SocketAddr>) -> Registration {
        let connection_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.inner.per_connection_buffer);

        let greeting = encode_notice(&RelayNotice::Connected { connection_id });
        let greeting = Message::Text(String::from_utf8_lossy(&greeting).into_owned());
        if let Err(err) = sender.try_send(greeting) {
            warn!(connection_id = %connection_id, error = %err, "failed to queue connection ack");
        }

        let mut guard = self.inner.connections.write().await;
        let key = guard.slab.insert(ClientConnection {
            id: connection_id,
            sender,
            alive: AtomicBool::new(true),
            remote_addr,
        });
        guard.index.insert(connection_id, key);

        Registration {
            connection_id,
            receiver,
            active_connections: guard.slab.len(),
        }
    }

    /// Removes a connection. Returns the number of connections still active.
    pub async fn unregister(&self, connection_id: ConnectionId) -> usize {
        let mut guard = self.inner.connections.write().await;
        if let Some(key) = guard.index.remove(&connection_id) {
            let entry = guard.slab.remove(key);
            entry.alive.store(false, Ordering::Release);
        }
        guard.slab.len()
    }

    /// Forwards `message` verbatim to every registered connection except `source`.
    pub async fn broadcast(&self, source: ConnectionId, message: Message) -> BroadcastReport {
        let recipients: Vec<(ConnectionId, mpsc::Sender<Message>)> = {
            let guard = self.inner.connections.read().await;
            guard
                .slab
                .iter()
                .filter(|(_, entry)| entry.id != source && entry.alive.load(Ordering::Acquire))
                .map(|(_, entry)| (entry.id, entry.sender.clone()))
                .collect()
        };

        let bytes = message_len(&message);
        let mut report = BroadcastReport::default();
        let mut evicted = Vec::new();

        for (connection_id, sender) in recipients {
            match deliver(&sender, message.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    report.bytes += bytes;
                }
                Err(DeliveryError::Backpressure) => {
                    report.dropped += 1;
                    counter!(
                        crate::telemetry::FLOW_CONTROL_DROPS_TOTAL,
                        1,
                        "connection_id" => connection_id.to_string()
                    );
                }
                Err(DeliveryError::Closed) => {
                    report.closed += 1;
                    evicted.push(connection_id);
                }
            }
        }

        for connection_id in evicted {
            debug!(connection_id = %connection_id, "evicting closed connection");
            self.unregister(connection_id).await;
        }

        report
    }

    pub async fn len(&self) -> usize {
        self.inner.connections.read().await.slab.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, connection_id: ConnectionId) -> bool {
        self.inner
            .connections
            .read()
            .await
            .index
            .contains_key(&connection_id)
    }

    pub async fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let guard = self.inner.connections.read().await;
        guard
            .slab
            .iter()
            .map(|(_, entry)| ConnectionSnapshot {
                connection_id: entry.id,
                remote_addr: entry.remote_addr,
            })
            .collect()
    }
}

fn deliver(sender: &mpsc::Sender<Message>, message: Message) -> Result<(), DeliveryError> {
    sender.try_send(message).map_err(|err| match err {
        TrySendError::Full(_) => DeliveryError::Backpressure,
        TrySendError::Closed(_) => DeliveryError::Closed,
    })
}

pub(crate) fn message_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(bytes) => bytes.len(),
        _ => 0,
    }
}
