//! Connection registry — which live connections are attached to which board.
//!
//! DESIGN
//! ======
//! Each board gets its own `BoardHub`, created lazily on first join and
//! reaped when its last connection leaves. A hub owns the board's subscriber
//! set behind its own lock, so contention stays within one board, and the
//! board's mutation sequencer used by the dispatcher.
//!
//! Every connection has an independently buffered outbound queue. Broadcast
//! only ever `try_send`s: a connection whose queue is full has not drained
//! within its budget and is evicted on the spot, so one stuck client can
//! neither block nor fail delivery to the rest of the board.
//!
//! LOCK ORDER
//! ==========
//! `boards` map → hub `connections`. The connection index is never held
//! together with either.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::envelope::{Envelope, now_ms};

// =============================================================================
// CONNECTION
// =============================================================================

/// One live client session.
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub board_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub created_at_ms: i64,
    last_activity_ms: AtomicI64,
}

impl Connection {
    #[must_use]
    pub fn new(board_id: Uuid, user_id: Uuid, display_name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            board_id,
            user_id,
            display_name: display_name.into(),
            created_at_ms: now,
            last_activity_ms: AtomicI64::new(now),
        }
    }

    /// Record inbound activity now.
    pub fn touch(&self) {
        self.touch_at(now_ms());
    }

    pub fn touch_at(&self, at_ms: i64) {
        self.last_activity_ms.fetch_max(at_ms, Ordering::Relaxed);
    }

    #[must_use]
    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }
}

// =============================================================================
// OUTBOUND QUEUE
// =============================================================================

/// Registry-side half of a connection's outbound queue.
pub struct OutboundSender {
    tx: mpsc::Sender<Envelope>,
    evicted: Arc<Notify>,
}

/// Transport-side half: drain `rx` to the socket and stop when `evicted` fires
/// or the queue closes.
pub struct OutboundReceiver {
    pub rx: mpsc::Receiver<Envelope>,
    pub evicted: Arc<Notify>,
}

/// Create a bounded outbound queue.
#[must_use]
pub fn outbound_channel(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let evicted = Arc::new(Notify::new());
    (OutboundSender { tx, evicted: evicted.clone() }, OutboundReceiver { rx, evicted })
}

struct Subscriber {
    connection: Arc<Connection>,
    outbound: OutboundSender,
}

// =============================================================================
// BOARD HUB
// =============================================================================

/// Per-board subscriber set plus the dispatcher's serialization point.
#[derive(Default)]
pub struct BoardHub {
    connections: RwLock<HashMap<Uuid, Subscriber>>,
    /// Held for the whole apply + broadcast of a task mutation. Guards the
    /// board's last issued sequence number.
    pub(crate) sequencer: Mutex<u64>,
}

/// Result of one fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Connections dropped because their queue was full or closed.
    pub evicted: Vec<Uuid>,
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    boards: RwLock<HashMap<Uuid, Arc<BoardHub>>>,
    /// `connection_id` → `board_id`.
    index: RwLock<HashMap<Uuid, Uuid>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` under its board. Returns `false` when the
    /// connection id is already registered there (the call is a no-op). A
    /// connection registered under another board is moved.
    pub async fn join(&self, connection: Arc<Connection>, outbound: OutboundSender) -> bool {
        let connection_id = connection.id;
        let board_id = connection.board_id;

        let previous = self.inner.index.read().await.get(&connection_id).copied();
        match previous {
            Some(existing) if existing == board_id => return false,
            Some(_) => {
                self.leave(connection_id).await;
            }
            None => {}
        }

        {
            let mut boards = self.inner.boards.write().await;
            let hub = boards.entry(board_id).or_default();
            let mut connections = hub.connections.write().await;
            connections.insert(connection_id, Subscriber { connection, outbound });
            info!(%board_id, %connection_id, subscribers = connections.len(), "registry: connection joined");
        }
        self.inner.index.write().await.insert(connection_id, board_id);
        true
    }

    /// Remove a connection from whatever board it is attached to. Safe to
    /// call repeatedly; returns the connection only on the call that removed it.
    pub async fn leave(&self, connection_id: Uuid) -> Option<Arc<Connection>> {
        let board_id = self.inner.index.write().await.remove(&connection_id)?;
        let hub = self.hub(board_id).await?;

        let removed = {
            let mut connections = hub.connections.write().await;
            let removed = connections.remove(&connection_id);
            if removed.is_some() {
                info!(%board_id, %connection_id, remaining = connections.len(), "registry: connection left");
            }
            removed
        };
        drop(hub);
        self.reap_if_empty(board_id).await;
        removed.map(|s| s.connection)
    }

    /// Deliver `envelope` to every subscriber of `board_id` except `exclude`.
    /// Never blocks on a slow subscriber and never fails.
    pub async fn broadcast(&self, board_id: Uuid, envelope: &Envelope, exclude: Option<Uuid>) -> BroadcastReport {
        let Some(hub) = self.hub(board_id).await else {
            return BroadcastReport::default();
        };

        let mut report = BroadcastReport::default();
        {
            let connections = hub.connections.read().await;
            for (connection_id, subscriber) in connections.iter() {
                if exclude == Some(*connection_id) {
                    continue;
                }
                match subscriber.outbound.tx.try_send(envelope.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(%board_id, %connection_id, "registry: outbound queue full; evicting");
                        report.evicted.push(*connection_id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        report.evicted.push(*connection_id);
                    }
                }
            }
        }
        self.release(board_id, hub).await;

        for connection_id in &report.evicted {
            self.evict(*connection_id).await;
        }
        report
    }

    /// Deliver to a single connection, evicting it if its queue is full.
    pub async fn send_to(&self, connection_id: Uuid, envelope: Envelope) -> bool {
        let Some(board_id) = self.inner.index.read().await.get(&connection_id).copied() else {
            return false;
        };
        let Some(hub) = self.hub(board_id).await else {
            return false;
        };
        let sent = {
            let connections = hub.connections.read().await;
            connections
                .get(&connection_id)
                .is_some_and(|s| s.outbound.tx.try_send(envelope).is_ok())
        };
        self.release(board_id, hub).await;
        if !sent {
            self.evict(connection_id).await;
        }
        sent
    }

    /// Forcibly disconnect: remove from the board and signal the transport.
    pub async fn evict(&self, connection_id: Uuid) -> Option<Arc<Connection>> {
        let board_id = self.inner.index.write().await.remove(&connection_id)?;
        let hub = self.hub(board_id).await?;
        let removed = hub.connections.write().await.remove(&connection_id);
        drop(hub);
        self.reap_if_empty(board_id).await;

        let subscriber = removed?;
        subscriber.outbound.evicted.notify_one();
        info!(%board_id, %connection_id, "registry: connection evicted");
        Some(subscriber.connection)
    }

    /// Evict every connection with no inbound activity since `cutoff_ms`.
    pub async fn evict_idle(&self, cutoff_ms: i64) -> Vec<Arc<Connection>> {
        let idle: Vec<Uuid> = {
            let boards = self.inner.boards.read().await;
            let mut idle = Vec::new();
            for hub in boards.values() {
                let connections = hub.connections.read().await;
                idle.extend(
                    connections
                        .values()
                        .filter(|s| s.connection.last_activity_ms() < cutoff_ms)
                        .map(|s| s.connection.id),
                );
            }
            idle
        };

        let mut evicted = Vec::with_capacity(idle.len());
        for connection_id in idle {
            if let Some(connection) = self.evict(connection_id).await {
                evicted.push(connection);
            }
        }
        evicted
    }

    /// Current subscriber count for a board.
    pub async fn count(&self, board_id: Uuid) -> usize {
        let Some(hub) = self.hub(board_id).await else {
            return 0;
        };
        let count = hub.connections.read().await.len();
        self.release(board_id, hub).await;
        count
    }

    /// Number of live connections `user_id` holds on `board_id`.
    pub async fn user_connection_count(&self, board_id: Uuid, user_id: Uuid) -> usize {
        let Some(hub) = self.hub(board_id).await else {
            return 0;
        };
        let count = hub
            .connections
            .read()
            .await
            .values()
            .filter(|s| s.connection.user_id == user_id)
            .count();
        self.release(board_id, hub).await;
        count
    }

    /// Snapshot of a board's connections.
    pub async fn connections(&self, board_id: Uuid) -> Vec<Arc<Connection>> {
        let Some(hub) = self.hub(board_id).await else {
            return Vec::new();
        };
        let connections: Vec<Arc<Connection>> =
            hub.connections.read().await.values().map(|s| s.connection.clone()).collect();
        self.release(board_id, hub).await;
        connections
    }

    pub async fn contains(&self, connection_id: Uuid) -> bool {
        self.inner.index.read().await.contains_key(&connection_id)
    }

    /// The live hub for a board, if any connection is attached.
    pub async fn hub(&self, board_id: Uuid) -> Option<Arc<BoardHub>> {
        self.inner.boards.read().await.get(&board_id).cloned()
    }

    pub async fn active_boards(&self) -> usize {
        self.inner.boards.read().await.len()
    }

    /// Give back a handle obtained from [`Self::hub`]. A board that emptied
    /// while the handle was held is reaped here, since its last `leave`
    /// could not.
    pub async fn release(&self, board_id: Uuid, hub: Arc<BoardHub>) {
        let empty = hub.connections.read().await.is_empty();
        drop(hub);
        if empty {
            self.reap_if_empty(board_id).await;
        }
    }

    /// Drop a hub with no connections, unless an in-flight operation still
    /// holds it.
    async fn reap_if_empty(&self, board_id: Uuid) {
        let mut boards = self.inner.boards.write().await;
        let Some(hub) = boards.get(&board_id) else {
            return;
        };
        if Arc::strong_count(hub) > 1 {
            return;
        }
        if hub.connections.read().await.is_empty() {
            boards.remove(&board_id);
            info!(%board_id, "registry: reaped empty board hub");
        }
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
