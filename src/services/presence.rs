//! Presence tracker — who is online, where their cursor is, who is typing.
//!
//! DESIGN
//! ======
//! Each board keeps an in-process map of `user_id → PresenceRecord` behind
//! its own lock, created lazily and reaped once empty and unheld. Every
//! change is written through to the `PresenceStore` first and only then
//! applied in memory and broadcast, so a store failure never produces a
//! broadcast.
//!
//! Heartbeat touches reach the store at most once per write interval,
//! measured from the last write rather than the last touch.
//!
//! Typing state rides on `last_seen_ms`: a client that crashes mid-typing is
//! cleared by the same staleness sweep that takes it offline.
//!
//! CONCURRENCY
//! ===========
//! Sweep and update race on the same key by timestamp. The store only
//! purges rows still older than the cutoff, and the sweep decides each key
//! under its board lock: a record refreshed after the purge is written back
//! and never announced offline.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::{Data, Envelope, EnvelopeType, ErrorCode, now_ms};
use crate::services::registry::{Connection, Registry};
use crate::store::{Cursor, PresenceKey, PresenceRecord, PresenceStore, StoreError};

/// Heartbeat refreshes reach the store at most this often per user and board.
const TOUCH_WRITE_INTERVAL_MS: i64 = 5_000;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("cursor coordinates must be finite")]
    InvalidCursor,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for PresenceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidCursor => "E_VALIDATION",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::InvalidCursor => false,
            Self::Store(e) => e.retryable(),
        }
    }
}

/// A presence-relevant client event.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Online { focused_element: Option<String> },
    Cursor { x: f64, y: f64 },
    Typing { is_typing: bool, focused_element: Option<String> },
}

/// A live record and the `last_seen_ms` its store row was last written with.
#[derive(Debug, Clone)]
struct Tracked {
    record: PresenceRecord,
    written_ms: i64,
}

type BoardPresence = Arc<Mutex<HashMap<Uuid, Tracked>>>;

enum SweepAction {
    Keep,
    Purge { display_name: String },
}

#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    registry: Registry,
    boards: Arc<RwLock<HashMap<Uuid, BoardPresence>>>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(store: Arc<dyn PresenceStore>, registry: Registry) -> Self {
        Self { store, registry, boards: Arc::default() }
    }

    /// Upsert `origin`'s record for `event` and broadcast the matching
    /// envelope to the rest of the board.
    ///
    /// # Errors
    ///
    /// `InvalidCursor` for non-finite coordinates; `Store` when the write
    /// fails, in which case nothing is broadcast.
    pub async fn update_presence(&self, origin: &Connection, event: PresenceEvent) -> Result<PresenceRecord, PresenceError> {
        self.update_presence_at(origin, event, now_ms()).await
    }

    /// `update_presence` with an explicit event time.
    ///
    /// # Errors
    ///
    /// See [`Self::update_presence`].
    pub async fn update_presence_at(
        &self,
        origin: &Connection,
        event: PresenceEvent,
        at_ms: i64,
    ) -> Result<PresenceRecord, PresenceError> {
        if let PresenceEvent::Cursor { x, y } = event
            && !(x.is_finite() && y.is_finite())
        {
            return Err(PresenceError::InvalidCursor);
        }

        let board = self.board(origin.board_id).await;
        let written = {
            let mut records = board.lock().await;
            let mut record = records
                .get(&origin.user_id)
                .map(|t| t.record.clone())
                .unwrap_or_else(|| PresenceRecord {
                    user_id: origin.user_id,
                    board_id: origin.board_id,
                    display_name: origin.display_name.clone(),
                    last_seen_ms: at_ms,
                    cursor: None,
                    focused_element: None,
                    is_typing: false,
                });
            record.display_name.clone_from(&origin.display_name);
            record.last_seen_ms = record.last_seen_ms.max(at_ms);
            match &event {
                PresenceEvent::Online { focused_element } => {
                    if focused_element.is_some() {
                        record.focused_element.clone_from(focused_element);
                    }
                }
                PresenceEvent::Cursor { x, y } => record.cursor = Some(Cursor { x: *x, y: *y }),
                PresenceEvent::Typing { is_typing, focused_element } => {
                    record.is_typing = *is_typing;
                    if focused_element.is_some() {
                        record.focused_element.clone_from(focused_element);
                    }
                }
            }

            self.store.upsert(&record).await.map(|()| {
                let written_ms = record.last_seen_ms;
                records.insert(origin.user_id, Tracked { record: record.clone(), written_ms });
                record
            })
        };
        self.release(origin.board_id, board).await;
        let record = written?;

        let envelope = presence_envelope(&record, &event);
        if matches!(event, PresenceEvent::Online { .. }) {
            info!(board_id = %origin.board_id, user_id = %origin.user_id, "presence: online");
        } else {
            debug!(board_id = %origin.board_id, user_id = %origin.user_id, kind = %envelope.kind, "presence: update");
        }
        self.registry.broadcast(origin.board_id, &envelope, Some(origin.id)).await;
        Ok(record)
    }

    /// Refresh `origin`'s last-seen time without broadcasting. Store writes
    /// are throttled; the in-memory view is always refreshed.
    ///
    /// # Errors
    ///
    /// Returns `Store` when a due write fails.
    pub async fn touch(&self, origin: &Connection) -> Result<(), PresenceError> {
        self.touch_at(origin, now_ms()).await
    }

    /// # Errors
    ///
    /// See [`Self::touch`].
    pub async fn touch_at(&self, origin: &Connection, at_ms: i64) -> Result<(), PresenceError> {
        let Some(board) = self.existing_board(origin.board_id).await else {
            return Ok(());
        };
        let result = {
            let mut records = board.lock().await;
            match records.get_mut(&origin.user_id) {
                Some(tracked) => {
                    tracked.record.last_seen_ms = tracked.record.last_seen_ms.max(at_ms);
                    if tracked.record.last_seen_ms - tracked.written_ms >= TOUCH_WRITE_INTERVAL_MS {
                        self.store.upsert(&tracked.record).await.map(|()| {
                            tracked.written_ms = tracked.record.last_seen_ms;
                        })
                    } else {
                        Ok(())
                    }
                }
                None => Ok(()),
            }
        };
        self.release(origin.board_id, board).await;
        Ok(result?)
    }

    /// Explicit leave: delete the record and tell the board the user went
    /// offline. Returns whether a record existed.
    ///
    /// # Errors
    ///
    /// Returns `Store` when the delete fails; nothing is broadcast then.
    pub async fn remove_presence(&self, board_id: Uuid, user_id: Uuid) -> Result<bool, PresenceError> {
        let existed_in_store = self.store.delete(user_id, board_id).await?;
        let removed = self.forget(board_id, user_id).await;
        let existed = existed_in_store || removed.is_some();
        if existed {
            let display_name = removed.map(|r| r.display_name).unwrap_or_default();
            info!(%board_id, %user_id, "presence: offline");
            self.broadcast_offline(board_id, user_id, &display_name).await;
        }
        Ok(existed)
    }

    /// Purge every record last seen before `cutoff_ms` and broadcast offline
    /// for each. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `Store` when the bulk delete fails; the in-memory view is left
    /// untouched.
    pub async fn sweep(&self, cutoff_ms: i64) -> Result<Vec<PresenceKey>, PresenceError> {
        let mut keys = self.store.delete_older_than(cutoff_ms).await?;
        keys.extend(self.stale_in_memory(cutoff_ms).await);
        keys.sort();
        keys.dedup();

        let mut purged = Vec::with_capacity(keys.len());
        for key in keys {
            if let SweepAction::Purge { display_name } = self.sweep_one(key, cutoff_ms).await {
                self.broadcast_offline(key.board_id, key.user_id, &display_name).await;
                purged.push(key);
            }
        }

        if !purged.is_empty() {
            info!(purged = purged.len(), cutoff_ms, "presence: swept stale records");
        }
        Ok(purged)
    }

    /// Current presence view of a board.
    pub async fn list_by_board(&self, board_id: Uuid) -> Vec<PresenceRecord> {
        let Some(board) = self.existing_board(board_id).await else {
            return Vec::new();
        };
        let mut list: Vec<PresenceRecord> = board.lock().await.values().map(|t| t.record.clone()).collect();
        self.release(board_id, board).await;
        list.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.user_id.cmp(&b.user_id)));
        list
    }

    /// Durable presence rows, for callers without a live board view.
    ///
    /// # Errors
    ///
    /// Returns `Store` when the read fails.
    pub async fn list_stored(&self, board_id: Uuid) -> Result<Vec<PresenceRecord>, PresenceError> {
        Ok(self.store.list_by_board(board_id).await?)
    }

    // -------------------------------------------------------------------------

    async fn board(&self, board_id: Uuid) -> BoardPresence {
        if let Some(board) = self.existing_board(board_id).await {
            return board;
        }
        self.boards.write().await.entry(board_id).or_default().clone()
    }

    async fn existing_board(&self, board_id: Uuid) -> Option<BoardPresence> {
        self.boards.read().await.get(&board_id).cloned()
    }

    async fn stale_in_memory(&self, cutoff_ms: i64) -> Vec<PresenceKey> {
        let boards: Vec<BoardPresence> = self.boards.read().await.values().cloned().collect();
        let mut stale = Vec::new();
        for board in boards {
            let records = board.lock().await;
            stale.extend(
                records
                    .values()
                    .filter(|t| t.record.last_seen_ms < cutoff_ms)
                    .map(|t| t.record.key()),
            );
        }
        stale
    }

    async fn forget(&self, board_id: Uuid, user_id: Uuid) -> Option<PresenceRecord> {
        let board = self.existing_board(board_id).await?;
        let removed = board.lock().await.remove(&user_id).map(|t| t.record);
        self.release(board_id, board).await;
        removed
    }

    /// Decide one swept key under its board lock. A record refreshed since
    /// `cutoff_ms` is kept and its row, already purged from the store, is
    /// written back.
    async fn sweep_one(&self, key: PresenceKey, cutoff_ms: i64) -> SweepAction {
        let Some(board) = self.existing_board(key.board_id).await else {
            return SweepAction::Purge { display_name: String::new() };
        };
        let action = {
            let mut records = board.lock().await;
            let fresh = records.get(&key.user_id).map(|t| t.record.last_seen_ms >= cutoff_ms);
            match fresh {
                Some(true) => {
                    if let Some(tracked) = records.get_mut(&key.user_id) {
                        match self.store.upsert(&tracked.record).await {
                            Ok(()) => tracked.written_ms = tracked.record.last_seen_ms,
                            Err(e) => {
                                warn!(board_id = %key.board_id, user_id = %key.user_id, error = %e, "presence: restore after sweep failed");
                            }
                        }
                    }
                    SweepAction::Keep
                }
                Some(false) => {
                    let display_name = records
                        .remove(&key.user_id)
                        .map(|t| t.record.display_name)
                        .unwrap_or_default();
                    SweepAction::Purge { display_name }
                }
                None => SweepAction::Purge { display_name: String::new() },
            }
        };
        self.release(key.board_id, board).await;
        action
    }

    /// Give back a board handle, reaping the board if it is now empty.
    async fn release(&self, board_id: Uuid, board: BoardPresence) {
        let empty = board.lock().await.is_empty();
        drop(board);
        if empty {
            self.reap_if_empty(board_id).await;
        }
    }

    /// Drop an empty board map unless someone still holds it.
    async fn reap_if_empty(&self, board_id: Uuid) {
        let mut boards = self.boards.write().await;
        let Some(board) = boards.get(&board_id) else {
            return;
        };
        if Arc::strong_count(board) > 1 {
            return;
        }
        if board.lock().await.is_empty() {
            boards.remove(&board_id);
        }
    }

    #[cfg(test)]
    pub(crate) async fn tracked_boards(&self) -> usize {
        self.boards.read().await.len()
    }

    async fn broadcast_offline(&self, board_id: Uuid, user_id: Uuid, display_name: &str) {
        let mut data = Data::new();
        data.insert("user_id".into(), json!(user_id));
        data.insert("display_name".into(), json!(display_name));
        data.insert("status".into(), json!(STATUS_OFFLINE));
        data.insert("focused_element".into(), serde_json::Value::Null);
        let envelope = Envelope::new(EnvelopeType::UserPresence, board_id, data).with_user(user_id);
        let report = self.registry.broadcast(board_id, &envelope, None).await;
        if !report.evicted.is_empty() {
            warn!(%board_id, evicted = report.evicted.len(), "presence: offline broadcast evicted lagging connections");
        }
    }
}

fn presence_envelope(record: &PresenceRecord, event: &PresenceEvent) -> Envelope {
    let mut data = Data::new();
    data.insert("user_id".into(), json!(record.user_id));
    data.insert("display_name".into(), json!(record.display_name));
    let kind = match event {
        PresenceEvent::Online { .. } => {
            data.insert("status".into(), json!(STATUS_ONLINE));
            data.insert("focused_element".into(), json!(record.focused_element));
            EnvelopeType::UserPresence
        }
        PresenceEvent::Cursor { x, y } => {
            data.insert("x".into(), json!(x));
            data.insert("y".into(), json!(y));
            EnvelopeType::CursorMove
        }
        PresenceEvent::Typing { is_typing, .. } => {
            data.insert("is_typing".into(), json!(is_typing));
            data.insert("focused_element".into(), json!(record.focused_element));
            EnvelopeType::Typing
        }
    };
    Envelope::new(kind, record.board_id, data).with_user(record.user_id)
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
