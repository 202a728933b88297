//! Dispatch — routes inbound envelopes and owns per-board ordering.
//!
//! DESIGN
//! ======
//! Inbound text is parsed and validated first; nothing malformed reaches a
//! handler and nothing rejected is ever broadcast. Task mutations then take
//! the board hub's sequencer lock and hold it across apply, sequence-number
//! assignment and fan-out, so every subscriber sees a board's mutations in
//! the order they were accepted. Boards never share a sequencer.
//!
//! Presence traffic skips the sequencer: cursor and typing updates are
//! best-effort and may interleave freely with task mutations.
//!
//! All traffic to a connection, including replies to its own requests, goes
//! through its outbound queue so it is written in one order.
//!
//! ERROR HANDLING
//! ==============
//! Every rejection becomes an `error` envelope sent to the originator only,
//! carrying `code`, `message`, `retryable`, `request_type` and, for
//! conflicts, the `current` task.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::{Data, Envelope, EnvelopeError, EnvelopeType, ErrorCode};
use crate::services::presence::{PresenceEvent, STATUS_OFFLINE, STATUS_ONLINE};
use crate::services::registry::{BoardHub, Connection, OutboundSender};
use crate::services::render::fragments_for;
use crate::services::task::{MoveOutcome, Mutation, TaskError, TaskOp, TaskUpdate};
use crate::state::AppState;
use crate::store::{PresenceRecord, Task};

// =============================================================================
// TYPES
// =============================================================================

/// What happened to one inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A task mutation was applied and broadcast with this sequence number.
    Applied { op: TaskOp, seq: u64 },
    /// A move that would not change anything.
    Unchanged,
    Presence,
    Snapshot,
    /// An error envelope went back to the sender.
    Rejected { code: &'static str },
    /// The connection is no longer registered; nothing was done.
    Detached,
}

/// Parsed task request. Built before the sequencer is taken.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskCommand {
    Move { task_id: Uuid, version: i64, column_id: Uuid, position: i64 },
    Create { column_id: Uuid, title: String, description: Option<String>, position: Option<i64> },
    Update { task_id: Uuid, version: i64, update: TaskUpdate },
    Delete { task_id: Uuid, version: i64 },
}

impl TaskCommand {
    fn from_envelope(envelope: &Envelope) -> Result<Self, EnvelopeError> {
        match envelope.kind {
            EnvelopeType::TaskMove => Ok(Self::Move {
                task_id: envelope.require_uuid("task_id")?,
                version: envelope.require_i64("version")?,
                column_id: envelope.require_uuid("column_id")?,
                position: envelope.require_i64("position")?,
            }),
            EnvelopeType::TaskCreate => Ok(Self::Create {
                column_id: envelope.require_uuid("column_id")?,
                title: envelope.require_str("title")?.to_owned(),
                description: envelope.optional_str("description")?.map(str::to_owned),
                position: envelope.optional_i64("position")?,
            }),
            EnvelopeType::TaskUpdate => Ok(Self::Update {
                task_id: envelope.require_uuid("task_id")?,
                version: envelope.require_i64("version")?,
                update: parse_update(envelope)?,
            }),
            EnvelopeType::TaskDelete => Ok(Self::Delete {
                task_id: envelope.require_uuid("task_id")?,
                version: envelope.require_i64("version")?,
            }),
            kind => Err(EnvelopeError::ServerOnly { kind }),
        }
    }
}

fn parse_update(envelope: &Envelope) -> Result<TaskUpdate, EnvelopeError> {
    let invalid = || EnvelopeError::InvalidField { kind: envelope.kind, field: "action" };
    let action = envelope.require_str("action")?;
    match action {
        "edit" => {
            let description = match envelope.data.get("description") {
                None => None,
                Some(Value::Null) => Some(None),
                Some(_) => Some(envelope.optional_str("description")?.map(str::to_owned)),
            };
            Ok(TaskUpdate::Edit { title: envelope.optional_str("title")?.map(str::to_owned), description })
        }
        "assign" | "unassign" => {
            let assignee = match envelope.optional_uuid("user_id")? {
                Some(id) => id,
                None => envelope.user_id.ok_or_else(invalid)?,
            };
            if action == "assign" {
                Ok(TaskUpdate::Assign(assignee))
            } else {
                Ok(TaskUpdate::Unassign(assignee))
            }
        }
        "complete" => Ok(TaskUpdate::Complete),
        "reopen" => Ok(TaskUpdate::Reopen),
        _ => Err(invalid()),
    }
}

/// Board state at one point in the board's mutation order.
#[derive(Debug, Clone, Serialize)]
pub struct BoardSnapshot {
    pub board_id: Uuid,
    pub seq: u64,
    pub tasks: Vec<Task>,
    pub presence: Vec<PresenceRecord>,
}

// =============================================================================
// SESSION LIFECYCLE
// =============================================================================

/// Register `connection`, announce its user online and, when configured,
/// push a `board_snapshot`. Returns `false` if it was already registered.
pub async fn join_board(state: &AppState, connection: Arc<Connection>, outbound: OutboundSender) -> bool {
    if !state.registry.join(connection.clone(), outbound).await {
        return false;
    }

    if let Err(e) = state
        .presence
        .update_presence(&connection, PresenceEvent::Online { focused_element: None })
        .await
    {
        warn!(board_id = %connection.board_id, user_id = %connection.user_id, error = %e, "dispatch: online announce failed");
        let reply = Envelope::error_for(connection.board_id, Some(EnvelopeType::UserPresence), &e);
        state.registry.send_to(connection.id, reply).await;
    }

    if state.config.snapshot_on_join {
        send_snapshot(state, &connection).await;
    }
    true
}

/// Deregister `connection`. The user goes offline once their last
/// connection to the board is gone. Safe to call repeatedly.
pub async fn leave_board(state: &AppState, connection: &Connection) {
    state.registry.leave(connection.id).await;
    if state
        .registry
        .user_connection_count(connection.board_id, connection.user_id)
        .await
        > 0
    {
        return;
    }
    if let Err(e) = state
        .presence
        .remove_presence(connection.board_id, connection.user_id)
        .await
    {
        warn!(board_id = %connection.board_id, user_id = %connection.user_id, error = %e, "dispatch: offline cleanup failed; sweep will retry");
    }
}

// =============================================================================
// INBOUND
// =============================================================================

/// Handle one inbound text frame from `connection`.
pub async fn dispatch_text(state: &AppState, connection: &Connection, text: &str) -> Outcome {
    refresh_activity(state, connection).await;

    match Envelope::parse_inbound(text, connection.board_id, connection.user_id) {
        Ok(envelope) => dispatch(state, connection, envelope).await,
        Err(e) => {
            debug!(connection_id = %connection.id, error = %e, "dispatch: rejected inbound frame");
            reject(state, connection, Envelope::error_for(connection.board_id, None, &e), e.error_code()).await
        }
    }
}

/// Refresh liveness for any inbound traffic, including pongs.
pub async fn refresh_activity(state: &AppState, connection: &Connection) {
    connection.touch();
    if let Err(e) = state.presence.touch(connection).await {
        debug!(connection_id = %connection.id, error = %e, "dispatch: presence touch failed");
    }
}

/// Route a validated envelope.
pub async fn dispatch(state: &AppState, connection: &Connection, envelope: Envelope) -> Outcome {
    match envelope.kind {
        kind if kind.is_task_mutation() => match TaskCommand::from_envelope(&envelope) {
            Ok(command) => apply_task_command(state, connection, &envelope, command).await,
            Err(e) => reject(state, connection, envelope.error_from(&e), e.error_code()).await,
        },
        EnvelopeType::UserPresence => handle_user_presence(state, connection, &envelope).await,
        EnvelopeType::CursorMove => {
            let event = match (envelope.require_f64("x"), envelope.require_f64("y")) {
                (Ok(x), Ok(y)) => PresenceEvent::Cursor { x, y },
                (Err(e), _) | (_, Err(e)) => {
                    return reject(state, connection, envelope.error_from(&e), e.error_code()).await;
                }
            };
            presence_update(state, connection, &envelope, event).await
        }
        EnvelopeType::Typing => {
            let event = match (envelope.require_bool("is_typing"), envelope.optional_str("focused_element")) {
                (Ok(is_typing), Ok(focused)) => {
                    PresenceEvent::Typing { is_typing, focused_element: focused.map(str::to_owned) }
                }
                (Err(e), _) | (_, Err(e)) => {
                    return reject(state, connection, envelope.error_from(&e), e.error_code()).await;
                }
            };
            presence_update(state, connection, &envelope, event).await
        }
        EnvelopeType::BoardSnapshot => send_snapshot(state, connection).await,
        kind => {
            let e = EnvelopeError::ServerOnly { kind };
            reject(state, connection, envelope.error_from(&e), e.error_code()).await
        }
    }
}

async fn reject(state: &AppState, connection: &Connection, reply: Envelope, code: &'static str) -> Outcome {
    state.registry.send_to(connection.id, reply).await;
    Outcome::Rejected { code }
}

// =============================================================================
// TASK MUTATIONS
// =============================================================================

async fn apply_task_command(
    state: &AppState,
    connection: &Connection,
    request: &Envelope,
    command: TaskCommand,
) -> Outcome {
    let board_id = connection.board_id;
    let Some(hub) = state.registry.hub(board_id).await else {
        return Outcome::Detached;
    };
    let outcome = apply_sequenced(state, &hub, connection, request, command).await;
    state.registry.release(board_id, hub).await;
    outcome
}

async fn apply_sequenced(
    state: &AppState,
    hub: &BoardHub,
    connection: &Connection,
    request: &Envelope,
    command: TaskCommand,
) -> Outcome {
    let board_id = connection.board_id;
    let mut seq = hub.sequencer.lock().await;
    // Checked under the sequencer: an eviction may land while waiting for it.
    if !state.registry.contains(connection.id).await {
        debug!(%board_id, connection_id = %connection.id, "dispatch: dropped mutation from detached connection");
        return Outcome::Detached;
    }

    let result = match command {
        TaskCommand::Move { task_id, version, column_id, position } => state
            .tasks
            .move_task(board_id, task_id, Some(version), column_id, position)
            .await
            .map(|outcome| match outcome {
                MoveOutcome::Moved(mutation) => Some(mutation),
                MoveOutcome::Unchanged(_) => None,
            }),
        TaskCommand::Create { column_id, title, description, position } => state
            .tasks
            .create_task(board_id, column_id, &title, description, position, Some(connection.user_id))
            .await
            .map(Some),
        TaskCommand::Update { task_id, version, update } => {
            state.tasks.update_task(board_id, task_id, Some(version), update).await.map(Some)
        }
        TaskCommand::Delete { task_id, version } => {
            state.tasks.delete_task(board_id, task_id, Some(version)).await.map(Some)
        }
    };

    let mutation = match result {
        Ok(Some(mutation)) => mutation,
        Ok(None) => return Outcome::Unchanged,
        Err(e) => return reject_task(state, connection, request, &e).await,
    };

    *seq += 1;
    let envelope = mutation_envelope(board_id, connection.user_id, &mutation, *seq);
    state.registry.send_to(connection.id, envelope.clone()).await;
    let report = state.registry.broadcast(board_id, &envelope, Some(connection.id)).await;

    if let Some(renderer) = &state.renderer {
        let siblings = renumbered_siblings(state, &mutation).await;
        for fragment in fragments_for(renderer.as_ref(), board_id, &mutation, &siblings) {
            state.registry.broadcast(board_id, &fragment, None).await;
        }
    }

    info!(
        %board_id,
        connection_id = %connection.id,
        op = mutation.op.as_str(),
        seq = *seq,
        delivered = report.delivered,
        "dispatch: task mutation applied"
    );
    Outcome::Applied { op: mutation.op, seq: *seq }
}

/// Current state of every other task `mutation` renumbered, in column order.
async fn renumbered_siblings(state: &AppState, mutation: &Mutation) -> Vec<Task> {
    if mutation.positions.is_empty() {
        return Vec::new();
    }
    let tasks = match state.tasks.board_tasks(mutation.task.board_id).await {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!(board_id = %mutation.task.board_id, error = %e, "dispatch: sibling reload for fragments failed");
            return Vec::new();
        }
    };
    let mut by_id: HashMap<Uuid, Task> = tasks.into_iter().map(|t| (t.id, t)).collect();
    mutation
        .positions
        .iter()
        .flat_map(|p| p.task_ids.iter())
        .filter(|id| **id != mutation.task.id)
        .filter_map(|id| by_id.remove(id))
        .collect()
}

async fn reject_task(state: &AppState, connection: &Connection, request: &Envelope, err: &TaskError) -> Outcome {
    match err {
        TaskError::Conflict { .. } => {
            info!(board_id = %connection.board_id, connection_id = %connection.id, error = %err, "dispatch: conflict");
        }
        TaskError::Store(_) => {
            warn!(board_id = %connection.board_id, connection_id = %connection.id, error = %err, "dispatch: store failure");
        }
        _ => debug!(connection_id = %connection.id, error = %err, "dispatch: task request rejected"),
    }
    reject(state, connection, request.error_from(err), err.error_code()).await
}

/// Broadcast form of an accepted mutation.
#[must_use]
pub fn mutation_envelope(board_id: Uuid, user_id: Uuid, mutation: &Mutation, seq: u64) -> Envelope {
    let kind = match mutation.op {
        TaskOp::Moved => EnvelopeType::TaskMove,
        TaskOp::Created => EnvelopeType::TaskCreate,
        TaskOp::Deleted => EnvelopeType::TaskDelete,
        TaskOp::Updated | TaskOp::Assigned | TaskOp::Unassigned | TaskOp::Completed | TaskOp::Reopened => {
            EnvelopeType::TaskUpdate
        }
    };
    let mut data = Data::new();
    data.insert("op".into(), json!(mutation.op));
    data.insert("task".into(), json!(mutation.task));
    data.insert("seq".into(), json!(seq));
    if !mutation.positions.is_empty() {
        data.insert("positions".into(), json!(mutation.positions));
    }
    Envelope::new(kind, board_id, data).with_user(user_id)
}

// =============================================================================
// PRESENCE
// =============================================================================

async fn handle_user_presence(state: &AppState, connection: &Connection, envelope: &Envelope) -> Outcome {
    let status = match envelope.require_str("status") {
        Ok(status) => status,
        Err(e) => return reject(state, connection, envelope.error_from(&e), e.error_code()).await,
    };
    match status {
        STATUS_ONLINE => {
            let focused_element = match envelope.optional_str("focused_element") {
                Ok(focused) => focused.map(str::to_owned),
                Err(e) => return reject(state, connection, envelope.error_from(&e), e.error_code()).await,
            };
            presence_update(state, connection, envelope, PresenceEvent::Online { focused_element }).await
        }
        STATUS_OFFLINE => {
            // Other tabs keep the user online.
            let tabs = state
                .registry
                .user_connection_count(connection.board_id, connection.user_id)
                .await;
            if tabs > 1 {
                return Outcome::Presence;
            }
            match state.presence.remove_presence(connection.board_id, connection.user_id).await {
                Ok(_) => Outcome::Presence,
                Err(e) => reject(state, connection, envelope.error_from(&e), e.error_code()).await,
            }
        }
        _ => {
            let e = EnvelopeError::InvalidField { kind: envelope.kind, field: "status" };
            reject(state, connection, envelope.error_from(&e), e.error_code()).await
        }
    }
}

async fn presence_update(state: &AppState, connection: &Connection, envelope: &Envelope, event: PresenceEvent) -> Outcome {
    match state.presence.update_presence(connection, event).await {
        Ok(_) => Outcome::Presence,
        Err(e) => reject(state, connection, envelope.error_from(&e), e.error_code()).await,
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Read a board's tasks and presence between two mutations.
///
/// # Errors
///
/// Returns the task store's error when the board cannot be read.
pub async fn board_snapshot(state: &AppState, board_id: Uuid) -> Result<BoardSnapshot, TaskError> {
    let Some(hub) = state.registry.hub(board_id).await else {
        return read_snapshot(state, board_id, 0).await;
    };
    let snapshot = {
        let seq = hub.sequencer.lock().await;
        read_snapshot(state, board_id, *seq).await
    };
    state.registry.release(board_id, hub).await;
    snapshot
}

async fn read_snapshot(state: &AppState, board_id: Uuid, seq: u64) -> Result<BoardSnapshot, TaskError> {
    let tasks = state.tasks.board_tasks(board_id).await?;
    let presence = state.presence.list_by_board(board_id).await;
    Ok(BoardSnapshot { board_id, seq, tasks, presence })
}

async fn send_snapshot(state: &AppState, connection: &Connection) -> Outcome {
    match board_snapshot(state, connection.board_id).await {
        Ok(snapshot) => {
            let mut data = Data::new();
            data.insert("connection_id".into(), json!(connection.id));
            data.insert("tasks".into(), json!(snapshot.tasks));
            data.insert("presence".into(), json!(snapshot.presence));
            data.insert("seq".into(), json!(snapshot.seq));
            let envelope = Envelope::new(EnvelopeType::BoardSnapshot, connection.board_id, data);
            state.registry.send_to(connection.id, envelope).await;
            Outcome::Snapshot
        }
        Err(e) => {
            warn!(board_id = %connection.board_id, error = %e, "dispatch: snapshot failed");
            let reply = Envelope::error_for(connection.board_id, Some(EnvelopeType::BoardSnapshot), &e);
            reject(state, connection, reply, e.error_code()).await
        }
    }
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;
