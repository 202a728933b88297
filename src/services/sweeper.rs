//! Sweeper — periodic liveness cleanup.
//!
//! DESIGN
//! ======
//! One background task wakes every `sweep_interval` and:
//! - purges presence records idle past `presence_stale`, broadcasting
//!   offline for each (this also clears typing flags left by crashed
//!   clients);
//! - evicts registry connections with no inbound traffic within
//!   `heartbeat_timeout`, covering transports that died without closing.
//!
//! ERROR HANDLING
//! ==============
//! A failed sweep is logged and retried on the next tick. Sweeps are
//! idempotent, so a missed or repeated tick is harmless.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::envelope::now_ms;
use crate::services::dispatch::leave_board;
use crate::state::AppState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub presence_purged: usize,
    pub connections_evicted: usize,
}

/// Spawn the sweep loop.
pub fn spawn_sweep_task(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = state.config.sweep_interval.as_millis(), "sweeper: started");
        loop {
            ticker.tick().await;
            run_sweep_at(&state, now_ms()).await;
        }
    })
}

/// One sweep pass as of `now_ms`.
pub async fn run_sweep_at(state: &AppState, now_ms: i64) -> SweepReport {
    let mut report = SweepReport::default();

    let presence_cutoff = now_ms - millis(state.config.presence_stale);
    match state.presence.sweep(presence_cutoff).await {
        Ok(purged) => report.presence_purged = purged.len(),
        Err(e) => warn!(error = %e, "sweeper: presence sweep failed"),
    }

    let idle_cutoff = now_ms - millis(state.config.heartbeat_timeout);
    let evicted = state.registry.evict_idle(idle_cutoff).await;
    for connection in &evicted {
        info!(
            board_id = %connection.board_id,
            connection_id = %connection.id,
            idle_ms = now_ms - connection.last_activity_ms(),
            "sweeper: evicted idle connection"
        );
        leave_board(state, connection).await;
    }
    report.connections_evicted = evicted.len();
    report
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[path = "sweeper_test.rs"]
mod tests;
