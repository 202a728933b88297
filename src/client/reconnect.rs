//! Client reconnection state machine.
//!
//! DESIGN
//! ======
//! A pure state machine: the transport reports events (`start`,
//! `connected`, `connect_failed`, `disconnected`, `delay_elapsed`) and the
//! machine answers with the next `Step` to perform. It owns no sockets or
//! timers, so any transport can drive it and tests need no network.
//!
//! ```text
//! Idle → Connecting{0} → Connected ─drop→ Reconnecting{1} → Connecting{1} → …
//!                                                    └─ past max_attempts → Failed
//! ```
//!
//! A successful connect resets the attempt counter and asks for a presence
//! re-announcement before any other traffic. `Failed` is terminal until
//! `reset`.

use std::fmt;
use std::time::Duration;

use rand::Rng;

use crate::client::ClientError;

pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_JITTER: f64 = 0.2;

// =============================================================================
// POLICY
// =============================================================================

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed retries before giving up.
    pub max_attempts: u32,
    /// Fractional spread applied to each delay, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay before retry `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// `delay_for(attempt)` spread by up to `±jitter`, still capped at `max_delay`.
    pub fn jittered_delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let delay = self.delay_for(attempt);
        if !self.jitter.is_finite() || self.jitter <= 0.0 {
            return delay;
        }
        let jitter = self.jitter.min(1.0);
        let factor = 1.0 + rng.random_range(-jitter..=jitter);
        delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Parse a jitter fraction, accepting only finite values in `[0, 1]`.
///
/// # Errors
///
/// Returns a message unless `raw` is a finite number in `[0, 1]`.
pub fn parse_jitter(raw: &str) -> Result<f64, String> {
    let jitter: f64 = raw.trim().parse().map_err(|e| format!("invalid jitter {raw:?}: {e}"))?;
    if !jitter.is_finite() || !(0.0..=1.0).contains(&jitter) {
        return Err(format!("jitter must be between 0 and 1, got {raw}"));
    }
    Ok(jitter)
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    /// `attempt` is 0 for the first connect, otherwise the retry number.
    Connecting { attempt: u32 },
    Connected,
    /// Waiting out the backoff before retry `attempt`.
    Reconnecting { attempt: u32 },
    /// Gave up after `attempts` failed retries.
    Failed { attempts: u32 },
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting { .. } => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the transport should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Open the connection.
    Connect,
    /// Send `user_presence` online, then resume normal traffic.
    AnnouncePresence,
    /// Sleep, then report `delay_elapsed`.
    Wait(Duration),
    /// Surface a persistent connection error.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    state: ConnectionState,
}

impl Reconnector {
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, state: ConnectionState::Idle }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Begin the first connect.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the machine is idle.
    pub fn start(&mut self) -> Result<Step, ClientError> {
        match self.state {
            ConnectionState::Idle => {
                self.state = ConnectionState::Connecting { attempt: 0 };
                Ok(Step::Connect)
            }
            from => Err(invalid(from, "start")),
        }
    }

    /// The transport is open. Resets the attempt counter.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless a connect was in flight.
    pub fn connected(&mut self) -> Result<Step, ClientError> {
        match self.state {
            ConnectionState::Connecting { .. } => {
                self.state = ConnectionState::Connected;
                Ok(Step::AnnouncePresence)
            }
            from => Err(invalid(from, "connected")),
        }
    }

    /// A connect attempt failed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless a connect was in flight.
    pub fn connect_failed(&mut self, rng: &mut impl Rng) -> Result<Step, ClientError> {
        match self.state {
            ConnectionState::Connecting { attempt } => Ok(self.schedule_retry(attempt + 1, rng)),
            from => Err(invalid(from, "connect_failed")),
        }
    }

    /// An established connection dropped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the machine was connected.
    pub fn disconnected(&mut self, rng: &mut impl Rng) -> Result<Step, ClientError> {
        match self.state {
            ConnectionState::Connected => Ok(self.schedule_retry(1, rng)),
            from => Err(invalid(from, "disconnected")),
        }
    }

    /// The backoff delay is over.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless a retry was pending.
    pub fn delay_elapsed(&mut self) -> Result<Step, ClientError> {
        match self.state {
            ConnectionState::Reconnecting { attempt } => {
                self.state = ConnectionState::Connecting { attempt };
                Ok(Step::Connect)
            }
            from => Err(invalid(from, "delay_elapsed")),
        }
    }

    /// Back to `Idle` from any state, clearing the attempt counter.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Idle;
    }

    fn schedule_retry(&mut self, attempt: u32, rng: &mut impl Rng) -> Step {
        if attempt > self.policy.max_attempts {
            self.state = ConnectionState::Failed { attempts: attempt - 1 };
            return Step::GiveUp;
        }
        self.state = ConnectionState::Reconnecting { attempt };
        Step::Wait(self.policy.jittered_delay(attempt, rng))
    }
}

fn invalid(from: ConnectionState, event: &'static str) -> ClientError {
    ClientError::InvalidTransition { from: from.as_str(), event }
}

#[cfg(test)]
#[path = "reconnect_test.rs"]
mod tests;
