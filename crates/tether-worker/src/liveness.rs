/// Bounded polling for state transitions.
///
/// Used for the session handshake (probe until the manager answers) and
/// for `await_live` / `await_idle` on the runtime handle. A deliberate close
/// cancels every poll in flight through the shared token.
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;

/// Interval between handshake probes.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(300);

/// Probes sent before the handshake is declared failed.
pub const PROBE_ATTEMPTS: u32 = 1000;

/// Shortest period any poll or timer runs at; zero is raised to this.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Polling cadence and budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: PROBE_INTERVAL,
            max_attempts: PROBE_ATTEMPTS,
        }
    }
}

impl PollConfig {
    /// `interval` is raised to [`MIN_INTERVAL`] if shorter.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            max_attempts,
        }
    }

    /// Poll at `interval` for roughly `budget` (at least one attempt).
    pub fn for_budget(interval: Duration, budget: Duration) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let attempts = budget.as_millis().div_ceil(interval.as_millis()).max(1);
        Self {
            interval,
            max_attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        }
    }

    /// Worst-case wall time for one poll.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

/// Check `ready` every `interval`, up to `max_attempts` times.
///
/// `on_miss` runs after each failed check with the 1-based attempt number
/// (the handshake uses it to send the next probe). Returns the attempt on
/// which `ready` held, `Timeout` when the budget runs out, or `Cancelled`
/// as soon as `cancel` fires.
pub async fn poll_until<R, M>(
    config: PollConfig,
    cancel: &CancellationToken,
    what: &str,
    mut ready: R,
    mut on_miss: M,
) -> Result<u32, WorkerError>
where
    R: FnMut() -> bool,
    M: FnMut(u32),
{
    let mut ticker = ticker(config.interval);

    for attempt in 1..=config.max_attempts {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            _ = ticker.tick() => {}
        }
        if ready() {
            return Ok(attempt);
        }
        on_miss(attempt);
    }

    tracing::debug!(what, attempts = config.max_attempts, "poll budget exhausted");
    Err(WorkerError::timeout(what))
}

/// Interval timer that delays missed ticks. Periods below
/// [`MIN_INTERVAL`] are raised to it.
pub(crate) fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period.max(MIN_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}
