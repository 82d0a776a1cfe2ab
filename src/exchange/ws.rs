use std::time::Duration;

use rand::Rng;

/// Reconnect backoff starts at 1 s and doubles to a 30 s cap.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// A socket with no inbound frame for this long is considered dead and is
/// proactively reconnected, regardless of TCP state.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How often a live session checks its idle watchdog.
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Held funding frames wait this long for a mark price before being
/// released markless.
pub const MARK_HOLD_MS: i64 = 2_000;

/// How one WebSocket session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown was requested; do not reconnect.
    Cancelled,
    /// The connection dropped or stalled. `delivered_frames` resets the
    /// backoff counter: a session that produced data was healthy.
    Disconnected { delivered_frames: bool },
}

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn ws_default() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_CAP)
    }

    /// Delay before reconnect `attempt` (0-based): uniform over
    /// `0..=min(cap, base * 2^attempt)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = self.ceiling(attempt).as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(0..=ceiling_ms))
    }

    /// Upper bound of the delay for `attempt`, without jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        self.base
            .checked_mul(2u32.saturating_pow(attempt.min(16)))
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_until_cap() {
        let policy = BackoffPolicy::ws_default();
        assert_eq!(policy.ceiling(0), Duration::from_secs(1));
        assert_eq!(policy.ceiling(1), Duration::from_secs(2));
        assert_eq!(policy.ceiling(4), Duration::from_secs(16));
        assert_eq!(policy.ceiling(5), Duration::from_secs(30));
        assert_eq!(policy.ceiling(30), Duration::from_secs(30));
    }

    #[test]
    fn delay_is_jittered_within_ceiling() {
        let policy = BackoffPolicy::ws_default();
        for attempt in 0..8 {
            for _ in 0..32 {
                assert!(policy.delay(attempt) <= policy.ceiling(attempt));
            }
        }
    }
}
