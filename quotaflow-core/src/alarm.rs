//! Single-timer alarm coalescing, one per shard (`spec.md` §4.6, §9).

use crate::config::{ALARM_MAX_SECS, ALARM_MIN_SECS};
use tokio::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct AlarmState {
    fires_at: Option<Instant>,
}

impl AlarmState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fires_at(&self) -> Option<Instant> {
        self.fires_at
    }

    /// `ensureAlarmIsSet`: clamp the requested delay to `[5s, 1800s]`; if no
    /// alarm is set, arm one; if one is already in the future, leave it
    /// (coalesce); a past-due alarm is replaced. `default_delay_sec` is the
    /// caller's configured fallback (`TTL_ANALYTICS`) used when no explicit
    /// `flush_time_sec` accompanies the request.
    pub fn ensure_set(&mut self, now: Instant, flush_time_sec: Option<u64>, default_delay_sec: u64) -> Instant {
        let delay = flush_time_sec.unwrap_or(default_delay_sec).clamp(ALARM_MIN_SECS, ALARM_MAX_SECS);
        let candidate = now + Duration::from_secs(delay);

        match self.fires_at {
            Some(existing) if existing > now => existing,
            _ => {
                self.fires_at = Some(candidate);
                candidate
            }
        }
    }

    pub fn clear(&mut self) {
        self.fires_at = None;
    }

    pub fn take_if_due(&mut self, now: Instant) -> bool {
        match self.fires_at {
            Some(at) if at <= now => {
                self.fires_at = None;
                true
            }
            _ => false,
        }
    }
}
