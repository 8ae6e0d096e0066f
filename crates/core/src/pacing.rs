// crates/core/src/pacing.rs
//! Request pacing and retry backoff for calls into the racing API.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Spaces calls evenly to stay inside a requests-per-second budget.
///
/// Slots are handed out under a lock, so concurrent callers queue up rather
/// than bursting.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Option<Duration>,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    /// `None` (or a non-positive rate) disables pacing.
    pub fn new(requests_per_second: Option<f64>) -> Self {
        let interval = requests_per_second
            .filter(|rps| *rps > 0.0 && rps.is_finite())
            .map(|rps| Duration::from_secs_f64(1.0 / rps));
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Wait for the next free slot.
    pub async fn acquire(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(t) if t > now => t,
                _ => now,
            };
            *next = Some(slot + interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based). A server-supplied
    /// `retry_after` hint is honoured when it is longer.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let computed = self.base.saturating_mul(1u32 << exp).min(self.max);
        match retry_after {
            Some(hint) if hint > computed => hint.min(self.max),
            _ => computed,
        }
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}
