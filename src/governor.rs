//! Politeness controls: a global token bucket on probe starts and a paced
//! pause between port sweeps. The two are independent of the worker count.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Token bucket shared by every worker.
#[derive(Debug)]
pub struct RateGovernor {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl RateGovernor {
    /// `rate_per_sec` probes per second on average, at most `burst` back to back.
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_sec: f64::from(rate_per_sec.max(1)),
            burst,
            state: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        // The lock is held across the sleep: waiters are served one at a time.
        let mut bucket = self.state.lock().await;
        let now = Instant::now();
        let refill = now.duration_since(bucket.last).as_secs_f64() * self.rate_per_sec;
        bucket.tokens = (bucket.tokens + refill).min(self.burst);
        bucket.last = now;

        if bucket.tokens < 1.0 {
            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate_per_sec);
            time::sleep(wait).await;
            bucket.tokens = 1.0;
            bucket.last = Instant::now();
        }
        bucket.tokens -= 1.0;
    }
}

/// Fixed delay plus uniform jitter, inserted after each port sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacer {
    pub delay: Duration,
    pub jitter: Duration,
}

impl Pacer {
    pub fn new(delay: Duration, jitter: Duration) -> Self {
        Self { delay, jitter }
    }

    /// Next pause, in `delay..=delay + jitter`.
    pub fn next_pause<R: Rng>(&self, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rng.gen_range(0..=jitter_ms)
        };
        self.delay + Duration::from_millis(extra)
    }

    /// Sleep for `pause` unless cancelled first. Returns `false` on cancellation.
    pub async fn pause(pause: Duration, cancel: &CancellationToken) -> bool {
        if pause.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = time::sleep(pause) => true,
        }
    }
}
