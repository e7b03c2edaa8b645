//! Token bucket shared by every outbound provider call.
//!
//! A `RateLimiter` is a cheap handle: clones share one bucket. Build exactly
//! one at startup and hand clones to every client so the whole process stays
//! inside the provider budget.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

struct LimiterInner {
    interval_ms: AtomicU64,
    burst: AtomicU32,
    bucket: AsyncMutex<Bucket>,
    reconfigured: Notify,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, interval: Duration, burst: u32) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = elapsed.as_secs_f64() / interval.as_secs_f64();
        self.tokens = (self.tokens + earned).min(f64::from(burst));
        self.last_refill = now;
    }

    fn until_next_token(&self, interval: Duration) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        interval.mul_f64(missing)
    }
}

impl RateLimiter {
    /// One token every `interval`, holding at most `burst` tokens. Starts full.
    pub fn new(interval: Duration, burst: u32) -> Self {
        let burst = burst.max(1);
        Self {
            inner: Arc::new(LimiterInner {
                interval_ms: AtomicU64::new(interval_to_ms(interval)),
                burst: AtomicU32::new(burst),
                bucket: AsyncMutex::new(Bucket {
                    tokens: f64::from(burst),
                    last_refill: Instant::now(),
                }),
                reconfigured: Notify::new(),
            }),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.rate_interval(), config.rate_burst)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.inner.interval_ms.load(Ordering::SeqCst))
    }

    pub fn burst(&self) -> u32 {
        self.inner.burst.load(Ordering::SeqCst)
    }

    /// Changes pacing in place. Callers already blocked in [`wait`](Self::wait)
    /// stay queued and re-evaluate against the new limit.
    pub fn update_limit(&self, interval: Duration, burst: u32) {
        self.inner
            .interval_ms
            .store(interval_to_ms(interval), Ordering::SeqCst);
        self.inner.burst.store(burst.max(1), Ordering::SeqCst);
        debug!(
            interval_ms = interval_to_ms(interval),
            burst = burst.max(1),
            "rate limit updated"
        );
        self.inner.reconfigured.notify_waiters();
    }

    /// Blocks until a token is available or `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> AppResult<()> {
        // The bucket lock is fair, so waiters are served in arrival order.
        let mut bucket = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            guard = self.inner.bucket.lock() => guard,
        };

        loop {
            let interval = self.interval();
            bucket.refill(Instant::now(), interval, self.burst());
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return Ok(());
            }

            let delay = bucket.until_next_token(interval);
            trace!(delay_ms = delay.as_millis() as u64, "waiting for rate limit token");
            let reconfigured = self.inner.reconfigured.notified();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                _ = reconfigured => {}
                _ = sleep(delay) => {}
            }
        }
    }
}

fn interval_to_ms(interval: Duration) -> u64 {
    (interval.as_millis() as u64).max(1)
}
