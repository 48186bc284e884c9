//! Token-bucket rate limiter (§4.4) with TCP-overhead compensation.
//!
//! The internal state lives behind a `parking_lot::Mutex`, a synchronous
//! lock that cannot be held across an `.await`, which is exactly the
//! constraint §5 places on the bucket's critical section ("protected by a
//! short critical section that never brackets a suspension").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;

use crate::config::{RateLimitConfig, RateLimitDirection};

struct Inner {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket bounding the average bytes/sec and burst size of one
/// direction. Safe under concurrent callers; correctness (average rate,
/// burst bound) holds under any caller pattern, though in practice each
/// session direction has exactly one caller (the forwarding engine).
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    overhead_factor: f64,
    inner: Mutex<Inner>,
    cancelled: AtomicBool,
}

impl TokenBucket {
    pub fn new(capacity_bytes: u64, rate_bytes_per_sec: u64, overhead_factor: f64) -> Self {
        Self {
            capacity: capacity_bytes as f64,
            rate: rate_bytes_per_sec as f64,
            overhead_factor,
            inner: Mutex::new(Inner {
                tokens: capacity_bytes as f64,
                last_refill: Instant::now(),
            }),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Cancel any in-flight or future wait. The wait MUST return promptly
    /// per §4.4's failure semantics ("the limiter never fails; it only
    /// delays ... the wait MUST be cancellable").
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Refill, then attempt to charge `n` bytes (after overhead
    /// compensation). Returns the wait required before the *next* attempt
    /// would succeed, or `None` if the charge was applied immediately.
    fn try_charge(&self, n: f64) -> Option<Duration> {
        let mut inner = self.inner.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.rate).min(self.capacity);
        inner.last_refill = now;

        if inner.tokens >= n {
            inner.tokens -= n;
            None
        } else {
            let deficit = n - inner.tokens;
            Some(Duration::from_secs_f64(deficit / self.rate))
        }
    }

    /// Acquire permission to send `n` bytes, blocking (with cancellation)
    /// until the bucket can afford it. A request larger than `capacity` is
    /// split into `capacity`-sized sub-requests per §4.4's granularity
    /// rule; a zero-byte request is a no-op. Returns the total time spent
    /// waiting, for the caller to report to its counters.
    pub async fn acquire(&self, n: u64) -> Duration {
        if n == 0 {
            return Duration::ZERO;
        }

        let mut remaining = n as f64 * self.overhead_factor;
        let mut total_wait = Duration::ZERO;

        while remaining > 0.0 {
            let chunk = remaining.min(self.capacity);

            loop {
                if self.is_cancelled() {
                    return total_wait;
                }

                match self.try_charge(chunk) {
                    None => break,
                    Some(wait) => {
                        total_wait += wait;
                        sleep(wait).await;
                    }
                }
            }

            remaining -= chunk;
        }

        total_wait
    }
}

/// Build the egress and ingress limiters implied by a [`RateLimitConfig`],
/// honoring its `enabled` flag and `direction` scope (§3 `TunnelConfig`'s
/// "direction scope").
pub fn build_limiters(cfg: &RateLimitConfig) -> (Option<Arc<TokenBucket>>, Option<Arc<TokenBucket>>) {
    if !cfg.enabled {
        return (None, None);
    }

    let make = || {
        Arc::new(TokenBucket::new(
            cfg.burst_bytes,
            cfg.rate_bytes_per_sec,
            cfg.overhead_factor,
        ))
    };

    match cfg.direction {
        RateLimitDirection::Both => (Some(make()), Some(make())),
        RateLimitDirection::EgressOnly => (Some(make()), None),
        RateLimitDirection::IngressOnly => (None, Some(make())),
    }
}
