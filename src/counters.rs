//! Per-direction cumulative counters and the observer interface through
//! which the core reports session events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Count(AtomicU64);

impl Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Cumulative counters for one direction of a session (egress or ingress).
/// Never shared between directions and never locked: every field is an
/// independent atomic, matching §5's "forwarder MUST NOT hold shared locks
/// across a suspension point" constraint.
#[derive(Default)]
pub struct DirectionCounters {
    frames: Count,
    bytes: Count,
    oversize_drops: Count,
    rate_limit_waits: Count,
    rate_limit_wait_nanos: Count,
    transport_errors: Count,
    framing_errors: Count,
}

impl DirectionCounters {
    pub fn add_frame(&self, bytes: usize) {
        self.frames.add(1);
        self.bytes.add(bytes as u64);
    }

    pub fn add_oversize_drop(&self) {
        self.oversize_drops.add(1);
    }

    pub fn add_rate_limit_wait(&self, wait: Duration) {
        self.rate_limit_waits.add(1);
        self.rate_limit_wait_nanos.add(wait.as_nanos() as u64);
    }

    pub fn add_transport_error(&self) {
        self.transport_errors.add(1);
    }

    pub fn add_framing_error(&self) {
        self.framing_errors.add(1);
    }

    pub fn snapshot(&self) -> DirectionSnapshot {
        DirectionSnapshot {
            frames: self.frames.get(),
            bytes: self.bytes.get(),
            oversize_drops: self.oversize_drops.get(),
            rate_limit_waits: self.rate_limit_waits.get(),
            rate_limit_wait: Duration::from_nanos(self.rate_limit_wait_nanos.get()),
            transport_errors: self.transport_errors.get(),
            framing_errors: self.framing_errors.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectionSnapshot {
    pub frames: u64,
    pub bytes: u64,
    pub oversize_drops: u64,
    pub rate_limit_waits: u64,
    pub rate_limit_wait: Duration,
    pub transport_errors: u64,
    pub framing_errors: u64,
}

/// The cumulative counters of one session, one set per direction (§6).
#[derive(Default)]
pub struct Counters {
    pub egress: DirectionCounters,
    pub ingress: DirectionCounters,
}

/// Session lifecycle state, mirrored from `session::SessionState` so the
/// observer interface doesn't need to depend back on the session module's
/// internal transition logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    Dialing,
    Listening,
    Handshaking,
    Running,
    Draining,
    Backoff,
    Closed,
}

/// The thin observer interface through which the core reports state
/// changes and notable events (§1, §6). Implementations must not block:
/// they are called from the session's hot paths.
pub trait Observer: Send + Sync {
    fn on_state_change(&self, peer: &str, state: ObservedState, reason: &str) {
        let _ = (peer, state, reason);
    }

    fn on_oversize_drop(&self, peer: &str, size: usize) {
        let _ = (peer, size);
    }

    fn on_rate_limit_wait(&self, peer: &str, wait: Duration) {
        let _ = (peer, wait);
    }

    fn on_transport_error(&self, peer: &str, message: &str) {
        let _ = (peer, message);
    }

    fn on_framing_error(&self, peer: &str, message: &str) {
        let _ = (peer, message);
    }
}

/// Default observer: logs every callback through the `log` facade.
pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn on_state_change(&self, peer: &str, state: ObservedState, reason: &str) {
        log::info!("session state change: peer={peer}, state={state:?}, reason={reason}");
    }

    fn on_oversize_drop(&self, peer: &str, size: usize) {
        log::warn!("oversize packet dropped: peer={peer}, size={size}");
    }

    fn on_rate_limit_wait(&self, peer: &str, wait: Duration) {
        log::trace!("rate limit wait: peer={peer}, wait={wait:?}");
    }

    fn on_transport_error(&self, peer: &str, message: &str) {
        log::warn!("transport error: peer={peer}, err={message}");
    }

    fn on_framing_error(&self, peer: &str, message: &str) {
        log::error!("framing error: peer={peer}, err={message}");
    }
}
