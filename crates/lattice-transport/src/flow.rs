//! Flow accounting and rate limiting.
//!
//! Each connection keeps cumulative and rolling per-second byte counters
//! for both directions. The per-second window is swapped out by a 1 s
//! scheduler job; readers see the last completed window. Token buckets
//! optionally cap the slow-path bulk commands and are disabled by default.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Byte counters for one connection.
#[derive(Debug, Default)]
pub struct FlowCounters {
    read_total: AtomicU64,
    write_total: AtomicU64,
    read_window: AtomicU64,
    write_window: AtomicU64,
    read_per_second: AtomicU64,
    write_per_second: AtomicU64,
}

/// A point-in-time view of a connection's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSnapshot {
    /// Total bytes read since the connection was established.
    pub read_total: u64,
    /// Total bytes written since the connection was established.
    pub write_total: u64,
    /// Bytes read during the last completed one-second window.
    pub read_per_second: u64,
    /// Bytes written during the last completed one-second window.
    pub write_per_second: u64,
}

impl FlowCounters {
    /// Fresh zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Account bytes received.
    pub fn record_read(&self, bytes: u64) {
        self.read_total.fetch_add(bytes, Ordering::Relaxed);
        self.read_window.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Account bytes sent.
    pub fn record_write(&self, bytes: u64) {
        self.write_total.fetch_add(bytes, Ordering::Relaxed);
        self.write_window.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Close the current one-second window and expose it to readers.
    pub fn roll_window(&self) {
        let read = self.read_window.swap(0, Ordering::Relaxed);
        let write = self.write_window.swap(0, Ordering::Relaxed);
        self.read_per_second.store(read, Ordering::Relaxed);
        self.write_per_second.store(write, Ordering::Relaxed);
    }

    /// Current counter values.
    #[must_use]
    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            read_total: self.read_total.load(Ordering::Relaxed),
            write_total: self.write_total.load(Ordering::Relaxed),
            read_per_second: self.read_per_second.load(Ordering::Relaxed),
            write_per_second: self.write_per_second.load(Ordering::Relaxed),
        }
    }
}

/// A token bucket capping bytes per second for one bulk command.
#[derive(Debug)]
pub struct TokenBucket {
    rate: u64,
    burst: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled: Instant,
}

impl TokenBucket {
    /// A bucket refilling at `rate` bytes per second with `burst` capacity.
    #[must_use]
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                refilled: Instant::now(),
            }),
        }
    }

    /// Take `bytes` tokens, returning how long the caller must wait before
    /// the debit is covered. `Duration::ZERO` means proceed immediately.
    pub fn debit(&self, bytes: u64) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let refill = now.duration_since(state.refilled).as_secs_f64() * self.rate as f64;
        state.tokens = (state.tokens + refill).min(self.burst as f64);
        state.refilled = now;

        state.tokens -= bytes as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_roll_exposes_last_second() {
        let counters = FlowCounters::new();
        counters.record_read(100);
        counters.record_write(40);
        assert_eq!(counters.snapshot().read_per_second, 0);

        counters.roll_window();
        let snap = counters.snapshot();
        assert_eq!(snap.read_per_second, 100);
        assert_eq!(snap.write_per_second, 40);
        assert_eq!(snap.read_total, 100);

        counters.roll_window();
        assert_eq!(counters.snapshot().read_per_second, 0);
        assert_eq!(counters.snapshot().read_total, 100);
    }

    #[test]
    fn bucket_allows_burst_then_delays() {
        let bucket = TokenBucket::new(1000, 1000);
        assert_eq!(bucket.debit(1000), Duration::ZERO);

        let wait = bucket.debit(500);
        assert!(wait > Duration::from_millis(400));
        assert!(wait <= Duration::from_millis(600));
    }
}
