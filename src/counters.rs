//! Traffic counters
//!
//! Shared by the proxy (writers) and the metrics reporter (reader).
//! Each counter is an independent atomic; snapshots are per-counter
//! consistent but not cross-counter atomic.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic request/byte/error counters
#[derive(Debug)]
pub struct Counters {
    requests: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    errors: AtomicU64,
    started_at: Instant,
}

/// Point-in-time read of all counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub requests: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Count one forwarded request and its declared body length
    #[inline]
    pub fn record_request(&self, declared_len: Option<u64>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if let Some(len) = declared_len.filter(|len| *len > 0) {
            self.bytes_in.fetch_add(len, Ordering::Relaxed);
        }
    }

    /// Bytes received after the headers (upgraded connections)
    #[inline]
    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Time since the counters were created
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_counters() {
        let counters = Counters::new();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }

    #[test]
    fn test_declared_length() {
        let counters = Counters::new();

        counters.record_request(Some(128));
        counters.record_request(None);
        counters.record_request(Some(0));

        let snap = counters.snapshot();
        assert_eq!(snap.requests, 3);
        assert_eq!(snap.bytes_in, 128);
    }

    #[test]
    fn test_concurrent_increments() {
        let counters = Arc::new(Counters::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = counters.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.record_request(Some(2));
                        counters.add_bytes_out(3);
                        counters.record_error();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snap = counters.snapshot();
        assert_eq!(snap.requests, 8000);
        assert_eq!(snap.bytes_in, 16000);
        assert_eq!(snap.bytes_out, 24000);
        assert_eq!(snap.errors, 8000);
    }
}
