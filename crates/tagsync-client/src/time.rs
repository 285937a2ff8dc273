//! Clocks and server time samples

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// One round trip of the `sync/time` exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSample {
    /// When the client sent the request
    pub client_request_time: u64,
    /// When the server received the request
    pub server_receive_time: u64,
    /// When the server sent the response
    pub server_transmit_time: u64,
    /// When the client received the response
    pub current_time: u64,
}

impl TimeSample {
    /// Estimated server clock minus client clock
    pub fn offset_ms(&self) -> i64 {
        let outbound = self.server_receive_time as i64 - self.client_request_time as i64;
        let inbound = self.server_transmit_time as i64 - self.current_time as i64;
        (outbound + inbound) / 2
    }

    /// Time spent on the network, excluding server processing
    pub fn round_trip_ms(&self) -> i64 {
        let total = self.current_time as i64 - self.client_request_time as i64;
        let processing = self.server_transmit_time as i64 - self.server_receive_time as i64;
        total - processing
    }
}
