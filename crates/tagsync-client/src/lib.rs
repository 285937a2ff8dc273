//! tagsync client
//!
//! Keeps branches of a shared document in sync with the authority service:
//! - Watch lifecycle: watches are re-established on every reconnect
//! - Pending updates: tracked until acknowledged, resent with backoff
//! - Device presence, server time sampling and connection counts
//! - Metrics: Prometheus metrics (optional feature)

mod branches;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod ledger;
pub mod memory;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod time;

pub use client::{BranchDevices, BranchUpdates, PendingResponse, SyncClient};
pub use config::ClientConfig;
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use error::{ClientError, ClientResult};
pub use events::{ClientUpdate, DeviceEvent, SyncEvent, SyncState, UpdateError};
pub use ledger::{Backoff, PendingLedger, PendingUpdate};
pub use memory::MemoryConnection;
#[cfg(feature = "metrics")]
pub use metrics::ClientMetrics;
pub use time::{Clock, ManualClock, SystemClock, TimeSample};
