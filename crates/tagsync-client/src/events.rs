//! Events produced by the sync client

use tagsync_protocol::{BranchKey, ConnectionInfo};
use thiserror::Error;

/// Everything a branch watcher receives
#[derive(Debug, Clone, PartialEq)]
pub enum ClientUpdate {
    /// A batch of updates. The first batch a watcher sees is the initial
    /// state of the branch and carries `initial = true`.
    Updates {
        updates: Vec<String>,
        initial: bool,
        timestamp: Option<u64>,
    },
    /// A device action sent to the branch
    Event { action: serde_json::Value },
    /// One of our updates was rejected by the server
    Error(UpdateError),
    /// Outcome of a watch request
    WatchResult {
        success: bool,
        error_code: Option<String>,
        error_message: Option<String>,
    },
}

/// An update the server refused. The update is no longer pending.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error(
        "Update {update_id} exceeds the branch size limit (max {max_branch_size_in_bytes:?} bytes, needed {needed_branch_size_in_bytes:?})"
    )]
    MaxSizeReached {
        update_id: u64,
        max_branch_size_in_bytes: Option<u64>,
        needed_branch_size_in_bytes: Option<u64>,
    },

    #[error("Update {update_id} rejected: {error_code}")]
    Rejected { update_id: u64, error_code: String },
}

impl UpdateError {
    pub fn update_id(&self) -> u64 {
        match self {
            UpdateError::MaxSizeReached { update_id, .. } => *update_id,
            UpdateError::Rejected { update_id, .. } => *update_id,
        }
    }
}

/// Presence change of another device watching a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected(ConnectionInfo),
    Disconnected(ConnectionInfo),
}

impl DeviceEvent {
    pub fn connection(&self) -> &ConnectionInfo {
        match self {
            DeviceEvent::Connected(info) | DeviceEvent::Disconnected(info) => info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Local updates are waiting for an acknowledgement
    Syncing,
    /// Every local update has been acknowledged
    Synced,
}

/// Sync status change of a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub state: SyncState,
    pub key: BranchKey,
}

impl SyncEvent {
    pub fn syncing(key: BranchKey) -> Self {
        Self {
            state: SyncState::Syncing,
            key,
        }
    }

    pub fn synced(key: BranchKey) -> Self {
        Self {
            state: SyncState::Synced,
            key,
        }
    }
}
