//! Messages sent from the client to the server

use crate::branch::{impl_addressed, BranchKey};
use serde::{Deserialize, Serialize};

/// `watch_branch`: start receiving updates for a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchBranch {
    pub record_name: Option<String>,
    pub inst: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary: Option<bool>,
}

impl WatchBranch {
    pub fn new(key: &BranchKey) -> Self {
        Self {
            record_name: key.record_name.clone(),
            inst: key.inst.clone(),
            branch: key.branch.clone(),
            temporary: None,
        }
    }
}

/// `add_updates`: a batch of opaque updates for a branch.
///
/// Sent by the client with an `update_id`; sent by the server with the
/// `initial` flag on the first batch after a watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUpdates {
    pub record_name: Option<String>,
    pub inst: String,
    pub branch: String,
    pub updates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl AddUpdates {
    pub fn new(key: &BranchKey, updates: Vec<String>) -> Self {
        Self {
            record_name: key.record_name.clone(),
            inst: key.inst.clone(),
            branch: key.branch.clone(),
            updates,
            update_id: None,
            initial: None,
            timestamp: None,
        }
    }

    pub fn with_update_id(mut self, update_id: u64) -> Self {
        self.update_id = Some(update_id);
        self
    }

    pub fn initial(mut self) -> Self {
        self.initial = Some(true);
        self
    }

    pub fn is_initial(&self) -> bool {
        self.initial.unwrap_or(false)
    }
}

/// An action targeted at the devices watching a branch.
///
/// Sent as `send_action`, received as `receive_action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchAction {
    pub record_name: Option<String>,
    pub inst: String,
    pub branch: String,
    pub action: serde_json::Value,
}

impl BranchAction {
    pub fn new(key: &BranchKey, action: serde_json::Value) -> Self {
        Self {
            record_name: key.record_name.clone(),
            inst: key.inst.clone(),
            branch: key.branch.clone(),
            action,
        }
    }
}

/// `connection_count` request. Without an inst it counts every connection
/// in the record (or the whole server without a record).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCountRequest {
    pub record_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl From<Option<&BranchKey>> for ConnectionCountRequest {
    fn from(key: Option<&BranchKey>) -> Self {
        match key {
            Some(key) => Self {
                record_name: key.record_name.clone(),
                inst: Some(key.inst.clone()),
                branch: Some(key.branch.clone()),
            },
            None => Self::default(),
        }
    }
}

/// `sync/time` request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRequest {
    pub id: u64,
    pub client_request_time: u64,
}

impl_addressed!(WatchBranch, AddUpdates, BranchAction);

/// Every message the client sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "watch_branch")]
    WatchBranch(WatchBranch),

    #[serde(rename = "unwatch_branch")]
    UnwatchBranch(BranchKey),

    #[serde(rename = "add_updates")]
    AddUpdates(AddUpdates),

    #[serde(rename = "send_action")]
    SendAction(BranchAction),

    #[serde(rename = "watch_branch_devices")]
    WatchBranchDevices(BranchKey),

    #[serde(rename = "unwatch_branch_devices")]
    UnwatchBranchDevices(BranchKey),

    #[serde(rename = "connection_count")]
    ConnectionCount(ConnectionCountRequest),

    #[serde(rename = "sync/time")]
    TimeRequest(TimeRequest),
}

impl ClientMessage {
    pub const TYPES: &'static [&'static str] = &[
        "watch_branch",
        "unwatch_branch",
        "add_updates",
        "send_action",
        "watch_branch_devices",
        "unwatch_branch_devices",
        "connection_count",
        "sync/time",
    ];

    /// Wire name of the message
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::WatchBranch(_) => "watch_branch",
            ClientMessage::UnwatchBranch(_) => "unwatch_branch",
            ClientMessage::AddUpdates(_) => "add_updates",
            ClientMessage::SendAction(_) => "send_action",
            ClientMessage::WatchBranchDevices(_) => "watch_branch_devices",
            ClientMessage::UnwatchBranchDevices(_) => "unwatch_branch_devices",
            ClientMessage::ConnectionCount(_) => "connection_count",
            ClientMessage::TimeRequest(_) => "sync/time",
        }
    }
}
