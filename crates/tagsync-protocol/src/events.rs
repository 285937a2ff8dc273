//! Messages sent from the server to the client

use crate::branch::impl_addressed;
use crate::messages::{AddUpdates, BranchAction, WatchBranch};
use serde::{Deserialize, Serialize};

/// Error code for an update batch that would push the branch past its size limit
pub const MAX_SIZE_REACHED: &str = "max_size_reached";

/// Identity of a single connection to the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ConnectionInfo {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            session_id: None,
            user_id: None,
        }
    }
}

/// `updates_received`: acknowledgement (or rejection) of a client batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatesReceived {
    pub record_name: Option<String>,
    pub inst: String,
    pub branch: String,
    pub update_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_branch_size_in_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needed_branch_size_in_bytes: Option<u64>,
}

/// `watch_branch_result`: outcome of a watch request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchBranchResult {
    pub record_name: Option<String>,
    pub inst: String,
    pub branch: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// `connected_to_branch`: a device started watching a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedToBranch {
    pub broadcast: bool,
    pub branch: WatchBranch,
    pub connection: ConnectionInfo,
}

/// `disconnected_from_branch`: a device stopped watching a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectedFromBranch {
    pub broadcast: bool,
    pub record_name: Option<String>,
    pub inst: String,
    pub branch: String,
    pub connection: ConnectionInfo,
}

/// `connection_count` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCountResponse {
    pub record_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub count: u64,
}

/// `sync/time/response`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeResponse {
    pub id: u64,
    pub client_request_time: u64,
    pub server_receive_time: u64,
    pub server_transmit_time: u64,
}

impl_addressed!(UpdatesReceived, WatchBranchResult, DisconnectedFromBranch);

/// Every message the server sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "add_updates")]
    AddUpdates(AddUpdates),

    #[serde(rename = "updates_received")]
    UpdatesReceived(UpdatesReceived),

    #[serde(rename = "watch_branch_result")]
    WatchBranchResult(WatchBranchResult),

    #[serde(rename = "receive_action")]
    ReceiveAction(BranchAction),

    #[serde(rename = "connected_to_branch")]
    ConnectedToBranch(ConnectedToBranch),

    #[serde(rename = "disconnected_from_branch")]
    DisconnectedFromBranch(DisconnectedFromBranch),

    #[serde(rename = "connection_count")]
    ConnectionCount(ConnectionCountResponse),

    #[serde(rename = "sync/time/response")]
    TimeResponse(TimeResponse),
}

impl ServerMessage {
    pub const TYPES: &'static [&'static str] = &[
        "add_updates",
        "updates_received",
        "watch_branch_result",
        "receive_action",
        "connected_to_branch",
        "disconnected_from_branch",
        "connection_count",
        "sync/time/response",
    ];

    /// Wire name of the message
    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::AddUpdates(_) => "add_updates",
            ServerMessage::UpdatesReceived(_) => "updates_received",
            ServerMessage::WatchBranchResult(_) => "watch_branch_result",
            ServerMessage::ReceiveAction(_) => "receive_action",
            ServerMessage::ConnectedToBranch(_) => "connected_to_branch",
            ServerMessage::DisconnectedFromBranch(_) => "disconnected_from_branch",
            ServerMessage::ConnectionCount(_) => "connection_count",
            ServerMessage::TimeResponse(_) => "sync/time/response",
        }
    }
}
