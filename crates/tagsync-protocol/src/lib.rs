//! Branch Sync Protocol
//!
//! Name-tagged JSON messages exchanged between a tagsync client and the
//! authority service.
//!
//! ## Client messages
//! ```text
//! watch_branch / unwatch_branch             # subscribe to branch updates
//! add_updates {updates, updateId}           # send local updates
//! send_action                               # device action for a branch
//! watch_branch_devices / unwatch_branch_devices
//! connection_count                          # count connected devices
//! sync/time {id, clientRequestTime}         # time sample request
//! ```
//!
//! ## Server messages
//! ```text
//! add_updates {updates, initial?}           # remote updates, initial batch acks a watch
//! updates_received {updateId, errorCode?}   # ack for add_updates
//! watch_branch_result                       # watch failures
//! receive_action
//! connected_to_branch / disconnected_from_branch
//! connection_count {count}
//! sync/time/response
//! ```

pub mod branch;
pub mod codec;
pub mod error;
pub mod events;
pub mod messages;

pub use branch::{Addressed, BranchKey, DEFAULT_BRANCH};
pub use codec::{Codec, Message, DEFAULT_MAX_MESSAGE_SIZE};
pub use error::{ProtocolError, ProtocolResult};
pub use events::{
    ConnectedToBranch, ConnectionCountResponse, ConnectionInfo, DisconnectedFromBranch,
    ServerMessage, TimeResponse, UpdatesReceived, WatchBranchResult, MAX_SIZE_REACHED,
};
pub use messages::{
    AddUpdates, BranchAction, ClientMessage, ConnectionCountRequest, TimeRequest, WatchBranch,
};
