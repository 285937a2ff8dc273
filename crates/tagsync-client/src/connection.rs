//! Transport abstraction consumed by the sync client

use tagsync_protocol::{ClientMessage, ConnectionInfo, ServerMessage};
use tokio::sync::broadcast;

/// Connection status reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub info: Option<ConnectionInfo>,
}

impl ConnectionState {
    pub fn connected(info: Option<ConnectionInfo>) -> Self {
        Self { connected: true, info }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            info: None,
        }
    }
}

/// Everything a transport reports, in delivery order
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Message(ServerMessage),
}

/// A reconnecting message transport to the authority service.
///
/// Framing and reconnection policy belong to the implementation. `send` must
/// not block: messages sent while offline may be dropped, the client resends
/// anything that matters.
pub trait Connection: Send + Sync {
    /// Subscribe to connection transitions and inbound messages
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    fn send(&self, message: ClientMessage);

    fn connect(&self);

    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Identity of this connection, when connected
    fn info(&self) -> Option<ConnectionInfo>;
}
