//! In-process transport

use crate::connection::{Connection, ConnectionEvent, ConnectionState};
use crate::error::ClientResult;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tagsync_protocol::{ClientMessage, Codec, ConnectionInfo, ServerMessage};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 1024;

/// In-process transport
///
/// Every message goes through the wire codec, so size limits and message
/// shapes behave as they would on a socket. Sent messages are recorded for
/// whoever plays the server side; server messages are injected with
/// [`MemoryConnection::deliver`].
pub struct MemoryConnection {
    info: ConnectionInfo,
    codec: Codec,
    connected: AtomicBool,
    sent: Mutex<Vec<ClientMessage>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::with_codec(Codec::default())
    }

    pub fn with_codec(codec: Codec) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            info: ConnectionInfo::new(uuid::Uuid::new_v4().to_string()),
            codec,
            connected: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Deliver a server message to subscribers
    pub fn deliver(&self, message: ServerMessage) {
        let _ = self.events.send(ConnectionEvent::Message(message));
    }

    /// Decode and deliver a raw server frame
    pub fn deliver_raw(&self, data: &[u8]) -> ClientResult<()> {
        let message: ServerMessage = self.codec.decode(data)?;
        self.deliver(message);
        Ok(())
    }

    /// Messages sent so far, leaving the record empty
    pub fn take_sent(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for MemoryConnection {
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn send(&self, message: ClientMessage) {
        // round-trip through the codec like a real socket would
        let decoded = self
            .codec
            .encode(&message)
            .and_then(|data| self.codec.decode::<ClientMessage>(&data));
        match decoded {
            Ok(message) => self.sent.lock().push(message),
            Err(e) => {
                warn!(connection = %self.info.connection_id, error = %e, "Dropping message");
            }
        }
    }

    fn connect(&self) {
        debug!(connection = %self.info.connection_id, "Connecting");
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::StateChanged(ConnectionState::connected(
            Some(self.info.clone()),
        )));
    }

    fn disconnect(&self) {
        debug!(connection = %self.info.connection_id, "Disconnecting");
        self.connected.store(false, Ordering::SeqCst);
        let _ = self
            .events
            .send(ConnectionEvent::StateChanged(ConnectionState::disconnected()));
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn info(&self) -> Option<ConnectionInfo> {
        self.is_connected().then(|| self.info.clone())
    }
}
