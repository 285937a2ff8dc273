//! JSON codec for wire messages

use crate::error::{ProtocolError, ProtocolResult};
use crate::events::ServerMessage;
use crate::messages::ClientMessage;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

/// Default maximum message size (1MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// A name-tagged wire message
pub trait Message: Serialize + DeserializeOwned {
    /// Every `type` value the message enum understands
    const TYPES: &'static [&'static str];

    fn message_type(&self) -> &'static str;
}

impl Message for ClientMessage {
    const TYPES: &'static [&'static str] = ClientMessage::TYPES;

    fn message_type(&self) -> &'static str {
        ClientMessage::message_type(self)
    }
}

impl Message for ServerMessage {
    const TYPES: &'static [&'static str] = ServerMessage::TYPES;

    fn message_type(&self) -> &'static str {
        ServerMessage::message_type(self)
    }
}

/// Encodes and decodes JSON messages, enforcing a size limit both ways
#[derive(Debug, Clone)]
pub struct Codec {
    max_message_size: usize,
}

impl Codec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn encode<M: Message>(&self, message: &M) -> ProtocolResult<Bytes> {
        let data =
            serde_json::to_vec(message).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        self.check_size(data.len())?;
        trace!(message_type = message.message_type(), size = data.len(), "Encoded message");
        Ok(Bytes::from(data))
    }

    pub fn decode<M: Message>(&self, data: &[u8]) -> ProtocolResult<M> {
        self.check_size(data.len())?;

        let value: serde_json::Value =
            serde_json::from_slice(data).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let message_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?;
        if !M::TYPES.contains(&message_type) {
            return Err(ProtocolError::UnknownMessage(message_type.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    fn check_size(&self, size: usize) -> ProtocolResult<()> {
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}
