//! Signaling gateway boundary.

use async_trait::async_trait;
use thiserror::Error;

use crate::signaling::SignalingMessage;

/// Transport-level send failures. Both are transient conditions: the core
/// drops the affected message with a warning and never retries on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("signaling channel is not open")]
    NotOpen,

    #[error("signaling send failed: {0}")]
    SendFailed(String),
}

/// The already-established, ordered, authenticated signaling channel.
///
/// Implementations own the socket and its lifecycle (reconnects included);
/// the core only ever asks whether the channel is usable and hands it
/// messages to deliver. Inbound messages are pushed into the core through
/// `CallHandle::handle_signal`, tagged with the authenticated sender id.
#[async_trait]
pub trait SignalingGateway: Send + Sync {
    /// Whether the channel can currently deliver.
    fn is_open(&self) -> bool;

    /// Deliver one message to the peer named in its `toUserId` field.
    async fn send(&self, message: &SignalingMessage) -> Result<(), TransportError>;
}
