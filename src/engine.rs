//! Negotiation engine boundary.
//!
//! The engine wraps SDP offer/answer and ICE/DTLS/SRTP session setup,
//! everything this crate deliberately does not implement. One engine
//! instance serves exactly one negotiation round; renegotiation and
//! call replacement always build a fresh engine through the factory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::candidate::IceCandidateDescriptor;
use crate::config::IceServerConfig;
use crate::media::{LocalMedia, RemoteTrackHandle};
use crate::side_channel::StatusMessage;

/// Whether an SDP blob is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP session description as exchanged over signaling:
/// `{"type":"offer","sdp":"v=0..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connection state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Opaque engine failure, surfaced into the call error taxonomy by the
/// operation that hit it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Notification pushed by an engine instance.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The engine gathered a local candidate to forward to the peer.
    IceCandidateGenerated(IceCandidateDescriptor),
    /// The peer's media arrived.
    RemoteTrack(RemoteTrackHandle),
    ConnectionStateChanged(ConnectionState),
    /// Mute/camera status received over the side channel.
    StatusReceived(StatusMessage),
}

/// Event sender handed to each engine at creation, pre-tagged with the
/// negotiation round it belongs to. Events from superseded rounds are
/// dropped by the session owner, which is what makes replacing an engine
/// mid-flight safe.
#[derive(Debug, Clone)]
pub struct EngineEventSink {
    round: u64,
    tx: mpsc::UnboundedSender<(u64, EngineEvent)>,
}

impl EngineEventSink {
    pub fn new(round: u64, tx: mpsc::UnboundedSender<(u64, EngineEvent)>) -> Self {
        Self { round, tx }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Fire-and-forget; a closed receiver means the owning session is gone
    /// and the event is irrelevant.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send((self.round, event));
    }
}

/// One negotiation round's SDP/ICE driver.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn add_ice_candidate(
        &self,
        candidate: &IceCandidateDescriptor,
    ) -> Result<(), EngineError>;

    /// Attach the local capture stream so its tracks are negotiated.
    fn attach_local_tracks(&self, media: Arc<dyn LocalMedia>);

    /// The ICE username fragment of the currently applied remote
    /// description, used to discard candidates from a stale round.
    fn remote_ufrag(&self) -> Option<String>;

    /// Whether the in-band side channel is open for status messages.
    fn side_channel_open(&self) -> bool;

    /// Fire-and-forget status message over the side channel.
    fn send_status(&self, status: &StatusMessage) -> Result<(), EngineError>;

    /// Tear the engine down. Idempotent.
    fn close(&self);
}

/// Builds one engine per negotiation round.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: EngineEventSink,
    ) -> Result<Arc<dyn NegotiationEngine>, EngineError>;
}
