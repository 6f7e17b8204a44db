//! Call-related error types.
//!
//! The taxonomy follows where a failure can occur: building the engine,
//! acquiring media, producing or applying SDP, connectivity, the signaling
//! transport, and operations issued in the wrong state. Which of these are
//! fatal to a call attempt is decided by the manager, not here.

use thiserror::Error;

use crate::engine::EngineError;
use crate::gateway::TransportError;
use crate::media::MediaError;
use crate::state::InvalidTransition;

#[derive(Debug, Clone, Error)]
pub enum CallError {
    // initialization
    #[error("negotiation engine creation failed: {0}")]
    EngineCreate(EngineError),

    // media
    #[error(transparent)]
    Media(#[from] MediaError),

    // signaling
    #[error("offer creation failed: {0}")]
    OfferCreation(EngineError),

    #[error("answer creation failed: {0}")]
    AnswerCreation(EngineError),

    #[error("applying local description failed: {0}")]
    SetLocalDescription(EngineError),

    #[error("applying remote description failed: {0}")]
    SetRemoteDescription(EngineError),

    // connectivity
    #[error("ice candidate rejected: {0}")]
    CandidateRejected(EngineError),

    #[error("peer connection failed")]
    ConnectionFailed,

    // transport
    #[error(transparent)]
    Transport(#[from] TransportError),

    // state
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("no active call session")]
    NoSession,

    #[error("no negotiation engine for this session")]
    NoEngine,

    #[error("call manager is not running")]
    NotRunning,

    /// The attempt was abandoned because a newer start/accept/end superseded
    /// it mid-flight. Not a failure of the superseding operation.
    #[error("call attempt superseded")]
    Superseded,
}

impl CallError {
    /// Errors worth surfacing to the user with an actionable message, as
    /// opposed to diagnostic detail that belongs in logs.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::EngineCreate(_) | Self::Media(_)
        )
    }
}
