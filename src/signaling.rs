//! Signaling message definitions and wire codec.
//!
//! The four message variants below are the entire vocabulary exchanged with
//! the remote peer over the signaling gateway. Every message is a flat JSON
//! object tagged by `type` and addressed by `toUserId`; the sender identity
//! is supplied out-of-band by the gateway, never by the sender itself.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::candidate::IceCandidateDescriptor;
use crate::engine::SessionDescription;
use crate::state::CallMode;

/// Numeric identity of a chat participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Call-control message exchanged over the signaling gateway.
///
/// Wire representation is internally tagged:
/// `{"type":"RTC_CALL_OFFER","toUserId":42,"callMode":"video","sdp":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    /// Offer a new call, or renegotiate an established one.
    #[serde(rename = "RTC_CALL_OFFER")]
    CallOffer {
        #[serde(rename = "toUserId")]
        to: UserId,
        #[serde(rename = "callMode")]
        mode: CallMode,
        sdp: SessionDescription,
    },

    /// Answer an offer we previously received.
    #[serde(rename = "RTC_CALL_ANSWER")]
    CallAnswer {
        #[serde(rename = "toUserId")]
        to: UserId,
        sdp: SessionDescription,
    },

    /// Connectivity hint gathered by the local negotiation engine.
    #[serde(rename = "RTC_ICE_CANDIDATE")]
    IceCandidate {
        #[serde(rename = "toUserId")]
        to: UserId,
        candidate: IceCandidateDescriptor,
    },

    /// Hang up, or reject an offer that was never answered.
    #[serde(rename = "RTC_CALL_END")]
    CallEnd {
        #[serde(rename = "toUserId")]
        to: UserId,
    },
}

impl SignalingMessage {
    /// The wire tag, for logging.
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::CallOffer { .. } => "RTC_CALL_OFFER",
            Self::CallAnswer { .. } => "RTC_CALL_ANSWER",
            Self::IceCandidate { .. } => "RTC_ICE_CANDIDATE",
            Self::CallEnd { .. } => "RTC_CALL_END",
        }
    }

    /// The addressee of this message.
    pub const fn to(&self) -> UserId {
        match self {
            Self::CallOffer { to, .. }
            | Self::CallAnswer { to, .. }
            | Self::IceCandidate { to, .. }
            | Self::CallEnd { to } => *to,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode an inbound message. Unknown `type` tags are a decode error;
    /// the dispatcher drops those with a debug log rather than failing.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
