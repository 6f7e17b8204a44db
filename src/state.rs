//! Call session state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::candidate::CandidateQueue;
use crate::engine::{NegotiationEngine, SessionDescription};
use crate::media::LocalMedia;
use crate::signaling::UserId;

/// Media mode of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    Audio,
    Video,
    Screen,
}

impl CallMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screen => "screen",
        }
    }

    /// The mode the callee acquires local media in when answering an offer
    /// of this mode. Screen-share offers are answered audio-only: the
    /// callee is a viewer, not a second presenter.
    pub const fn answer_mode(&self) -> CallMode {
        match self {
            Self::Screen => Self::Audio,
            other => *other,
        }
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the call this participant is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallEndReason {
    LocalHangUp,
    RemoteHangUp,
    Rejected,
    MediaUnavailable,
    NegotiationFailed,
    ConnectionFailed,
    Superseded,
}

/// Current phase of the session. `Idle` has no representation here: no
/// session means no phase.
#[derive(Debug, Clone, Serialize)]
pub enum CallPhase {
    /// Outgoing call: offer sent, waiting for an answer.
    Calling { started_at: DateTime<Utc> },
    /// Incoming call: offer stored, waiting for the local user's decision.
    Ringing { received_at: DateTime<Utc> },
    /// Media session established.
    Connected { connected_at: DateTime<Utc> },
    /// Same remote sent a fresh offer mid-call (e.g. a mode switch).
    Renegotiating {
        since: DateTime<Utc>,
        connected_at: DateTime<Utc>,
    },
    /// Torn down.
    Ended {
        reason: CallEndReason,
        ended_at: DateTime<Utc>,
    },
}

impl CallPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. } | Self::Renegotiating { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Calling { .. } => "Calling",
            Self::Ringing { .. } => "Ringing",
            Self::Connected { .. } => "Connected",
            Self::Renegotiating { .. } => "Renegotiating",
            Self::Ended { .. } => "Ended",
        }
    }
}

/// State transitions for a session.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Callee accepted the stored offer and the answer went out.
    Accepted,
    /// Caller received the remote answer.
    AnswerReceived,
    /// A renegotiation offer from the current remote is being applied.
    RenegotiationStarted,
    /// The renegotiation round produced a new answer.
    RenegotiationCompleted,
    Terminated { reason: CallEndReason },
}

impl CallTransition {
    const fn name(&self) -> &'static str {
        match self {
            Self::Accepted => "Accepted",
            Self::AnswerReceived => "AnswerReceived",
            Self::RenegotiationStarted => "RenegotiationStarted",
            Self::RenegotiationCompleted => "RenegotiationCompleted",
            Self::Terminated { .. } => "Terminated",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("invalid transition {attempted} in phase {phase}")]
pub struct InvalidTransition {
    pub phase: &'static str,
    pub attempted: &'static str,
}

/// Local and mirrored remote mute/camera indicators. Ephemeral; a new
/// session starts from defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuteVideoState {
    pub mic_muted: bool,
    pub camera_off: bool,
    pub remote_mic_muted: bool,
    pub remote_camera_off: bool,
}

/// An incoming offer held while the local user decides, or while a
/// renegotiation round is being applied.
#[derive(Debug, Clone)]
pub struct StoredOffer {
    pub from: UserId,
    pub mode: CallMode,
    pub sdp: SessionDescription,
}

/// The single active or pending call. At most one exists per participant;
/// the manager owns it as an explicit `Option<CallSession>`.
pub struct CallSession {
    pub remote: UserId,
    pub mode: CallMode,
    pub role: CallRole,
    pub phase: CallPhase,
    /// Identity of the current negotiation round. Engine events and
    /// in-flight async results from older rounds are discarded.
    pub round: u64,
    pub engine: Option<Arc<dyn NegotiationEngine>>,
    /// Whether the current round's remote description has been applied;
    /// candidates queue until it has.
    pub remote_description_applied: bool,
    pub queue: CandidateQueue,
    pub local_media: Option<Arc<dyn LocalMedia>>,
    pub pending_offer: Option<StoredOffer>,
    pub mute_video: MuteVideoState,
    /// Whether an offer or answer has gone out for this session. Decides
    /// if an aborting teardown owes the remote a hang-up notification.
    pub signaled: bool,
}

impl CallSession {
    pub fn new_outgoing(remote: UserId, mode: CallMode, round: u64) -> Self {
        Self {
            remote,
            mode,
            role: CallRole::Caller,
            phase: CallPhase::Calling {
                started_at: Utc::now(),
            },
            round,
            engine: None,
            remote_description_applied: false,
            queue: CandidateQueue::new(),
            local_media: None,
            pending_offer: None,
            mute_video: MuteVideoState::default(),
            signaled: false,
        }
    }

    pub fn new_incoming(offer: StoredOffer) -> Self {
        Self {
            remote: offer.from,
            mode: offer.mode,
            role: CallRole::Callee,
            phase: CallPhase::Ringing {
                received_at: Utc::now(),
            },
            round: 0,
            engine: None,
            remote_description_applied: false,
            queue: CandidateQueue::new(),
            local_media: None,
            pending_offer: Some(offer),
            mute_video: MuteVideoState::default(),
            signaled: false,
        }
    }

    /// Apply a state transition. Returns an error if the transition is not
    /// valid in the current phase.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_phase = match (&self.phase, &transition) {
            (CallPhase::Ringing { .. }, CallTransition::Accepted) => CallPhase::Connected {
                connected_at: Utc::now(),
            },
            (CallPhase::Calling { .. }, CallTransition::AnswerReceived) => CallPhase::Connected {
                connected_at: Utc::now(),
            },
            (
                CallPhase::Connected { connected_at },
                CallTransition::RenegotiationStarted,
            ) => CallPhase::Renegotiating {
                since: Utc::now(),
                connected_at: *connected_at,
            },
            (
                CallPhase::Renegotiating { connected_at, .. },
                CallTransition::RenegotiationCompleted,
            ) => CallPhase::Connected {
                connected_at: *connected_at,
            },
            (phase, CallTransition::Terminated { reason }) if !phase.is_ended() => {
                CallPhase::Ended {
                    reason: *reason,
                    ended_at: Utc::now(),
                }
            }
            (phase, transition) => {
                return Err(InvalidTransition {
                    phase: phase.name(),
                    attempted: transition.name(),
                });
            }
        };
        self.phase = new_phase;
        Ok(())
    }

    /// An offer from this sender while connected is a renegotiation of the
    /// current call, applied without prompting the user.
    pub fn accepts_renegotiation_from(&self, from: UserId) -> bool {
        self.remote == from && self.phase.is_connected()
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("remote", &self.remote)
            .field("mode", &self.mode)
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("round", &self.round)
            .field("engine", &self.engine.is_some())
            .field("remote_description_applied", &self.remote_description_applied)
            .field("queued_candidates", &self.queue.len())
            .field("local_media", &self.local_media.is_some())
            .field("pending_offer", &self.pending_offer.is_some())
            .field("signaled", &self.signaled)
            .finish()
    }
}
