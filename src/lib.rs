//! Call-negotiation core for a chat application.
//!
//! This crate establishes, maintains, renegotiates, and tears down one
//! peer-to-peer media session (audio, video, or screen share) between two
//! authenticated users, driven over an already-established ordered
//! signaling channel.
//!
//! # Architecture
//!
//! - [`SignalingMessage`]: the four-message wire vocabulary (offer, answer,
//!   candidate, end)
//! - [`CallSession`], [`CallPhase`] & [`CallTransition`]: the session state
//!   machine
//! - [`CandidateQueue`]: buffers candidates that outran the remote
//!   description, replayed in arrival order
//! - [`CallManager`] & [`CallHandle`]: the orchestration core; one task
//!   owns the session and processes every local action and inbound message
//!   as a serialized command
//! - [`StatusMessage`]: side-channel mute/camera mirroring
//! - [`SignalingGateway`], [`MediaProvider`], [`NegotiationEngine`],
//!   [`CallObserver`]: the four external boundaries
//!
//! The transport below the gateway, media capture, and the ICE/DTLS/SRTP
//! engine are all external collaborators; this crate only drives them.

pub mod candidate;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod manager;
pub mod media;
pub mod side_channel;
pub mod signaling;
pub mod state;

pub use candidate::{CandidateQueue, CandidateRejection, IceCandidateDescriptor};
pub use config::{CallConfig, IceServerConfig};
pub use engine::{
    ConnectionState, EngineError, EngineEvent, EngineEventSink, EngineFactory, NegotiationEngine,
    SdpKind, SessionDescription,
};
pub use error::CallError;
pub use events::{CallObserver, CallStateUpdate, IncomingCall};
pub use gateway::{SignalingGateway, TransportError};
pub use manager::{CallHandle, CallManager};
pub use media::{LocalMedia, MediaError, MediaProvider, RemoteTrackHandle, TrackKind};
pub use side_channel::StatusMessage;
pub use signaling::{SignalingMessage, UserId};
pub use state::{
    CallEndReason, CallMode, CallPhase, CallRole, CallSession, CallTransition, InvalidTransition,
    MuteVideoState, StoredOffer,
};
