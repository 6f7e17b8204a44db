//! UI-facing call events.
//!
//! The rendering layer implements [`CallObserver`] to learn about incoming
//! calls, call state flips, remote media, and mirrored mute/camera
//! indicators. Observer methods are invoked off the manager's command loop
//! in delivery order; an observer may call back into the [`CallHandle`]
//! (e.g. accepting an invitation) without deadlocking it.

use async_trait::async_trait;
use std::fmt;

use crate::error::CallError;
use crate::manager::CallHandle;
use crate::media::RemoteTrackHandle;
use crate::signaling::UserId;
use crate::state::{CallMode, CallRole};

/// In-call status snapshot pushed on every lifecycle edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStateUpdate {
    pub in_call: bool,
    pub role: Option<CallRole>,
}

/// A pending invitation surfaced to the user. Consuming it either way
/// resolves the stored offer; dropping it leaves the call ringing until the
/// caller gives up.
pub struct IncomingCall {
    pub from: UserId,
    pub mode: CallMode,
    handle: CallHandle,
}

impl IncomingCall {
    pub(crate) fn new(from: UserId, mode: CallMode, handle: CallHandle) -> Self {
        Self { from, mode, handle }
    }

    /// Accept the call: local media is acquired for the answering mode and
    /// a `CallAnswer` goes back to the offerer.
    pub async fn accept(self) -> Result<(), CallError> {
        self.handle.accept_incoming(self.from).await
    }

    /// Decline: the offerer receives a `CallEnd` and the stored offer is
    /// discarded.
    pub async fn reject(self) {
        self.handle.reject_incoming(self.from).await;
    }
}

impl fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingCall")
            .field("from", &self.from)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Callback trait for UI-facing call events.
///
/// This is the integration point between the negotiation core and the
/// rendering layer (call buttons, incoming-call prompt, video elements).
#[async_trait]
pub trait CallObserver: Send + Sync {
    /// An offer arrived from a peer we are not already in a call with.
    async fn on_incoming_call(&self, invitation: IncomingCall);

    /// The session was established or torn down.
    async fn on_call_state(&self, update: CallStateUpdate);

    /// The remote peer's media arrived; hand the track to the renderer.
    async fn on_remote_track(&self, track: RemoteTrackHandle);

    /// Remote mute indicator flipped.
    async fn on_remote_mic_muted(&self, muted: bool);

    /// Remote camera indicator flipped.
    async fn on_remote_camera_off(&self, off: bool);

    /// A user-visible failure (see [`CallError::is_user_visible`]);
    /// connectivity detail arrives here only as the call ending.
    async fn on_error(&self, error: CallError);
}
