//! Call manager: the orchestration core.
//!
//! One [`CallManager`] task owns the single active [`CallSession`] and
//! serializes every mutation against it. External events (local UI
//! actions, inbound signaling, engine notifications) all become commands
//! processed one at a time, which is what rules out the races a callback
//! soup invites: duplicate processing, lost candidates, reentrant hang-ups.
//!
//! The suspension points (media acquisition, SDP creation, description
//! application) are cancellation-aware. Session-replacing entry points bump
//! an epoch counter at enqueue time; an in-flight step observes the bump,
//! abandons the attempt, and any media stream that resolves afterwards is
//! stopped instead of being attached to a dead engine.

use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Notify, mpsc, oneshot};

use crate::candidate::IceCandidateDescriptor;
use crate::config::CallConfig;
use crate::engine::{
    ConnectionState, EngineError, EngineEvent, EngineEventSink, EngineFactory, NegotiationEngine,
    SessionDescription,
};
use crate::error::CallError;
use crate::events::{CallObserver, CallStateUpdate, IncomingCall};
use crate::gateway::SignalingGateway;
use crate::media::{LocalMedia, MediaError, MediaProvider, RemoteTrackHandle, TrackKind};
use crate::side_channel::StatusMessage;
use crate::signaling::{SignalingMessage, UserId};
use crate::state::{
    CallEndReason, CallMode, CallPhase, CallRole, CallSession, CallTransition, StoredOffer,
};

/// Epoch counter shared between the public handle and the actor. Bumping it
/// invalidates whatever negotiation step is currently suspended.
#[derive(Debug, Default)]
struct AbortSignal {
    epoch: AtomicU64,
    notify: Notify,
}

impl AbortSignal {
    fn current(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.current() != epoch
    }

    async fn invalidated(&self, epoch: u64) {
        loop {
            let notified = self.notify.notified();
            if self.is_stale(epoch) {
                return;
            }
            notified.await;
        }
    }
}

enum Command {
    StartCall {
        remote: UserId,
        mode: CallMode,
        done: oneshot::Sender<Result<(), CallError>>,
    },
    AcceptIncoming {
        from: UserId,
        done: oneshot::Sender<Result<(), CallError>>,
    },
    RejectIncoming {
        from: UserId,
        done: oneshot::Sender<()>,
    },
    EndCall {
        notify_remote: bool,
        done: Option<oneshot::Sender<()>>,
    },
    ToggleMic {
        done: oneshot::Sender<bool>,
    },
    ToggleCamera {
        done: oneshot::Sender<bool>,
    },
    IsInCall {
        done: oneshot::Sender<bool>,
    },
    Signal {
        from: UserId,
        message: SignalingMessage,
    },
}

/// Events relayed to the observer on a dedicated task, in order, so the
/// command loop never blocks on UI code and the UI may call straight back
/// into the handle.
enum ObserverEvent {
    IncomingCall(IncomingCall),
    State(CallStateUpdate),
    RemoteTrack(RemoteTrackHandle),
    RemoteMicMuted(bool),
    RemoteCameraOff(bool),
    Error(CallError),
}

async fn pump_observer(
    observer: Arc<dyn CallObserver>,
    mut events: mpsc::UnboundedReceiver<ObserverEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ObserverEvent::IncomingCall(invitation) => observer.on_incoming_call(invitation).await,
            ObserverEvent::State(update) => observer.on_call_state(update).await,
            ObserverEvent::RemoteTrack(track) => observer.on_remote_track(track).await,
            ObserverEvent::RemoteMicMuted(muted) => observer.on_remote_mic_muted(muted).await,
            ObserverEvent::RemoteCameraOff(off) => observer.on_remote_camera_off(off).await,
            ObserverEvent::Error(error) => observer.on_error(error).await,
        }
    }
}

/// Cloneable public surface of the call manager.
///
/// Methods enqueue a command and, where a result is meaningful, await its
/// completion. [`CallHandle::handle_signal`] is the fire-and-forget entry
/// the signaling gateway drives with inbound messages.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    abort: Arc<AbortSignal>,
}

impl CallHandle {
    /// Start an outgoing call. Any prior session is torn down first; a new
    /// call always wins over a stale one.
    pub async fn start_call(
        &self,
        remote: UserId,
        mode: CallMode,
    ) -> Result<(), CallError> {
        self.abort.bump();
        let (done, result) = oneshot::channel();
        self.commands
            .send(Command::StartCall { remote, mode, done })
            .map_err(|_| CallError::NotRunning)?;
        result.await.map_err(|_| CallError::NotRunning)?
    }

    /// Hang up the current call, notifying the remote peer. A no-op when no
    /// call is active; calling it twice sends exactly one `CallEnd`.
    pub async fn end_call(&self) {
        self.abort.bump();
        let (done, result) = oneshot::channel();
        if self
            .commands
            .send(Command::EndCall {
                notify_remote: true,
                done: Some(done),
            })
            .is_ok()
        {
            let _ = result.await;
        }
    }

    /// Flip the local microphone. Returns the resulting muted state.
    pub async fn toggle_mic(&self) -> bool {
        let (done, result) = oneshot::channel();
        if self.commands.send(Command::ToggleMic { done }).is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }

    /// Flip the local camera. Returns the resulting camera-off state.
    pub async fn toggle_camera(&self) -> bool {
        let (done, result) = oneshot::channel();
        if self.commands.send(Command::ToggleCamera { done }).is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }

    /// Whether a call is live (offer out or answered). A session still
    /// ringing for the user's decision does not count.
    pub async fn is_in_call(&self) -> bool {
        let (done, result) = oneshot::channel();
        if self.commands.send(Command::IsInCall { done }).is_err() {
            return false;
        }
        result.await.unwrap_or(false)
    }

    /// Feed one inbound signaling message, tagged with the authenticated
    /// sender. Messages are processed strictly in arrival order.
    pub fn handle_signal(&self, from: UserId, message: SignalingMessage) {
        if matches!(message, SignalingMessage::CallEnd { .. }) {
            // A remote hang-up cancels in-flight negotiation steps too.
            self.abort.bump();
        }
        let _ = self.commands.send(Command::Signal { from, message });
    }

    pub(crate) async fn accept_incoming(&self, from: UserId) -> Result<(), CallError> {
        // Accepting cancels any in-progress negotiation outright.
        self.abort.bump();
        let (done, result) = oneshot::channel();
        self.commands
            .send(Command::AcceptIncoming { from, done })
            .map_err(|_| CallError::NotRunning)?;
        result.await.map_err(|_| CallError::NotRunning)?
    }

    pub(crate) async fn reject_incoming(&self, from: UserId) {
        let (done, result) = oneshot::channel();
        if self
            .commands
            .send(Command::RejectIncoming { from, done })
            .is_ok()
        {
            let _ = result.await;
        }
    }
}

/// Spawns the call manager task and returns its handle.
pub struct CallManager;

impl CallManager {
    pub fn spawn(
        gateway: Arc<dyn SignalingGateway>,
        media: Arc<dyn MediaProvider>,
        engines: Arc<dyn EngineFactory>,
        config: CallConfig,
    ) -> CallHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let abort = Arc::new(AbortSignal::default());

        let observer_tx = config.observer.clone().map(|observer| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(pump_observer(observer, rx));
            tx
        });

        let handle = CallHandle {
            commands: command_tx.clone(),
            abort: Arc::clone(&abort),
        };

        let mut actor = CallActor {
            config,
            gateway,
            media,
            engines,
            commands: command_rx,
            commands_weak: command_tx.downgrade(),
            engine_events_tx: engine_tx,
            engine_events: engine_rx,
            observer_tx,
            abort,
            session: None,
            pending_invite: None,
            rounds: 0,
        };
        tokio::spawn(async move { actor.run().await });

        handle
    }
}

struct CallActor {
    config: CallConfig,
    gateway: Arc<dyn SignalingGateway>,
    media: Arc<dyn MediaProvider>,
    engines: Arc<dyn EngineFactory>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// For minting invitation handles without keeping the command channel
    /// alive once every external handle is gone.
    commands_weak: mpsc::WeakUnboundedSender<Command>,
    engine_events_tx: mpsc::UnboundedSender<(u64, EngineEvent)>,
    engine_events: mpsc::UnboundedReceiver<(u64, EngineEvent)>,
    observer_tx: Option<mpsc::UnboundedSender<ObserverEvent>>,
    abort: Arc<AbortSignal>,
    session: Option<CallSession>,
    /// Offer from a peer other than the current remote, waiting on the
    /// user; accepting it replaces the live session.
    pending_invite: Option<StoredOffer>,
    rounds: u64,
}

impl CallActor {
    async fn run(&mut self) {
        debug!("call manager started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = self.engine_events.recv() => {
                    if let Some((round, event)) = event {
                        self.handle_engine_event(round, event).await;
                    }
                }
            }
        }
        self.teardown(false, CallEndReason::Superseded).await;
        debug!("call manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall { remote, mode, done } => {
                let result = self.start_call(remote, mode).await;
                let _ = done.send(result);
            }
            Command::AcceptIncoming { from, done } => {
                let result = self.accept_pending(from).await;
                let _ = done.send(result);
            }
            Command::RejectIncoming { from, done } => {
                self.reject_pending(from).await;
                let _ = done.send(());
            }
            Command::EndCall {
                notify_remote,
                done,
            } => {
                self.teardown(notify_remote, CallEndReason::LocalHangUp).await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Command::ToggleMic { done } => {
                let _ = done.send(self.toggle_track(TrackKind::Audio));
            }
            Command::ToggleCamera { done } => {
                let _ = done.send(self.toggle_track(TrackKind::Video));
            }
            Command::IsInCall { done } => {
                let in_call = self.session.as_ref().is_some_and(|s| s.signaled);
                let _ = done.send(in_call);
            }
            Command::Signal { from, message } => self.dispatch_signal(from, message).await,
        }
    }

    /// Inbound signaling dispatch, in arrival order.
    async fn dispatch_signal(&mut self, from: UserId, message: SignalingMessage) {
        debug!("received {} from user {}", message.tag(), from);
        match message {
            SignalingMessage::CallOffer { mode, sdp, .. } => {
                self.handle_offer(StoredOffer { from, mode, sdp }).await;
            }
            SignalingMessage::CallAnswer { sdp, .. } => self.handle_answer(from, sdp).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.handle_candidate(from, candidate).await;
            }
            SignalingMessage::CallEnd { .. } => {
                if self
                    .pending_invite
                    .take_if(|offer| offer.from == from)
                    .is_some()
                {
                    debug!("user {} withdrew their offer", from);
                }
                // A teardown we were told about is never echoed back.
                self.teardown(false, CallEndReason::RemoteHangUp).await;
            }
        }
    }

    async fn handle_offer(&mut self, offer: StoredOffer) {
        if self
            .session
            .as_ref()
            .is_some_and(|session| session.accepts_renegotiation_from(offer.from))
        {
            // Mid-call mode switch from the peer we are talking to: applied
            // silently, no user prompt.
            info!(
                "renegotiation offer from user {} ({} mode)",
                offer.from, offer.mode
            );
            if let Some(session) = self.session.as_mut()
                && matches!(session.phase, CallPhase::Connected { .. })
                && let Err(err) = session.apply_transition(CallTransition::RenegotiationStarted)
            {
                warn!("cannot renegotiate: {}", err);
                return;
            }
            let _ = self.accept_offer(offer).await;
            return;
        }

        let (from, mode) = (offer.from, offer.mode);
        let Some(commands) = self.commands_weak.upgrade() else {
            debug!("dropping offer from user {}: manager shutting down", from);
            return;
        };
        let invitation = IncomingCall::new(
            from,
            mode,
            CallHandle {
                commands,
                abort: Arc::clone(&self.abort),
            },
        );

        if self.session.is_none() {
            self.session = Some(CallSession::new_incoming(offer));
            info!("incoming {} call from user {}", mode, from);
        } else {
            // Busy with another peer; keep the live call, let the user
            // decide whether the new one replaces it.
            self.pending_invite = Some(offer);
            info!("incoming {} call from user {} while in a call", mode, from);
        }
        self.notify(ObserverEvent::IncomingCall(invitation));
    }

    /// Start an outgoing call: fresh engine, local media, offer out.
    async fn start_call(
        &mut self,
        remote: UserId,
        mode: CallMode,
    ) -> Result<(), CallError> {
        let epoch = self.abort.current();
        info!("starting {} call to user {}", mode, remote);

        // A new call always wins over whatever was in flight.
        self.teardown(false, CallEndReason::Superseded).await;

        let round = self.next_round();
        let engine = match self.engines.create(
            &self.config.ice_servers,
            EngineEventSink::new(round, self.engine_events_tx.clone()),
        ) {
            Ok(engine) => engine,
            Err(err) => {
                let err = CallError::EngineCreate(err);
                self.report(&err);
                return Err(err);
            }
        };

        let mut session = CallSession::new_outgoing(remote, mode, round);
        session.engine = Some(Arc::clone(&engine));
        self.session = Some(session);

        let stream = match acquire_local_media(&self.abort, &self.media, mode, epoch).await {
            Ok(stream) => stream,
            Err(CallError::Superseded) => return Err(CallError::Superseded),
            Err(err) => {
                // Nothing was signaled yet; fold the attempt without a peer
                // notification.
                self.report(&err);
                self.teardown(false, CallEndReason::MediaUnavailable).await;
                return Err(err);
            }
        };
        engine.attach_local_tracks(Arc::clone(&stream));
        if let Some(session) = self.session.as_mut() {
            session.local_media = Some(stream);
        }

        let offer = match engine_step(
            &self.abort,
            epoch,
            engine.create_offer(),
            CallError::OfferCreation,
        )
        .await
        {
            Ok(offer) => offer,
            Err(err) => return Err(self.fail_negotiation(err).await),
        };
        if let Err(err) = engine_step(
            &self.abort,
            epoch,
            engine.set_local_description(offer.clone()),
            CallError::SetLocalDescription,
        )
        .await
        {
            return Err(self.fail_negotiation(err).await);
        }

        self.send_signal(SignalingMessage::CallOffer {
            to: remote,
            mode,
            sdp: offer,
        })
        .await;
        if let Some(session) = self.session.as_mut() {
            session.signaled = true;
        }
        self.notify(ObserverEvent::State(CallStateUpdate {
            in_call: true,
            role: Some(CallRole::Caller),
        }));
        Ok(())
    }

    /// Resolve a user's accept of a stored offer: either the ringing
    /// session, or a call-waiting invite that replaces the live call.
    async fn accept_pending(&mut self, from: UserId) -> Result<(), CallError> {
        if let Some(session) = self.session.as_mut()
            && session.remote == from
            && session.phase.is_ringing()
        {
            let Some(offer) = session.pending_offer.take() else {
                warn!("ringing session for user {} has no stored offer", from);
                return Err(CallError::NoSession);
            };
            return self.accept_offer(offer).await;
        }

        if let Some(invite) = self.pending_invite.take_if(|offer| offer.from == from) {
            self.teardown(false, CallEndReason::Superseded).await;
            self.session = Some(CallSession::new_incoming(invite.clone()));
            return self.accept_offer(invite).await;
        }

        debug!("stale accept for user {}: call already gone", from);
        Err(CallError::NoSession)
    }

    async fn reject_pending(&mut self, from: UserId) {
        let ringing = self
            .session
            .as_ref()
            .is_some_and(|session| session.remote == from && session.phase.is_ringing());
        if ringing {
            self.session = None;
        } else if self
            .pending_invite
            .take_if(|offer| offer.from == from)
            .is_none()
        {
            debug!("stale reject for user {}: call already gone", from);
            return;
        }
        info!("rejected incoming call from user {}", from);
        self.send_signal(SignalingMessage::CallEnd { to: from }).await;
    }

    /// Apply a stored offer: fresh engine (buffered candidates survive the
    /// swap), remote description, queue replay, local media, answer out.
    async fn accept_offer(&mut self, offer: StoredOffer) -> Result<(), CallError> {
        let epoch = self.abort.current();
        let (from, mode) = (offer.from, offer.mode);
        info!("accepting {} offer from user {}", mode, from);

        let round = self.next_round();
        let preserved = {
            let Some(session) = self.session.as_mut() else {
                return Err(CallError::NoSession);
            };
            session.pending_offer = None;
            if let Some(old) = session.engine.take() {
                // Round-specific negotiation state dies with the engine; the
                // queued candidates must not.
                old.close();
            }
            if let Some(old) = session.local_media.take() {
                // Renegotiation reacquires capture for the new mode.
                old.stop();
            }
            session.round = round;
            session.remote_description_applied = false;
            session.mode = mode;
            session.mute_video.camera_off = false;
            session.mute_video.remote_mic_muted = false;
            session.mute_video.remote_camera_off = false;
            session.queue.take()
        };

        let engine = match self.engines.create(
            &self.config.ice_servers,
            EngineEventSink::new(round, self.engine_events_tx.clone()),
        ) {
            Ok(engine) => engine,
            Err(err) => {
                let err = CallError::EngineCreate(err);
                return Err(self.fail_negotiation(err).await);
            }
        };
        if let Some(session) = self.session.as_mut() {
            session.engine = Some(Arc::clone(&engine));
            session.queue = preserved;
        }

        if let Err(err) = engine_step(
            &self.abort,
            epoch,
            engine.set_remote_description(offer.sdp),
            CallError::SetRemoteDescription,
        )
        .await
        {
            return Err(self.fail_negotiation(err).await);
        }
        if let Some(session) = self.session.as_mut() {
            session.remote_description_applied = true;
        }
        // Everything buffered replays before the answer is created, so
        // candidates gathered out-of-band cannot lose the race.
        self.drain_candidate_queue().await;

        match acquire_local_media(&self.abort, &self.media, mode.answer_mode(), epoch).await {
            Ok(stream) => {
                engine.attach_local_tracks(Arc::clone(&stream));
                if let Some(session) = self.session.as_mut() {
                    session.local_media = Some(stream);
                }
            }
            Err(CallError::Superseded) => return Err(CallError::Superseded),
            Err(err) => {
                // Non-fatal on the answering side: continue receive-only so
                // the caller still gets through.
                warn!("answering without local media: {}", err);
                self.report(&err);
            }
        }

        let answer = match engine_step(
            &self.abort,
            epoch,
            engine.create_answer(),
            CallError::AnswerCreation,
        )
        .await
        {
            Ok(answer) => answer,
            Err(err) => return Err(self.fail_negotiation(err).await),
        };
        if let Err(err) = engine_step(
            &self.abort,
            epoch,
            engine.set_local_description(answer.clone()),
            CallError::SetLocalDescription,
        )
        .await
        {
            return Err(self.fail_negotiation(err).await);
        }

        self.send_signal(SignalingMessage::CallAnswer {
            to: from,
            sdp: answer,
        })
        .await;

        let mut role = CallRole::Callee;
        if let Some(session) = self.session.as_mut() {
            session.signaled = true;
            let transition = if session.phase.is_ringing() {
                CallTransition::Accepted
            } else {
                CallTransition::RenegotiationCompleted
            };
            if let Err(err) = session.apply_transition(transition) {
                warn!("{}", err);
            }
            role = session.role;
            info!("call with user {} connected", session.remote);
        }
        self.notify(ObserverEvent::State(CallStateUpdate {
            in_call: true,
            role: Some(role),
        }));
        Ok(())
    }

    /// Caller side: the peer answered our offer.
    async fn handle_answer(&mut self, from: UserId, sdp: SessionDescription) {
        let epoch = self.abort.current();
        let engine = match self.session.as_ref() {
            Some(session)
                if session.remote == from
                    && session.role == CallRole::Caller
                    && matches!(session.phase, CallPhase::Calling { .. }) =>
            {
                match session.engine.clone() {
                    Some(engine) => engine,
                    None => {
                        warn!(
                            "answer from user {} but no negotiation engine; ignoring",
                            from
                        );
                        return;
                    }
                }
            }
            _ => {
                warn!("unexpected answer from user {}; no outbound call to them", from);
                return;
            }
        };

        match engine_step(
            &self.abort,
            epoch,
            engine.set_remote_description(sdp),
            CallError::SetRemoteDescription,
        )
        .await
        {
            Ok(()) => {}
            Err(CallError::Superseded) => return,
            Err(err) => {
                self.fail_negotiation(err).await;
                return;
            }
        }
        if let Some(session) = self.session.as_mut() {
            session.remote_description_applied = true;
        }
        self.drain_candidate_queue().await;

        if let Some(session) = self.session.as_mut() {
            if let Err(err) = session.apply_transition(CallTransition::AnswerReceived) {
                warn!("{}", err);
                return;
            }
            info!("call with user {} connected", session.remote);
        }
    }

    /// Apply-or-queue for one inbound candidate.
    async fn handle_candidate(&mut self, from: UserId, candidate: IceCandidateDescriptor) {
        let Some(session) = self.session.as_mut() else {
            // Expected after a teardown raced the peer's gathering.
            debug!("stale ice candidate from user {} (no session)", from);
            return;
        };
        if session.remote != from {
            debug!(
                "stale ice candidate from user {} (current call is with user {})",
                from, session.remote
            );
            return;
        }

        let engine = match &session.engine {
            Some(engine) if session.remote_description_applied => Arc::clone(engine),
            _ => {
                session.queue.push(candidate);
                debug!(
                    "queued ice candidate from user {} ({} pending)",
                    from,
                    session.queue.len()
                );
                return;
            }
        };
        self.apply_candidate(&engine, candidate).await;
    }

    async fn drain_candidate_queue(&mut self) {
        let (engine, candidates, remote) = {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            let Some(engine) = session.engine.clone() else {
                return;
            };
            (engine, session.queue.drain(), session.remote)
        };
        if candidates.is_empty() {
            return;
        }
        debug!(
            "replaying {} queued candidates for user {}",
            candidates.len(),
            remote
        );
        for candidate in candidates {
            self.apply_candidate(&engine, candidate).await;
        }
    }

    async fn apply_candidate(
        &mut self,
        engine: &Arc<dyn NegotiationEngine>,
        candidate: IceCandidateDescriptor,
    ) {
        if let Err(rejection) = candidate.validate(engine.remote_ufrag().as_deref()) {
            warn!("discarding ice candidate: {}", rejection);
            return;
        }
        if let Err(err) = engine.add_ice_candidate(&candidate).await {
            // One rejected candidate never aborts the session; connectivity
            // may still come through another path.
            self.report(&CallError::CandidateRejected(err));
        }
    }

    fn toggle_track(&mut self, kind: TrackKind) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let currently_off = match kind {
            TrackKind::Audio => session.mute_video.mic_muted,
            TrackKind::Video => session.mute_video.camera_off,
        };
        let Some(media) = session.local_media.clone() else {
            return currently_off;
        };

        let now_off = !currently_off;
        if !media.set_track_enabled(kind, !now_off) {
            return currently_off;
        }
        let status = match kind {
            TrackKind::Audio => {
                session.mute_video.mic_muted = now_off;
                StatusMessage::MicStatus { muted: now_off }
            }
            TrackKind::Video => {
                session.mute_video.camera_off = now_off;
                StatusMessage::VideoStatus { off: now_off }
            }
        };

        if let Some(engine) = &session.engine {
            if engine.side_channel_open() {
                if let Err(err) = engine.send_status(&status) {
                    debug!("status message not delivered: {}", err);
                }
            } else {
                // Fire-and-forget: the toggle holds locally, the peer just
                // misses the indicator until the channel reopens.
                debug!("side channel closed; {} indicator not mirrored", kind);
            }
        }
        now_off
    }

    async fn handle_engine_event(&mut self, round: u64, event: EngineEvent) {
        let (current_round, remote) = match self.session.as_ref() {
            Some(session) => (session.round, session.remote),
            None => {
                debug!("dropping engine event from round {} (no session)", round);
                return;
            }
        };
        if current_round != round {
            debug!(
                "dropping engine event from superseded round {} (current {})",
                round, current_round
            );
            return;
        }

        match event {
            EngineEvent::IceCandidateGenerated(candidate) => {
                self.send_signal(SignalingMessage::IceCandidate {
                    to: remote,
                    candidate,
                })
                .await;
            }
            EngineEvent::RemoteTrack(track) => {
                debug!("remote {} track {}", track.kind, track.id);
                self.notify(ObserverEvent::RemoteTrack(track));
            }
            EngineEvent::ConnectionStateChanged(state) => {
                info!("peer connection state: {}", state);
                match state {
                    ConnectionState::Failed => {
                        // Surfaces to the user only as the call ending; the
                        // diagnostics here are for the logs.
                        self.report(&CallError::ConnectionFailed);
                        self.teardown(false, CallEndReason::ConnectionFailed).await;
                    }
                    ConnectionState::Disconnected => {
                        warn!("peer connection to user {} degraded", remote);
                    }
                    _ => {}
                }
            }
            EngineEvent::StatusReceived(StatusMessage::MicStatus { muted }) => {
                if let Some(session) = self.session.as_mut() {
                    session.mute_video.remote_mic_muted = muted;
                }
                self.notify(ObserverEvent::RemoteMicMuted(muted));
            }
            EngineEvent::StatusReceived(StatusMessage::VideoStatus { off }) => {
                if let Some(session) = self.session.as_mut() {
                    session.mute_video.remote_camera_off = off;
                }
                self.notify(ObserverEvent::RemoteCameraOff(off));
            }
        }
    }

    /// Tear the session down. Idempotent; every cleanup step runs even when
    /// an earlier one fails, because a half-closed session is worse than a
    /// fully-closed one. `notify_remote` is true only when the hang-up
    /// originates locally.
    async fn teardown(&mut self, notify_remote: bool, reason: CallEndReason) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let remote = session.remote;
        let announced = session.signaled;
        info!(
            "ending call with user {} ({:?}, notify_remote={})",
            remote, reason, notify_remote
        );

        if let Some(media) = session.local_media.take() {
            media.stop();
        }
        if let Some(engine) = session.engine.take() {
            engine.close();
        }
        let dropped = session.queue.drain().len();
        if dropped > 0 {
            debug!("discarded {} queued candidates", dropped);
        }
        if let Err(err) = session.apply_transition(CallTransition::Terminated { reason }) {
            debug!("{}", err);
        }

        if notify_remote {
            self.send_signal(SignalingMessage::CallEnd { to: remote }).await;
        }
        if announced {
            self.notify(ObserverEvent::State(CallStateUpdate {
                in_call: false,
                role: None,
            }));
        }
    }

    /// Abort the current attempt over a fatal negotiation error. The remote
    /// is notified only when an offer or answer already went out.
    async fn fail_negotiation(&mut self, err: CallError) -> CallError {
        if matches!(err, CallError::Superseded) {
            return err;
        }
        self.report(&err);
        let notify = self.session.as_ref().is_some_and(|s| s.signaled);
        self.teardown(notify, CallEndReason::NegotiationFailed).await;
        err
    }

    fn report(&self, error: &CallError) {
        if error.is_user_visible() {
            warn!("call failed: {}", error);
            self.notify(ObserverEvent::Error(error.clone()));
        } else {
            warn!("{}", error);
        }
    }

    async fn send_signal(&self, message: SignalingMessage) {
        if !self.gateway.is_open() {
            warn!(
                "dropping {} to user {}: signaling channel not open",
                message.tag(),
                message.to()
            );
            return;
        }
        debug!("sending {} to user {}", message.tag(), message.to());
        if let Err(err) = self.gateway.send(&message).await {
            warn!(
                "failed to send {} to user {}: {}",
                message.tag(),
                message.to(),
                err
            );
        }
    }

    fn notify(&self, event: ObserverEvent) {
        if let Some(tx) = &self.observer_tx {
            let _ = tx.send(event);
        }
    }

    fn next_round(&mut self) -> u64 {
        self.rounds += 1;
        self.rounds
    }
}

/// Run one engine step under epoch invalidation. A bump while suspended
/// abandons the step; the result of a stale step is never applied.
async fn engine_step<T>(
    abort: &AbortSignal,
    epoch: u64,
    step: impl Future<Output = Result<T, EngineError>>,
    wrap: fn(EngineError) -> CallError,
) -> Result<T, CallError> {
    tokio::select! {
        _ = abort.invalidated(epoch) => Err(CallError::Superseded),
        result = step => {
            if abort.is_stale(epoch) {
                Err(CallError::Superseded)
            } else {
                result.map_err(wrap)
            }
        }
    }
}

/// Acquire local media on its own task so an abandoned attempt can still
/// stop the stream once capture eventually resolves.
async fn acquire_local_media(
    abort: &AbortSignal,
    provider: &Arc<dyn MediaProvider>,
    mode: CallMode,
    epoch: u64,
) -> Result<Arc<dyn LocalMedia>, CallError> {
    let provider = Arc::clone(provider);
    let mut capture = tokio::spawn(async move { provider.acquire(mode).await });

    tokio::select! {
        _ = abort.invalidated(epoch) => {
            debug!("media acquisition abandoned; will stop the stream on arrival");
            tokio::spawn(async move {
                if let Ok(Ok(stream)) = capture.await {
                    stream.stop();
                }
            });
            Err(CallError::Superseded)
        }
        result = &mut capture => match result {
            Ok(Ok(stream)) => {
                if abort.is_stale(epoch) {
                    stream.stop();
                    Err(CallError::Superseded)
                } else {
                    Ok(stream)
                }
            }
            Ok(Err(err)) => Err(CallError::Media(err)),
            Err(join_err) => Err(CallError::Media(MediaError::Capture(join_err.to_string()))),
        }
    }
}
