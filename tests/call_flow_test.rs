//! End-to-end call flows against mock gateway, media, and engine
//! implementations.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use call_core::{
    CallConfig, CallError, CallHandle, CallManager, CallMode, CallObserver, CallStateUpdate,
    ConnectionState, EngineError, EngineEvent, EngineEventSink, EngineFactory,
    IceCandidateDescriptor, IceServerConfig, IncomingCall, LocalMedia, MediaError, MediaProvider,
    NegotiationEngine, RemoteTrackHandle, SessionDescription, SignalingGateway, SignalingMessage,
    StatusMessage, TrackKind, TransportError, UserId,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

// ---- mock collaborators ----

#[derive(Default)]
struct MockGateway {
    closed: AtomicBool,
    sent: Mutex<Vec<SignalingMessage>>,
}

impl MockGateway {
    fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_call_ends(&self) -> usize {
        self.sent()
            .iter()
            .filter(|m| matches!(m, SignalingMessage::CallEnd { .. }))
            .count()
    }
}

#[async_trait]
impl SignalingGateway for MockGateway {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &SignalingMessage) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

struct MockMedia {
    mode: CallMode,
    stopped: AtomicBool,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
}

impl MockMedia {
    fn new(mode: CallMode) -> Self {
        Self {
            mode,
            stopped: AtomicBool::new(false),
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
        }
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalMedia for MockMedia {
    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        match kind {
            TrackKind::Audio => {
                self.audio_enabled.store(enabled, Ordering::SeqCst);
                true
            }
            TrackKind::Video => {
                if self.mode == CallMode::Audio {
                    return false;
                }
                self.video_enabled.store(enabled, Ordering::SeqCst);
                true
            }
        }
    }

    fn has_track(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => true,
            TrackKind::Video => self.mode != CallMode::Audio,
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockMediaProvider {
    fail: Mutex<Option<MediaError>>,
    acquired: Mutex<Vec<(CallMode, Arc<MockMedia>)>>,
}

impl MockMediaProvider {
    fn fail_with(&self, err: MediaError) {
        *self.fail.lock().unwrap() = Some(err);
    }

    fn acquired_modes(&self) -> Vec<CallMode> {
        self.acquired.lock().unwrap().iter().map(|(m, _)| *m).collect()
    }

    fn last_media(&self) -> Arc<MockMedia> {
        let acquired = self.acquired.lock().unwrap();
        Arc::clone(&acquired.last().expect("no media acquired").1)
    }
}

#[async_trait]
impl MediaProvider for MockMediaProvider {
    async fn acquire(&self, mode: CallMode) -> Result<Arc<dyn LocalMedia>, MediaError> {
        if let Some(err) = self.fail.lock().unwrap().clone() {
            return Err(err);
        }
        let media = Arc::new(MockMedia::new(mode));
        self.acquired.lock().unwrap().push((mode, Arc::clone(&media)));
        Ok(media)
    }
}

struct MockEngine {
    sink: EngineEventSink,
    ops: Mutex<Vec<String>>,
    remote_ufrag: Mutex<Option<String>>,
    side_open: AtomicBool,
    statuses: Mutex<Vec<StatusMessage>>,
    closed: AtomicBool,
    fail_remote_description: AtomicBool,
}

impl MockEngine {
    fn new(sink: EngineEventSink) -> Self {
        Self {
            sink,
            ops: Mutex::new(Vec::new()),
            remote_ufrag: Mutex::new(None),
            side_open: AtomicBool::new(true),
            statuses: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_remote_description: AtomicBool::new(false),
        }
    }

    fn push_op(&self, op: impl Into<String>) {
        self.ops.lock().unwrap().push(op.into());
    }

    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn applied_candidates(&self) -> Vec<String> {
        self.ops()
            .iter()
            .filter_map(|op| op.strip_prefix("add_candidate:").map(str::to_string))
            .collect()
    }

    fn statuses(&self) -> Vec<StatusMessage> {
        self.statuses.lock().unwrap().clone()
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_remote_ufrag(&self, ufrag: &str) {
        *self.remote_ufrag.lock().unwrap() = Some(ufrag.to_string());
    }

    fn emit(&self, event: EngineEvent) {
        self.sink.emit(event);
    }
}

#[async_trait]
impl NegotiationEngine for MockEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.push_op("create_offer");
        Ok(SessionDescription::offer("mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.push_op("create_answer");
        Ok(SessionDescription::answer("mock-answer"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.push_op(format!("set_local_description:{}", description.sdp));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        if self.fail_remote_description.load(Ordering::SeqCst) {
            return Err(EngineError::new("forced remote description failure"));
        }
        self.push_op(format!("set_remote_description:{}", description.sdp));
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: &IceCandidateDescriptor,
    ) -> Result<(), EngineError> {
        self.push_op(format!("add_candidate:{}", candidate.candidate));
        Ok(())
    }

    fn attach_local_tracks(&self, _media: Arc<dyn LocalMedia>) {
        self.push_op("attach_local_tracks");
    }

    fn remote_ufrag(&self) -> Option<String> {
        self.remote_ufrag.lock().unwrap().clone()
    }

    fn side_channel_open(&self) -> bool {
        self.side_open.load(Ordering::SeqCst)
    }

    fn send_status(&self, status: &StatusMessage) -> Result<(), EngineError> {
        self.statuses.lock().unwrap().push(*status);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockEngineFactory {
    engines: Mutex<Vec<Arc<MockEngine>>>,
    fail: AtomicBool,
}

impl MockEngineFactory {
    fn count(&self) -> usize {
        self.engines.lock().unwrap().len()
    }

    fn last(&self) -> Arc<MockEngine> {
        let engines = self.engines.lock().unwrap();
        Arc::clone(engines.last().expect("no engine created"))
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(
        &self,
        _ice_servers: &[IceServerConfig],
        events: EngineEventSink,
    ) -> Result<Arc<dyn NegotiationEngine>, EngineError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::new("engine create refused"));
        }
        let engine = Arc::new(MockEngine::new(events));
        self.engines.lock().unwrap().push(Arc::clone(&engine));
        Ok(engine)
    }
}

#[derive(Default)]
struct RecordingObserver {
    invites: Mutex<Vec<(UserId, CallMode)>>,
    invitation: Mutex<Option<IncomingCall>>,
    states: Mutex<Vec<CallStateUpdate>>,
    errors: Mutex<Vec<CallError>>,
    remote_mic: Mutex<Vec<bool>>,
    remote_cam: Mutex<Vec<bool>>,
    tracks: Mutex<Vec<RemoteTrackHandle>>,
}

impl RecordingObserver {
    fn invite_count(&self) -> usize {
        self.invites.lock().unwrap().len()
    }

    fn take_invitation(&self) -> Option<IncomingCall> {
        self.invitation.lock().unwrap().take()
    }

    fn states(&self) -> Vec<CallStateUpdate> {
        self.states.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<CallError> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallObserver for RecordingObserver {
    async fn on_incoming_call(&self, invitation: IncomingCall) {
        self.invites
            .lock()
            .unwrap()
            .push((invitation.from, invitation.mode));
        *self.invitation.lock().unwrap() = Some(invitation);
    }

    async fn on_call_state(&self, update: CallStateUpdate) {
        self.states.lock().unwrap().push(update);
    }

    async fn on_remote_track(&self, track: RemoteTrackHandle) {
        self.tracks.lock().unwrap().push(track);
    }

    async fn on_remote_mic_muted(&self, muted: bool) {
        self.remote_mic.lock().unwrap().push(muted);
    }

    async fn on_remote_camera_off(&self, off: bool) {
        self.remote_cam.lock().unwrap().push(off);
    }

    async fn on_error(&self, error: CallError) {
        self.errors.lock().unwrap().push(error);
    }
}

// ---- harness ----

struct Harness {
    gateway: Arc<MockGateway>,
    media: Arc<MockMediaProvider>,
    engines: Arc<MockEngineFactory>,
    observer: Arc<RecordingObserver>,
    handle: CallHandle,
}

impl Harness {
    fn new() -> Self {
        init_logging();
        let gateway = Arc::new(MockGateway::default());
        let media = Arc::new(MockMediaProvider::default());
        let engines = Arc::new(MockEngineFactory::default());
        let observer = Arc::new(RecordingObserver::default());
        let handle = CallManager::spawn(
            gateway.clone(),
            media.clone(),
            engines.clone(),
            CallConfig::new().with_observer(observer.clone()),
        );
        Self {
            gateway,
            media,
            engines,
            observer,
            handle,
        }
    }

    /// Drive one query through the actor so everything enqueued before it
    /// is known to be processed.
    async fn settle(&self) {
        let _ = self.handle.is_in_call().await;
    }

    async fn wait_invitation(&self) -> IncomingCall {
        for _ in 0..500 {
            if let Some(invitation) = self.observer.take_invitation() {
                return invitation;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("no incoming-call invitation arrived");
    }

    /// Caller-side call to `remote`, answered by the peer.
    async fn connected_outgoing(&self, remote: UserId) -> Arc<MockEngine> {
        self.handle.start_call(remote, CallMode::Video).await.unwrap();
        self.handle.handle_signal(
            remote,
            SignalingMessage::CallAnswer {
                to: UserId(1),
                sdp: SessionDescription::answer("remote-answer"),
            },
        );
        let engine = self.engines.last();
        let probe = Arc::clone(&engine);
        eventually("remote answer applied", move || {
            probe
                .ops()
                .iter()
                .any(|op| op.starts_with("set_remote_description"))
        })
        .await;
        engine
    }

    /// Callee-side call from `from`, accepted by the local user.
    async fn connected_incoming(&self, from: UserId, mode: CallMode) -> Arc<MockEngine> {
        self.handle.handle_signal(
            from,
            SignalingMessage::CallOffer {
                to: UserId(1),
                mode,
                sdp: SessionDescription::offer("remote-offer"),
            },
        );
        let invitation = self.wait_invitation().await;
        invitation.accept().await.unwrap();
        self.engines.last()
    }
}

fn candidate(label: &str) -> SignalingMessage {
    SignalingMessage::IceCandidate {
        to: UserId(1),
        candidate: IceCandidateDescriptor::new(format!(
            "candidate:{label} 1 UDP 2130706431 192.168.1.1 8888 typ host"
        )),
    }
}

// ---- call flows ----

#[tokio::test]
async fn start_call_sends_one_offer_and_enters_calling() {
    let h = Harness::new();
    h.handle.start_call(UserId(42), CallMode::Video).await.unwrap();

    let sent = h.gateway.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        SignalingMessage::CallOffer { to, mode, sdp } => {
            assert_eq!(*to, UserId(42));
            assert_eq!(*mode, CallMode::Video);
            assert_eq!(sdp.sdp, "mock-offer");
        }
        other => panic!("expected CallOffer, got {:?}", other),
    }

    assert!(h.handle.is_in_call().await);
    let states = h.observer.states();
    assert!(states.iter().any(|s| s.in_call));

    let ops = h.engines.last().ops();
    assert!(ops.contains(&"attach_local_tracks".to_string()));
    assert!(ops.contains(&"create_offer".to_string()));
}

#[tokio::test]
async fn candidates_after_answer_apply_in_arrival_order() {
    let h = Harness::new();
    h.handle.start_call(UserId(42), CallMode::Video).await.unwrap();

    h.handle.handle_signal(
        UserId(42),
        SignalingMessage::CallAnswer {
            to: UserId(1),
            sdp: SessionDescription::answer("remote-answer"),
        },
    );
    for label in ["a", "b", "c"] {
        h.handle.handle_signal(UserId(42), candidate(label));
    }
    h.settle().await;

    let applied = h.engines.last().applied_candidates();
    assert_eq!(applied.len(), 3);
    assert!(applied[0].starts_with("candidate:a"));
    assert!(applied[1].starts_with("candidate:b"));
    assert!(applied[2].starts_with("candidate:c"));
}

#[tokio::test]
async fn early_candidates_queue_and_replay_after_answer() {
    let h = Harness::new();
    h.handle.start_call(UserId(42), CallMode::Video).await.unwrap();

    // Peer's candidates outran its answer.
    for label in ["a", "b", "c"] {
        h.handle.handle_signal(UserId(42), candidate(label));
    }
    h.settle().await;
    assert!(h.engines.last().applied_candidates().is_empty());

    h.handle.handle_signal(
        UserId(42),
        SignalingMessage::CallAnswer {
            to: UserId(1),
            sdp: SessionDescription::answer("remote-answer"),
        },
    );
    h.settle().await;

    let ops = h.engines.last().ops();
    let remote_at = ops
        .iter()
        .position(|op| op.starts_with("set_remote_description"))
        .unwrap();
    let candidate_positions: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.starts_with("add_candidate"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(candidate_positions.len(), 3);
    assert!(candidate_positions.iter().all(|&i| i > remote_at));
    assert!(
        candidate_positions.windows(2).all(|w| w[0] < w[1]),
        "candidates must replay in arrival order"
    );
}

#[tokio::test]
async fn screen_offer_is_answered_with_audio_only_media() {
    let h = Harness::new();
    h.handle.handle_signal(
        UserId(7),
        SignalingMessage::CallOffer {
            to: UserId(1),
            mode: CallMode::Screen,
            sdp: SessionDescription::offer("screen-offer"),
        },
    );

    let invitation = h.wait_invitation().await;
    assert_eq!(invitation.from, UserId(7));
    assert_eq!(invitation.mode, CallMode::Screen);
    invitation.accept().await.unwrap();

    // Viewer side: audio only, never a second screen capture.
    assert_eq!(h.media.acquired_modes(), vec![CallMode::Audio]);

    let sent = h.gateway.sent();
    match sent.last().unwrap() {
        SignalingMessage::CallAnswer { to, sdp } => {
            assert_eq!(*to, UserId(7));
            assert_eq!(sdp.sdp, "mock-answer");
        }
        other => panic!("expected CallAnswer, got {:?}", other),
    }
    assert!(h.handle.is_in_call().await);
}

#[tokio::test]
async fn queued_candidates_replay_before_answer_creation() {
    let h = Harness::new();
    h.handle.handle_signal(
        UserId(7),
        SignalingMessage::CallOffer {
            to: UserId(1),
            mode: CallMode::Video,
            sdp: SessionDescription::offer("remote-offer"),
        },
    );
    // No engine exists yet; both candidates buffer in the session.
    for label in ["a", "b"] {
        h.handle.handle_signal(UserId(7), candidate(label));
    }

    let invitation = h.wait_invitation().await;
    invitation.accept().await.unwrap();

    let ops = h.engines.last().ops();
    let answer_at = ops.iter().position(|op| op == "create_answer").unwrap();
    let remote_at = ops
        .iter()
        .position(|op| op.starts_with("set_remote_description"))
        .unwrap();
    let candidate_positions: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.starts_with("add_candidate"))
        .map(|(i, _)| i)
        .collect();

    assert_eq!(candidate_positions.len(), 2);
    assert!(
        candidate_positions.iter().all(|&i| remote_at < i && i < answer_at),
        "candidates must apply after the remote description and before the answer: {ops:?}"
    );
}

#[tokio::test]
async fn end_call_is_idempotent_and_notifies_once() {
    let h = Harness::new();
    let engine = h.connected_outgoing(UserId(7)).await;
    let media = h.media.last_media();

    h.handle.end_call().await;

    let sent = h.gateway.sent();
    match sent.last().unwrap() {
        SignalingMessage::CallEnd { to } => assert_eq!(*to, UserId(7)),
        other => panic!("expected CallEnd, got {:?}", other),
    }
    assert_eq!(h.gateway.sent_call_ends(), 1);
    assert!(engine.closed());
    assert!(media.stopped());
    let observer = Arc::clone(&h.observer);
    eventually("teardown state update", move || {
        observer.states().last().is_some_and(|s| !s.in_call)
    })
    .await;

    // Hanging up again with no session is a no-op.
    h.handle.end_call().await;
    assert_eq!(h.gateway.sent_call_ends(), 1);
    assert!(!h.handle.is_in_call().await);
}

#[tokio::test]
async fn remote_call_end_is_never_echoed() {
    let h = Harness::new();
    let engine = h.connected_outgoing(UserId(42)).await;

    h.handle
        .handle_signal(UserId(42), SignalingMessage::CallEnd { to: UserId(1) });
    let probe = Arc::clone(&engine);
    eventually("teardown after remote hang-up", move || probe.closed()).await;

    assert_eq!(h.gateway.sent_call_ends(), 0);
    assert!(h.media.last_media().stopped());
}

#[tokio::test]
async fn stale_candidate_after_teardown_is_discarded_silently() {
    let h = Harness::new();
    let engine = h.connected_outgoing(UserId(42)).await;
    h.handle.end_call().await;

    let before = engine.applied_candidates().len();
    h.handle.handle_signal(UserId(42), candidate("late"));
    h.settle().await;

    assert_eq!(engine.applied_candidates().len(), before);
    assert!(h.observer.errors().is_empty());
}

#[tokio::test]
async fn renegotiation_from_current_remote_skips_the_prompt() {
    let h = Harness::new();
    let first_engine = h.connected_incoming(UserId(7), CallMode::Video).await;
    let invites_before = h.observer.invite_count();
    assert_eq!(h.engines.count(), 1);

    // Mid-call mode switch: the peer starts screen sharing.
    h.handle.handle_signal(
        UserId(7),
        SignalingMessage::CallOffer {
            to: UserId(1),
            mode: CallMode::Screen,
            sdp: SessionDescription::offer("screen-offer"),
        },
    );
    let gateway = Arc::clone(&h.gateway);
    eventually("renegotiated answer", move || {
        gateway
            .sent()
            .iter()
            .filter(|m| matches!(m, SignalingMessage::CallAnswer { .. }))
            .count()
            == 2
    })
    .await;

    assert_eq!(h.engines.count(), 2);
    assert_eq!(h.observer.invite_count(), invites_before);
    assert!(first_engine.closed());
}

#[tokio::test]
async fn media_failure_on_start_is_fatal_and_silent() {
    let h = Harness::new();
    h.media.fail_with(MediaError::PermissionDenied);

    let result = h.handle.start_call(UserId(42), CallMode::Video).await;
    assert!(matches!(
        result,
        Err(CallError::Media(MediaError::PermissionDenied))
    ));
    assert!(h.gateway.sent().is_empty());

    // The aborted attempt left no session behind.
    h.handle.end_call().await;
    assert!(h.gateway.sent().is_empty());

    let observer = Arc::clone(&h.observer);
    eventually("permission error reported", move || {
        observer
            .errors()
            .iter()
            .any(|e| matches!(e, CallError::Media(MediaError::PermissionDenied)))
    })
    .await;
}

#[tokio::test]
async fn media_failure_on_accept_degrades_to_receive_only() {
    let h = Harness::new();
    h.handle.handle_signal(
        UserId(7),
        SignalingMessage::CallOffer {
            to: UserId(1),
            mode: CallMode::Video,
            sdp: SessionDescription::offer("remote-offer"),
        },
    );
    let invitation = h.wait_invitation().await;

    h.media.fail_with(MediaError::DeviceNotFound);
    invitation.accept().await.unwrap();

    // Answer still goes out; the caller gets through one-way.
    assert!(matches!(
        h.gateway.sent().last().unwrap(),
        SignalingMessage::CallAnswer { .. }
    ));
    let ops = h.engines.last().ops();
    assert!(!ops.contains(&"attach_local_tracks".to_string()));
}

#[tokio::test]
async fn engine_create_failure_aborts_the_attempt() {
    let h = Harness::new();
    h.engines.fail.store(true, Ordering::SeqCst);

    let result = h.handle.start_call(UserId(42), CallMode::Audio).await;
    assert!(matches!(result, Err(CallError::EngineCreate(_))));
    assert!(h.gateway.sent().is_empty());
}

#[tokio::test]
async fn remote_description_failure_tears_down_with_notification() {
    let h = Harness::new();
    h.handle.start_call(UserId(42), CallMode::Video).await.unwrap();
    let engine = h.engines.last();
    engine.fail_remote_description.store(true, Ordering::SeqCst);

    h.handle.handle_signal(
        UserId(42),
        SignalingMessage::CallAnswer {
            to: UserId(1),
            sdp: SessionDescription::answer("remote-answer"),
        },
    );
    let probe = Arc::clone(&engine);
    eventually("failed negotiation teardown", move || probe.closed()).await;

    // The offer had been sent, so the peer is owed a hang-up.
    assert_eq!(h.gateway.sent_call_ends(), 1);
}

#[tokio::test]
async fn toggles_flip_tracks_and_mirror_over_the_side_channel() {
    let h = Harness::new();
    let engine = h.connected_outgoing(UserId(7)).await;
    let media = h.media.last_media();

    assert!(h.handle.toggle_mic().await);
    assert!(!media.audio_enabled.load(Ordering::SeqCst));
    assert_eq!(
        engine.statuses(),
        vec![StatusMessage::MicStatus { muted: true }]
    );

    assert!(!h.handle.toggle_mic().await);
    assert!(media.audio_enabled.load(Ordering::SeqCst));

    assert!(h.handle.toggle_camera().await);
    assert!(!media.video_enabled.load(Ordering::SeqCst));
    assert_eq!(
        engine.statuses().last().unwrap(),
        &StatusMessage::VideoStatus { off: true }
    );
}

#[tokio::test]
async fn toggle_still_applies_when_side_channel_is_closed() {
    let h = Harness::new();
    let engine = h.connected_outgoing(UserId(7)).await;
    let media = h.media.last_media();

    engine.side_open.store(false, Ordering::SeqCst);
    assert!(h.handle.toggle_mic().await);

    assert!(!media.audio_enabled.load(Ordering::SeqCst));
    assert!(engine.statuses().is_empty());
}

#[tokio::test]
async fn candidate_with_mismatched_ufrag_is_discarded() {
    let h = Harness::new();
    let engine = h.connected_outgoing(UserId(42)).await;
    engine.set_remote_ufrag("Ab3d");

    h.handle.handle_signal(
        UserId(42),
        SignalingMessage::IceCandidate {
            to: UserId(1),
            candidate: IceCandidateDescriptor::new(
                "candidate:1 1 UDP 1 10.0.0.1 9 typ host ufrag zZzZ",
            ),
        },
    );
    h.handle.handle_signal(
        UserId(42),
        SignalingMessage::IceCandidate {
            to: UserId(1),
            candidate: IceCandidateDescriptor::new(
                "candidate:2 1 UDP 1 10.0.0.2 9 typ host ufrag Ab3d",
            ),
        },
    );
    h.settle().await;

    let applied = engine.applied_candidates();
    assert_eq!(applied.len(), 1);
    assert!(applied[0].contains("ufrag Ab3d"));
}

#[tokio::test]
async fn local_candidates_are_forwarded_to_the_remote() {
    let h = Harness::new();
    let engine = h.connected_outgoing(UserId(42)).await;

    engine.emit(EngineEvent::IceCandidateGenerated(
        IceCandidateDescriptor::new("candidate:local 1 UDP 1 10.0.0.9 9 typ host"),
    ));

    let gateway = Arc::clone(&h.gateway);
    eventually("local candidate forwarded", move || {
        gateway.sent().iter().any(|m| {
            matches!(
                m,
                SignalingMessage::IceCandidate { to, .. } if *to == UserId(42)
            )
        })
    })
    .await;
}

#[tokio::test]
async fn stale_round_engine_events_are_dropped() {
    let h = Harness::new();
    let first_engine = h.connected_incoming(UserId(7), CallMode::Video).await;

    // Renegotiate so the first engine's round is superseded.
    h.handle.handle_signal(
        UserId(7),
        SignalingMessage::CallOffer {
            to: UserId(1),
            mode: CallMode::Screen,
            sdp: SessionDescription::offer("screen-offer"),
        },
    );
    let gateway = Arc::clone(&h.gateway);
    eventually("renegotiated answer", move || {
        gateway
            .sent()
            .iter()
            .filter(|m| matches!(m, SignalingMessage::CallAnswer { .. }))
            .count()
            == 2
    })
    .await;

    let sent_before = h.gateway.sent().len();
    first_engine.emit(EngineEvent::IceCandidateGenerated(
        IceCandidateDescriptor::new("candidate:stale 1 UDP 1 10.0.0.9 9 typ host"),
    ));
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(h.gateway.sent().len(), sent_before);
}

#[tokio::test]
async fn remote_status_messages_reach_the_observer() {
    let h = Harness::new();
    let engine = h.connected_outgoing(UserId(42)).await;

    engine.emit(EngineEvent::StatusReceived(StatusMessage::MicStatus {
        muted: true,
    }));
    engine.emit(EngineEvent::StatusReceived(StatusMessage::VideoStatus {
        off: true,
    }));

    let observer = Arc::clone(&h.observer);
    eventually("remote indicators", move || {
        observer.remote_mic.lock().unwrap().as_slice() == [true]
            && observer.remote_cam.lock().unwrap().as_slice() == [true]
    })
    .await;
}

#[tokio::test]
async fn remote_tracks_reach_the_observer() {
    let h = Harness::new();
    let engine = h.connected_outgoing(UserId(42)).await;

    engine.emit(EngineEvent::RemoteTrack(RemoteTrackHandle::new(
        TrackKind::Video,
        "track-1",
    )));

    let observer = Arc::clone(&h.observer);
    eventually("remote track", move || {
        !observer.tracks.lock().unwrap().is_empty()
    })
    .await;
}

#[tokio::test]
async fn connection_failure_ends_the_call_without_notifying() {
    let h = Harness::new();
    let engine = h.connected_outgoing(UserId(42)).await;

    engine.emit(EngineEvent::ConnectionStateChanged(ConnectionState::Failed));

    let probe = Arc::clone(&engine);
    eventually("teardown on connection failure", move || probe.closed()).await;
    assert_eq!(h.gateway.sent_call_ends(), 0);
    let observer = Arc::clone(&h.observer);
    eventually("teardown state update", move || {
        observer.states().last().is_some_and(|s| !s.in_call)
    })
    .await;
}

#[tokio::test]
async fn reject_sends_call_end_and_discards_the_offer() {
    let h = Harness::new();
    h.handle.handle_signal(
        UserId(7),
        SignalingMessage::CallOffer {
            to: UserId(1),
            mode: CallMode::Audio,
            sdp: SessionDescription::offer("remote-offer"),
        },
    );

    let invitation = h.wait_invitation().await;
    invitation.reject().await;

    let sent = h.gateway.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        SignalingMessage::CallEnd { to } => assert_eq!(*to, UserId(7)),
        other => panic!("expected CallEnd, got {:?}", other),
    }
    // No engine was ever built, no media acquired.
    assert_eq!(h.engines.count(), 0);
    assert!(h.media.acquired_modes().is_empty());
}

#[tokio::test]
async fn accepting_a_second_caller_replaces_the_live_call() {
    let h = Harness::new();
    let first_engine = h.connected_outgoing(UserId(42)).await;
    let first_media = h.media.last_media();

    h.handle.handle_signal(
        UserId(7),
        SignalingMessage::CallOffer {
            to: UserId(1),
            mode: CallMode::Audio,
            sdp: SessionDescription::offer("second-offer"),
        },
    );
    let invitation = h.wait_invitation().await;
    // The live call with 42 stays up until the user decides.
    assert!(!first_engine.closed());

    invitation.accept().await.unwrap();

    assert!(first_engine.closed());
    assert!(first_media.stopped());
    match h.gateway.sent().last().unwrap() {
        SignalingMessage::CallAnswer { to, .. } => assert_eq!(*to, UserId(7)),
        other => panic!("expected CallAnswer, got {:?}", other),
    }
}

#[tokio::test]
async fn answer_without_a_call_is_ignored() {
    let h = Harness::new();
    h.handle.handle_signal(
        UserId(42),
        SignalingMessage::CallAnswer {
            to: UserId(1),
            sdp: SessionDescription::answer("unsolicited"),
        },
    );
    h.settle().await;

    assert!(h.gateway.sent().is_empty());
    assert_eq!(h.engines.count(), 0);
}
