//! In-memory collaborators for scenario tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_common::config::{SessionConfig, VadConfig};
use parley_session::directory::{JoinRequest, JoinResponse, RoomDirectory};
use parley_session::engine::{
    ConsumeOptions, Consumer, MediaConstraints, MediaEngine, MediaStream, MediaTrack,
    ProduceOptions, ProduceRequest, Producer, TrackState, Transport, TransportHandler,
};
use parley_session::signaling::{InboundSignal, OutboundSignal, SignalingChannel};
use parley_session::types::{
    AppData, ConnectionState, ConsumerDescriptor, DtlsParameters, MediaKind, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpParameters, StreamAnnouncement, StreamMetadata,
    TransportDescriptor,
};
use parley_session::{
    Collaborators, EngineError, Session, SessionError, SessionEvent, SessionResult,
};
use tokio::sync::{broadcast, mpsc};

// ── Tracks, producers, consumers ─────────────────────────────────────────────

#[derive(Debug)]
pub struct MockTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl MockTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }
    fn kind(&self) -> MediaKind {
        self.kind
    }
    fn ready_state(&self) -> TrackState {
        if self.ended.load(Ordering::SeqCst) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
    fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockProducer {
    id: String,
    kind: MediaKind,
    track: Mutex<Arc<dyn MediaTrack>>,
    paused: AtomicBool,
    pub closed: AtomicBool,
    pub replaced: AtomicUsize,
}

#[async_trait]
impl Producer for MockProducer {
    fn id(&self) -> &str {
        &self.id
    }
    fn kind(&self) -> MediaKind {
        self.kind
    }
    fn track(&self) -> Option<Arc<dyn MediaTrack>> {
        Some(Arc::clone(&self.track.lock()))
    }
    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), EngineError> {
        *self.track.lock() = track;
        self.replaced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    track: Arc<MockTrack>,
    paused: AtomicBool,
    pub closed: AtomicBool,
}

impl Consumer for MockConsumer {
    fn id(&self) -> &str {
        &self.id
    }
    fn producer_id(&self) -> &str {
        &self.producer_id
    }
    fn kind(&self) -> MediaKind {
        self.kind
    }
    fn track(&self) -> Arc<dyn MediaTrack> {
        self.track.clone()
    }
    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

pub struct MockTransport {
    id: String,
    state: Mutex<ConnectionState>,
    handler: Arc<dyn TransportHandler>,
    consume_error: Option<EngineError>,
    /// Holds every `consume` for this long before answering.
    pub consume_delay: Mutex<Option<Duration>>,
    closed: AtomicBool,
    pub produced: Mutex<Vec<(MediaKind, AppData)>>,
    pub producers: Mutex<Vec<Arc<MockProducer>>>,
    pub consumers: Mutex<Vec<Arc<MockConsumer>>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport").field("id", &self.id).finish()
    }
}

impl MockTransport {
    /// Move to `state` and notify the session, as the engine would.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        self.handler.on_connection_state_change(state);
    }

    pub async fn connect(&self) -> Result<(), EngineError> {
        self.handler.on_connect(DtlsParameters::default()).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn consumer(&self, id: &str) -> Option<Arc<MockConsumer>> {
        self.consumers.lock().iter().find(|c| c.id == id).cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn produce(&self, options: ProduceOptions) -> Result<Arc<dyn Producer>, EngineError> {
        let kind = options.track.kind();
        let id = self
            .handler
            .on_produce(ProduceRequest {
                kind,
                rtp_parameters: RtpParameters::default(),
                app_data: options.app_data.clone(),
            })
            .await?;
        self.produced.lock().push((kind, options.app_data));
        let producer = Arc::new(MockProducer {
            id,
            kind,
            track: Mutex::new(options.track),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            replaced: AtomicUsize::new(0),
        });
        self.producers.lock().push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn Consumer>, EngineError> {
        if let Some(e) = &self.consume_error {
            return Err(e.clone());
        }
        let delay = *self.consume_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let consumer = Arc::new(MockConsumer {
            track: MockTrack::new(format!("track-{}", options.id), options.kind),
            id: options.id,
            producer_id: options.producer_id,
            kind: options.kind,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().push(Arc::clone(&consumer));
        Ok(consumer)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn closed(&self) -> bool {
        self.is_closed()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub fn codec(mime: &str, kind: MediaKind, clock_rate: u32) -> RtpCodecCapability {
    RtpCodecCapability {
        mime_type: mime.into(),
        kind,
        clock_rate,
        channels: None,
        preferred_payload_type: None,
        parameters: Default::default(),
    }
}

pub fn capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            codec("audio/opus", MediaKind::Audio, 48000),
            codec("video/VP8", MediaKind::Video, 90000),
        ],
        header_extensions: Vec::new(),
    }
}

pub struct MockEngine {
    loaded: AtomicBool,
    capabilities: RtpCapabilities,
    pub has_camera: AtomicBool,
    pub has_microphone: AtomicBool,
    pub consume_error: Mutex<Option<EngineError>>,
    pub send: Mutex<Vec<Arc<MockTransport>>>,
    pub recv: Mutex<Vec<Arc<MockTransport>>>,
    captures: AtomicUsize,
}

impl MockEngine {
    pub fn new(capabilities: RtpCapabilities) -> Self {
        Self {
            loaded: AtomicBool::new(false),
            capabilities,
            has_camera: AtomicBool::new(true),
            has_microphone: AtomicBool::new(true),
            consume_error: Mutex::new(None),
            send: Mutex::new(Vec::new()),
            recv: Mutex::new(Vec::new()),
            captures: AtomicUsize::new(0),
        }
    }

    pub fn send_transport(&self) -> Arc<MockTransport> {
        Arc::clone(self.send.lock().first().expect("send transport"))
    }

    pub fn recv_transport(&self) -> Arc<MockTransport> {
        Arc::clone(self.recv.lock().first().expect("recv transport"))
    }

    fn build(
        &self,
        descriptor: &TransportDescriptor,
        handler: Arc<dyn TransportHandler>,
    ) -> Arc<MockTransport> {
        Arc::new(MockTransport {
            id: descriptor.id.clone(),
            state: Mutex::new(ConnectionState::New),
            handler,
            consume_error: self.consume_error.lock().clone(),
            consume_delay: Mutex::new(None),
            closed: AtomicBool::new(false),
            produced: Mutex::new(Vec::new()),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn load(&self, _router: &RtpCapabilities) -> Result<(), EngineError> {
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.is_loaded().then(|| self.capabilities.clone())
    }

    async fn create_send_transport(
        &self,
        descriptor: &TransportDescriptor,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        let transport = self.build(descriptor, handler);
        self.send.lock().push(Arc::clone(&transport));
        Ok(transport)
    }

    async fn create_recv_transport(
        &self,
        descriptor: &TransportDescriptor,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        let transport = self.build(descriptor, handler);
        self.recv.lock().push(Arc::clone(&transport));
        Ok(transport)
    }

    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, EngineError> {
        if constraints.video && !self.has_camera.load(Ordering::SeqCst) {
            return Err(EngineError::DeviceUnavailable(MediaKind::Video));
        }
        if constraints.audio && !self.has_microphone.load(Ordering::SeqCst) {
            return Err(EngineError::DeviceUnavailable(MediaKind::Audio));
        }
        let n = self.captures.fetch_add(1, Ordering::SeqCst);
        let mut stream = MediaStream::new(format!("capture-{n}"));
        if constraints.video {
            stream.add_track(MockTrack::new(format!("camera-{n}"), MediaKind::Video));
        }
        if constraints.audio {
            stream.add_track(MockTrack::new(format!("mic-{n}"), MediaKind::Audio));
        }
        Ok(stream)
    }

    async fn get_display_media(&self) -> Result<MediaStream, EngineError> {
        let mut stream = MediaStream::new("display");
        stream.add_track(MockTrack::new("screen-video", MediaKind::Video));
        stream.add_track(MockTrack::new("screen-audio", MediaKind::Audio));
        Ok(stream)
    }
}

// ── Signaling ────────────────────────────────────────────────────────────────

/// Records every emitted signal and answers the request/response exchanges the
/// way the router would.
pub struct MockSignaling {
    inbound: mpsc::UnboundedSender<InboundSignal>,
    connected: AtomicBool,
    pub emitted: Mutex<Vec<OutboundSignal>>,
    pub pin_success: AtomicBool,
    produced: AtomicUsize,
}

impl MockSignaling {
    pub fn new(inbound: mpsc::UnboundedSender<InboundSignal>) -> Self {
        Self {
            inbound,
            connected: AtomicBool::new(false),
            emitted: Mutex::new(Vec::new()),
            pin_success: AtomicBool::new(true),
            produced: AtomicUsize::new(0),
        }
    }

    /// Deliver a server event through the session's inbound pump.
    pub fn inject(&self, signal: InboundSignal) {
        let _ = self.inbound.send(signal);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.emitted.lock().iter().map(OutboundSignal::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }

    fn respond(&self, signal: &OutboundSignal) {
        let reply = match signal {
            OutboundSignal::ConnectTransport { transport_id, .. } => {
                Some(InboundSignal::TransportConnected {
                    transport_id: transport_id.clone(),
                })
            }
            OutboundSignal::Produce { kind, app_data, .. } => {
                let n = self.produced.fetch_add(1, Ordering::SeqCst);
                let media_type = app_data.media_type.map_or("video", |t| t.as_str());
                Some(InboundSignal::ProducerCreated {
                    producer_id: format!("producer-{n}"),
                    kind: *kind,
                    stream_id: Some(format!("alice_{media_type}_{n}_test")),
                    app_data: app_data.clone(),
                })
            }
            OutboundSignal::PinUser { peer_id } => Some(InboundSignal::PinResponse {
                peer_id: peer_id.clone(),
                pinned: true,
                success: self.pin_success.load(Ordering::SeqCst),
            }),
            OutboundSignal::UnpinUser { peer_id } => Some(InboundSignal::PinResponse {
                peer_id: peer_id.clone(),
                pinned: false,
                success: true,
            }),
            OutboundSignal::LockRoom { .. } => Some(InboundSignal::RoomLocked),
            OutboundSignal::UnlockRoom => Some(InboundSignal::RoomUnlocked),
            _ => None,
        };
        if let Some(reply) = reply {
            self.inject(reply);
        }
    }
}

#[async_trait]
impl SignalingChannel for MockSignaling {
    async fn connect(&self) -> SessionResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn emit(&self, signal: OutboundSignal) -> SessionResult<()> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.respond(&signal);
        self.emitted.lock().push(signal);
        Ok(())
    }
}

// ── Directory ────────────────────────────────────────────────────────────────

pub struct MockDirectory {
    pub response: Mutex<Result<JoinResponse, parley_session::JoinFailure>>,
    pub requests: Mutex<Vec<JoinRequest>>,
}

impl MockDirectory {
    pub fn new(is_creator: bool) -> Self {
        Self {
            response: Mutex::new(Ok(JoinResponse {
                router_rtp_capabilities: capabilities(),
                is_creator,
                locked: false,
            })),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RoomDirectory for MockDirectory {
    async fn join(&self, request: JoinRequest) -> SessionResult<JoinResponse> {
        self.requests.lock().push(request);
        self.response.lock().clone().map_err(SessionError::from)
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

pub struct Harness {
    pub session: Session,
    pub signaling: Arc<MockSignaling>,
    pub engine: Arc<MockEngine>,
    pub directory: Arc<MockDirectory>,
    pub events: broadcast::Receiver<SessionEvent>,
}

pub fn harness() -> Harness {
    harness_with(MockEngine::new(capabilities()), MockDirectory::new(true))
}

pub fn harness_with(engine: MockEngine, directory: MockDirectory) -> Harness {
    let (tx, rx) = mpsc::unbounded_channel();
    let signaling = Arc::new(MockSignaling::new(tx));
    let engine = Arc::new(engine);
    let directory = Arc::new(directory);
    let session = Session::new(
        SessionConfig::default(),
        VadConfig::default(),
        Collaborators {
            signaling: signaling.clone(),
            engine: engine.clone(),
            directory: directory.clone(),
        },
    );
    let events = session.subscribe();
    let pump = session.clone();
    tokio::spawn(async move { pump.run(rx).await });
    Harness {
        session,
        signaling,
        engine,
        directory,
        events,
    }
}

/// Let spawned work and timers run for `ms` of (paused) time.
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

pub fn descriptor(id: &str, is_producer: bool) -> TransportDescriptor {
    TransportDescriptor {
        id: id.into(),
        is_producer,
        ice_parameters: Default::default(),
        ice_candidates: Vec::new(),
        dtls_parameters: DtlsParameters::default(),
    }
}

pub fn announcement(stream_id: &str) -> StreamAnnouncement {
    StreamAnnouncement {
        stream_id: stream_id.into(),
        publisher_id: None,
        producer_id: Some(format!("{stream_id}-producer")),
        metadata: StreamMetadata::default(),
        rtp_parameters: None,
    }
}

pub fn rtp_parameters(kind: MediaKind) -> RtpParameters {
    let (mime, rate) = match kind {
        MediaKind::Audio => ("audio/opus", 48000),
        MediaKind::Video => ("video/VP8", 90000),
    };
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: Some(mime.into()),
            payload_type: Some(100),
            clock_rate: Some(rate),
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn consumer_created(consumer_id: &str, stream_id: &str, kind: MediaKind) -> InboundSignal {
    InboundSignal::ConsumerCreated(ConsumerDescriptor {
        consumer_id: Some(consumer_id.into()),
        producer_id: Some(format!("{stream_id}-producer")),
        kind: Some(kind),
        rtp_parameters: Some(rtp_parameters(kind)),
        stream_id: stream_id.into(),
        publisher_id: None,
        metadata: StreamMetadata::default(),
    })
}

/// Join as `alice` in `r1` and bring both transports up to connected.
pub async fn joined_with_transports(h: &Harness) {
    h.session.join("r1", "alice", None).await.expect("join");
    h.signaling.inject(InboundSignal::RouterCapabilities {
        rtp_capabilities: capabilities(),
    });
    h.signaling.inject(InboundSignal::RtpCapabilitiesAck);
    advance(400).await;
    h.signaling.inject(InboundSignal::TransportCreated(descriptor("send-1", true)));
    h.signaling.inject(InboundSignal::TransportCreated(descriptor("recv-1", false)));
    advance(10).await;
    h.engine.send_transport().set_state(ConnectionState::Connected);
    h.engine.recv_transport().set_state(ConnectionState::Connected);
    advance(100).await;
}

/// Drain every event received so far.
pub fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
