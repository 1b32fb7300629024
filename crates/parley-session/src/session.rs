//! The public handle: owns the shared state and dispatches inbound signals.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use parley_common::config::{SessionConfig, VadConfig};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use crate::consumer::ConsumerManager;
use crate::context::SessionShared;
use crate::directory::RoomDirectory;
use crate::engine::MediaEngine;
use crate::error::SessionResult;
use crate::events::{EventBus, NoticeLevel, SessionEvent};
use crate::producer::ProducerManager;
use crate::room::RoomManager;
use crate::signaling::{InboundSignal, SignalingChannel};
use crate::stream::StreamManager;
use crate::transport::TransportManager;
use crate::types::StreamInfo;
use crate::vad::{VadManager, VadSnapshot};
use crate::waiter::{Expectation, Response};

/// External collaborators a session drives.
#[derive(Clone)]
pub struct Collaborators {
    pub signaling: Arc<dyn SignalingChannel>,
    pub engine: Arc<dyn MediaEngine>,
    pub directory: Arc<dyn RoomDirectory>,
}

/// One participant's media session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub fn new(config: SessionConfig, vad_config: VadConfig, collaborators: Collaborators) -> Self {
        let events = EventBus::new();
        let vad = VadManager::new(vad_config, Arc::clone(&collaborators.signaling), events.clone());
        let shared = SessionShared::new(
            config,
            collaborators.signaling,
            collaborators.engine,
            collaborators.directory,
            events,
            vad,
        );
        Self {
            shared: Arc::new(shared),
        }
    }

    // ── Managers ──

    pub fn transports(&self) -> TransportManager {
        TransportManager::new(Arc::clone(&self.shared))
    }

    pub fn producers(&self) -> ProducerManager {
        ProducerManager::new(Arc::clone(&self.shared))
    }

    pub fn consumers(&self) -> ConsumerManager {
        ConsumerManager::new(Arc::clone(&self.shared))
    }

    pub fn streams(&self) -> StreamManager {
        StreamManager::new(Arc::clone(&self.shared))
    }

    pub fn room(&self) -> RoomManager {
        RoomManager::new(Arc::clone(&self.shared))
    }

    pub fn vad(&self) -> &VadManager {
        &self.shared.vad
    }

    // ── Read side ──

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Regular stream entries in display order.
    pub fn streams_snapshot(&self) -> Vec<StreamInfo> {
        self.shared.streams.lock().streams.clone()
    }

    pub fn screen_streams_snapshot(&self) -> Vec<StreamInfo> {
        self.shared.streams.lock().screen_streams.clone()
    }

    pub fn vad_state(&self) -> VadSnapshot {
        self.shared.vad.snapshot()
    }

    pub fn is_joined(&self) -> bool {
        self.shared.flags.joined.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.flags.connected.load(Ordering::SeqCst)
    }

    pub fn consuming_count(&self) -> usize {
        self.shared.streams.lock().consuming.len()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.streams.lock().pending.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.shared.media.lock().consumers.len()
    }

    pub fn producer_count(&self) -> usize {
        self.shared.media.lock().producers.len()
    }

    pub fn camera_available(&self) -> bool {
        !self.shared.flags.no_camera.load(Ordering::SeqCst)
    }

    pub fn microphone_available(&self) -> bool {
        !self.shared.flags.no_micro.load(Ordering::SeqCst)
    }

    pub fn is_creator(&self) -> bool {
        self.shared.room.lock().is_creator
    }

    pub fn is_locked(&self) -> bool {
        self.shared.room.lock().locked
    }

    pub fn pinned_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.shared.room.lock().pinned.iter().cloned().collect();
        peers.sort();
        peers
    }

    pub fn speaking_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.shared.streams.lock().speaking.iter().cloned().collect();
        peers.sort();
        peers
    }

    // ── Actions ──

    pub async fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        password: Option<&str>,
    ) -> SessionResult<()> {
        self.room().join_room(room_id, peer_id, password).await
    }

    pub async fn leave(&self) {
        self.room().leave_room().await
    }

    pub async fn toggle_video(&self) -> SessionResult<bool> {
        self.producers().toggle_video().await
    }

    pub async fn toggle_audio(&self) -> SessionResult<bool> {
        self.producers().toggle_audio().await
    }

    pub async fn toggle_screen_share(&self) -> SessionResult<bool> {
        self.producers().toggle_screen_share().await
    }

    pub async fn toggle_pin(&self, peer_id: &str) -> SessionResult<bool> {
        self.room().toggle_pin_user(peer_id).await
    }

    pub async fn toggle_lock(&self, password: Option<&str>) -> SessionResult<bool> {
        self.room().toggle_lock_room(password).await
    }

    pub async fn kick(&self, peer_id: &str) -> SessionResult<()> {
        self.room().kick_peer(peer_id).await
    }

    /// Start the VAD over a stream of mono `f32` frames.
    pub fn start_vad(&self, frames: mpsc::Receiver<Vec<f32>>) -> SessionResult<()> {
        self.shared.vad.start_with_frames(frames)
    }

    pub async fn stop_vad(&self) {
        self.shared.vad.stop().await
    }

    // ── Inbound ──

    /// Pump inbound signals until the channel closes.
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<InboundSignal>) {
        while let Some(signal) = inbound.recv().await {
            self.handle_signal(signal).await;
        }
        debug!("Inbound signal channel closed");
    }

    /// Apply one inbound event. Long-running work is spawned so the pump stays
    /// responsive to the confirmations that work waits on.
    pub async fn handle_signal(&self, signal: InboundSignal) {
        let shared = &self.shared;
        if !shared.flags.joined.load(Ordering::SeqCst) {
            debug!(event = signal.name(), "Not joined, ignoring signal");
            return;
        }
        debug!(event = signal.name(), "Inbound signal");

        match signal {
            InboundSignal::JoinSuccess {
                room_id,
                peer_id,
                is_creator,
                locked,
            } => {
                info!(%room_id, %peer_id, is_creator, "Router accepted join");
                shared.room.lock().is_creator |= is_creator;
                self.room().apply_lock(locked);
            }
            InboundSignal::RouterCapabilities { rtp_capabilities } => {
                let transports = self.transports();
                tokio::spawn(async move {
                    transports.initialize_device(&rtp_capabilities).await;
                });
            }
            InboundSignal::RtpCapabilitiesAck => {
                let transports = self.transports();
                tokio::spawn(async move { transports.create_transports().await });
            }
            InboundSignal::TransportCreated(descriptor) => {
                let transports = self.transports();
                let events = shared.events.clone();
                tokio::spawn(async move {
                    if let Err(e) = transports.create_transport(descriptor).await {
                        error!(error = %e, "Transport setup failed");
                        events.notice(
                            NoticeLevel::Error,
                            "Media connection could not be established",
                        );
                    }
                });
            }
            InboundSignal::TransportConnected { transport_id } => {
                shared
                    .waiters
                    .resolve(&Expectation::TransportConnected(transport_id), Response::Ack);
            }
            InboundSignal::ProducerCreated {
                producer_id,
                kind,
                stream_id,
                app_data,
            } => {
                self.producers()
                    .handle_producer_created(&producer_id, kind, stream_id, &app_data);
                let expectation = Expectation::ProducerCreated {
                    kind,
                    screen: app_data.is_screen(),
                };
                shared
                    .waiters
                    .resolve(&expectation, Response::ProducerId(producer_id));
            }
            InboundSignal::ConsumerCreated(descriptor) => {
                let consumers = self.consumers();
                tokio::spawn(async move {
                    consumers.create_consumer(descriptor).await;
                });
            }
            InboundSignal::ConsumerSkipped { stream_id, reason } => {
                self.streams()
                    .handle_consumer_skipped(&stream_id, reason.as_deref());
            }
            InboundSignal::ConsumerResumed { consumer_id } => {
                debug!(%consumer_id, "Consumer resumed");
            }
            InboundSignal::ConsumerRemoved { consumer_id } => {
                self.consumers().remove_consumer(&consumer_id).await;
            }
            InboundSignal::StreamAdded(announcement) => {
                self.streams().handle_stream_added(announcement).await;
            }
            InboundSignal::StreamRemoved {
                stream_id,
                is_screen_share,
            } => {
                self.streams().remove_stream(&stream_id, is_screen_share).await;
            }
            InboundSignal::StreamMetadataUpdated { stream_id, metadata } => {
                self.streams().update_metadata(&stream_id, metadata);
            }
            InboundSignal::StreamsList { streams, peers } => {
                self.streams().handle_streams_list(streams, peers).await;
            }
            InboundSignal::PeerLeft { peer_id, kicked } => {
                self.streams().remove_peer(&peer_id, kicked);
            }
            InboundSignal::PinResponse {
                peer_id,
                pinned,
                success,
            } => {
                let resolved = shared.waiters.resolve(
                    &Expectation::PinResponse(peer_id.clone()),
                    Response::Pin { pinned, success },
                );
                if !resolved && success {
                    self.room().apply_pin(&peer_id, pinned);
                }
            }
            InboundSignal::RoomLocked => {
                shared.waiters.resolve(&Expectation::RoomLocked, Response::Ack);
                self.room().apply_lock(true);
            }
            InboundSignal::RoomUnlocked => {
                shared.waiters.resolve(&Expectation::RoomUnlocked, Response::Ack);
                self.room().apply_lock(false);
            }
            InboundSignal::UserSpeaking { peer_id } => {
                self.streams().set_speaking(&peer_id, true);
            }
            InboundSignal::UserStoppedSpeaking { peer_id } => {
                self.streams().set_speaking(&peer_id, false);
            }
            InboundSignal::ScreenShareStarted { peer_id, stream_id } => {
                info!(%peer_id, ?stream_id, "Screen share started");
            }
            InboundSignal::ScreenShareStopped { peer_id } => {
                self.streams().screen_share_stopped(&peer_id).await;
            }
            InboundSignal::TranslationCabinCreated {
                target_user_id,
                language,
            } => {
                info!(%target_user_id, ?language, "Translation cabin created");
            }
            InboundSignal::TranslationCabinDestroyed { target_user_id } => {
                let consumers = self.consumers();
                tokio::spawn(async move {
                    consumers.revert_translation_stream(&target_user_id).await;
                });
            }
        }
    }
}
