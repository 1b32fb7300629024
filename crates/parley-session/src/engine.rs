//! Media engine contract.
//!
//! The engine owns WebRTC negotiation, codecs and capture. The session only
//! drives it through these traits; tests plug in in-memory implementations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::types::{
    AppData, ConnectionState, DtlsParameters, MediaKind, RtpCapabilities,
    RtpEncodingParameters, RtpParameters, TransportDescriptor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

/// A local or remote media track.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn ready_state(&self) -> TrackState;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);

    fn is_live(&self) -> bool {
        self.ready_state() == TrackState::Live
    }
}

/// An ordered set of tracks rendered together.
#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Add a track unless one with the same id is already present.
    pub fn add_track(&mut self, track: Arc<dyn MediaTrack>) {
        if !self.tracks.iter().any(|t| t.id() == track.id()) {
            self.tracks.push(track);
        }
    }

    /// Returns `true` if a track was removed.
    pub fn remove_track(&mut self, track_id: &str) -> bool {
        let before = self.tracks.len();
        self.tracks.retain(|t| t.id() != track_id);
        self.tracks.len() != before
    }

    pub fn track_of(&self, kind: MediaKind) -> Option<&Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self { audio: true, video: true };
    pub const AUDIO_ONLY: Self = Self { audio: true, video: false };
    pub const VIDEO_ONLY: Self = Self { audio: false, video: true };
}

#[derive(Debug, Clone)]
pub struct ProduceOptions {
    pub track: Arc<dyn MediaTrack>,
    pub encodings: Vec<RtpEncodingParameters>,
    pub app_data: AppData,
}

/// What the engine asks the application to forward when producing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: AppData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOptions {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[async_trait]
pub trait Producer: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> Option<Arc<dyn MediaTrack>>;
    fn paused(&self) -> bool;
    fn pause(&self);
    fn resume(&self);
    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), EngineError>;
    fn close(&self);
}

pub trait Consumer: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> Arc<dyn MediaTrack>;
    fn paused(&self) -> bool;
    fn pause(&self);
    fn resume(&self);
    fn close(&self);
}

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn connection_state(&self) -> ConnectionState;
    async fn produce(&self, options: ProduceOptions) -> Result<Arc<dyn Producer>, EngineError>;
    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn Consumer>, EngineError>;
    fn close(&self);
    fn closed(&self) -> bool;
}

/// Callbacks a transport raises into the application.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// DTLS parameters are ready; resolve once the remote side confirms.
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    /// A local track is being produced; resolve with the server-assigned producer id.
    async fn on_produce(&self, request: ProduceRequest) -> Result<String, EngineError>;

    fn on_connection_state_change(&self, state: ConnectionState);
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    fn is_loaded(&self) -> bool;
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<(), EngineError>;
    /// Device capabilities, available once loaded.
    fn rtp_capabilities(&self) -> Option<RtpCapabilities>;

    async fn create_send_transport(
        &self,
        descriptor: &TransportDescriptor,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn Transport>, EngineError>;

    async fn create_recv_transport(
        &self,
        descriptor: &TransportDescriptor,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn Transport>, EngineError>;

    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, EngineError>;
    async fn get_display_media(&self) -> Result<MediaStream, EngineError>;
}
