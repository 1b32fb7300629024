//! Signaling with the SFU: message types and the channel contract.
//!
//! Frames are JSON objects `{"event": "<kebab-name>", "data": {...}}`. Delivery is
//! neither ordered nor at-most-once, so every handler of an inbound event must be
//! idempotent.

pub mod ws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SessionResult;
use crate::types::{
    AppData, ConsumerDescriptor, DtlsParameters, MediaKind, PeerSummary, RtpCapabilities,
    RtpParameters, StreamAnnouncement, StreamMetadata, TransportDescriptor,
};

pub use ws::WsSignalingChannel;

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum InboundSignal {
    /// The router accepted our identity.
    JoinSuccess {
        room_id: String,
        peer_id: String,
        #[serde(default)]
        is_creator: bool,
        #[serde(default)]
        locked: bool,
    },

    RouterCapabilities {
        rtp_capabilities: RtpCapabilities,
    },

    /// Device capabilities were stored; transports may be requested.
    RtpCapabilitiesAck,

    TransportCreated(TransportDescriptor),

    TransportConnected {
        transport_id: String,
    },

    ProducerCreated {
        producer_id: String,
        kind: MediaKind,
        #[serde(default)]
        stream_id: Option<String>,
        #[serde(default)]
        app_data: AppData,
    },

    ConsumerCreated(ConsumerDescriptor),

    /// The router declined to create a consumer for a stream we asked for.
    ConsumerSkipped {
        stream_id: String,
        #[serde(default)]
        reason: Option<String>,
    },

    ConsumerResumed {
        consumer_id: String,
    },

    ConsumerRemoved {
        consumer_id: String,
    },

    StreamAdded(StreamAnnouncement),

    StreamRemoved {
        stream_id: String,
        #[serde(default)]
        is_screen_share: Option<bool>,
    },

    StreamMetadataUpdated {
        stream_id: String,
        metadata: StreamMetadata,
    },

    /// Bulk listing of every stream and participant in the room.
    StreamsList {
        #[serde(default)]
        streams: Vec<StreamAnnouncement>,
        #[serde(default)]
        peers: Vec<PeerSummary>,
    },

    PeerLeft {
        peer_id: String,
        #[serde(default)]
        kicked: bool,
    },

    PinResponse {
        peer_id: String,
        pinned: bool,
        success: bool,
    },

    RoomLocked,
    RoomUnlocked,

    UserSpeaking {
        peer_id: String,
    },

    UserStoppedSpeaking {
        peer_id: String,
    },

    ScreenShareStarted {
        peer_id: String,
        #[serde(default)]
        stream_id: Option<String>,
    },

    ScreenShareStopped {
        peer_id: String,
    },

    TranslationCabinCreated {
        target_user_id: String,
        #[serde(default)]
        language: Option<String>,
    },

    TranslationCabinDestroyed {
        target_user_id: String,
    },
}

impl InboundSignal {
    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinSuccess { .. } => "join-success",
            Self::RouterCapabilities { .. } => "router-capabilities",
            Self::RtpCapabilitiesAck => "rtp-capabilities-ack",
            Self::TransportCreated(_) => "transport-created",
            Self::TransportConnected { .. } => "transport-connected",
            Self::ProducerCreated { .. } => "producer-created",
            Self::ConsumerCreated(_) => "consumer-created",
            Self::ConsumerSkipped { .. } => "consumer-skipped",
            Self::ConsumerResumed { .. } => "consumer-resumed",
            Self::ConsumerRemoved { .. } => "consumer-removed",
            Self::StreamAdded(_) => "stream-added",
            Self::StreamRemoved { .. } => "stream-removed",
            Self::StreamMetadataUpdated { .. } => "stream-metadata-updated",
            Self::StreamsList { .. } => "streams-list",
            Self::PeerLeft { .. } => "peer-left",
            Self::PinResponse { .. } => "pin-response",
            Self::RoomLocked => "room-locked",
            Self::RoomUnlocked => "room-unlocked",
            Self::UserSpeaking { .. } => "user-speaking",
            Self::UserStoppedSpeaking { .. } => "user-stopped-speaking",
            Self::ScreenShareStarted { .. } => "screen-share-started",
            Self::ScreenShareStopped { .. } => "screen-share-stopped",
            Self::TranslationCabinCreated { .. } => "translation-cabin-created",
            Self::TranslationCabinDestroyed { .. } => "translation-cabin-destroyed",
        }
    }
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundSignal {
    Join {
        room_id: String,
        peer_id: String,
    },

    SetRtpCapabilities {
        rtp_capabilities: RtpCapabilities,
    },

    CreateTransport {
        is_producer: bool,
    },

    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },

    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppData,
    },

    Consume {
        stream_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        publisher_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        producer_id: Option<String>,
        rtp_capabilities: RtpCapabilities,
    },

    ResumeConsumer {
        consumer_id: String,
    },

    Unpublish {
        stream_id: String,
    },

    UpdateStreamMetadata {
        stream_id: String,
        metadata: StreamMetadata,
    },

    LockRoom {
        password: String,
    },

    UnlockRoom,

    PinUser {
        peer_id: String,
    },

    UnpinUser {
        peer_id: String,
    },

    KickPeer {
        peer_id: String,
    },

    GetStreams,

    MySpeaking {
        peer_id: String,
    },

    MyStopSpeaking {
        peer_id: String,
    },

    #[serde(rename = "audio:buffer")]
    AudioBuffer(AudioChunk),
}

impl OutboundSignal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::SetRtpCapabilities { .. } => "set-rtp-capabilities",
            Self::CreateTransport { .. } => "create-transport",
            Self::ConnectTransport { .. } => "connect-transport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resume-consumer",
            Self::Unpublish { .. } => "unpublish",
            Self::UpdateStreamMetadata { .. } => "update-stream-metadata",
            Self::LockRoom { .. } => "lock-room",
            Self::UnlockRoom => "unlock-room",
            Self::PinUser { .. } => "pin-user",
            Self::UnpinUser { .. } => "unpin-user",
            Self::KickPeer { .. } => "kick-peer",
            Self::GetStreams => "get-streams",
            Self::MySpeaking { .. } => "my-speaking",
            Self::MyStopSpeaking { .. } => "my-stop-speaking",
            Self::AudioBuffer(_) => "audio:buffer",
        }
    }
}

/// One delivery of recorded speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunk {
    pub user_id: String,
    pub room_id: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    /// 16-bit little-endian PCM.
    pub buffer: Vec<u8>,
    /// Seconds of audio in `buffer`.
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub is_final: bool,
}

/// Bidirectional event channel to the SFU.
///
/// Inbound events are not returned from this trait; implementations push them into
/// whatever sink they were built with (see [`WsSignalingChannel::new`]).
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn connect(&self) -> SessionResult<()>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
    async fn emit(&self, signal: OutboundSignal) -> SessionResult<()>;
}
