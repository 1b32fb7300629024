//! Data model shared by the managers: RTP descriptors, stream entries,
//! producer/consumer records and the transient pending-stream queue entries.

use crate::engine::{Consumer, MediaStream, Producer};
use crate::identity::StreamIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// The media-type token carried in stream ids and producer app data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Video,
    Audio,
    Screen,
    ScreenAudio,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Screen => "screen",
            Self::ScreenAudio => "screen_audio",
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Video | Self::Screen => MediaKind::Video,
            Self::Audio | Self::ScreenAudio => MediaKind::Audio,
        }
    }

    pub fn is_screen(&self) -> bool {
        matches!(self, Self::Screen | Self::ScreenAudio)
    }
}

/// Application data attached to a producer and echoed back by the router.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppData {
    #[serde(default)]
    pub is_screen_share: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
}

impl AppData {
    pub fn camera(kind: MediaKind) -> Self {
        let media_type = match kind {
            MediaKind::Video => MediaType::Video,
            MediaKind::Audio => MediaType::Audio,
        };
        Self {
            is_screen_share: false,
            media_type: Some(media_type),
        }
    }

    pub fn screen(kind: MediaKind) -> Self {
        let media_type = match kind {
            MediaKind::Video => MediaType::Screen,
            MediaKind::Audio => MediaType::ScreenAudio,
        };
        Self {
            is_screen_share: true,
            media_type: Some(media_type),
        }
    }

    /// Screen share by flag or by type tag.
    pub fn is_screen(&self) -> bool {
        self.is_screen_share || self.media_type.is_some_and(|t| t.is_screen())
    }
}

// ── RTP descriptors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub mime_type: String,
    pub kind: MediaKind,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<serde_json::Value>,
}

impl RtpCapabilities {
    /// Whether at least one media codec (not RTX) appears in both capability sets.
    pub fn has_common_codec(&self, other: &RtpCapabilities) -> bool {
        self.codecs
            .iter()
            .filter(|c| !c.mime_type.to_ascii_lowercase().ends_with("/rtx"))
            .any(|ours| {
                other.codecs.iter().any(|theirs| {
                    ours.mime_type.eq_ignore_ascii_case(&theirs.mime_type)
                        && ours.clock_rate == theirs.clock_rate
                })
            })
    }
}

/// Codec entry of consumer RTP parameters. Fields are optional on the wire and
/// checked before materialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub payload_type: Option<u8>,
    #[serde(default)]
    pub clock_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_resolution_down_by: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub header_extensions: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Server description of a transport to build locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: String,
    pub is_producer: bool,
    #[serde(default)]
    pub ice_parameters: serde_json::Value,
    #[serde(default)]
    pub ice_candidates: Vec<serde_json::Value>,
    #[serde(default)]
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportRole {
    Send,
    Recv,
}

impl TransportRole {
    pub fn from_is_producer(is_producer: bool) -> Self {
        if is_producer { Self::Send } else { Self::Recv }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

// ── Stream metadata and announcements ────────────────────────────────────────

/// Free-form stream metadata. Known keys are typed; the rest is kept as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_screen_share: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StreamMetadata {
    /// Overlay the keys that `update` sets onto `self`.
    pub fn merge(&mut self, update: &StreamMetadata) {
        if update.publisher_id.is_some() {
            self.publisher_id.clone_from(&update.publisher_id);
        }
        if update.media_type.is_some() {
            self.media_type = update.media_type;
        }
        if update.is_screen_share.is_some() {
            self.is_screen_share = update.is_screen_share;
        }
        if update.target_user_id.is_some() {
            self.target_user_id.clone_from(&update.target_user_id);
        }
        if update.video_enabled.is_some() {
            self.video_enabled = update.video_enabled;
        }
        if update.audio_enabled.is_some() {
            self.audio_enabled = update.audio_enabled;
        }
        if update.display_name.is_some() {
            self.display_name.clone_from(&update.display_name);
        }
        for (k, v) in &update.extra {
            self.extra.insert(k.clone(), v.clone());
        }
    }
}

/// A remote stream announced by the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamAnnouncement {
    pub stream_id: String,
    #[serde(default)]
    pub publisher_id: Option<String>,
    #[serde(default)]
    pub producer_id: Option<String>,
    #[serde(default)]
    pub metadata: StreamMetadata,
    #[serde(default)]
    pub rtp_parameters: Option<RtpParameters>,
}

/// A participant listed by the router, with or without streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Server push describing a consumer ready to be materialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    #[serde(default)]
    pub consumer_id: Option<String>,
    #[serde(default)]
    pub producer_id: Option<String>,
    #[serde(default)]
    pub kind: Option<MediaKind>,
    #[serde(default)]
    pub rtp_parameters: Option<RtpParameters>,
    pub stream_id: String,
    #[serde(default)]
    pub publisher_id: Option<String>,
    #[serde(default)]
    pub metadata: StreamMetadata,
}

// ── Session records ──────────────────────────────────────────────────────────

/// One entry of the UI-facing stream list.
///
/// `media` is `None` for presence placeholders, which keep a participant visible
/// while their media cannot be shown.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub id: String,
    pub publisher_id: Option<String>,
    pub media: Option<MediaStream>,
    pub metadata: StreamMetadata,
}

impl StreamInfo {
    pub fn is_presence(&self) -> bool {
        self.media.is_none()
    }
}

/// A local track published on the send transport.
#[derive(Debug, Clone)]
pub struct ProducerInfo {
    pub producer_id: String,
    /// Server-assigned stream id, once the router has reported it.
    pub stream_id: Option<String>,
    pub kind: MediaKind,
    pub app_data: AppData,
    pub handle: Arc<dyn Producer>,
}

impl ProducerInfo {
    pub fn is_screen_share(&self) -> bool {
        self.app_data.is_screen()
    }
}

/// A remote track materialized on the receive transport.
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub consumer: Arc<dyn Consumer>,
    /// Server stream id the consumer was created for.
    pub stream_id: String,
    pub identity: StreamIdentity,
}

/// A stream announcement waiting for the receive transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStreamData {
    pub stream_id: String,
    pub publisher_id: Option<String>,
    pub producer_id: Option<String>,
    pub metadata: StreamMetadata,
    pub rtp_parameters: Option<RtpParameters>,
}

impl From<StreamAnnouncement> for PendingStreamData {
    fn from(a: StreamAnnouncement) -> Self {
        Self {
            stream_id: a.stream_id,
            publisher_id: a.publisher_id,
            producer_id: a.producer_id,
            metadata: a.metadata,
            rtp_parameters: a.rtp_parameters,
        }
    }
}

impl From<PendingStreamData> for StreamAnnouncement {
    fn from(p: PendingStreamData) -> Self {
        Self {
            stream_id: p.stream_id,
            publisher_id: p.publisher_id,
            producer_id: p.producer_id,
            metadata: p.metadata,
            rtp_parameters: p.rtp_parameters,
        }
    }
}

/// Server stream ids of this participant's own camera and microphone producers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentStreamIds {
    pub primary: Option<String>,
    pub video: Option<String>,
    pub audio: Option<String>,
}

impl CurrentStreamIds {
    pub fn for_kind(&self, kind: MediaKind) -> Option<&String> {
        match kind {
            MediaKind::Video => self.video.as_ref(),
            MediaKind::Audio => self.audio.as_ref(),
        }
        .or(self.primary.as_ref())
    }
}
