//! Voice activity detection and speech delivery.
//!
//! - [`detector`]: per-frame energy, zero-crossing and silence features
//! - [`segmenter`]: the Listening/Recording state machine
//! - [`pcm`]: PCM16 conversion and delivery limits
//! - [`manager`]: frame pump, microphone gating and delivery to signaling

pub mod detector;
pub mod manager;
pub mod pcm;
pub mod segmenter;

use serde::Serialize;

pub use manager::{VadManager, VadSnapshot};
pub use segmenter::{SegmentEvent, SpeechSegmenter, StopReason};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "vad", rename_all = "snake_case")]
pub enum VadEvent {
    SpeechStarted,
    ChunkSent {
        duration_secs: f64,
        bytes: usize,
        is_final: bool,
    },
    /// The chunk was mostly zero bytes and was not sent.
    ChunkSuppressed { is_final: bool },
    Discarded { duration_ms: u64 },
    SpeechEnded { reason: StopReason },
    StateChanged(VadSnapshot),
}
