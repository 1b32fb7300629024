//! Events broadcast to UI collaborators.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::vad::VadEvent;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A single user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Joined { room_id: String, peer_id: String },
    Left,
    /// The regular or screen stream list changed; re-read the snapshots.
    StreamsChanged,
    Notice(Notice),
    CodecIncompatible { stream_id: String, publisher_id: Option<String> },
    CodecNegotiationFailed { stream_id: String, publisher_id: Option<String> },
    PeerLeft { peer_id: String, kicked: bool },
    SpeakingChanged { peer_id: String, speaking: bool },
    RoomLockChanged { locked: bool },
    PinChanged { peer_id: String, pinned: bool },
    DevicesChanged { camera_available: bool, microphone_available: bool },
    Vad(VadEvent),
}

/// Fan-out of [`SessionEvent`]s. Sending with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        trace!(?event, "Session event");
        let _ = self.sender.send(event);
    }

    pub fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
        self.emit(SessionEvent::Notice(Notice {
            level,
            message: message.into(),
        }));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
