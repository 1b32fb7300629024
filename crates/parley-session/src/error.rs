//! Error types for the session layer.
//!
//! Collaborator failures are caught where they happen and either converted into a
//! fallback stream state or surfaced once as a [`crate::events::Notice`]. These
//! enums are what crosses the public API.

use crate::types::MediaKind;

/// Failures reported by the media engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("setRemoteDescription failed: {0}")]
    RemoteDescription(String),

    #[error("RTP parameters rejected: {0}")]
    RtpMismatch(String),

    #[error("InvalidAccessError: {0}")]
    InvalidAccess(String),

    #[error("OperationError: {0}")]
    Operation(String),

    #[error("No {0} device available")]
    DeviceUnavailable(MediaKind),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Transport closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// How a failed consume should be reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeFailure {
    /// Remote description or RTP parameters do not match the device.
    CodecIncompatible,
    /// The engine rejected the state; a fresh stream list should fix it.
    NeedsRefresh,
    /// Codec negotiation failed inside the engine.
    NegotiationFailed,
    Other,
}

impl EngineError {
    pub fn classify(&self) -> ConsumeFailure {
        match self {
            Self::RemoteDescription(_) | Self::RtpMismatch(_) => ConsumeFailure::CodecIncompatible,
            Self::InvalidAccess(_) => ConsumeFailure::NeedsRefresh,
            Self::Operation(_) => ConsumeFailure::NegotiationFailed,
            _ => ConsumeFailure::Other,
        }
    }
}

/// User-facing join failure categories.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinFailure {
    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Password required")]
    PasswordRequired,

    #[error("Invalid password")]
    InvalidPassword,

    #[error("{0}")]
    Other(String),
}

impl JoinFailure {
    /// Text suitable for a notice shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::ConnectionRefused => "Could not reach the room server".into(),
            Self::PasswordRequired => "This room is locked, a password is required".into(),
            Self::InvalidPassword => "The room password is incorrect".into(),
            Self::Other(msg) => format!("Could not join the room: {msg}"),
        }
    }
}

/// Core error type of the session layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    // === Negotiation ===
    #[error("No codec in common between the device and the router")]
    NoCommonCodec,

    #[error("Media device is not loaded")]
    DeviceNotLoaded,

    // === Timeouts ===
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    // === Resource state ===
    #[error("{0} is not available")]
    MissingResource(&'static str),

    #[error("{0} is already in progress")]
    InProgress(&'static str),

    #[error("Request was cancelled: {0}")]
    Cancelled(String),

    // === Authorization ===
    #[error("Only the room creator may {0}")]
    Unauthorized(&'static str),

    // === Validation ===
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    // === Collaborators ===
    #[error("Join failed: {0}")]
    Join(#[from] JoinFailure),

    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Signaling channel is not connected")]
    NotConnected,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Convenience alias for results in the session layer.
pub type SessionResult<T> = Result<T, SessionError>;
