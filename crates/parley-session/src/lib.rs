//! Client-side session orchestration for SFU-routed conferences.
//!
//! A [`Session`] joins a room, builds one send and one receive transport,
//! publishes local tracks, materializes remote ones, and runs voice activity
//! detection over the local microphone. Media, signaling and the room directory
//! are collaborators behind traits ([`engine::MediaEngine`],
//! [`signaling::SignalingChannel`], [`directory::RoomDirectory`]).

pub mod consumer;
pub mod context;
pub mod debounce;
pub mod directory;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod producer;
pub mod room;
pub mod session;
pub mod signaling;
pub mod stream;
pub mod transport;
pub mod types;
pub mod vad;
pub mod waiter;

pub use error::{EngineError, JoinFailure, SessionError, SessionResult};
pub use events::{EventBus, SessionEvent};
pub use session::{Collaborators, Session};
