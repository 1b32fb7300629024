//! # parley-common
//!
//! Configuration and tracing bootstrap shared by the Parley crates.
//! No session logic lives here, only the knobs the session layer is tuned with.

pub mod config;
pub mod telemetry;
