//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for deployment.
//! Config precedence: env vars > .env file > parley.toml > defaults
//!
//! Every section implements [`Default`] with the protocol constants, so library
//! users can build a session without going through [`init`].

use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global configuration, if [`init`] has run.
pub fn get() -> Option<&'static AppConfig> {
    CONFIG.get()
}

/// Initialize the global configuration from environment.
///
/// Should be called once at startup, before anything reads the config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load(config::File::with_name("parley").required(false))?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration from defaults, the given file source and `PARLEY__*` env vars.
pub fn load<S>(file: S) -> Result<AppConfig, config::ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let cfg = config::Config::builder()
        .set_default("signaling.url", "ws://localhost:3016/signaling")?
        .set_default("signaling.api_base_url", "http://localhost:3016/api")?
        .set_default("logging.filter", "parley=debug")?
        .set_default("logging.json", false)?
        .add_source(file)
        // Environment variables (PARLEY__SIGNALING__URL, PARLEY__VAD__ENERGY_THRESHOLD, etc.)
        .add_source(
            config::Environment::with_prefix("PARLEY")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub vad: VadConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// WebSocket endpoint of the SFU signaling server.
    pub url: String,
    /// Base URL of the room directory (join requests).
    pub api_base_url: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3016/signaling".into(),
            api_base_url: "http://localhost:3016/api".into(),
        }
    }
}

/// Protocol timings for the transport/producer/consumer state machines.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Gap between the send- and receive-transport creation requests.
    pub recv_transport_delay_ms: u64,
    /// Bound on waiting for `transport-connected` after forwarding DTLS parameters.
    /// Expiry is soft: the engine keeps retrying.
    pub transport_connect_timeout_ms: u64,
    /// Bound on waiting for `producer-created`. Expiry fails the produce call.
    pub produce_timeout_ms: u64,
    /// Bound on request/response acknowledgements (pin, lock).
    pub request_timeout_ms: u64,
    /// How long a join waits for the signaling channel to report connected.
    pub signaling_connect_timeout_ms: u64,
    /// Retry delay for a queued stream whose receive transport exists but is not connected.
    pub pending_retry_delay_ms: u64,
    /// Per-stream-id coalescing window for UI writes.
    pub stream_debounce_ms: u64,
    /// Delay after joining before local media is acquired.
    pub local_media_delay_ms: u64,
    /// Delay between device-initialization retries.
    pub device_retry_delay_ms: u64,
    pub device_retry_attempts: u32,
    /// Use the reduced camera simulcast ladder.
    pub is_mobile: bool,
}

impl SessionConfig {
    pub fn recv_transport_delay(&self) -> Duration {
        Duration::from_millis(self.recv_transport_delay_ms)
    }

    pub fn transport_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_connect_timeout_ms)
    }

    pub fn produce_timeout(&self) -> Duration {
        Duration::from_millis(self.produce_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn signaling_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_connect_timeout_ms)
    }

    pub fn pending_retry_delay(&self) -> Duration {
        Duration::from_millis(self.pending_retry_delay_ms)
    }

    pub fn stream_debounce(&self) -> Duration {
        Duration::from_millis(self.stream_debounce_ms)
    }

    pub fn local_media_delay(&self) -> Duration {
        Duration::from_millis(self.local_media_delay_ms)
    }

    pub fn device_retry_delay(&self) -> Duration {
        Duration::from_millis(self.device_retry_delay_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recv_transport_delay_ms: 300,
            transport_connect_timeout_ms: 15_000,
            produce_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            signaling_connect_timeout_ms: 10_000,
            pending_retry_delay_ms: 500,
            stream_debounce_ms: 50,
            local_media_delay_ms: 1_000,
            device_retry_delay_ms: 2_000,
            device_retry_attempts: 3,
            is_mobile: false,
        }
    }
}

/// Speech detector and delivery constants.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VadConfig {
    /// Mean-square energy above which a frame may be speech.
    pub energy_threshold: f32,
    /// Zero-crossing rate below which a frame may be speech.
    pub zcr_threshold: f32,
    /// Consecutive speech frames needed before recording starts.
    pub speech_confirm_frames: u32,
    /// Silence that ends a recording.
    pub silence_duration_ms: u64,
    /// Recordings with less speech than this are discarded.
    pub min_recording_ms: u64,
    /// Hard stop for a single recording.
    pub max_recording_ms: u64,
    /// Buffered audio that triggers a periodic (non-final) delivery.
    pub chunk_duration_ms: u64,
    /// Absolute amplitude treated as zero by the microphone-off check.
    pub near_zero_amplitude: f32,
    /// Fraction of near-zero samples that marks a frame as "microphone off".
    pub mic_off_ratio: f32,
    /// Fraction of zero bytes above which a chunk is not sent.
    pub zero_byte_ratio: f32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Cap on a delivered PCM buffer (15s of 16kHz/16-bit mono).
    pub max_buffer_bytes: usize,
    /// Timer resolution of the frame loop when no frames arrive.
    pub tick_interval_ms: u64,
}

impl VadConfig {
    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(self.silence_duration_ms)
    }

    pub fn min_recording(&self) -> Duration {
        Duration::from_millis(self.min_recording_ms)
    }

    pub fn max_recording(&self) -> Duration {
        Duration::from_millis(self.max_recording_ms)
    }

    pub fn chunk_duration(&self) -> Duration {
        Duration::from_millis(self.chunk_duration_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.002,
            zcr_threshold: 0.3,
            speech_confirm_frames: 3,
            silence_duration_ms: 1_000,
            min_recording_ms: 300,
            max_recording_ms: 30_000,
            chunk_duration_ms: 15_000,
            near_zero_amplitude: 1e-4,
            mic_off_ratio: 0.98,
            zero_byte_ratio: 0.95,
            sample_rate: 16_000,
            channels: 1,
            max_buffer_bytes: 15 * 16_000 * 2,
            tick_interval_ms: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Fallback `EnvFilter` directive when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "parley=debug".into(),
            json: false,
        }
    }
}
