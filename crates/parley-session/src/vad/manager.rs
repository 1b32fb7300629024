//! VAD lifecycle and delivery.
//!
//! States are `Idle → Listening → (Recording ⇄ Listening) → Idle`. Frames are fed
//! either by the pump spawned in [`VadManager::start_with_frames`] (wall clock) or
//! directly through [`VadManager::push_frame_at`] (caller-supplied audio time).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_common::config::VadConfig;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::VadEvent;
use super::pcm;
use super::segmenter::{SegmentEvent, SpeechSegmenter, StopReason};
use crate::error::{SessionError, SessionResult};
use crate::events::{EventBus, SessionEvent};
use crate::signaling::{AudioChunk, OutboundSignal, SignalingChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VadSnapshot {
    pub is_initialized: bool,
    pub is_listening: bool,
    pub is_recording: bool,
    pub microphone_enabled: bool,
}

#[derive(Debug, Clone)]
struct Speaker {
    user_id: String,
    room_id: String,
}

struct Runtime {
    segmenter: SpeechSegmenter,
    initialized: bool,
    listening: bool,
    microphone_enabled: bool,
    speaker: Option<Speaker>,
    origin: Instant,
    /// Latest time seen by the segmenter.
    last_at: Duration,
}

impl Runtime {
    fn snapshot(&self) -> VadSnapshot {
        VadSnapshot {
            is_initialized: self.initialized,
            is_listening: self.listening,
            is_recording: self.segmenter.is_recording(),
            microphone_enabled: self.microphone_enabled,
        }
    }
}

struct Inner {
    config: VadConfig,
    signaling: Arc<dyn SignalingChannel>,
    events: EventBus,
    runtime: Mutex<Runtime>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct VadManager {
    inner: Arc<Inner>,
}

impl VadManager {
    pub fn new(config: VadConfig, signaling: Arc<dyn SignalingChannel>, events: EventBus) -> Self {
        let runtime = Runtime {
            segmenter: SpeechSegmenter::new(config.clone()),
            initialized: false,
            listening: false,
            microphone_enabled: true,
            speaker: None,
            origin: Instant::now(),
            last_at: Duration::ZERO,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                signaling,
                events,
                runtime: Mutex::new(runtime),
                pump: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.inner.config
    }

    /// Who chunks are attributed to.
    pub fn set_identity(&self, user_id: impl Into<String>, room_id: impl Into<String>) {
        self.inner.runtime.lock().speaker = Some(Speaker {
            user_id: user_id.into(),
            room_id: room_id.into(),
        });
    }

    pub fn clear_identity(&self) {
        self.inner.runtime.lock().speaker = None;
    }

    pub fn snapshot(&self) -> VadSnapshot {
        self.inner.runtime.lock().snapshot()
    }

    fn publish_state(&self) {
        let snapshot = self.snapshot();
        self.inner
            .events
            .emit(SessionEvent::Vad(VadEvent::StateChanged(snapshot)));
    }

    /// Idle → Listening. Requires the microphone to be enabled.
    pub fn start(&self) -> SessionResult<()> {
        {
            let mut rt = self.inner.runtime.lock();
            if !rt.microphone_enabled {
                return Err(SessionError::Rejected("microphone is disabled".into()));
            }
            if rt.listening {
                debug!("VAD already listening");
                return Ok(());
            }
            rt.initialized = true;
            rt.listening = true;
            rt.origin = Instant::now();
            rt.last_at = Duration::ZERO;
            rt.segmenter = SpeechSegmenter::new(self.inner.config.clone());
        }
        info!("VAD listening");
        self.publish_state();
        Ok(())
    }

    /// Start listening and consume frames from `frames` until it closes or [`stop`](Self::stop).
    pub fn start_with_frames(&self, mut frames: mpsc::Receiver<Vec<f32>>) -> SessionResult<()> {
        self.start()?;
        let vad = self.clone();
        let tick = self.inner.config.tick_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    frame = frames.recv() => match frame {
                        Some(samples) => vad.push_frame(&samples).await,
                        None => break,
                    },
                    _ = ticker.tick() => vad.poll().await,
                }
            }
            debug!("VAD frame source closed");
        });
        if let Some(old) = self.inner.pump.lock().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// Listening/Recording → Idle. Any recording in progress is finalized.
    pub async fn stop(&self) {
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        let events = {
            let mut rt = self.inner.runtime.lock();
            if !rt.listening {
                return;
            }
            rt.listening = false;
            let at = rt.last_at;
            rt.segmenter.force_stop(StopReason::Stopped, at)
        };
        self.deliver(events).await;
        info!("VAD stopped");
        self.publish_state();
    }

    /// Disabling forces an immediate stop and clears speech confirmation.
    pub async fn set_microphone_enabled(&self, enabled: bool) {
        let events = {
            let mut rt = self.inner.runtime.lock();
            if rt.microphone_enabled == enabled {
                return;
            }
            rt.microphone_enabled = enabled;
            if enabled {
                Vec::new()
            } else {
                let at = rt.last_at;
                rt.segmenter.force_stop(StopReason::MicrophoneDisabled, at)
            }
        };
        debug!(enabled, "VAD microphone state");
        self.deliver(events).await;
        self.publish_state();
    }

    /// Feed a frame timestamped by the wall clock.
    pub async fn push_frame(&self, samples: &[f32]) {
        let at = self.inner.runtime.lock().origin.elapsed();
        self.push_frame_at(samples, at).await;
    }

    /// Feed a frame that starts `at` after listening began.
    pub async fn push_frame_at(&self, samples: &[f32], at: Duration) {
        let events = {
            let mut rt = self.inner.runtime.lock();
            if !rt.listening || !rt.microphone_enabled {
                return;
            }
            rt.last_at = rt.last_at.max(at);
            rt.segmenter.push(samples, at)
        };
        self.deliver(events).await;
    }

    /// Fire expired timers against the wall clock.
    pub async fn poll(&self) {
        let now = self.inner.runtime.lock().origin.elapsed();
        self.poll_at(now).await;
    }

    pub async fn poll_at(&self, now: Duration) {
        let events = {
            let mut rt = self.inner.runtime.lock();
            if !rt.listening {
                return;
            }
            rt.last_at = rt.last_at.max(now);
            rt.segmenter.tick(now)
        };
        self.deliver(events).await;
    }

    async fn deliver(&self, events: Vec<SegmentEvent>) {
        if events.is_empty() {
            return;
        }
        let speaker = self.inner.runtime.lock().speaker.clone();
        for event in events {
            match event {
                SegmentEvent::SpeechStarted => {
                    info!("Speech started");
                    if let Some(s) = &speaker {
                        self.send(OutboundSignal::MySpeaking {
                            peer_id: s.user_id.clone(),
                        })
                        .await;
                    }
                    self.inner
                        .events
                        .emit(SessionEvent::Vad(VadEvent::SpeechStarted));
                }
                SegmentEvent::Chunk { samples, is_final } => {
                    self.deliver_chunk(&samples, is_final, speaker.as_ref()).await;
                }
                SegmentEvent::Discarded { speech } => {
                    debug!(speech_ms = speech.as_millis() as u64, "Recording too short, discarded");
                    self.inner.events.emit(SessionEvent::Vad(VadEvent::Discarded {
                        duration_ms: speech.as_millis() as u64,
                    }));
                }
                SegmentEvent::SpeechEnded { reason } => {
                    info!(?reason, "Speech ended");
                    if let Some(s) = &speaker {
                        self.send(OutboundSignal::MyStopSpeaking {
                            peer_id: s.user_id.clone(),
                        })
                        .await;
                    }
                    self.inner
                        .events
                        .emit(SessionEvent::Vad(VadEvent::SpeechEnded { reason }));
                }
            }
        }
    }

    async fn deliver_chunk(&self, samples: &[f32], is_final: bool, speaker: Option<&Speaker>) {
        let cfg = &self.inner.config;
        let bytes = pcm::to_pcm16(samples);
        let zero_ratio = pcm::zero_byte_ratio(&bytes);
        if zero_ratio > cfg.zero_byte_ratio {
            debug!(zero_ratio, is_final, "Chunk is mostly silence, not sent");
            self.inner
                .events
                .emit(SessionEvent::Vad(VadEvent::ChunkSuppressed { is_final }));
            return;
        }

        let Some(speaker) = speaker else {
            warn!("No identity for audio chunk, dropping");
            return;
        };

        let buffer = pcm::cap_tail(bytes, cfg.max_buffer_bytes);
        let duration = pcm::duration_secs(&buffer, cfg.sample_rate, cfg.channels);
        let len = buffer.len();
        let chunk = AudioChunk {
            user_id: speaker.user_id.clone(),
            room_id: speaker.room_id.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            buffer,
            duration,
            sample_rate: cfg.sample_rate,
            channels: cfg.channels,
            is_final,
        };
        debug!(bytes = len, duration, is_final, "Sending audio chunk");
        if self.send(OutboundSignal::AudioBuffer(chunk)).await {
            self.inner.events.emit(SessionEvent::Vad(VadEvent::ChunkSent {
                duration_secs: duration,
                bytes: len,
                is_final,
            }));
        }
    }

    async fn send(&self, signal: OutboundSignal) -> bool {
        let name = signal.name();
        match self.inner.signaling.emit(signal).await {
            Ok(()) => true,
            Err(e) => {
                warn!(event = name, error = %e, "VAD signal not sent");
                false
            }
        }
    }
}
