//! Speech segmentation state machine.
//!
//! Driven entirely by the timestamps handed to it, so the same code runs on wall
//! clock in a session and on audio time in offline replays and tests.

use std::time::Duration;

use parley_common::config::VadConfig;
use serde::Serialize;

use super::detector::FrameFeatures;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    SilenceTimeout,
    MaxDuration,
    /// Frames became digital silence mid-recording.
    MicrophoneOff,
    MicrophoneDisabled,
    Stopped,
}

impl StopReason {
    fn is_forced(self) -> bool {
        !matches!(self, Self::SilenceTimeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    SpeechStarted,
    Chunk { samples: Vec<f32>, is_final: bool },
    /// The recording held less speech than the minimum and was dropped.
    Discarded { speech: Duration },
    SpeechEnded { reason: StopReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    Listening,
    Recording,
}

#[derive(Debug)]
pub struct SpeechSegmenter {
    config: VadConfig,
    state: SegmenterState,
    confirm_count: u32,
    pre_roll: Vec<f32>,
    pre_roll_start: Duration,
    buffer: Vec<f32>,
    recording_start: Duration,
    last_speech_end: Duration,
    /// Buffer length at the end of the most recent speech frame.
    speech_end_len: usize,
    silence_deadline: Option<Duration>,
    chunks_sent: u32,
    /// A periodic chunk already cut from the buffer, emitted once the buffer holds
    /// more speech. Becomes the final chunk if the recording ends first.
    held: Option<HeldChunk>,
}

#[derive(Debug)]
struct HeldChunk {
    samples: Vec<f32>,
    /// Samples up to the end of the last speech frame inside the chunk.
    speech_len: usize,
}

impl SpeechSegmenter {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: SegmenterState::Listening,
            confirm_count: 0,
            pre_roll: Vec::new(),
            pre_roll_start: Duration::ZERO,
            buffer: Vec::new(),
            recording_start: Duration::ZERO,
            last_speech_end: Duration::ZERO,
            speech_end_len: 0,
            silence_deadline: None,
            chunks_sent: 0,
            held: None,
        }
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == SegmenterState::Recording
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    fn samples_per_second(&self) -> u64 {
        u64::from(self.config.sample_rate.max(1)) * u64::from(self.config.channels.max(1))
    }

    fn span_of(&self, samples: usize) -> Duration {
        Duration::from_nanos(samples as u64 * 1_000_000_000 / self.samples_per_second())
    }

    fn chunk_samples(&self) -> usize {
        (self.config.chunk_duration_ms * self.samples_per_second() / 1_000) as usize
    }

    /// Feed one frame that starts at `at`.
    pub fn push(&mut self, samples: &[f32], at: Duration) -> Vec<SegmentEvent> {
        let mut events = self.tick(at);
        let frame_end = at + self.span_of(samples.len());
        let features = FrameFeatures::analyze(samples, self.config.near_zero_amplitude);

        if features.is_mic_off(&self.config) {
            self.reset_confirmation();
            if self.is_recording() {
                events.extend(self.stop(StopReason::MicrophoneOff, at));
            }
            return events;
        }

        let speech = features.is_speech(&self.config);
        match self.state {
            SegmenterState::Listening => {
                if !speech {
                    self.reset_confirmation();
                    return events;
                }
                if self.confirm_count == 0 {
                    self.pre_roll_start = at;
                }
                self.confirm_count += 1;
                self.pre_roll.extend_from_slice(samples);
                if self.confirm_count >= self.config.speech_confirm_frames.max(1) {
                    self.state = SegmenterState::Recording;
                    self.buffer = std::mem::take(&mut self.pre_roll);
                    self.recording_start = self.pre_roll_start;
                    self.last_speech_end = frame_end;
                    self.speech_end_len = self.buffer.len();
                    self.silence_deadline = None;
                    self.chunks_sent = 0;
                    self.held = None;
                    self.confirm_count = 0;
                    events.push(SegmentEvent::SpeechStarted);
                }
            }
            SegmenterState::Recording => {
                self.buffer.extend_from_slice(samples);
                if speech {
                    self.last_speech_end = frame_end;
                    self.speech_end_len = self.buffer.len();
                    self.silence_deadline = None;
                } else if self.silence_deadline.is_none() {
                    self.silence_deadline = Some(at + self.config.silence_duration());
                }

                self.cut_chunks(&mut events);

                if frame_end.saturating_sub(self.recording_start) >= self.config.max_recording() {
                    events.extend(self.stop(StopReason::MaxDuration, frame_end));
                }
            }
        }
        events
    }

    /// Fire any timer that expired by `now`.
    pub fn tick(&mut self, now: Duration) -> Vec<SegmentEvent> {
        if !self.is_recording() {
            return Vec::new();
        }
        if self.silence_deadline.is_some_and(|d| now >= d) {
            return self.stop(StopReason::SilenceTimeout, now);
        }
        if now.saturating_sub(self.recording_start) >= self.config.max_recording() {
            return self.stop(StopReason::MaxDuration, now);
        }
        Vec::new()
    }

    /// End the current recording, if any, and clear speech confirmation.
    pub fn force_stop(&mut self, reason: StopReason, now: Duration) -> Vec<SegmentEvent> {
        self.reset_confirmation();
        if self.is_recording() {
            self.stop(reason, now)
        } else {
            Vec::new()
        }
    }

    /// Split full chunks off the front of the buffer. The remainder stays buffered
    /// so no chunk exceeds the chunk size.
    fn cut_chunks(&mut self, events: &mut Vec<SegmentEvent>) {
        let chunk = self.chunk_samples().max(1);
        while self.buffer.len() >= chunk {
            if let Some(held) = self.held.take() {
                events.push(SegmentEvent::Chunk {
                    samples: held.samples,
                    is_final: false,
                });
            }
            let samples: Vec<f32> = self.buffer.drain(..chunk).collect();
            let speech_len = self.speech_end_len.min(chunk);
            self.speech_end_len = self.speech_end_len.saturating_sub(chunk);
            self.chunks_sent += 1;
            self.held = Some(HeldChunk { samples, speech_len });
        }
        // Speech after the cut guarantees a non-empty final chunk.
        if self.speech_end_len > 0 {
            if let Some(held) = self.held.take() {
                events.push(SegmentEvent::Chunk {
                    samples: held.samples,
                    is_final: false,
                });
            }
        }
    }

    fn reset_confirmation(&mut self) {
        self.confirm_count = 0;
        self.pre_roll.clear();
    }

    fn stop(&mut self, reason: StopReason, now: Duration) -> Vec<SegmentEvent> {
        let mut buffer = std::mem::take(&mut self.buffer);
        let recorded = if reason.is_forced() {
            now.saturating_sub(self.recording_start)
        } else {
            buffer.truncate(self.speech_end_len);
            self.last_speech_end.saturating_sub(self.recording_start)
        };

        let mut events = Vec::with_capacity(3);
        let held = self.held.take();
        if self.chunks_sent == 0 && recorded < self.config.min_recording() {
            events.push(SegmentEvent::Discarded { speech: recorded });
        } else {
            match held {
                Some(mut held) if buffer.is_empty() => {
                    if !reason.is_forced() {
                        held.samples.truncate(held.speech_len);
                    }
                    events.push(SegmentEvent::Chunk {
                        samples: held.samples,
                        is_final: true,
                    });
                }
                held => {
                    if let Some(held) = held {
                        events.push(SegmentEvent::Chunk {
                            samples: held.samples,
                            is_final: false,
                        });
                    }
                    events.push(SegmentEvent::Chunk {
                        samples: buffer,
                        is_final: true,
                    });
                }
            }
        }
        events.push(SegmentEvent::SpeechEnded { reason });

        self.state = SegmenterState::Listening;
        self.silence_deadline = None;
        self.speech_end_len = 0;
        self.chunks_sent = 0;
        self.reset_confirmation();
        events
    }
}
