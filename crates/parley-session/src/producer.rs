//! Local media: acquisition, publishing and toggles.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::context::{FlagGuard, SessionShared};
use crate::engine::{MediaConstraints, MediaStream, MediaTrack, ProduceOptions, Transport};
use crate::error::{SessionError, SessionResult};
use crate::events::{NoticeLevel, SessionEvent};
use crate::identity::LOCAL_STREAM_ID;
use crate::signaling::OutboundSignal;
use crate::stream::StreamManager;
use crate::types::{
    AppData, MediaKind, ProducerInfo, RtpEncodingParameters, StreamInfo, StreamMetadata,
    TransportRole,
};

fn layer(rid: &str, max_bitrate: u32, scale: f32) -> RtpEncodingParameters {
    RtpEncodingParameters {
        rid: Some(rid.to_owned()),
        max_bitrate: Some(max_bitrate),
        scale_resolution_down_by: Some(scale),
        ..Default::default()
    }
}

/// Simulcast ladder for camera video.
pub fn camera_encodings(mobile: bool) -> Vec<RtpEncodingParameters> {
    if mobile {
        vec![
            layer("r0", 50_000, 4.0),
            layer("r1", 150_000, 2.0),
            layer("r2", 500_000, 1.0),
        ]
    } else {
        vec![
            layer("r0", 100_000, 4.0),
            layer("r1", 300_000, 2.0),
            layer("r2", 900_000, 1.0),
        ]
    }
}

/// Screen content keeps full resolution on every layer.
pub fn screen_encodings() -> Vec<RtpEncodingParameters> {
    vec![
        layer("r0", 500_000, 1.0),
        layer("r1", 1_500_000, 1.0),
        layer("r2", 3_000_000, 1.0),
    ]
}

#[derive(Clone)]
pub struct ProducerManager {
    shared: Arc<SessionShared>,
}

impl ProducerManager {
    pub fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    /// Acquire camera and microphone, falling back to audio-only, then video-only.
    pub async fn initialize_local_media(&self) {
        let shared = &self.shared;
        let Some(_pending) = FlagGuard::acquire(&shared.flags.local_media_pending) else {
            debug!("Local media initialization already in flight");
            return;
        };
        if shared.media.lock().local_stream.is_some() {
            debug!("Local media already initialized");
            return;
        }

        let epoch = shared.epoch();
        let mut stream = None;
        for constraints in [
            MediaConstraints::AUDIO_VIDEO,
            MediaConstraints::AUDIO_ONLY,
            MediaConstraints::VIDEO_ONLY,
        ] {
            match shared.engine.get_user_media(constraints).await {
                Ok(s) if !s.is_empty() => {
                    stream = Some(s);
                    break;
                }
                Ok(_) => debug!(?constraints, "Capture returned no tracks"),
                Err(e) => warn!(?constraints, error = %e, "Media capture failed"),
            }
        }
        if !shared.is_current(epoch) {
            if let Some(s) = stream {
                s.stop_all();
            }
            return;
        }

        let camera = stream.as_ref().is_some_and(|s| s.track_of(MediaKind::Video).is_some());
        let micro = stream.as_ref().is_some_and(|s| s.track_of(MediaKind::Audio).is_some());
        shared.flags.no_camera.store(!camera, Ordering::SeqCst);
        shared.flags.no_micro.store(!micro, Ordering::SeqCst);
        shared.events.emit(SessionEvent::DevicesChanged {
            camera_available: camera,
            microphone_available: micro,
        });
        if !micro {
            shared.vad.set_microphone_enabled(false).await;
        }

        let Some(stream) = stream else {
            warn!("No camera or microphone available");
            shared
                .events
                .notice(NoticeLevel::Warning, "No camera or microphone available");
            return;
        };
        info!(camera, micro, tracks = stream.tracks.len(), "Local media ready");

        let metadata = {
            let mut media = shared.media.lock();
            for track in &stream.tracks {
                let enabled = match track.kind() {
                    MediaKind::Video => media.video_enabled,
                    MediaKind::Audio => media.audio_enabled,
                };
                track.set_enabled(enabled);
            }
            media.local_stream = Some(stream.clone());
            StreamMetadata {
                video_enabled: Some(camera && media.video_enabled),
                audio_enabled: Some(micro && media.audio_enabled),
                ..Default::default()
            }
        };
        StreamManager::new(Arc::clone(shared)).upsert_local(StreamInfo {
            id: LOCAL_STREAM_ID.to_owned(),
            publisher_id: shared.local_peer_id(),
            media: Some(stream),
            metadata,
        });

        if shared.transport(TransportRole::Send).is_some() {
            drop(_pending);
            self.publish_tracks().await;
        }
    }

    /// Publish the live local tracks, video first. Idempotent.
    pub async fn publish_tracks(&self) -> bool {
        let shared = &self.shared;
        let Some(_publishing) = FlagGuard::acquire(&shared.flags.publishing) else {
            debug!("Publishing already in flight");
            return false;
        };
        let local = {
            let media = shared.media.lock();
            if media.has_camera_producers() {
                debug!("Producers already exist, skipping publish");
                return false;
            }
            media.local_stream.clone()
        };
        if !shared.engine.is_loaded() {
            warn!("Cannot publish before the device is loaded");
            return false;
        }
        let Some(transport) = shared.transport(TransportRole::Send) else {
            warn!("Cannot publish without a send transport");
            return false;
        };
        let Some(local) = local else {
            debug!("No local stream to publish");
            return false;
        };

        let video = live_track(&local, MediaKind::Video);
        let audio = live_track(&local, MediaKind::Audio);
        if video.is_none() && audio.is_none() {
            info!("No live tracks to publish");
            return false;
        }

        let mut published = false;
        if let Some(track) = video {
            published |= self
                .produce(
                    &transport,
                    track,
                    AppData::camera(MediaKind::Video),
                    camera_encodings(shared.config.is_mobile),
                )
                .await;
        }
        if let Some(track) = audio {
            published |= self
                .produce(&transport, track, AppData::camera(MediaKind::Audio), Vec::new())
                .await;
        }
        published
    }

    /// Publish screen video and, if present, screen audio as separate producers.
    pub async fn publish_screen_share_tracks(&self, stream: MediaStream) -> bool {
        let shared = &self.shared;
        let Some(_publishing) = FlagGuard::acquire(&shared.flags.publishing_screen) else {
            debug!("Screen publishing already in flight");
            return false;
        };
        let Some(transport) = shared.transport(TransportRole::Send) else {
            warn!("Cannot share screen without a send transport");
            return false;
        };
        let Some(video) = live_track(&stream, MediaKind::Video) else {
            warn!("Screen capture has no live video track");
            return false;
        };
        shared.media.lock().screen_stream = Some(stream.clone());

        let published = self
            .produce(&transport, video, AppData::screen(MediaKind::Video), screen_encodings())
            .await;
        if let Some(audio) = live_track(&stream, MediaKind::Audio) {
            self.produce(&transport, audio, AppData::screen(MediaKind::Audio), Vec::new())
                .await;
        }
        published
    }

    /// Unpublish and close every screen-share producer. Returns how many were removed.
    pub async fn unpublish_screen_share(&self) -> usize {
        let shared = &self.shared;
        let (removed, screen_stream) = {
            let mut media = shared.media.lock();
            let ids: Vec<String> = media
                .producers
                .values()
                .filter(|p| p.is_screen_share())
                .map(|p| p.producer_id.clone())
                .collect();
            let mut removed = Vec::with_capacity(ids.len());
            for id in &ids {
                let Some(p) = media.producers.remove(id) else {
                    continue;
                };
                let stream_id = p
                    .stream_id
                    .clone()
                    .or_else(|| media.server_stream_ids.get(&p.producer_id).cloned())
                    .unwrap_or_else(|| p.producer_id.clone());
                removed.push((p, stream_id));
            }
            (removed, media.screen_stream.take())
        };

        for (producer, stream_id) in &removed {
            shared
                .send(OutboundSignal::Unpublish {
                    stream_id: stream_id.clone(),
                })
                .await;
            producer.handle.close();
            info!(producer_id = %producer.producer_id, %stream_id, "Screen producer removed");
        }
        if let Some(stream) = screen_stream {
            stream.stop_all();
        }
        removed.len()
    }

    pub async fn toggle_screen_share(&self) -> SessionResult<bool> {
        let sharing = {
            let media = self.shared.media.lock();
            media.screen_stream.is_some() || media.producers.values().any(|p| p.is_screen_share())
        };
        if sharing {
            self.unpublish_screen_share().await;
            return Ok(false);
        }

        let stream = self.shared.engine.get_display_media().await.inspect_err(|e| {
            warn!(error = %e, "Screen capture failed");
        })?;
        if self.publish_screen_share_tracks(stream.clone()).await {
            Ok(true)
        } else {
            stream.stop_all();
            self.shared.media.lock().screen_stream = None;
            Err(SessionError::Rejected("screen share could not be published".into()))
        }
    }

    pub async fn toggle_video(&self) -> SessionResult<bool> {
        if self.shared.flags.no_camera.load(Ordering::SeqCst) {
            return Err(SessionError::MissingResource("camera"));
        }
        self.toggle_kind(MediaKind::Video).await
    }

    /// Also gates the VAD microphone state.
    pub async fn toggle_audio(&self) -> SessionResult<bool> {
        if self.shared.flags.no_micro.load(Ordering::SeqCst) {
            return Err(SessionError::MissingResource("microphone"));
        }
        let enabled = self.toggle_kind(MediaKind::Audio).await?;
        self.shared.vad.set_microphone_enabled(enabled).await;
        Ok(enabled)
    }

    async fn toggle_kind(&self, kind: MediaKind) -> SessionResult<bool> {
        let shared = &self.shared;
        let (enabled, producer, track, stream_id) = {
            let mut media = shared.media.lock();
            let flag = match kind {
                MediaKind::Video => &mut media.video_enabled,
                MediaKind::Audio => &mut media.audio_enabled,
            };
            *flag = !*flag;
            let enabled = *flag;
            let producer = media.find_producer(kind, false).map(|p| Arc::clone(&p.handle));
            let track = media
                .local_stream
                .as_ref()
                .and_then(|s| s.track_of(kind).cloned());
            let stream_id = media.current_ids.for_kind(kind).cloned();
            (enabled, producer, track, stream_id)
        };

        if let Some(track) = &track {
            track.set_enabled(enabled);
        }
        match (&producer, enabled) {
            (Some(p), true) => p.resume(),
            (Some(p), false) => p.pause(),
            (None, true) if shared.flags.publishing.load(Ordering::SeqCst) => {
                debug!(%kind, "Publish in flight, it will pick up the enabled track");
            }
            (None, true) => {
                let transport = shared.transport(TransportRole::Send);
                if let (Some(track), Some(transport)) = (track, transport) {
                    let (app_data, encodings) = match kind {
                        MediaKind::Video => (
                            AppData::camera(kind),
                            camera_encodings(shared.config.is_mobile),
                        ),
                        MediaKind::Audio => (AppData::camera(kind), Vec::new()),
                    };
                    self.produce(&transport, track, app_data, encodings).await;
                }
            }
            (None, false) => {}
        }

        if let Some(stream_id) = stream_id {
            let metadata = match kind {
                MediaKind::Video => StreamMetadata {
                    video_enabled: Some(enabled),
                    ..Default::default()
                },
                MediaKind::Audio => StreamMetadata {
                    audio_enabled: Some(enabled),
                    ..Default::default()
                },
            };
            shared
                .send(OutboundSignal::UpdateStreamMetadata { stream_id, metadata })
                .await;
        }
        info!(%kind, enabled, "Local track toggled");
        Ok(enabled)
    }

    /// Produce `track`, or swap it into the existing producer of the same kind and share type.
    async fn produce(
        &self,
        transport: &Arc<dyn Transport>,
        track: Arc<dyn MediaTrack>,
        app_data: AppData,
        encodings: Vec<RtpEncodingParameters>,
    ) -> bool {
        let kind = track.kind();
        let screen = app_data.is_screen();
        let existing = self
            .shared
            .media
            .lock()
            .find_producer(kind, screen)
            .map(|p| Arc::clone(&p.handle));
        if let Some(producer) = existing {
            return match producer.replace_track(track).await {
                Ok(()) => {
                    info!(%kind, screen, producer_id = producer.id(), "Track replaced");
                    true
                }
                Err(e) => {
                    warn!(%kind, screen, error = %e, "Track replacement failed");
                    false
                }
            };
        }

        let options = ProduceOptions {
            track: Arc::clone(&track),
            encodings,
            app_data: app_data.clone(),
        };
        match transport.produce(options).await {
            Ok(handle) => {
                let mut media = self.shared.media.lock();
                if media.find_producer(kind, screen).is_some() {
                    debug!(%kind, screen, "Producer created concurrently, closing duplicate");
                    handle.close();
                    return true;
                }
                // The track may have been toggled while the producer was being created.
                if !track.enabled() {
                    handle.pause();
                }
                let producer_id = handle.id().to_owned();
                let stream_id = media.server_stream_ids.get(&producer_id).cloned();
                info!(%kind, screen, %producer_id, ?stream_id, "Producer created");
                media.producers.insert(
                    producer_id.clone(),
                    ProducerInfo {
                        producer_id,
                        stream_id,
                        kind,
                        app_data,
                        handle,
                    },
                );
                true
            }
            Err(e) => {
                warn!(%kind, screen, error = %e, "Produce failed");
                false
            }
        }
    }

    /// Record the server's confirmation of a producer.
    pub fn handle_producer_created(
        &self,
        producer_id: &str,
        kind: MediaKind,
        stream_id: Option<String>,
        app_data: &AppData,
    ) {
        let Some(stream_id) = stream_id else {
            return;
        };
        let mut media = self.shared.media.lock();
        media
            .server_stream_ids
            .insert(producer_id.to_owned(), stream_id.clone());
        if let Some(p) = media.producers.get_mut(producer_id) {
            p.stream_id = Some(stream_id.clone());
        }
        if !app_data.is_screen() {
            let ids = &mut media.current_ids;
            ids.primary.get_or_insert_with(|| stream_id.clone());
            match kind {
                MediaKind::Video => ids.video = Some(stream_id),
                MediaKind::Audio => ids.audio = Some(stream_id),
            }
        }
    }

    /// Close every producer and release local capture.
    pub fn close_all(&self) {
        let (producers, local, screen) = {
            let mut media = self.shared.media.lock();
            let producers: Vec<ProducerInfo> = media.producers.drain().map(|(_, p)| p).collect();
            (producers, media.local_stream.take(), media.screen_stream.take())
        };
        for p in &producers {
            p.handle.close();
        }
        for stream in local.iter().chain(screen.iter()) {
            stream.stop_all();
        }
    }
}

fn live_track(stream: &MediaStream, kind: MediaKind) -> Option<Arc<dyn MediaTrack>> {
    stream
        .track_of(kind)
        .filter(|t| t.is_live())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_ladders() {
        let desktop: Vec<_> = camera_encodings(false)
            .iter()
            .filter_map(|e| e.max_bitrate)
            .collect();
        assert_eq!(desktop, [100_000, 300_000, 900_000]);
        let mobile: Vec<_> = camera_encodings(true).iter().filter_map(|e| e.max_bitrate).collect();
        assert_eq!(mobile, [50_000, 150_000, 500_000]);
        assert_eq!(camera_encodings(false)[0].scale_resolution_down_by, Some(4.0));
    }

    #[test]
    fn screen_ladder() {
        let rates: Vec<_> = screen_encodings().iter().filter_map(|e| e.max_bitrate).collect();
        assert_eq!(rates, [500_000, 1_500_000, 3_000_000]);
    }
}
