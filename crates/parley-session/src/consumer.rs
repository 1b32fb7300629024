//! Remote track materialization on the receive transport.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::context::SessionShared;
use crate::engine::{ConsumeOptions, Consumer, MediaStream};
use crate::error::ConsumeFailure;
use crate::events::SessionEvent;
use crate::identity::{StreamClass, StreamIdentity};
use crate::signaling::OutboundSignal;
use crate::stream::StreamManager;
use crate::types::{
    ConsumerDescriptor, ConsumerInfo, MediaKind, RtpParameters, StreamMetadata, TransportRole,
};

/// Structural check of consumer RTP parameters before they reach the engine.
pub fn validate_codecs(rtp_parameters: &RtpParameters) -> Result<(), String> {
    if rtp_parameters.codecs.is_empty() {
        return Err("no codecs".into());
    }
    for (i, codec) in rtp_parameters.codecs.iter().enumerate() {
        if codec.mime_type.as_deref().is_none_or(str::is_empty) {
            return Err(format!("codec {i} has no mimeType"));
        }
        if codec.payload_type.is_none() {
            return Err(format!("codec {i} has no payloadType"));
        }
        if codec.clock_rate.is_none_or(|r| r == 0) {
            return Err(format!("codec {i} has no clockRate"));
        }
    }
    Ok(())
}

/// H.264 High profile (`profile-level-id` 64xxxx) decodes poorly on some devices.
pub fn has_risky_h264_profile(rtp_parameters: &RtpParameters) -> bool {
    rtp_parameters.codecs.iter().any(|codec| {
        codec
            .mime_type
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("video/h264"))
            && codec
                .parameters
                .get("profile-level-id")
                .and_then(|v| v.as_str())
                .is_some_and(|p| p.starts_with("64"))
    })
}

#[derive(Clone)]
pub struct ConsumerManager {
    shared: Arc<SessionShared>,
}

impl ConsumerManager {
    pub fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    /// Materialize a server-pushed consumer. Returns `true` if a track was added.
    ///
    /// Every failure path leaves the stream out of the consuming set and shows
    /// the publisher as a presence entry instead.
    pub async fn create_consumer(&self, descriptor: ConsumerDescriptor) -> bool {
        let shared = &self.shared;
        let stream_id = descriptor.stream_id.clone();
        let identity = StreamIdentity::resolve(
            &stream_id,
            descriptor.publisher_id.as_deref(),
            descriptor.kind,
            &descriptor.metadata,
        );
        let fallback_publisher = identity
            .as_ref()
            .map(|i| i.publisher_id.clone())
            .or_else(|| descriptor.publisher_id.clone());

        let ConsumerDescriptor {
            consumer_id,
            producer_id,
            kind,
            rtp_parameters,
            metadata,
            ..
        } = descriptor;
        let (Some(consumer_id), Some(producer_id), Some(kind), Some(rtp_parameters)) =
            (consumer_id, producer_id, kind, rtp_parameters)
        else {
            warn!(%stream_id, "Consumer descriptor incomplete, rendering presence");
            self.fall_back(&stream_id, fallback_publisher.as_deref(), &metadata);
            return false;
        };
        let Some(identity) = identity else {
            warn!(%stream_id, "Cannot resolve stream identity, rendering presence");
            self.fall_back(&stream_id, fallback_publisher.as_deref(), &metadata);
            return false;
        };

        if let Err(reason) = validate_codecs(&rtp_parameters) {
            warn!(%stream_id, %reason, "Invalid consumer RTP parameters");
            shared.events.emit(SessionEvent::CodecIncompatible {
                stream_id: stream_id.clone(),
                publisher_id: Some(identity.publisher_id.clone()),
            });
            self.fall_back(&stream_id, Some(&identity.publisher_id), &metadata);
            return false;
        }
        if has_risky_h264_profile(&rtp_parameters) {
            warn!(%stream_id, "H.264 high profile stream, decoding may fail on this device");
        }

        if !identity.is_screen_share() && shared.is_local_peer(&identity.publisher_id) {
            debug!(%stream_id, "Not consuming own stream");
            shared.streams.lock().consuming.remove(&stream_id);
            return false;
        }

        {
            let mut media = shared.media.lock();
            if media.consumers.contains_key(&consumer_id)
                || !media.materializing.insert(consumer_id.clone())
            {
                debug!(%consumer_id, "Consumer already exists");
                return false;
            }
        }

        let epoch = shared.epoch();
        let removal = shared.streams.lock().removal_mark(&identity);
        let result = match shared.transport(TransportRole::Recv) {
            Some(transport) => transport
                .consume(ConsumeOptions {
                    id: consumer_id.clone(),
                    producer_id,
                    kind,
                    rtp_parameters,
                })
                .await
                .map_err(Some),
            None => Err(None),
        };
        shared.media.lock().materializing.remove(&consumer_id);

        let consumer = match result {
            Ok(consumer) => consumer,
            Err(None) => {
                warn!(%stream_id, "No receive transport, rendering presence");
                self.fall_back(&stream_id, Some(&identity.publisher_id), &metadata);
                return false;
            }
            Err(Some(e)) => {
                error!(%stream_id, %consumer_id, error = %e, "Consume failed");
                let publisher_id = Some(identity.publisher_id.clone());
                match e.classify() {
                    ConsumeFailure::CodecIncompatible => {
                        shared.events.emit(SessionEvent::CodecIncompatible {
                            stream_id: stream_id.clone(),
                            publisher_id,
                        })
                    }
                    ConsumeFailure::NegotiationFailed => {
                        shared.events.emit(SessionEvent::CodecNegotiationFailed {
                            stream_id: stream_id.clone(),
                            publisher_id,
                        })
                    }
                    ConsumeFailure::NeedsRefresh => {
                        shared.send(OutboundSignal::GetStreams).await;
                    }
                    ConsumeFailure::Other => {}
                }
                self.fall_back(&stream_id, Some(&identity.publisher_id), &metadata);
                return false;
            }
        };
        if !shared.is_current(epoch) {
            consumer.close();
            return false;
        }
        if shared.streams.lock().removal_mark(&identity) != removal {
            info!(%stream_id, %consumer_id, "Stream removed while consuming, closing consumer");
            consumer.close();
            shared.streams.lock().consuming.remove(&stream_id);
            return false;
        }

        let to_pause = self.register(&consumer_id, &consumer, &stream_id, &identity);
        for c in &to_pause {
            c.pause();
        }

        let ui_id = identity.ui_stream_id();
        {
            let mut streams = shared.streams.lock();
            streams
                .aggregates
                .entry(ui_id.clone())
                .or_insert_with(|| MediaStream::new(ui_id.clone()))
                .add_track(consumer.track());
            streams.settling.entry(ui_id.clone()).or_default().push(stream_id.clone());
        }

        shared
            .send(OutboundSignal::ResumeConsumer {
                consumer_id: consumer_id.clone(),
            })
            .await;
        StreamManager::new(Arc::clone(shared)).schedule_upsert(identity, metadata);
        info!(%stream_id, %consumer_id, %ui_id, %kind, "Consumer created");
        true
    }

    /// Record the consumer and apply translation substitution. Returns the
    /// consumers that must be paused.
    fn register(
        &self,
        consumer_id: &str,
        consumer: &Arc<dyn Consumer>,
        stream_id: &str,
        identity: &StreamIdentity,
    ) -> Vec<Arc<dyn Consumer>> {
        let mut guard = self.shared.media.lock();
        let media = &mut *guard;
        media.consumers.insert(
            consumer_id.to_owned(),
            ConsumerInfo {
                consumer: Arc::clone(consumer),
                stream_id: stream_id.to_owned(),
                identity: identity.clone(),
            },
        );

        let target = &identity.publisher_id;
        match identity.class {
            StreamClass::Translated => {
                let originals: Vec<(String, Arc<dyn Consumer>)> = media
                    .consumers
                    .iter()
                    .filter(|(_, c)| {
                        &c.identity.publisher_id == target
                            && c.identity.class == StreamClass::Camera(MediaKind::Audio)
                    })
                    .map(|(id, c)| (id.clone(), Arc::clone(&c.consumer)))
                    .collect();
                let state = media.translations.entry(target.clone()).or_default();
                state.consumer_id = Some(consumer_id.to_owned());
                for (id, _) in &originals {
                    if !state.paused_consumers.contains(id) {
                        state.paused_consumers.push(id.clone());
                    }
                }
                info!(target_user_id = %target, paused = originals.len(), "Translation active");
                originals.into_iter().map(|(_, c)| c).collect()
            }
            StreamClass::Camera(MediaKind::Audio) => match media.translations.get_mut(target) {
                Some(state) if state.consumer_id.is_some() => {
                    state.paused_consumers.push(consumer_id.to_owned());
                    vec![Arc::clone(consumer)]
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn fall_back(&self, stream_id: &str, publisher_id: Option<&str>, metadata: &StreamMetadata) {
        self.shared.streams.lock().consuming.remove(stream_id);
        if let Some(publisher_id) = publisher_id {
            StreamManager::new(Arc::clone(&self.shared))
                .render_presence(publisher_id, metadata.clone());
        }
    }

    /// Resume the original audio of `target_user_id` and drop its translation.
    pub async fn revert_translation_stream(&self, target_user_id: &str) -> bool {
        let (translation, resumed) = {
            let mut media = self.shared.media.lock();
            let Some(state) = media.translations.remove(target_user_id) else {
                return false;
            };
            let translation = state
                .consumer_id
                .as_ref()
                .and_then(|id| media.consumers.remove(id));
            let resumed: Vec<Arc<dyn Consumer>> = state
                .paused_consumers
                .iter()
                .filter_map(|id| media.consumers.get(id))
                .map(|c| Arc::clone(&c.consumer))
                .collect();
            (translation, resumed)
        };

        for consumer in &resumed {
            consumer.resume();
            self.shared
                .send(OutboundSignal::ResumeConsumer {
                    consumer_id: consumer.id().to_owned(),
                })
                .await;
        }
        if let Some(info) = &translation {
            info.consumer.close();
        }

        let ui_id = StreamIdentity {
            server_stream_id: String::new(),
            publisher_id: target_user_id.to_owned(),
            class: StreamClass::Translated,
        }
        .ui_stream_id();
        {
            let mut streams = self.shared.streams.lock();
            streams.settling.remove(&ui_id);
            if let Some(info) = &translation {
                streams.consuming.remove(&info.stream_id);
            }
            streams.remove(&ui_id);
        }
        info!(%target_user_id, resumed = resumed.len(), "Translation reverted");
        self.shared.events.emit(SessionEvent::StreamsChanged);
        true
    }

    /// Close one consumer and take its track out of the aggregate.
    pub async fn remove_consumer(&self, consumer_id: &str) -> bool {
        let (info, translation_target) = {
            let mut media = self.shared.media.lock();
            let Some(info) = media.consumers.remove(consumer_id) else {
                return false;
            };
            let mut target = None;
            for (user, state) in media.translations.iter_mut() {
                state.paused_consumers.retain(|id| id != consumer_id);
                if state.consumer_id.as_deref() == Some(consumer_id) {
                    target = Some(user.clone());
                }
            }
            (info, target)
        };
        info.consumer.close();
        self.detach(&info);

        if let Some(target) = translation_target {
            self.revert_translation_stream(&target).await;
        }
        debug!(%consumer_id, stream_id = %info.stream_id, "Consumer removed");
        self.shared.events.emit(SessionEvent::StreamsChanged);
        true
    }

    fn detach(&self, info: &ConsumerInfo) {
        let ui_id = info.identity.ui_stream_id();
        let track = info.consumer.track();
        let mut guard = self.shared.streams.lock();
        let state = &mut *guard;
        state.consuming.remove(&info.stream_id);
        if let Some(ids) = state.settling.get_mut(&ui_id) {
            ids.retain(|s| s != &info.stream_id);
        }

        let Some(aggregate) = state.aggregates.get_mut(&ui_id) else {
            return;
        };
        aggregate.remove_track(track.id());
        if aggregate.is_empty() {
            state.remove(&ui_id);
            state.settling.remove(&ui_id);
            return;
        }
        let snapshot = aggregate.clone();
        for entry in state
            .streams
            .iter_mut()
            .chain(state.screen_streams.iter_mut())
            .filter(|s| s.id == ui_id)
        {
            entry.media = Some(snapshot.clone());
        }
    }

    /// Close every consumer and remove their entries.
    pub fn close_all(&self) -> usize {
        let closed: Vec<ConsumerInfo> = {
            let mut media = self.shared.media.lock();
            media.translations.clear();
            media.materializing.clear();
            media.consumers.drain().map(|(_, c)| c).collect()
        };
        for info in &closed {
            info.consumer.close();
            self.detach(info);
        }
        if !closed.is_empty() {
            info!(count = closed.len(), "Consumers closed");
            self.shared.events.emit(SessionEvent::StreamsChanged);
        }
        closed.len()
    }
}
