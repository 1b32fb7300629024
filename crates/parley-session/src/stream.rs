//! Remote stream announcements → UI stream entries.
//!
//! Announcements are filtered and de-duplicated here, queued while the receive
//! transport is not connected, and written to the UI lists through a per-id
//! debounce. This is the only writer of [`crate::context::StreamState`] lists.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::consumer::ConsumerManager;
use crate::context::{RemovalKey, SessionShared};
use crate::engine::MediaStream;
use crate::events::{NoticeLevel, SessionEvent};
use crate::identity::{StreamIdentity, presence_stream_id};
use crate::signaling::OutboundSignal;
use crate::transport::TransportManager;
use crate::types::{
    PeerSummary, PendingStreamData, StreamAnnouncement, StreamInfo, StreamMetadata, TransportRole,
};

const PENDING_RETRY_KEY: &str = "pending-retry";

/// What happened to a consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeAttempt {
    /// A `consume` request is in flight.
    Requested,
    /// Held until the receive transport connects.
    Queued,
    /// Already consuming, already consumed, or not ours to consume.
    Skipped,
}

#[derive(Clone)]
pub struct StreamManager {
    shared: Arc<SessionShared>,
}

impl StreamManager {
    pub fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub async fn handle_stream_added(&self, announcement: StreamAnnouncement) -> ConsumeAttempt {
        let stream_id = announcement.stream_id.clone();
        if self.is_own_camera_stream(&announcement) {
            debug!(%stream_id, "Skipping own stream");
            return ConsumeAttempt::Skipped;
        }

        let attempt = self.try_consume(announcement.into()).await;
        if attempt == ConsumeAttempt::Queued
            && self.shared.transport(TransportRole::Recv).is_some()
        {
            self.schedule_pending_retry();
        }
        attempt
    }

    fn is_own_camera_stream(&self, announcement: &StreamAnnouncement) -> bool {
        let identity = StreamIdentity::resolve(
            &announcement.stream_id,
            announcement.publisher_id.as_deref(),
            None,
            &announcement.metadata,
        );
        match identity {
            Some(identity) => {
                !identity.is_screen_share() && self.shared.is_local_peer(&identity.publisher_id)
            }
            None => announcement
                .publisher_id
                .as_deref()
                .is_some_and(|p| self.shared.is_local_peer(p)),
        }
    }

    /// Request a consumer for `item`, or queue it. Never schedules a retry.
    async fn try_consume(&self, item: PendingStreamData) -> ConsumeAttempt {
        let shared = &self.shared;
        let stream_id = item.stream_id.clone();
        let consumed = shared
            .media
            .lock()
            .consumers
            .values()
            .any(|c| c.stream_id == stream_id);
        if consumed {
            debug!(%stream_id, "Stream already consumed");
            return ConsumeAttempt::Skipped;
        }

        let recv_connected = TransportManager::new(Arc::clone(shared)).is_recv_connected();
        let capabilities = shared.engine.rtp_capabilities();
        let (publisher_id, producer_id) = (item.publisher_id.clone(), item.producer_id.clone());
        let rtp_capabilities = {
            let mut streams = shared.streams.lock();
            if streams.consuming.contains(&stream_id) {
                debug!(%stream_id, "Stream already being consumed");
                return ConsumeAttempt::Skipped;
            }
            match capabilities {
                Some(caps) if recv_connected => {
                    streams.consuming.insert(stream_id.clone());
                    caps
                }
                _ => {
                    if streams.pending.iter().any(|p| p.stream_id == stream_id) {
                        debug!(%stream_id, "Stream already queued");
                    } else {
                        debug!(%stream_id, "Receive transport not ready, queueing stream");
                        streams.pending.push_back(item);
                    }
                    return ConsumeAttempt::Queued;
                }
            }
        };

        let sent = shared
            .send(OutboundSignal::Consume {
                stream_id: stream_id.clone(),
                publisher_id,
                producer_id,
                rtp_capabilities,
            })
            .await;
        if sent {
            debug!(%stream_id, "Consume requested");
            ConsumeAttempt::Requested
        } else {
            shared.streams.lock().consuming.remove(&stream_id);
            ConsumeAttempt::Skipped
        }
    }

    fn schedule_pending_retry(&self) {
        let manager = self.clone();
        let epoch = self.shared.epoch();
        self.shared.debouncer.schedule(
            PENDING_RETRY_KEY,
            self.shared.config.pending_retry_delay(),
            async move {
                if !manager.shared.is_current(epoch) {
                    return;
                }
                if TransportManager::new(Arc::clone(&manager.shared)).is_recv_connected() {
                    manager.flush_pending().await;
                } else {
                    debug!("Receive transport still not connected, keeping queue");
                }
            },
        );
    }

    /// Drain the pending queue in FIFO order.
    pub async fn flush_pending(&self) -> usize {
        let queued: Vec<PendingStreamData> = self.shared.streams.lock().pending.drain(..).collect();
        if queued.is_empty() {
            return 0;
        }
        info!(count = queued.len(), "Flushing pending streams");
        let mut requested = 0;
        for item in queued {
            if self.try_consume(item).await == ConsumeAttempt::Requested {
                requested += 1;
            }
        }
        requested
    }

    /// Debounced write of a consumed stream's aggregate into the UI list.
    ///
    /// The consuming markers of every stream that settled into this aggregate are
    /// cleared under the same lock as the write.
    pub fn schedule_upsert(&self, identity: StreamIdentity, metadata: StreamMetadata) {
        let shared = Arc::clone(&self.shared);
        let ui_id = identity.ui_stream_id();
        let epoch = shared.epoch();
        let delay = shared.config.stream_debounce();
        self.shared.debouncer.schedule(ui_id.clone(), delay, async move {
            if !shared.is_current(epoch) {
                return;
            }
            {
                let mut streams = shared.streams.lock();
                let settled = streams.settling.remove(&ui_id).unwrap_or_default();
                for id in &settled {
                    streams.consuming.remove(id);
                }
                let Some(aggregate) = streams.aggregates.get(&ui_id).cloned() else {
                    debug!(ui_id = %ui_id, "Aggregate gone before UI write");
                    return;
                };
                let mut merged = streams
                    .streams
                    .iter()
                    .chain(streams.screen_streams.iter())
                    .find(|s| s.id == ui_id)
                    .map(|s| s.metadata.clone())
                    .unwrap_or_default();
                merged.merge(&metadata);
                if let Some(early) = streams.early_metadata.remove(&ui_id) {
                    merged.merge(&early.metadata);
                }
                streams.upsert(
                    StreamInfo {
                        id: ui_id.clone(),
                        publisher_id: Some(identity.publisher_id.clone()),
                        media: Some(aggregate),
                        metadata: merged,
                    },
                    identity.in_screen_list(),
                );
            }
            debug!(ui_id = %ui_id, "Stream entry written");
            shared.events.emit(SessionEvent::StreamsChanged);
        });
    }

    /// Insert or replace this participant's own entry.
    pub fn upsert_local(&self, info: StreamInfo) {
        self.shared.streams.lock().upsert(info, false);
        self.shared.events.emit(SessionEvent::StreamsChanged);
    }

    /// Debounced metadata merge for a remote stream's UI entry.
    pub fn update_metadata(&self, stream_id: &str, metadata: StreamMetadata) {
        let identity = self
            .shared
            .media
            .lock()
            .consumers
            .values()
            .find(|c| c.stream_id == stream_id)
            .map(|c| c.identity.clone())
            .or_else(|| StreamIdentity::resolve(stream_id, None, None, &metadata));
        let Some(identity) = identity else {
            debug!(%stream_id, "Metadata update for unknown stream");
            return;
        };

        let shared = Arc::clone(&self.shared);
        let ui_id = identity.ui_stream_id();
        let key = format!("metadata:{ui_id}");
        let epoch = shared.epoch();
        let delay = shared.config.stream_debounce();
        self.shared.debouncer.schedule(key, delay, async move {
            if !shared.is_current(epoch) {
                return;
            }
            let updated = {
                let mut guard = shared.streams.lock();
                let state = &mut *guard;
                let entry = state
                    .streams
                    .iter_mut()
                    .chain(state.screen_streams.iter_mut())
                    .find(|s| s.id == ui_id);
                match entry {
                    Some(entry) => {
                        entry.metadata.merge(&metadata);
                        true
                    }
                    None => {
                        debug!(ui_id = %ui_id, "No entry yet, holding metadata update");
                        state.stash_metadata(&identity, &metadata);
                        false
                    }
                }
            };
            if updated {
                shared.events.emit(SessionEvent::StreamsChanged);
            }
        });
    }

    /// Tear down a remote stream: its consumers, its aggregate tracks, and any
    /// queued or in-flight state for the id.
    pub async fn remove_stream(&self, stream_id: &str, is_screen_share: Option<bool>) {
        self.shared
            .streams
            .lock()
            .mark_removed(RemovalKey::Stream(stream_id.to_owned()));
        let consumer_ids: Vec<String> = self
            .shared
            .media
            .lock()
            .consumers
            .iter()
            .filter(|(_, c)| c.stream_id == stream_id)
            .map(|(id, _)| id.clone())
            .collect();

        let consumers = ConsumerManager::new(Arc::clone(&self.shared));
        for id in &consumer_ids {
            consumers.remove_consumer(id).await;
        }

        {
            let mut streams = self.shared.streams.lock();
            streams.pending.retain(|p| p.stream_id != stream_id);
            streams.consuming.remove(stream_id);

            if consumer_ids.is_empty() {
                let hint = StreamMetadata {
                    is_screen_share: is_screen_share.filter(|s| *s),
                    ..Default::default()
                };
                match StreamIdentity::resolve(stream_id, None, None, &hint) {
                    Some(identity) if is_screen_share == Some(true) => {
                        streams.remove_publisher(&identity.publisher_id, true);
                    }
                    Some(identity) => {
                        let ui_id = identity.ui_stream_id();
                        if streams.aggregates.get(&ui_id).is_none_or(MediaStream::is_empty) {
                            streams.remove(&ui_id);
                        }
                    }
                    None => debug!(%stream_id, "Removed stream has no recoverable identity"),
                }
            }
        }
        info!(%stream_id, consumers = consumer_ids.len(), "Stream removed");
        self.shared.events.emit(SessionEvent::StreamsChanged);
    }

    /// Drop everything a departed participant had on screen.
    pub fn remove_peer(&self, peer_id: &str, kicked: bool) {
        self.shared
            .streams
            .lock()
            .mark_removed(RemovalKey::Peer(peer_id.to_owned()));
        let closed = {
            let mut media = self.shared.media.lock();
            let ids: Vec<String> = media
                .consumers
                .iter()
                .filter(|(_, c)| c.identity.publisher_id == peer_id)
                .map(|(id, _)| id.clone())
                .collect();
            media.translations.remove(peer_id);
            for state in media.translations.values_mut() {
                state.paused_consumers.retain(|id| !ids.contains(id));
            }
            ids.iter()
                .filter_map(|id| media.consumers.remove(id))
                .collect::<Vec<_>>()
        };
        for info in &closed {
            info.consumer.close();
        }

        {
            let mut streams = self.shared.streams.lock();
            let removed = streams.remove_publisher(peer_id, false);
            for ui_id in &removed {
                streams.settling.remove(ui_id);
            }
            streams.speaking.remove(peer_id);
            let publisher_of = |stream_id: &str, publisher: Option<&str>| {
                StreamIdentity::resolve(stream_id, publisher, None, &StreamMetadata::default())
                    .map(|i| i.publisher_id)
            };
            streams.pending.retain(|p| {
                let publisher = publisher_of(&p.stream_id, p.publisher_id.as_deref());
                publisher.as_deref() != Some(peer_id)
            });
            streams
                .consuming
                .retain(|id| publisher_of(id, None).as_deref() != Some(peer_id));
        }
        self.shared.room.lock().pinned.remove(peer_id);

        info!(%peer_id, kicked, consumers = closed.len(), "Peer left");
        self.shared.events.emit(SessionEvent::PeerLeft {
            peer_id: peer_id.to_owned(),
            kicked,
        });
        let message = if kicked {
            format!("{peer_id} was removed from the room")
        } else {
            format!("{peer_id} left the room")
        };
        self.shared.events.notice(NoticeLevel::Info, message);
        self.shared.events.emit(SessionEvent::StreamsChanged);
    }

    /// Bulk listing: consume every stream, and show presence for peers without any.
    pub async fn handle_streams_list(
        &self,
        streams: Vec<StreamAnnouncement>,
        peers: Vec<PeerSummary>,
    ) {
        let publishers: Vec<String> = streams
            .iter()
            .filter_map(|a| {
                StreamIdentity::resolve(&a.stream_id, a.publisher_id.as_deref(), None, &a.metadata)
                    .map(|i| i.publisher_id)
            })
            .collect();
        debug!(streams = streams.len(), peers = peers.len(), "Streams list received");

        for announcement in streams {
            self.handle_stream_added(announcement).await;
        }
        for peer in peers {
            if publishers.contains(&peer.peer_id) {
                continue;
            }
            let metadata = StreamMetadata {
                display_name: peer.display_name,
                ..Default::default()
            };
            self.render_presence(&peer.peer_id, metadata);
        }
    }

    /// Show a placeholder for a participant whose media cannot be rendered.
    pub fn render_presence(&self, publisher_id: &str, metadata: StreamMetadata) -> bool {
        if self.shared.is_local_peer(publisher_id) {
            return false;
        }
        let info = StreamInfo {
            id: presence_stream_id(publisher_id),
            publisher_id: Some(publisher_id.to_owned()),
            media: None,
            metadata,
        };
        let added = self.shared.streams.lock().ensure_presence(publisher_id, info);
        if added {
            debug!(%publisher_id, "Presence entry added");
            self.shared.events.emit(SessionEvent::StreamsChanged);
        }
        added
    }

    /// The router will not create a consumer for `stream_id`.
    pub fn handle_consumer_skipped(&self, stream_id: &str, reason: Option<&str>) {
        warn!(%stream_id, reason = reason.unwrap_or("unspecified"), "Consumer skipped");
        self.shared.streams.lock().consuming.remove(stream_id);
        let identity =
            StreamIdentity::resolve(stream_id, None, None, &StreamMetadata::default());
        if let Some(identity) = identity {
            self.render_presence(&identity.publisher_id, StreamMetadata::default());
        }
    }

    pub fn set_speaking(&self, peer_id: &str, speaking: bool) {
        let changed = {
            let mut streams = self.shared.streams.lock();
            if speaking {
                streams.speaking.insert(peer_id.to_owned())
            } else {
                streams.speaking.remove(peer_id)
            }
        };
        if changed {
            self.shared.events.emit(SessionEvent::SpeakingChanged {
                peer_id: peer_id.to_owned(),
                speaking,
            });
        }
    }

    /// Remove a publisher's screen-share consumers and entries.
    pub async fn screen_share_stopped(&self, peer_id: &str) {
        self.shared
            .streams
            .lock()
            .mark_removed(RemovalKey::ScreenShare(peer_id.to_owned()));
        let ids: Vec<String> = self
            .shared
            .media
            .lock()
            .consumers
            .iter()
            .filter(|(_, c)| c.identity.publisher_id == peer_id && c.identity.is_screen_share())
            .map(|(id, _)| id.clone())
            .collect();
        let consumers = ConsumerManager::new(Arc::clone(&self.shared));
        for id in &ids {
            consumers.remove_consumer(id).await;
        }
        let removed = self.shared.streams.lock().remove_publisher(peer_id, true);
        info!(%peer_id, entries = removed.len(), "Screen share stopped");
        self.shared.events.emit(SessionEvent::StreamsChanged);
    }
}
