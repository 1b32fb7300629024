//! Per-session shared state.
//!
//! One [`SessionShared`] is owned by the [`crate::Session`]; every manager holds
//! an `Arc` to it. State lives behind `parking_lot` locks that are never held
//! across an `.await`, so each guarded block is one atomic step.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use parley_common::config::SessionConfig;
use tracing::warn;

use crate::debounce::Debouncer;
use crate::directory::RoomDirectory;
use crate::engine::{MediaEngine, MediaStream, Transport};
use crate::error::SessionResult;
use crate::events::EventBus;
use crate::identity::{StreamIdentity, presence_stream_id};
use crate::signaling::{OutboundSignal, SignalingChannel};
use crate::types::{
    ConsumerInfo, CurrentStreamIds, MediaKind, PendingStreamData, ProducerInfo, StreamInfo,
    StreamMetadata, TransportRole,
};
use crate::vad::VadManager;
use crate::waiter::ResponseWaiters;

// ── Stream state ─────────────────────────────────────────────────────────────

/// UI-facing stream lists plus the bookkeeping that keeps them race-free.
#[derive(Debug, Default)]
pub struct StreamState {
    /// Regular entries in display order.
    pub streams: Vec<StreamInfo>,
    pub screen_streams: Vec<StreamInfo>,
    /// Track aggregates keyed by UI stream id.
    pub aggregates: HashMap<String, MediaStream>,
    /// Server stream ids with a consume request in flight.
    pub consuming: HashSet<String>,
    pub pending: VecDeque<PendingStreamData>,
    /// UI id → server stream ids whose tracks joined the aggregate but whose
    /// debounced UI write has not run yet.
    pub settling: HashMap<String, Vec<String>>,
    pub speaking: HashSet<String>,
    /// Metadata updates that arrived before their UI entry was written.
    pub early_metadata: HashMap<String, EarlyMetadata>,
    /// Teardown generations keyed by [`RemovalKey`].
    removals: HashMap<RemovalKey, u64>,
}

#[derive(Debug, Clone)]
pub struct EarlyMetadata {
    pub publisher_id: String,
    pub screen: bool,
    pub metadata: StreamMetadata,
}

/// What a teardown applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemovalKey {
    Peer(String),
    ScreenShare(String),
    Stream(String),
}

fn upsert(list: &mut Vec<StreamInfo>, info: StreamInfo) {
    match list.iter_mut().find(|s| s.id == info.id) {
        Some(existing) => *existing = info,
        None => list.push(info),
    }
}

impl StreamState {
    /// Insert or replace an entry. A real media entry for a publisher removes that
    /// publisher's presence placeholder.
    pub fn upsert(&mut self, info: StreamInfo, screen: bool) {
        if !info.is_presence() {
            if let Some(publisher) = info.publisher_id.as_deref() {
                let presence = presence_stream_id(publisher);
                self.streams.retain(|s| s.id != presence);
            }
        }
        if screen {
            upsert(&mut self.screen_streams, info);
        } else {
            upsert(&mut self.streams, info);
        }
    }

    /// Add a presence placeholder unless the publisher already has media showing.
    pub fn ensure_presence(&mut self, publisher_id: &str, info: StreamInfo) -> bool {
        if self.has_media_for(publisher_id) {
            return false;
        }
        upsert(&mut self.streams, info);
        true
    }

    pub fn has_media_for(&self, publisher_id: &str) -> bool {
        self.streams
            .iter()
            .chain(self.screen_streams.iter())
            .any(|s| !s.is_presence() && s.publisher_id.as_deref() == Some(publisher_id))
    }

    /// Remove an entry (and its aggregate) from both lists.
    pub fn remove(&mut self, ui_id: &str) -> bool {
        let before = self.streams.len() + self.screen_streams.len();
        self.streams.retain(|s| s.id != ui_id);
        self.screen_streams.retain(|s| s.id != ui_id);
        self.aggregates.remove(ui_id);
        self.early_metadata.remove(ui_id);
        before != self.streams.len() + self.screen_streams.len()
    }

    /// Remove every entry published by `publisher_id`. Returns the removed UI ids.
    pub fn remove_publisher(&mut self, publisher_id: &str, screen_only: bool) -> Vec<String> {
        let matches = |s: &StreamInfo| s.publisher_id.as_deref() == Some(publisher_id);
        let mut removed: Vec<String> = self
            .screen_streams
            .iter()
            .filter(|s| matches(s))
            .map(|s| s.id.clone())
            .collect();
        self.screen_streams.retain(|s| !matches(s));
        if !screen_only {
            removed.extend(self.streams.iter().filter(|s| matches(s)).map(|s| s.id.clone()));
            self.streams.retain(|s| !matches(s));
        }
        for id in &removed {
            self.aggregates.remove(id);
        }
        self.early_metadata
            .retain(|_, e| e.publisher_id != publisher_id || (screen_only && !e.screen));
        removed
    }

    /// Hold a metadata update until the entry for `identity` is written.
    pub fn stash_metadata(&mut self, identity: &StreamIdentity, update: &StreamMetadata) {
        self.early_metadata
            .entry(identity.ui_stream_id())
            .or_insert_with(|| EarlyMetadata {
                publisher_id: identity.publisher_id.clone(),
                screen: identity.in_screen_list(),
                metadata: StreamMetadata::default(),
            })
            .metadata
            .merge(update);
    }

    pub fn mark_removed(&mut self, key: RemovalKey) {
        *self.removals.entry(key).or_default() += 1;
    }

    /// Changes whenever a teardown covering `identity` runs.
    pub fn removal_mark(&self, identity: &StreamIdentity) -> u64 {
        let generation = |key: RemovalKey| self.removals.get(&key).copied().unwrap_or_default();
        let publisher = &identity.publisher_id;
        let mut mark = generation(RemovalKey::Peer(publisher.clone()))
            + generation(RemovalKey::Stream(identity.server_stream_id.clone()));
        if identity.is_screen_share() {
            mark += generation(RemovalKey::ScreenShare(publisher.clone()));
        }
        mark
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

// ── Media state ──────────────────────────────────────────────────────────────

/// Original-audio consumers paused while a translation is active for a user.
#[derive(Debug, Default, Clone)]
pub struct TranslationState {
    pub consumer_id: Option<String>,
    pub paused_consumers: Vec<String>,
}

#[derive(Debug)]
pub struct MediaState {
    pub local_stream: Option<MediaStream>,
    pub screen_stream: Option<MediaStream>,
    pub producers: HashMap<String, ProducerInfo>,
    pub consumers: HashMap<String, ConsumerInfo>,
    /// Consumer ids being materialized right now.
    pub materializing: HashSet<String>,
    pub current_ids: CurrentStreamIds,
    /// producer id → server stream id, as reported by `producer-created`.
    pub server_stream_ids: HashMap<String, String>,
    /// Keyed by the translated user's id.
    pub translations: HashMap<String, TranslationState>,
    pub video_enabled: bool,
    pub audio_enabled: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            local_stream: None,
            screen_stream: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            materializing: HashSet::new(),
            current_ids: CurrentStreamIds::default(),
            server_stream_ids: HashMap::new(),
            translations: HashMap::new(),
            video_enabled: true,
            audio_enabled: true,
        }
    }
}

impl MediaState {
    pub fn has_camera_producers(&self) -> bool {
        self.producers.values().any(|p| !p.is_screen_share())
    }

    pub fn find_producer(&self, kind: MediaKind, screen: bool) -> Option<&ProducerInfo> {
        self.producers
            .values()
            .find(|p| p.kind == kind && p.is_screen_share() == screen)
    }
}

// ── Room state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub room_id: String,
    pub peer_id: String,
}

#[derive(Debug, Default)]
pub struct RoomState {
    pub identity: Option<LocalIdentity>,
    pub is_creator: bool,
    pub locked: bool,
    pub pinned: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct TransportSlots {
    pub send: Option<Arc<dyn Transport>>,
    pub recv: Option<Arc<dyn Transport>>,
}

impl TransportSlots {
    pub fn get(&self, role: TransportRole) -> Option<&Arc<dyn Transport>> {
        match role {
            TransportRole::Send => self.send.as_ref(),
            TransportRole::Recv => self.recv.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, role: TransportRole) -> &mut Option<Arc<dyn Transport>> {
        match role {
            TransportRole::Send => &mut self.send,
            TransportRole::Recv => &mut self.recv,
        }
    }
}

// ── Flags ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SessionFlags {
    pub joining: AtomicBool,
    pub joined: AtomicBool,
    pub connected: AtomicBool,
    pub device_initializing: AtomicBool,
    pub transports_requested: AtomicBool,
    pub creating_send: AtomicBool,
    pub creating_recv: AtomicBool,
    pub publishing: AtomicBool,
    pub publishing_screen: AtomicBool,
    pub local_media_pending: AtomicBool,
    pub no_camera: AtomicBool,
    pub no_micro: AtomicBool,
}

impl SessionFlags {
    pub fn creating(&self, role: TransportRole) -> &AtomicBool {
        match role {
            TransportRole::Send => &self.creating_send,
            TransportRole::Recv => &self.creating_recv,
        }
    }

    pub fn reset(&self) {
        for flag in [
            &self.joining,
            &self.joined,
            &self.connected,
            &self.device_initializing,
            &self.transports_requested,
            &self.creating_send,
            &self.creating_recv,
            &self.publishing,
            &self.publishing_screen,
            &self.local_media_pending,
            &self.no_camera,
            &self.no_micro,
        ] {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Holds an in-flight flag for the life of the guard.
pub struct FlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlagGuard<'a> {
    /// Returns `None` if the flag is already set.
    pub fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────────

/// Everything a session owns, shared by its managers.
pub struct SessionShared {
    pub config: SessionConfig,
    pub signaling: Arc<dyn SignalingChannel>,
    pub engine: Arc<dyn MediaEngine>,
    pub directory: Arc<dyn RoomDirectory>,
    pub events: EventBus,
    pub waiters: ResponseWaiters,
    pub debouncer: Debouncer,
    pub flags: SessionFlags,
    pub room: Mutex<RoomState>,
    pub media: Mutex<MediaState>,
    pub streams: Mutex<StreamState>,
    pub transports: RwLock<TransportSlots>,
    pub vad: VadManager,
    /// Bumped on leave; work started under an older epoch becomes a no-op.
    epoch: AtomicU64,
}

impl SessionShared {
    pub fn new(
        config: SessionConfig,
        signaling: Arc<dyn SignalingChannel>,
        engine: Arc<dyn MediaEngine>,
        directory: Arc<dyn RoomDirectory>,
        events: EventBus,
        vad: VadManager,
    ) -> Self {
        Self {
            config,
            signaling,
            engine,
            directory,
            events,
            waiters: ResponseWaiters::new(),
            debouncer: Debouncer::new(),
            flags: SessionFlags::default(),
            room: Mutex::new(RoomState::default()),
            media: Mutex::new(MediaState::default()),
            streams: Mutex::new(StreamState::default()),
            transports: RwLock::new(TransportSlots::default()),
            vad,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn local_peer_id(&self) -> Option<String> {
        self.room.lock().identity.as_ref().map(|i| i.peer_id.clone())
    }

    pub fn is_local_peer(&self, peer_id: &str) -> bool {
        self.room
            .lock()
            .identity
            .as_ref()
            .is_some_and(|i| i.peer_id == peer_id)
    }

    pub fn transport(&self, role: TransportRole) -> Option<Arc<dyn Transport>> {
        self.transports.read().get(role).cloned()
    }

    /// Emit a signal, logging instead of propagating a failure.
    pub async fn send(&self, signal: OutboundSignal) -> bool {
        let name = signal.name();
        match self.signaling.emit(signal).await {
            Ok(()) => true,
            Err(e) => {
                warn!(event = name, error = %e, "Failed to emit signal");
                false
            }
        }
    }

    /// Emit a signal and propagate a failure.
    pub async fn request(&self, signal: OutboundSignal) -> SessionResult<()> {
        self.signaling.emit(signal).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(publisher: &str) -> StreamInfo {
        StreamInfo {
            id: presence_stream_id(publisher),
            publisher_id: Some(publisher.into()),
            media: None,
            metadata: Default::default(),
        }
    }

    fn media(id: &str, publisher: &str) -> StreamInfo {
        StreamInfo {
            id: id.into(),
            publisher_id: Some(publisher.into()),
            media: Some(MediaStream::new(id)),
            metadata: Default::default(),
        }
    }

    #[test]
    fn media_entry_replaces_presence() {
        let mut state = StreamState::default();
        assert!(state.ensure_presence("bob", presence("bob")));
        state.upsert(media("remote-bob-media", "bob"), false);
        assert_eq!(state.streams.len(), 1);
        assert_eq!(state.streams[0].id, "remote-bob-media");
        assert!(!state.ensure_presence("bob", presence("bob")));
    }

    #[test]
    fn upsert_keeps_display_order() {
        let mut state = StreamState::default();
        state.upsert(media("remote-a-media", "a"), false);
        state.upsert(media("remote-b-media", "b"), false);
        state.upsert(media("remote-a-media", "a"), false);
        let ids: Vec<_> = state.streams.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["remote-a-media", "remote-b-media"]);
    }

    #[test]
    fn remove_publisher_clears_both_lists() {
        let mut state = StreamState::default();
        state.upsert(media("remote-a-media", "a"), false);
        state.upsert(media("screen-a", "a"), true);
        state.upsert(media("remote-ab-media", "ab"), false);
        state
            .aggregates
            .insert("screen-a".into(), MediaStream::new("screen-a"));

        let removed = state.remove_publisher("a", false);
        assert_eq!(removed.len(), 2);
        assert!(state.screen_streams.is_empty());
        assert_eq!(state.streams.len(), 1);
        assert!(state.aggregates.is_empty());
    }

    #[test]
    fn flag_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = FlagGuard::acquire(&flag).expect("first acquire");
        assert!(FlagGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(FlagGuard::acquire(&flag).is_some());
    }
}
