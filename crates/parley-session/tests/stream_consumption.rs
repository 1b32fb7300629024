mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use parley_session::SessionEvent;
use parley_session::engine::Consumer;
use parley_session::signaling::InboundSignal;
use parley_session::types::{ConnectionState, ConsumerDescriptor, MediaKind, StreamMetadata};

fn ids(h: &Harness) -> Vec<String> {
    h.session.streams_snapshot().into_iter().map(|s| s.id).collect()
}

#[tokio::test(start_paused = true)]
async fn pending_stream_is_flushed_once_on_connect() {
    let h = harness();
    h.session.join("r1", "alice", None).await.expect("join");
    h.signaling.inject(InboundSignal::RtpCapabilitiesAck);
    advance(400).await;
    h.signaling.inject(InboundSignal::TransportCreated(descriptor("recv-1", false)));
    advance(10).await;

    h.signaling.inject(InboundSignal::StreamAdded(announcement("bob_video_1_a")));
    h.signaling.inject(InboundSignal::StreamAdded(announcement("bob_video_1_a")));
    advance(10).await;
    assert_eq!(h.session.pending_count(), 1);
    assert_eq!(h.signaling.count("consume"), 0);

    // The retry fires while the transport is still connecting and keeps the queue.
    advance(600).await;
    assert_eq!(h.session.pending_count(), 1);

    h.engine.recv_transport().set_state(ConnectionState::Connected);
    advance(10).await;
    assert_eq!(h.session.pending_count(), 0);
    assert_eq!(h.session.consuming_count(), 1);
    assert_eq!(h.signaling.count("consume"), 1);
    assert_eq!(h.signaling.count("get-streams"), 1);

    h.signaling.inject(InboundSignal::StreamAdded(announcement("bob_video_1_a")));
    advance(10).await;
    assert_eq!(h.signaling.count("consume"), 1);
}

#[tokio::test(start_paused = true)]
async fn consumed_stream_reaches_the_ui_and_clears_consuming() {
    let mut h = harness();
    joined_with_transports(&h).await;

    h.signaling.inject(InboundSignal::StreamAdded(announcement("bob_video_1_a")));
    h.signaling.inject(InboundSignal::StreamAdded(announcement("bob_audio_1_b")));
    advance(10).await;
    assert_eq!(h.session.consuming_count(), 2);

    h.signaling.inject(consumer_created("c-video", "bob_video_1_a", MediaKind::Video));
    h.signaling.inject(consumer_created("c-audio", "bob_audio_1_b", MediaKind::Audio));
    advance(10).await;
    // Debounce window still open.
    assert_eq!(h.session.consuming_count(), 2);
    assert!(!ids(&h).contains(&"remote-bob-media".to_owned()));

    drain(&mut h.events);
    advance(100).await;
    assert_eq!(h.session.consuming_count(), 0);
    let entry = h
        .session
        .streams_snapshot()
        .into_iter()
        .find(|s| s.id == "remote-bob-media")
        .expect("bob entry");
    assert_eq!(entry.media.expect("media").tracks.len(), 2);
    assert_eq!(h.signaling.count("resume-consumer"), 2);
    let changed = drain(&mut h.events)
        .into_iter()
        .filter(|e| *e == SessionEvent::StreamsChanged)
        .count();
    assert_eq!(changed, 1);

    h.signaling.inject(InboundSignal::StreamAdded(announcement("bob_video_1_a")));
    advance(10).await;
    assert_eq!(h.signaling.count("consume"), 2);
}

#[tokio::test(start_paused = true)]
async fn duplicate_consumer_created_materializes_once() {
    let h = harness();
    joined_with_transports(&h).await;

    h.signaling.inject(consumer_created("c-1", "bob_video_1_a", MediaKind::Video));
    h.signaling.inject(consumer_created("c-1", "bob_video_1_a", MediaKind::Video));
    advance(100).await;
    assert_eq!(h.engine.recv_transport().consumers.lock().len(), 1);
    assert_eq!(h.session.consumer_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn own_camera_streams_are_not_consumed() {
    let h = harness();
    joined_with_transports(&h).await;

    h.signaling.inject(InboundSignal::StreamAdded(announcement("alice_video_1_a")));
    h.signaling.inject(InboundSignal::StreamAdded(announcement("alice_audio_1_b")));
    h.signaling.inject(consumer_created("c-own", "alice_video_1_a", MediaKind::Video));
    advance(100).await;
    assert_eq!(h.signaling.count("consume"), 0);
    assert_eq!(h.session.consumer_count(), 0);

    h.signaling.inject(InboundSignal::StreamAdded(announcement("alice_screen_1_c")));
    advance(10).await;
    assert_eq!(h.signaling.count("consume"), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_rtp_parameters_render_presence() {
    let h = harness();
    joined_with_transports(&h).await;

    h.signaling.inject(InboundSignal::StreamAdded(announcement("bob_video_1_a")));
    advance(10).await;
    assert_eq!(h.session.consuming_count(), 1);

    h.signaling.inject(InboundSignal::ConsumerCreated(ConsumerDescriptor {
        consumer_id: Some("c-1".into()),
        producer_id: Some("p-1".into()),
        kind: Some(MediaKind::Video),
        rtp_parameters: None,
        stream_id: "bob_video_1_a".into(),
        publisher_id: None,
        metadata: StreamMetadata::default(),
    }));
    advance(100).await;

    assert_eq!(h.session.consuming_count(), 0);
    assert_eq!(h.session.consumer_count(), 0);
    assert!(h.engine.recv_transport().consumers.lock().is_empty());
    assert!(ids(&h).contains(&"remote-bob-presence".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn consume_failure_is_classified_and_falls_back() {
    let engine = MockEngine::new(capabilities());
    *engine.consume_error.lock() =
        Some(parley_session::EngineError::RemoteDescription("m-line".into()));
    let mut h = harness_with(engine, MockDirectory::new(true));
    joined_with_transports(&h).await;
    drain(&mut h.events);

    h.signaling.inject(InboundSignal::StreamAdded(announcement("bob_video_1_a")));
    h.signaling.inject(consumer_created("c-1", "bob_video_1_a", MediaKind::Video));
    advance(100).await;

    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::CodecIncompatible { stream_id, .. } if stream_id == "bob_video_1_a"
    )));
    assert_eq!(h.session.consuming_count(), 0);
    assert!(ids(&h).contains(&"remote-bob-presence".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn media_entry_replaces_presence_entry() {
    let h = harness();
    joined_with_transports(&h).await;

    h.signaling.inject(InboundSignal::StreamsList {
        streams: Vec::new(),
        peers: vec![parley_session::types::PeerSummary {
            peer_id: "bob".into(),
            display_name: Some("Bob".into()),
        }],
    });
    advance(10).await;
    assert_eq!(ids(&h), ["local", "remote-bob-presence"]);

    h.signaling.inject(consumer_created("c-1", "bob_video_1_a", MediaKind::Video));
    advance(100).await;
    assert_eq!(ids(&h), ["local", "remote-bob-media"]);
}

#[tokio::test(start_paused = true)]
async fn screen_share_gets_its_own_list() {
    let h = harness();
    joined_with_transports(&h).await;

    h.signaling.inject(consumer_created("c-s", "bob_screen_1_a", MediaKind::Video));
    h.signaling.inject(consumer_created("c-sa", "bob_screen_audio_1_b", MediaKind::Audio));
    advance(100).await;

    let mut screens: Vec<String> = h
        .session
        .screen_streams_snapshot()
        .into_iter()
        .map(|s| s.id)
        .collect();
    screens.sort();
    assert_eq!(screens, ["remote-bob-screen_audio", "screen-bob"]);

    h.signaling.inject(InboundSignal::ScreenShareStopped { peer_id: "bob".into() });
    advance(10).await;
    assert!(h.session.screen_streams_snapshot().is_empty());
    assert_eq!(h.session.consumer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stream_removal_prunes_the_aggregate() {
    let h = harness();
    joined_with_transports(&h).await;

    h.signaling.inject(consumer_created("c-v", "bob_video_1_a", MediaKind::Video));
    h.signaling.inject(consumer_created("c-a", "bob_audio_1_b", MediaKind::Audio));
    advance(100).await;

    h.signaling.inject(InboundSignal::StreamRemoved {
        stream_id: "bob_video_1_a".into(),
        is_screen_share: None,
    });
    advance(10).await;
    let entry = h
        .session
        .streams_snapshot()
        .into_iter()
        .find(|s| s.id == "remote-bob-media")
        .expect("audio remains");
    assert_eq!(entry.media.expect("media").tracks.len(), 1);
    let removed = h.engine.recv_transport().consumer("c-v").expect("consumer");
    assert!(removed.closed.load(Ordering::SeqCst));

    h.signaling.inject(InboundSignal::StreamRemoved {
        stream_id: "bob_audio_1_b".into(),
        is_screen_share: None,
    });
    advance(10).await;
    assert_eq!(ids(&h), ["local"]);
}

#[tokio::test(start_paused = true)]
async fn peer_left_clears_entries_and_reports_kick() {
    let mut h = harness();
    joined_with_transports(&h).await;

    h.signaling.inject(consumer_created("c-v", "bob_video_1_a", MediaKind::Video));
    h.signaling.inject(consumer_created("c-s", "bob_screen_1_c", MediaKind::Video));
    h.signaling.inject(InboundSignal::UserSpeaking { peer_id: "bob".into() });
    advance(100).await;
    assert_eq!(h.session.speaking_peers(), ["bob"]);
    drain(&mut h.events);

    h.signaling.inject(InboundSignal::PeerLeft {
        peer_id: "bob".into(),
        kicked: true,
    });
    advance(10).await;

    assert_eq!(ids(&h), ["local"]);
    assert!(h.session.screen_streams_snapshot().is_empty());
    assert!(h.session.speaking_peers().is_empty());
    let events = drain(&mut h.events);
    assert!(events.contains(&SessionEvent::PeerLeft {
        peer_id: "bob".into(),
        kicked: true,
    }));
}

#[tokio::test(start_paused = true)]
async fn translation_pauses_original_audio_until_reverted() {
    let h = harness();
    joined_with_transports(&h).await;

    h.signaling.inject(consumer_created("c-mic", "bob_audio_1_a", MediaKind::Audio));
    advance(100).await;

    let mut translated = consumer_created("c-tr", "translated_es_1", MediaKind::Audio);
    if let InboundSignal::ConsumerCreated(descriptor) = &mut translated {
        descriptor.metadata.target_user_id = Some("bob".into());
    }
    h.signaling.inject(translated);
    advance(100).await;

    let recv = h.engine.recv_transport();
    let original = recv.consumer("c-mic").expect("original");
    assert!(original.paused());
    assert!(ids(&h).contains(&"remote-bob-translated".to_owned()));
    assert!(ids(&h).contains(&"remote-bob-media".to_owned()));

    h.signaling.inject(InboundSignal::TranslationCabinDestroyed {
        target_user_id: "bob".into(),
    });
    advance(10).await;
    assert!(!original.paused());
    let translation = recv.consumer("c-tr").expect("translation");
    assert!(translation.closed.load(Ordering::SeqCst));
    assert!(!ids(&h).contains(&"remote-bob-translated".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn metadata_update_before_the_entry_is_applied_when_it_is_written() {
    let h = harness();
    joined_with_transports(&h).await;

    h.signaling.inject(InboundSignal::StreamAdded(announcement("bob_video_1_a")));
    h.signaling.inject(InboundSignal::StreamMetadataUpdated {
        stream_id: "bob_video_1_a".into(),
        metadata: StreamMetadata {
            video_enabled: Some(false),
            ..Default::default()
        },
    });
    advance(200).await;
    assert!(!ids(&h).contains(&"remote-bob-media".to_owned()));

    h.signaling.inject(consumer_created("c-video", "bob_video_1_a", MediaKind::Video));
    advance(200).await;
    let entry = h
        .session
        .streams_snapshot()
        .into_iter()
        .find(|s| s.id == "remote-bob-media")
        .expect("bob entry");
    assert_eq!(entry.metadata.video_enabled, Some(false));
}

#[tokio::test(start_paused = true)]
async fn peer_leaving_mid_consume_closes_the_late_consumer() {
    let h = harness();
    joined_with_transports(&h).await;
    let recv = h.engine.recv_transport();
    *recv.consume_delay.lock() = Some(Duration::from_millis(50));

    h.signaling.inject(InboundSignal::StreamAdded(announcement("bob_video_1_a")));
    h.signaling.inject(consumer_created("c-1", "bob_video_1_a", MediaKind::Video));
    advance(10).await;
    assert_eq!(h.session.consumer_count(), 0);

    h.signaling.inject(InboundSignal::PeerLeft {
        peer_id: "bob".into(),
        kicked: false,
    });
    advance(300).await;

    assert_eq!(h.session.consumer_count(), 0);
    assert_eq!(h.session.consuming_count(), 0);
    assert!(recv.consumer("c-1").expect("consumer").closed.load(Ordering::SeqCst));
    assert!(!ids(&h).contains(&"remote-bob-media".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn stream_removed_mid_consume_closes_the_late_consumer() {
    let h = harness();
    joined_with_transports(&h).await;
    let recv = h.engine.recv_transport();
    *recv.consume_delay.lock() = Some(Duration::from_millis(50));

    h.signaling.inject(InboundSignal::StreamAdded(announcement("bob_video_1_a")));
    h.signaling.inject(consumer_created("c-1", "bob_video_1_a", MediaKind::Video));
    advance(10).await;
    h.signaling.inject(InboundSignal::StreamRemoved {
        stream_id: "bob_video_1_a".into(),
        is_screen_share: None,
    });
    advance(300).await;

    assert_eq!(h.session.consumer_count(), 0);
    assert!(recv.consumer("c-1").expect("consumer").closed.load(Ordering::SeqCst));
    assert!(!ids(&h).contains(&"remote-bob-media".to_owned()));

    // A later announcement of a different stream from the same peer still consumes.
    *recv.consume_delay.lock() = None;
    h.signaling.inject(InboundSignal::StreamAdded(announcement("bob_audio_1_b")));
    h.signaling.inject(consumer_created("c-2", "bob_audio_1_b", MediaKind::Audio));
    advance(300).await;
    assert_eq!(h.session.consumer_count(), 1);
    assert!(ids(&h).contains(&"remote-bob-media".to_owned()));
}
