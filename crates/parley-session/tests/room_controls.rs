mod common;

use common::*;
use parley_session::signaling::InboundSignal;
use parley_session::types::MediaKind;
use parley_session::{JoinFailure, SessionError, SessionEvent};

#[tokio::test(start_paused = true)]
async fn join_failure_is_reported_once() {
    let directory = MockDirectory::new(false);
    *directory.response.lock() = Err(JoinFailure::InvalidPassword);
    let mut h = harness_with(MockEngine::new(capabilities()), directory);

    let err = h.session.join("r1", "alice", Some("nope")).await.unwrap_err();
    assert!(matches!(err, SessionError::Join(JoinFailure::InvalidPassword)));
    assert!(!h.session.is_joined());
    assert_eq!(
        h.directory.requests.lock()[0].password.as_deref(),
        Some("nope")
    );

    let notices: Vec<_> = drain(&mut h.events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Notice(n) => Some(n.message),
            _ => None,
        })
        .collect();
    assert_eq!(notices, ["The room password is incorrect"]);
    assert!(h.signaling.names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn join_rejects_router_without_common_codec() {
    let directory = MockDirectory::new(false);
    if let Ok(response) = &mut *directory.response.lock() {
        response.router_rtp_capabilities.codecs =
            vec![codec("video/AV1", MediaKind::Video, 90000)];
    }
    let h = harness_with(MockEngine::new(capabilities()), directory);

    let err = h.session.join("r1", "alice", None).await.unwrap_err();
    assert!(matches!(err, SessionError::NoCommonCodec));
    assert!(!h.session.is_joined());
}

#[tokio::test(start_paused = true)]
async fn second_join_is_rejected() {
    let h = harness();
    h.session.join("r1", "alice", None).await.expect("join");
    let err = h.session.join("r1", "alice", None).await.unwrap_err();
    assert!(matches!(err, SessionError::Rejected(_)));
    assert_eq!(h.signaling.count("join"), 1);
}

#[tokio::test(start_paused = true)]
async fn lock_requires_creator_and_password() {
    let h = harness_with(MockEngine::new(capabilities()), MockDirectory::new(false));
    h.session.join("r1", "alice", None).await.expect("join");
    assert!(matches!(
        h.session.toggle_lock(Some("secret")).await,
        Err(SessionError::Unauthorized(_))
    ));
    assert_eq!(h.signaling.count("lock-room"), 0);

    let h = harness();
    h.session.join("r1", "alice", None).await.expect("join");
    assert!(matches!(
        h.session.toggle_lock(Some("  ")).await,
        Err(SessionError::Validation(_))
    ));
    assert!(h.session.toggle_lock(Some("secret")).await.expect("lock"));
    assert!(h.session.is_locked());
    assert!(!h.session.toggle_lock(None).await.expect("unlock"));
    assert!(!h.session.is_locked());
}

#[tokio::test(start_paused = true)]
async fn pin_needs_receive_transport_and_confirmation() {
    let h = harness();
    h.session.join("r1", "alice", None).await.expect("join");
    assert!(matches!(
        h.session.toggle_pin("bob").await,
        Err(SessionError::MissingResource(_))
    ));

    joined_transports_only(&h).await;
    assert!(h.session.toggle_pin("bob").await.expect("pin"));
    assert_eq!(h.session.pinned_peers(), ["bob"]);
    assert!(!h.session.toggle_pin("bob").await.expect("unpin"));
    assert!(h.session.pinned_peers().is_empty());

    h.signaling
        .pin_success
        .store(false, std::sync::atomic::Ordering::SeqCst);
    assert!(matches!(
        h.session.toggle_pin("carol").await,
        Err(SessionError::Rejected(_))
    ));
    assert!(h.session.pinned_peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn kick_is_creator_only_and_not_self() {
    let h = harness();
    h.session.join("r1", "alice", None).await.expect("join");
    assert!(matches!(
        h.session.kick("alice").await,
        Err(SessionError::Validation(_))
    ));
    h.session.kick("bob").await.expect("kick");
    assert_eq!(h.signaling.count("kick-peer"), 1);

    let h = harness_with(MockEngine::new(capabilities()), MockDirectory::new(false));
    h.session.join("r1", "alice", None).await.expect("join");
    assert!(matches!(
        h.session.kick("bob").await,
        Err(SessionError::Unauthorized(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn leave_tears_everything_down() {
    let h = harness();
    joined_with_transports(&h).await;
    h.signaling.inject(consumer_created("c-1", "bob_video_1_a", MediaKind::Video));
    advance(100).await;
    assert_eq!(h.session.consumer_count(), 1);

    h.session.leave().await;
    assert!(!h.session.is_joined());
    assert!(h.engine.send_transport().is_closed());
    assert!(h.engine.recv_transport().is_closed());
    assert_eq!(h.session.consumer_count(), 0);
    assert_eq!(h.session.producer_count(), 0);
    assert!(h.session.streams_snapshot().is_empty());

    // Late events from the old session are ignored.
    h.signaling.inject(consumer_created("c-2", "bob_audio_1_b", MediaKind::Audio));
    advance(100).await;
    assert_eq!(h.session.consumer_count(), 0);
    assert!(h.session.streams_snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn remote_lock_and_speaking_events_update_state() {
    let mut h = harness();
    h.session.join("r1", "alice", None).await.expect("join");
    drain(&mut h.events);

    h.signaling.inject(InboundSignal::RoomLocked);
    h.signaling.inject(InboundSignal::UserSpeaking { peer_id: "bob".into() });
    advance(10).await;
    assert!(h.session.is_locked());
    assert_eq!(h.session.speaking_peers(), ["bob"]);

    h.signaling.inject(InboundSignal::UserStoppedSpeaking { peer_id: "bob".into() });
    advance(10).await;
    let events = drain(&mut h.events);
    assert!(events.contains(&SessionEvent::RoomLockChanged { locked: true }));
    assert!(events.contains(&SessionEvent::SpeakingChanged {
        peer_id: "bob".into(),
        speaking: false,
    }));
}

/// Only the receive transport, already connected.
async fn joined_transports_only(h: &Harness) {
    h.signaling.inject(InboundSignal::TransportCreated(descriptor("recv-1", false)));
    advance(10).await;
    h.engine
        .recv_transport()
        .set_state(parley_session::types::ConnectionState::Connected);
    advance(10).await;
}
