//! Join/leave and the request/response room controls.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::consumer::ConsumerManager;
use crate::context::{FlagGuard, LocalIdentity, MediaState, RoomState, SessionShared};
use crate::directory::JoinRequest;
use crate::error::{SessionError, SessionResult};
use crate::events::{NoticeLevel, SessionEvent};
use crate::producer::ProducerManager;
use crate::signaling::OutboundSignal;
use crate::transport::TransportManager;
use crate::types::TransportRole;
use crate::waiter::{self, Expectation, Response};

const SIGNALING_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct RoomManager {
    shared: Arc<SessionShared>,
}

impl RoomManager {
    pub fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    /// Join `room_id` as `peer_id`.
    ///
    /// On failure the joined flag is cleared and one error notice is emitted.
    pub async fn join_room(
        &self,
        room_id: &str,
        peer_id: &str,
        password: Option<&str>,
    ) -> SessionResult<()> {
        let shared = &self.shared;
        let Some(_joining) = FlagGuard::acquire(&shared.flags.joining) else {
            return Err(SessionError::InProgress("join"));
        };
        if shared.flags.joined.load(Ordering::SeqCst) {
            return Err(SessionError::Rejected("already joined".into()));
        }

        shared.room.lock().identity = Some(LocalIdentity {
            room_id: room_id.to_owned(),
            peer_id: peer_id.to_owned(),
        });
        shared.vad.set_identity(peer_id, room_id);

        info!(%room_id, %peer_id, "Joining room");
        match self.run_join(room_id, peer_id, password).await {
            Ok(()) => {
                info!(%room_id, %peer_id, "Joined room");
                Ok(())
            }
            Err(e) => {
                shared.flags.joined.store(false, Ordering::SeqCst);
                shared.flags.connected.store(false, Ordering::SeqCst);
                error!(%room_id, %peer_id, error = %e, "Join failed");
                let message = match &e {
                    SessionError::Join(failure) => failure.user_message(),
                    other => other.to_string(),
                };
                shared.events.notice(NoticeLevel::Error, message);
                Err(e)
            }
        }
    }

    async fn run_join(
        &self,
        room_id: &str,
        peer_id: &str,
        password: Option<&str>,
    ) -> SessionResult<()> {
        let shared = &self.shared;
        let epoch = shared.epoch();
        let response = shared
            .directory
            .join(JoinRequest {
                room_id: room_id.to_owned(),
                peer_id: peer_id.to_owned(),
                password: password.map(str::to_owned),
            })
            .await?;

        let router = &response.router_rtp_capabilities;
        if !shared.engine.is_loaded() {
            shared.engine.load(router).await?;
        }
        let device = shared
            .engine
            .rtp_capabilities()
            .ok_or(SessionError::DeviceNotLoaded)?;
        if !device.has_common_codec(router) {
            return Err(SessionError::NoCommonCodec);
        }
        {
            let mut room = shared.room.lock();
            room.is_creator = response.is_creator;
            room.locked = response.locked;
        }
        shared.flags.joined.store(true, Ordering::SeqCst);

        shared.signaling.connect().await?;
        let connect_timeout = shared.config.signaling_connect_timeout();
        tokio::time::timeout(connect_timeout, async {
            while !shared.signaling.is_connected() {
                tokio::time::sleep(SIGNALING_POLL_INTERVAL).await;
            }
        })
        .await
        .map_err(|_| SessionError::Timeout("signaling connection".into()))?;
        shared.flags.connected.store(true, Ordering::SeqCst);

        shared
            .request(OutboundSignal::Join {
                room_id: room_id.to_owned(),
                peer_id: peer_id.to_owned(),
            })
            .await?;
        shared.events.emit(SessionEvent::Joined {
            room_id: room_id.to_owned(),
            peer_id: peer_id.to_owned(),
        });

        let session = Arc::clone(shared);
        tokio::spawn(async move {
            tokio::time::sleep(session.config.local_media_delay()).await;
            if !session.is_current(epoch) || session.media.lock().local_stream.is_some() {
                return;
            }
            ProducerManager::new(session).initialize_local_media().await;
        });
        Ok(())
    }

    /// Unconditional teardown. Work still in flight from this session becomes a no-op.
    pub async fn leave_room(&self) {
        let shared = &self.shared;
        shared.advance_epoch();
        shared.vad.stop().await;
        shared.vad.clear_identity();
        shared.debouncer.cancel_all();
        shared.waiters.clear();

        ProducerManager::new(Arc::clone(shared)).close_all();
        ConsumerManager::new(Arc::clone(shared)).close_all();
        TransportManager::new(Arc::clone(shared)).close_all();

        *shared.media.lock() = MediaState::default();
        shared.streams.lock().clear();
        *shared.room.lock() = RoomState::default();
        shared.flags.reset();

        shared.signaling.disconnect().await;
        info!("Left room");
        shared.events.emit(SessionEvent::Left);
        shared.events.emit(SessionEvent::StreamsChanged);
    }

    /// Lock with a password, or unlock. Returns the new locked state once the
    /// router acknowledges.
    pub async fn toggle_lock_room(&self, password: Option<&str>) -> SessionResult<bool> {
        let shared = &self.shared;
        let (is_creator, locked) = {
            let room = shared.room.lock();
            (room.is_creator, room.locked)
        };
        if !is_creator {
            return Err(SessionError::Unauthorized("lock or unlock the room"));
        }

        let (expectation, signal) = if locked {
            (Expectation::RoomUnlocked, OutboundSignal::UnlockRoom)
        } else {
            let password = password
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    SessionError::Validation("a password is required to lock the room".into())
                })?;
            (
                Expectation::RoomLocked,
                OutboundSignal::LockRoom {
                    password: password.to_owned(),
                },
            )
        };

        let rx = shared.waiters.register(expectation);
        shared.request(signal).await?;
        waiter::wait(rx, shared.config.request_timeout(), "room lock acknowledgement").await?;
        debug!(locked = !locked, "Room lock toggled");
        Ok(!locked)
    }

    /// Pin or unpin `peer_id`. Returns the new pinned state once confirmed.
    pub async fn toggle_pin_user(&self, peer_id: &str) -> SessionResult<bool> {
        let shared = &self.shared;
        let pinned = shared.room.lock().pinned.contains(peer_id);
        if !pinned && shared.transport(TransportRole::Recv).is_none() {
            return Err(SessionError::MissingResource("receive transport"));
        }

        let rx = shared
            .waiters
            .register(Expectation::PinResponse(peer_id.to_owned()));
        let signal = if pinned {
            OutboundSignal::UnpinUser {
                peer_id: peer_id.to_owned(),
            }
        } else {
            OutboundSignal::PinUser {
                peer_id: peer_id.to_owned(),
            }
        };
        shared.request(signal).await?;

        match waiter::wait(rx, shared.config.request_timeout(), "pin response").await? {
            Response::Pin {
                pinned: now_pinned,
                success: true,
            } => {
                self.apply_pin(peer_id, now_pinned);
                Ok(now_pinned)
            }
            Response::Pin { success: false, .. } => Err(SessionError::Rejected(format!(
                "pin request for {peer_id} was refused"
            ))),
            other => Err(SessionError::Rejected(format!("unexpected response {other:?}"))),
        }
    }

    pub(crate) fn apply_pin(&self, peer_id: &str, pinned: bool) {
        let changed = {
            let mut room = self.shared.room.lock();
            if pinned {
                room.pinned.insert(peer_id.to_owned())
            } else {
                room.pinned.remove(peer_id)
            }
        };
        if changed {
            self.shared.events.emit(SessionEvent::PinChanged {
                peer_id: peer_id.to_owned(),
                pinned,
            });
        }
    }

    pub(crate) fn apply_lock(&self, locked: bool) {
        let changed = {
            let mut room = self.shared.room.lock();
            std::mem::replace(&mut room.locked, locked) != locked
        };
        if changed {
            info!(locked, "Room lock changed");
            self.shared.events.emit(SessionEvent::RoomLockChanged { locked });
        }
    }

    pub async fn kick_peer(&self, peer_id: &str) -> SessionResult<()> {
        let shared = &self.shared;
        if !shared.room.lock().is_creator {
            return Err(SessionError::Unauthorized("kick participants"));
        }
        if shared.is_local_peer(peer_id) {
            return Err(SessionError::Validation("cannot kick yourself".into()));
        }
        shared
            .request(OutboundSignal::KickPeer {
                peer_id: peer_id.to_owned(),
            })
            .await?;
        info!(%peer_id, "Kick requested");
        Ok(())
    }
}
