//! Device negotiation and the send/receive transport pair.
//!
//! Exactly one transport per role exists per session. Duplicate signaling events
//! (a second capabilities ack, a replayed `transport-created`) are absorbed by
//! existence checks and in-flight flags.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::consumer::ConsumerManager;
use crate::context::{FlagGuard, SessionShared};
use crate::engine::{ProduceRequest, TransportHandler};
use crate::error::{EngineError, SessionError, SessionResult};
use crate::events::NoticeLevel;
use crate::producer::ProducerManager;
use crate::signaling::OutboundSignal;
use crate::stream::StreamManager;
use crate::types::{
    ConnectionState, DtlsParameters, RtpCapabilities, TransportDescriptor, TransportRole,
};
use crate::waiter::{self, Expectation, Response};

#[derive(Clone)]
pub struct TransportManager {
    shared: Arc<SessionShared>,
}

impl TransportManager {
    pub fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    /// Load the device (once) and announce its capabilities.
    ///
    /// A failure is retried in the background; the return value only reports
    /// this attempt.
    pub async fn initialize_device(&self, router_capabilities: &RtpCapabilities) -> bool {
        if self.try_initialize_device(router_capabilities).await {
            return true;
        }
        self.schedule_device_retry(router_capabilities.clone());
        false
    }

    async fn try_initialize_device(&self, router_capabilities: &RtpCapabilities) -> bool {
        let shared = &self.shared;
        if !shared.engine.is_loaded() {
            if let Err(e) = shared.engine.load(router_capabilities).await {
                warn!(error = %e, "Device load failed");
                return false;
            }
            info!("Device loaded");
        } else {
            debug!("Device already loaded");
        }

        let Some(rtp_capabilities) = shared.engine.rtp_capabilities() else {
            warn!("Device reports no RTP capabilities");
            return false;
        };
        shared
            .send(OutboundSignal::SetRtpCapabilities { rtp_capabilities })
            .await
    }

    fn schedule_device_retry(&self, router_capabilities: RtpCapabilities) {
        if self
            .shared
            .flags
            .device_initializing
            .swap(true, Ordering::SeqCst)
        {
            debug!("Device retry already scheduled");
            return;
        }

        let manager = self.clone();
        let epoch = self.shared.epoch();
        tokio::spawn(async move {
            let cfg = &manager.shared.config;
            for attempt in 1..=cfg.device_retry_attempts {
                tokio::time::sleep(cfg.device_retry_delay()).await;
                if !manager.shared.is_current(epoch) {
                    return;
                }
                debug!(attempt, "Retrying device initialization");
                if manager.try_initialize_device(&router_capabilities).await {
                    manager
                        .shared
                        .flags
                        .device_initializing
                        .store(false, Ordering::SeqCst);
                    return;
                }
            }
            manager
                .shared
                .flags
                .device_initializing
                .store(false, Ordering::SeqCst);
            error!("Device initialization failed after retries");
            manager
                .shared
                .events
                .notice(NoticeLevel::Error, "Could not initialize the media device");
        });
    }

    /// Request the send transport, then the receive transport after a short gap.
    ///
    /// No-op if either transport exists or the request was already made.
    pub async fn create_transports(&self) {
        let shared = &self.shared;
        {
            let slots = shared.transports.read();
            if slots.send.is_some() || slots.recv.is_some() {
                debug!("Transports already exist, skipping");
                return;
            }
        }
        if shared.flags.transports_requested.swap(true, Ordering::SeqCst) {
            debug!("Transports already requested, skipping");
            return;
        }

        let epoch = shared.epoch();
        if !shared
            .send(OutboundSignal::CreateTransport { is_producer: true })
            .await
        {
            shared.flags.transports_requested.store(false, Ordering::SeqCst);
            return;
        }
        tokio::time::sleep(shared.config.recv_transport_delay()).await;
        if !shared.is_current(epoch) {
            return;
        }
        shared
            .send(OutboundSignal::CreateTransport { is_producer: false })
            .await;
    }

    /// Build the local end of a server-created transport.
    pub async fn create_transport(&self, descriptor: TransportDescriptor) -> SessionResult<()> {
        let shared = &self.shared;
        let role = TransportRole::from_is_producer(descriptor.is_producer);
        if shared.transport(role).is_some() {
            debug!(transport = ?role, id = %descriptor.id, "Transport already exists, skipping");
            return Ok(());
        }
        let Some(_creating) = FlagGuard::acquire(shared.flags.creating(role)) else {
            debug!(transport = ?role, "Transport creation already in flight");
            return Ok(());
        };

        let epoch = shared.epoch();
        let hooks: Arc<dyn TransportHandler> = Arc::new(TransportHooks {
            shared: Arc::downgrade(shared),
            role,
            transport_id: descriptor.id.clone(),
            epoch,
        });
        let created = match role {
            TransportRole::Send => shared.engine.create_send_transport(&descriptor, hooks).await,
            TransportRole::Recv => shared.engine.create_recv_transport(&descriptor, hooks).await,
        };
        let transport = created.map_err(|e| {
            error!(transport = ?role, error = %e, "Transport creation failed");
            SessionError::Engine(e)
        })?;

        if !shared.is_current(epoch) {
            transport.close();
            return Ok(());
        }
        {
            let mut slots = shared.transports.write();
            let slot = slots.slot_mut(role);
            if slot.is_some() {
                transport.close();
                return Ok(());
            }
            *slot = Some(Arc::clone(&transport));
        }
        info!(transport = ?role, id = %descriptor.id, "Transport created");
        Ok(())
    }

    pub fn is_recv_connected(&self) -> bool {
        self.shared
            .transport(TransportRole::Recv)
            .is_some_and(|t| t.connection_state() == ConnectionState::Connected)
    }

    /// Connection-state observer shared by both transports.
    pub async fn handle_connection_state(&self, role: TransportRole, state: ConnectionState) {
        info!(transport = ?role, ?state, "Transport state changed");
        match (role, state) {
            (TransportRole::Send, ConnectionState::Connected) => {
                let (has_local, has_producers) = {
                    let media = self.shared.media.lock();
                    (media.local_stream.is_some(), media.has_camera_producers())
                };
                let producers = ProducerManager::new(Arc::clone(&self.shared));
                if !has_local {
                    producers.initialize_local_media().await;
                } else if !has_producers {
                    producers.publish_tracks().await;
                }
            }
            (TransportRole::Recv, ConnectionState::Connected) => {
                StreamManager::new(Arc::clone(&self.shared)).flush_pending().await;
                self.shared.send(OutboundSignal::GetStreams).await;
            }
            (_, ConnectionState::Failed) => {
                warn!(transport = ?role, "Transport failed");
                self.shared
                    .events
                    .notice(NoticeLevel::Warning, "Media connection lost, rejoin to recover");
            }
            (TransportRole::Recv, ConnectionState::Closed) => {
                ConsumerManager::new(Arc::clone(&self.shared)).close_all();
            }
            _ => {}
        }
    }

    /// Close both transports and forget them.
    pub fn close_all(&self) {
        let (send, recv) = {
            let mut slots = self.shared.transports.write();
            (slots.send.take(), slots.recv.take())
        };
        for t in send.into_iter().chain(recv) {
            t.close();
        }
    }
}

/// Callbacks wired into each transport.
///
/// Holds a weak reference so a transport kept alive by the engine does not keep
/// a left session alive.
struct TransportHooks {
    shared: Weak<SessionShared>,
    role: TransportRole,
    transport_id: String,
    epoch: u64,
}

impl TransportHooks {
    fn session(&self) -> Result<Arc<SessionShared>, EngineError> {
        self.shared
            .upgrade()
            .filter(|s| s.is_current(self.epoch))
            .ok_or(EngineError::Closed)
    }
}

#[async_trait]
impl TransportHandler for TransportHooks {
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        let shared = self.session()?;
        let rx = shared
            .waiters
            .register(Expectation::TransportConnected(self.transport_id.clone()));
        shared
            .request(OutboundSignal::ConnectTransport {
                transport_id: self.transport_id.clone(),
                dtls_parameters,
            })
            .await
            .map_err(|e| EngineError::Other(e.to_string()))?;

        let timeout = shared.config.transport_connect_timeout();
        match waiter::wait(rx, timeout, "transport-connected").await {
            Ok(_) => {
                debug!(
                    transport = ?self.role,
                    id = %self.transport_id,
                    "Transport connect confirmed"
                );
                Ok(())
            }
            Err(SessionError::Timeout(_)) => {
                warn!(
                    transport = ?self.role,
                    id = %self.transport_id,
                    "No transport-connected confirmation, continuing"
                );
                Ok(())
            }
            Err(_) => Err(EngineError::Closed),
        }
    }

    async fn on_produce(&self, request: ProduceRequest) -> Result<String, EngineError> {
        let shared = self.session()?;
        let expectation = Expectation::ProducerCreated {
            kind: request.kind,
            screen: request.app_data.is_screen(),
        };
        let rx = shared.waiters.register(expectation);
        shared
            .request(OutboundSignal::Produce {
                transport_id: self.transport_id.clone(),
                kind: request.kind,
                rtp_parameters: request.rtp_parameters,
                app_data: request.app_data,
            })
            .await
            .map_err(|e| EngineError::Other(e.to_string()))?;

        match waiter::wait(rx, shared.config.produce_timeout(), "producer-created").await {
            Ok(Response::ProducerId(id)) => Ok(id),
            Ok(other) => Err(EngineError::Other(format!("unexpected response {other:?}"))),
            Err(SessionError::Timeout(_)) => Err(EngineError::Timeout("producer-created")),
            Err(_) => Err(EngineError::Closed),
        }
    }

    fn on_connection_state_change(&self, state: ConnectionState) {
        let Ok(shared) = self.session() else {
            return;
        };
        let role = self.role;
        tokio::spawn(async move {
            TransportManager::new(shared)
                .handle_connection_state(role, state)
                .await;
        });
    }
}
