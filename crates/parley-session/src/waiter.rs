//! Request/response matching over the signaling channel.
//!
//! A caller registers what it expects, emits the request, then awaits the
//! receiver under a timeout. Inbound handlers resolve the oldest waiter that
//! matches.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{SessionError, SessionResult};
use crate::types::MediaKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expectation {
    TransportConnected(String),
    ProducerCreated { kind: MediaKind, screen: bool },
    PinResponse(String),
    RoomLocked,
    RoomUnlocked,
}

/// Payload handed to a resolved waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack,
    ProducerId(String),
    Pin { pinned: bool, success: bool },
}

#[derive(Default)]
pub struct ResponseWaiters {
    pending: Mutex<Vec<(Expectation, oneshot::Sender<Response>)>>,
}

impl ResponseWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, expectation: Expectation) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        // Drop waiters whose callers already gave up.
        pending.retain(|(_, tx)| !tx.is_closed());
        pending.push((expectation, tx));
        rx
    }

    /// Resolve the oldest waiter for `expectation`. Returns `false` if none was waiting.
    pub fn resolve(&self, expectation: &Expectation, response: Response) -> bool {
        let sender = {
            let mut pending = self.pending.lock();
            pending.retain(|(_, tx)| !tx.is_closed());
            let idx = pending.iter().position(|(e, _)| e == expectation);
            idx.map(|i| pending.remove(i).1)
        };
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(?expectation, "No waiter for response");
                false
            }
        }
    }

    /// Drop every waiter; their receivers observe cancellation.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Await a registered response, bounded by `timeout`.
pub async fn wait(
    rx: oneshot::Receiver<Response>,
    timeout: Duration,
    what: &str,
) -> SessionResult<Response> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => Err(SessionError::Cancelled(what.to_owned())),
        Err(_) => Err(SessionError::Timeout(what.to_owned())),
    }
}
