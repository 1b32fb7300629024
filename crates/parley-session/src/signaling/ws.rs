//! WebSocket signaling channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{InboundSignal, OutboundSignal, SignalingChannel};
use crate::error::{SessionError, SessionResult};

/// Signaling over a single WebSocket connection.
///
/// A writer task drains an outbound queue so `emit` never blocks on the socket;
/// a reader task parses frames and forwards them to the inbound sink.
pub struct WsSignalingChannel {
    url: url::Url,
    inbound: mpsc::UnboundedSender<InboundSignal>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    connected: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsSignalingChannel {
    pub fn new(url: &str, inbound: mpsc::UnboundedSender<InboundSignal>) -> SessionResult<Self> {
        let url = url::Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SessionError::Validation(format!(
                "signaling url must use ws or wss, got {}",
                url.scheme()
            )));
        }
        Ok(Self {
            url,
            inbound,
            outbound: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn connect(&self) -> SessionResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.abort_tasks();

        let (ws, _) = connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();
        info!(url = %self.url, "Signaling connected");

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);

        let connected = Arc::clone(&self.connected);
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "Signaling write failed");
                    break;
                }
            }
            let _ = sink.close().await;
            connected.store(false, Ordering::SeqCst);
        });

        let connected = Arc::clone(&self.connected);
        let inbound = self.inbound.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(t)) => t,
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Signaling closed by server");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "Signaling read failed");
                        break;
                    }
                };
                match serde_json::from_str::<InboundSignal>(text.as_str()) {
                    Ok(signal) => {
                        if inbound.send(signal).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "Ignoring unrecognized signaling frame"),
                }
            }
            connected.store(false, Ordering::SeqCst);
            info!("Signaling disconnected");
        });

        self.tasks.lock().extend([writer, reader]);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.outbound.lock().take();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn emit(&self, signal: OutboundSignal) -> SessionResult<()> {
        let text = serde_json::to_string(&signal)?;
        let tx = self.outbound.lock().clone().ok_or(SessionError::NotConnected)?;
        tx.send(text).map_err(|_| SessionError::NotConnected)?;
        debug!(event = signal.name(), "Signal sent");
        Ok(())
    }
}
