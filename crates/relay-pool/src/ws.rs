//! Websocket relay connection.
//!
//! One socket per relay. A writer task drains outbound frames, a reader task
//! routes inbound frames to per-subscription sinks and publish waiters. When
//! the socket ends every sink is dropped, so consumers see end-of-stream and
//! the registry reconnects on next use.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use nostr_sdk::{Event, Filter, SubscriptionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::connection::{Connector, Notification, RelayConnection, SUBSCRIPTION_BUFFER};
use crate::error::{Error, Result};
use crate::message::{self, RelayFrame};

/// Upper bound on waiting for an `OK` after sending an event.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

type Sinks = Arc<Mutex<HashMap<String, mpsc::Sender<Notification>>>>;
type Acks = Arc<Mutex<HashMap<String, oneshot::Sender<(bool, String)>>>>;

/// Opens real websocket connections.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn RelayConnection>> {
        let relay = WsRelay::connect(url).await?;
        Ok(Arc::new(relay))
    }
}

pub struct WsRelay {
    url: String,
    outbound: mpsc::UnboundedSender<WsMessage>,
    sinks: Sinks,
    acks: Acks,
    connected: Arc<AtomicBool>,
}

impl WsRelay {
    pub async fn connect(url: &str) -> Result<Self> {
        debug!(relay = %url, "connecting");
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| Error::connection(url, e))?;
        info!(relay = %url, "connected");

        let (mut write, mut read) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        let sinks: Sinks = Arc::default();
        let acks: Acks = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));

        {
            let connected = connected.clone();
            let url = url.to_string();
            tokio::spawn(async move {
                while let Some(msg) = outbound_rx.recv().await {
                    let closing = matches!(msg, WsMessage::Close(_));
                    if let Err(e) = write.send(msg).await {
                        warn!(relay = %url, "write failed: {e}");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                connected.store(false, Ordering::SeqCst);
                write.close().await.ok();
            });
        }

        {
            let connected = connected.clone();
            let sinks = sinks.clone();
            let acks = acks.clone();
            let pong = outbound.clone();
            let url = url.to_string();
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    let text = match msg {
                        Ok(WsMessage::Text(t)) => t.to_string(),
                        Ok(WsMessage::Ping(d)) => {
                            pong.send(WsMessage::Pong(d)).ok();
                            continue;
                        }
                        Ok(WsMessage::Close(_)) => {
                            info!(relay = %url, "relay sent close frame");
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(relay = %url, "read failed: {e}");
                            break;
                        }
                    };
                    route_frame(&url, message::parse_frame(&text), &sinks, &acks).await;
                }

                connected.store(false, Ordering::SeqCst);
                sinks.lock().clear();
                acks.lock().clear();
                debug!(relay = %url, "reader finished");
            });
        }

        Ok(Self {
            url: url.to_string(),
            outbound,
            sinks,
            acks,
            connected,
        })
    }

    fn send_text(&self, text: String) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::connection(&self.url, "not connected"));
        }
        self.outbound
            .send(WsMessage::Text(text.into()))
            .map_err(|_| Error::connection(&self.url, "writer gone"))
    }
}

async fn route_frame(url: &str, frame: RelayFrame, sinks: &Sinks, acks: &Acks) {
    let (sub_id, notification) = match frame {
        RelayFrame::Event { sub_id, event } => (sub_id, Notification::Event(event)),
        RelayFrame::EndOfStoredEvents { sub_id } => (sub_id, Notification::EndOfStoredEvents),
        RelayFrame::Closed { sub_id, message } => {
            debug!(relay = %url, sub = %sub_id, "subscription closed by relay: {message}");
            (sub_id, Notification::Closed(message))
        }
        RelayFrame::Ok {
            event_id,
            accepted,
            message,
        } => {
            if let Some(waiter) = acks.lock().remove(&event_id) {
                waiter.send((accepted, message)).ok();
            }
            return;
        }
        RelayFrame::Notice { message } => {
            warn!(relay = %url, "relay notice: {message}");
            return;
        }
        RelayFrame::Auth { challenge } => {
            debug!(relay = %url, "ignoring AUTH challenge {challenge}");
            return;
        }
        RelayFrame::Unknown(raw) => {
            debug!(relay = %url, "unhandled frame: {}", preview(&raw));
            return;
        }
    };

    // clone the sender so the map lock is not held across the send
    let sink = sinks.lock().get(&sub_id).cloned();
    if let Some(sink) = sink {
        if sink.send(notification).await.is_err() {
            sinks.lock().remove(&sub_id);
        }
    }
}

/// First 120 characters of a frame, for logging.
fn preview(raw: &str) -> String {
    raw.chars().take(120).collect()
}

#[async_trait]
impl RelayConnection for WsRelay {
    fn url(&self) -> &str {
        &self.url
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn register(&self, id: &SubscriptionId) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.sinks.lock().insert(id.to_string(), tx);
        rx
    }

    async fn req(&self, id: &SubscriptionId, filters: &[Filter]) -> Result<()> {
        self.send_text(message::req_frame(id, filters))
    }

    async fn close(&self, id: &SubscriptionId) {
        self.sinks.lock().remove(&id.to_string());
        if self.is_connected() {
            self.send_text(message::close_frame(id)).ok();
        }
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        let key = event.id.to_hex();
        let (tx, rx) = oneshot::channel();
        self.acks.lock().insert(key.clone(), tx);

        if let Err(e) = self.send_text(message::event_frame(event)) {
            self.acks.lock().remove(&key);
            return Err(e);
        }

        let outcome = tokio::time::timeout(ACK_TIMEOUT, rx).await;
        self.acks.lock().remove(&key);
        match outcome {
            Ok(Ok((true, _))) => Ok(()),
            Ok(Ok((false, reason))) => Err(Error::Rejected {
                url: self.url.clone(),
                reason,
            }),
            Ok(Err(_)) => Err(Error::connection(&self.url, "connection lost before OK")),
            Err(_) => Err(Error::Timeout),
        }
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        self.outbound.send(WsMessage::Close(None)).ok();
    }
}
