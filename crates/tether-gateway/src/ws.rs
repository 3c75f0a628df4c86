use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use tether_types::events::DISCONNECT;

use crate::connection::{Connection, EventListener, EventRegistry, SubscriptionId};
use crate::error::GatewayError;

/// Wire frame. Client emits carry `event` (+ `ack` when a reply is wanted);
/// server replies to an ack carry only `ack` and `data`.
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack: Option<u64>,
}

/// [`Connection`] over a WebSocket carrying JSON frames.
pub struct WsConnection {
    url: String,
    inner: Arc<WsInner>,
    link: tokio::sync::Mutex<Option<Link>>,
}

#[derive(Default)]
struct WsInner {
    events: EventRegistry,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_ack: AtomicU64,
}

struct Link {
    outgoing: mpsc::UnboundedSender<WsMessage>,
    closing: Arc<AtomicBool>,
    /// Set by the reader when the socket ends; the link is then dead.
    lost: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Link {
    fn is_live(&self) -> bool {
        !self.lost.load(Ordering::Acquire) && !self.reader.is_finished() && !self.outgoing.is_closed()
    }
}

impl WsInner {
    fn pending_acks(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Value>>> {
        self.pending_acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_text(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                let raw: String = text.chars().take(200).collect();
                warn!("Bad gateway frame: {} -- raw: {}", e, raw);
                return;
            }
        };

        match (frame.event, frame.ack) {
            (Some(event), _) => {
                let delivered = self.events.dispatch(&event, &frame.data);
                if delivered == 0 {
                    debug!("No listener for gateway event {}", event);
                }
            }
            (None, Some(ack)) => match self.pending_acks().remove(&ack) {
                Some(tx) => {
                    let _ = tx.send(frame.data);
                }
                None => debug!("Late ack {} ignored", ack),
            },
            (None, None) => warn!("Gateway frame with neither event nor ack"),
        }
    }
}

impl WsConnection {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            inner: Arc::new(WsInner::default()),
            link: tokio::sync::Mutex::new(None),
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), GatewayError> {
        let text = serde_json::to_string(frame).map_err(|e| GatewayError::Protocol(e.to_string()))?;
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(GatewayError::NotConnected)?;
        if !link.is_live() {
            return Err(GatewayError::Closed);
        }
        link.outgoing
            .send(WsMessage::Text(text.into()))
            .map_err(|_| GatewayError::Closed)
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn open(&self) -> Result<(), GatewayError> {
        let mut link = self.link.lock().await;
        match link.take() {
            Some(current) if current.is_live() => {
                *link = Some(current);
                return Ok(());
            }
            Some(stale) => {
                debug!("Discarding dead gateway link before reconnect");
                stale.reader.abort();
            }
            None => {}
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| GatewayError::ConnectFailed(e.to_string()))?;
        let (mut sink, mut stream) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let closing = Arc::new(AtomicBool::new(false));
        let reader_closing = closing.clone();
        let lost = Arc::new(AtomicBool::new(false));
        let reader_lost = lost.clone();
        let inner = self.inner.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => inner.handle_text(text.as_str()),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Gateway read error: {}", e);
                        break;
                    }
                }
            }

            reader_lost.store(true, Ordering::Release);
            // Outstanding acks resolve as Closed once their senders drop.
            inner.pending_acks().clear();
            if !reader_closing.load(Ordering::Acquire) {
                info!("Gateway connection lost");
                inner
                    .events
                    .dispatch(DISCONNECT, &json!({ "reason": "transport closed" }));
            }
        });

        info!("Gateway connected to {}", self.url);
        *link = Some(Link {
            outgoing,
            closing,
            lost,
            reader,
        });
        Ok(())
    }

    async fn close(&self) {
        let Some(link) = self.link.lock().await.take() else {
            return;
        };
        link.closing.store(true, Ordering::Release);
        let _ = link.outgoing.send(WsMessage::Close(None));
        link.reader.abort();
        self.inner.pending_acks().clear();
        info!("Gateway connection closed");
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<(), GatewayError> {
        self.send_frame(&Frame {
            event: Some(event.to_string()),
            data: payload,
            ack: None,
        })
        .await
    }

    async fn emit_with_ack(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let ack = self.inner.next_ack.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.inner.pending_acks().insert(ack, tx);

        let sent = self
            .send_frame(&Frame {
                event: Some(event.to_string()),
                data: payload,
                ack: Some(ack),
            })
            .await;
        if let Err(e) = sent {
            self.inner.pending_acks().remove(&ack);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(GatewayError::Closed),
            Err(_) => {
                self.inner.pending_acks().remove(&ack);
                Err(GatewayError::Timeout(timeout))
            }
        }
    }

    fn on(&self, event: &str) -> EventListener {
        self.inner.events.subscribe(event)
    }

    fn off(&self, id: SubscriptionId) {
        self.inner.events.unsubscribe(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_reply_resolves_pending_request() {
        let inner = WsInner::default();
        let (tx, mut rx) = oneshot::channel();
        inner.pending_acks().insert(7, tx);

        inner.handle_text(r#"{"ack":7,"data":{"ok":true,"seq":3}}"#);
        assert_eq!(rx.try_recv().unwrap(), json!({ "ok": true, "seq": 3 }));
        assert!(inner.pending_acks().is_empty());
    }

    #[test]
    fn server_events_reach_listeners() {
        let inner = WsInner::default();
        let mut listener = inner.events.subscribe("chat_message");
        inner.handle_text(r#"{"event":"chat_message","data":{"id":"m1"}}"#);
        inner.handle_text("not json");
        assert_eq!(listener.events.try_recv().unwrap(), json!({ "id": "m1" }));
        assert!(listener.events.try_recv().is_err());
    }

    #[test]
    fn bad_frame_with_multibyte_text_is_skipped() {
        let inner = WsInner::default();
        let mut listener = inner.events.subscribe("chat_message");
        let raw = format!("{}é{{not json", "a".repeat(199));
        inner.handle_text(&raw);
        inner.handle_text(r#"{"event":"chat_message","data":{"id":"m2"}}"#);
        assert_eq!(listener.events.try_recv().unwrap(), json!({ "id": "m2" }));
    }

    #[test]
    fn frames_omit_absent_fields() {
        let frame = Frame {
            event: Some("join_room".into()),
            data: json!({ "roomId": "r1" }),
            ack: None,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "event": "join_room", "data": { "roomId": "r1" } })
        );
    }

    #[tokio::test]
    async fn emit_before_open_is_not_connected() {
        let conn = WsConnection::new("ws://127.0.0.1:9");
        assert_eq!(conn.emit("join_room", json!({})).await, Err(GatewayError::NotConnected));
    }
}
