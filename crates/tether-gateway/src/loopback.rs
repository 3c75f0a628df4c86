use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use tether_types::events::{DISCONNECT, RoomEventKind, SEND_MESSAGE};

use crate::connection::{Connection, EventListener, EventRegistry, SubscriptionId};
use crate::error::GatewayError;

/// How the loopback answers one acknowledged emit.
#[derive(Debug, Clone)]
pub enum AckScript {
    Reply(Value),
    /// Never answer; the caller's timeout fires.
    Silent,
    Fail(GatewayError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmittedFrame {
    pub event: String,
    pub payload: Value,
}

/// In-process [`Connection`] with no server behind it. Acks are scripted,
/// every emit is recorded, and server events can be injected. With echo
/// enabled, accepted `send_message` payloads come back as `chat_message`
/// broadcasts carrying a sequence number, like a single-client server.
#[derive(Clone, Default)]
pub struct LoopbackConnection {
    inner: Arc<LoopInner>,
}

#[derive(Default)]
struct LoopInner {
    events: EventRegistry,
    state: Mutex<LoopState>,
    next_seq: AtomicI64,
}

#[derive(Default)]
struct LoopState {
    open: bool,
    opens: usize,
    fail_opens: usize,
    open_delay: Option<Duration>,
    emitted: Vec<EmittedFrame>,
    acks: VecDeque<AckScript>,
    default_ack: Option<AckScript>,
    echo: bool,
}

impl LoopbackConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_echo() -> Self {
        let conn = Self::default();
        conn.state().echo = true;
        conn
    }

    fn state(&self) -> MutexGuard<'_, LoopState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.state().fail_opens = count;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.state().open_delay = Some(delay);
    }

    /// Queue the answer for the next acknowledged emit.
    pub fn script_ack(&self, script: AckScript) {
        self.state().acks.push_back(script);
    }

    /// Answer used once the scripted queue is empty. `{"ok": true}` by default.
    pub fn set_default_ack(&self, script: AckScript) {
        self.state().default_ack = Some(script);
    }

    pub fn emitted(&self) -> Vec<EmittedFrame> {
        self.state().emitted.clone()
    }

    pub fn emitted_payloads(&self, event: &str) -> Vec<Value> {
        self.state()
            .emitted
            .iter()
            .filter(|f| f.event == event)
            .map(|f| f.payload.clone())
            .collect()
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.events.listener_count(event)
    }

    /// Deliver a server event to local listeners.
    pub fn inject(&self, event: &str, payload: Value) -> usize {
        self.inner.events.dispatch(event, &payload)
    }

    /// Simulate the transport dropping underneath the client.
    pub fn drop_connection(&self) {
        let was_open = std::mem::replace(&mut self.state().open, false);
        if was_open {
            info!("Loopback connection dropped");
            self.inner
                .events
                .dispatch(DISCONNECT, &json!({ "reason": "transport closed" }));
        }
    }

    fn record(&self, event: &str, payload: &Value) -> Result<(), GatewayError> {
        let mut state = self.state();
        if !state.open {
            return Err(GatewayError::NotConnected);
        }
        state.emitted.push(EmittedFrame {
            event: event.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }

    fn echo(&self, event: &str, payload: &Value, reply: &Value) -> Value {
        if !self.state().echo || event != SEND_MESSAGE {
            return reply.clone();
        }
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut broadcast = payload.clone();
        if let Value::Object(map) = &mut broadcast {
            map.insert("seq".into(), json!(seq));
        }
        self.inner
            .events
            .dispatch(RoomEventKind::ChatMessage.event_name(), &broadcast);

        let mut reply = reply.clone();
        if let Value::Object(map) = &mut reply {
            map.entry("seq").or_insert(json!(seq));
        }
        reply
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn open(&self) -> Result<(), GatewayError> {
        let delay = self.state().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.opens += 1;
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(GatewayError::ConnectFailed("loopback refused".into()));
        }
        state.open = true;
        debug!("Loopback connection open");
        Ok(())
    }

    async fn close(&self) {
        self.state().open = false;
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<(), GatewayError> {
        self.record(event, &payload)
    }

    async fn emit_with_ack(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        self.record(event, &payload)?;
        let script = {
            let mut state = self.state();
            state
                .acks
                .pop_front()
                .or_else(|| state.default_ack.clone())
                .unwrap_or_else(|| AckScript::Reply(json!({ "ok": true })))
        };

        match script {
            AckScript::Reply(reply) => Ok(self.echo(event, &payload, &reply)),
            AckScript::Silent => {
                tokio::time::sleep(timeout).await;
                Err(GatewayError::Timeout(timeout))
            }
            AckScript::Fail(e) => Err(e),
        }
    }

    fn on(&self, event: &str) -> EventListener {
        self.inner.events.subscribe(event)
    }

    fn off(&self, id: SubscriptionId) {
        self.inner.events.unsubscribe(id);
    }
}
