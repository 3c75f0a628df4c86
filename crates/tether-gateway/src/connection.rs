use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Payloads of one named server event, in arrival order.
pub struct EventListener {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<Value>,
}

/// A single bidirectional event connection to the chat server.
///
/// Implementations emit [`tether_types::events::DISCONNECT`] to their own
/// listeners when the underlying transport drops without `close()`.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn open(&self) -> Result<(), GatewayError>;

    async fn close(&self);

    /// Fire-and-forget emit.
    async fn emit(&self, event: &str, payload: Value) -> Result<(), GatewayError>;

    /// Emit and wait for the server's reply, at most `timeout`.
    async fn emit_with_ack(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError>;

    fn on(&self, event: &str) -> EventListener;

    fn off(&self, id: SubscriptionId);
}

/// Event-name keyed fan-out table shared by the connection providers.
#[derive(Default)]
pub struct EventRegistry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<Value>)>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<Value>)>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, event: &str) -> EventListener {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        self.handlers().entry(event.to_string()).or_default().push((id, tx));
        EventListener { id, events: rx }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut handlers = self.handlers();
        for subs in handlers.values_mut() {
            subs.retain(|(sid, _)| *sid != id);
        }
        handlers.retain(|_, subs| !subs.is_empty());
    }

    /// Deliver `payload` to every listener of `event`. Returns how many
    /// listeners received it; listeners whose receiver is gone are pruned.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let mut handlers = self.handlers();
        let Some(subs) = handlers.get_mut(event) else {
            return 0;
        };
        subs.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        subs.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.handlers().get(event).map_or(0, Vec::len)
    }
}
