//! Listener fan-out: per-device subscriber lists.
//!
//! Clients subscribe to a single (service, id) pair; there is no wildcard and
//! no cross-device topic. A client is identified by (client, role, project);
//! subscribing twice is a no-op.
//!
//! Two delivery kinds:
//!   Direct:    typed message, content forwarded as-is
//!   Encrypted: `"<type> <v1> <v2> ..."` encrypted with the device's current
//!               cipher, wrapped in a `device message` envelope

use std::sync::Arc;

use dashmap::DashMap;
use scape_core::message::value_text;
use scape_core::ScapeError;
use serde_json::{json, Map, Value};

use crate::device::DeviceKey;
use crate::registry::DeviceRegistry;

/// Message type of encrypted event envelopes.
pub const DEVICE_MESSAGE: &str = "device message";

/// Event type forwarded to clients without re-encryption.
pub const DEVICE_COMMAND: &str = "device command";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub client_id: String,
    pub role_id: String,
    pub project_id: String,
}

impl ClientIdentity {
    pub fn new(client_id: &str, role_id: &str, project_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            role_id: role_id.to_string(),
            project_id: project_id.to_string(),
        }
    }
}

/// A typed message for a client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMessage {
    pub msg_type: String,
    pub content: Map<String, Value>,
}

/// A connected client session, provided by the layer that serves clients.
pub trait ClientHandle: Send + Sync {
    fn identity(&self) -> ClientIdentity;

    /// Logged-in user, if any. Consulted by access control.
    fn username(&self) -> Option<String> {
        None
    }

    fn send_message(&self, message: ClientMessage);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Direct,
    Encrypted,
}

#[derive(Clone)]
pub struct Listeners {
    registry: DeviceRegistry,
    subscribers: Arc<DashMap<DeviceKey, Vec<Arc<dyn ClientHandle>>>>,
}

impl Listeners {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self {
            registry,
            subscribers: Arc::new(DashMap::new()),
        }
    }

    /// Add a subscriber. False when the device is unknown.
    pub fn subscribe(&self, service: &str, id: &str, client: Arc<dyn ClientHandle>) -> bool {
        if !self.registry.exists(service, id) {
            return false;
        }
        let identity = client.identity();
        let mut clients = self.subscribers.entry(DeviceKey::new(service, id)).or_default();
        if !clients.iter().any(|c| c.identity() == identity) {
            tracing::debug!(service, id, client = %identity.client_id, "listener added");
            clients.push(client);
        }
        true
    }

    pub fn unsubscribe(&self, service: &str, id: &str, identity: &ClientIdentity) -> bool {
        let key = DeviceKey::new(service, id);
        let mut removed = false;
        self.subscribers.remove_if_mut(&key, |_, clients| {
            let before = clients.len();
            clients.retain(|c| c.identity() != *identity);
            removed = clients.len() != before;
            clients.is_empty()
        });
        removed
    }

    /// Drop every subscription held by `identity`.
    pub fn unsubscribe_all(&self, identity: &ClientIdentity) {
        self.subscribers.retain(|_, clients| {
            clients.retain(|c| c.identity() != *identity);
            !clients.is_empty()
        });
    }

    /// Devices `identity` is subscribed to.
    pub fn subscriptions(&self, identity: &ClientIdentity) -> Vec<DeviceKey> {
        let mut keys: Vec<DeviceKey> = self
            .subscribers
            .iter()
            .filter(|entry| entry.value().iter().any(|c| c.identity() == *identity))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn clear(&self, service: &str, id: &str) {
        self.subscribers.remove(&DeviceKey::new(service, id));
    }

    /// Current subscribers, cloned out of the map.
    pub fn clients(&self, service: &str, id: &str) -> Vec<Arc<dyn ClientHandle>> {
        self.subscribers
            .get(&DeviceKey::new(service, id))
            .map(|clients| clients.clone())
            .unwrap_or_default()
    }

    /// Deliver an event to the device's subscribers. Returns the number of
    /// clients reached.
    pub fn publish(
        &self,
        service: &str,
        id: &str,
        kind: EventKind,
        event_type: &str,
        content: &Map<String, Value>,
    ) -> Result<usize, ScapeError> {
        let clients = self.clients(service, id);
        if clients.is_empty() {
            return Ok(0);
        }

        let message = match kind {
            EventKind::Direct => {
                let mut body = Map::new();
                body.insert("service".into(), json!(service));
                body.insert("device".into(), json!(id));
                body.extend(content.iter().map(|(k, v)| (k.clone(), v.clone())));
                ClientMessage {
                    msg_type: event_type.to_string(),
                    content: body,
                }
            }
            EventKind::Encrypted => {
                let text = event_text(event_type, content.values());
                let mut body = Map::new();
                body.insert("service".into(), json!(service));
                body.insert("device".into(), json!(id));
                body.insert("message".into(), json!(self.registry.encrypt(service, id, &text)?));
                ClientMessage {
                    msg_type: DEVICE_MESSAGE.to_string(),
                    content: body,
                }
            }
        };

        tracing::trace!(service, id, event = event_type, clients = clients.len(), "publishing event");
        for client in &clients {
            client.send_message(message.clone());
        }
        Ok(clients.len())
    }
}

/// `"<type> <v1> <v2> ..."`, trimmed.
pub fn event_text<'a>(event_type: &str, values: impl IntoIterator<Item = &'a Value>) -> String {
    let mut text = event_type.to_string();
    for value in values {
        text.push(' ');
        text.push_str(&value_text(value));
    }
    text.trim().to_string()
}

#[cfg(any(test, feature = "test-util"))]
/// A client that keeps what it receives.
#[derive(Debug)]
pub struct MemoryClient {
    identity: ClientIdentity,
    username: Option<String>,
    inbox: std::sync::Mutex<Vec<ClientMessage>>,
}

#[cfg(any(test, feature = "test-util"))]
impl MemoryClient {
    pub fn new(client_id: &str) -> Arc<Self> {
        Self::with_user(client_id, None)
    }

    pub fn with_user(client_id: &str, username: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            identity: ClientIdentity::new(client_id, "role", "project"),
            username: username.map(str::to_string),
            inbox: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Everything received so far, left in place.
    pub fn received(&self) -> Vec<ClientMessage> {
        self.inbox
            .lock()
            .map(|inbox| inbox.clone())
            .unwrap_or_default()
    }

    /// Remove and return everything received so far.
    pub fn take(&self) -> Vec<ClientMessage> {
        self.inbox
            .lock()
            .map(|mut inbox| std::mem::take(&mut *inbox))
            .unwrap_or_default()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl ClientHandle for MemoryClient {
    fn identity(&self) -> ClientIdentity {
        self.identity.clone()
    }

    fn username(&self) -> Option<String> {
        self.username.clone()
    }

    fn send_message(&self, message: ClientMessage) {
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.push(message);
        }
    }
}
