//! Device records and the security state they own.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use scape_core::cipher::{CAESAR, PLAIN};
use tokio::time::Instant;

/// Identifies a device: the service it belongs to and its id within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub service: String,
    pub id: String,
}

impl DeviceKey {
    pub fn new(service: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.id)
    }
}

/// Which wire format a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IoTScape JSON datagrams.
    Json,
    /// RoboScape fixed-header binary frames.
    Binary,
}

/// How a device's payloads are encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encryption {
    Concrete { cipher: String, key: Vec<i64> },
    /// Uses another device's security state. Never chains.
    Linked(DeviceKey),
}

impl Default for Encryption {
    fn default() -> Self {
        Encryption::Concrete {
            cipher: PLAIN.to_string(),
            key: vec![0],
        }
    }
}

impl Encryption {
    pub fn is_linked(&self) -> bool {
        matches!(self, Encryption::Linked(_))
    }
}

/// Resolved cipher name and key, as callers see them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionState {
    pub cipher: String,
    pub key: Vec<i64>,
}

impl EncryptionState {
    pub fn is_plain(&self) -> bool {
        self.cipher.eq_ignore_ascii_case(PLAIN)
    }

    pub fn is_caesar(&self) -> bool {
        self.cipher.eq_ignore_ascii_case(CAESAR)
    }
}

/// Per-client admission counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCounter {
    /// Commands admitted in the current one-second window.
    pub count: u32,
    /// Remaining ticks during which this client is refused.
    pub penalty: u32,
}

/// Rate limits and their counters. A limit of 0 means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateState {
    pub total_count: u32,
    pub total_rate: u32,
    pub client_rate: u32,
    /// Penalty ticks applied on a client-rate violation, on top of one.
    pub client_penalty: u32,
    pub clients: HashMap<String, ClientCounter>,
}

/// Everything a link shares: encryption, rate limiting, replay window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityState {
    pub encryption: Encryption,
    pub rate: RateState,
    /// Last accepted sequence number; −1 disables the replay check.
    pub last_seq: i64,
}

impl Default for SecurityState {
    fn default() -> Self {
        Self {
            encryption: Encryption::default(),
            rate: RateState::default(),
            last_seq: -1,
        }
    }
}

/// A registered device.
#[derive(Debug, Clone)]
pub struct Device {
    pub key: DeviceKey,
    pub family: Family,
    /// Source of the last datagram.
    pub address: SocketAddr,
    /// Ticks since the last datagram.
    pub heartbeats: u32,
    pub security: SecurityState,
    /// Device-local clock of the last binary frame; −1 before the first.
    pub timestamp: i64,
    /// When the button went down, while it is held.
    pub button_down_at: Option<Instant>,
}

impl Device {
    pub fn new(key: DeviceKey, address: SocketAddr, family: Family) -> Self {
        Self {
            key,
            family,
            address,
            heartbeats: 0,
            security: SecurityState::default(),
            timestamp: -1,
            button_down_at: None,
        }
    }

    pub fn snapshot(&self, created: bool) -> DeviceSnapshot {
        DeviceSnapshot {
            key: self.key.clone(),
            family: self.family,
            address: self.address,
            heartbeats: self.heartbeats,
            created,
        }
    }
}

/// Copy of a device's routing fields, returned without holding a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub key: DeviceKey,
    pub family: Family,
    pub address: SocketAddr,
    pub heartbeats: u32,
    /// True when this call created the record.
    pub created: bool,
}
