//! Device registry: every known device and its security state.
//!
//! Devices are keyed by (service, id) and created lazily by the first
//! datagram or announcement from a new pair. Configuration calls on an
//! unknown pair fail with `DeviceNotFound`; the dispatch paths that create
//! devices never fail.
//!
//! A device may link to another device's security state. Links are one level
//! deep: a linked device is never itself a link target, and a link target is
//! never itself linked. Lookups resolve the link transparently.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use scape_core::cipher::{CAESAR, PLAIN};
use scape_core::{CipherSuite, ScapeError};

use crate::device::{Device, DeviceKey, DeviceSnapshot, Encryption, EncryptionState, Family, SecurityState};

/// Name accepted by [`DeviceRegistry::set_encryption`] to request a link.
pub const LINKED: &str = "linked";

#[derive(Clone)]
pub struct DeviceRegistry {
    devices: Arc<DashMap<DeviceKey, Device>>,
    ciphers: Arc<CipherSuite>,
    /// Held while links are created or their targets removed.
    links: Arc<Mutex<()>>,
}

impl DeviceRegistry {
    pub fn new(ciphers: CipherSuite) -> Self {
        Self {
            devices: Arc::new(DashMap::new()),
            ciphers: Arc::new(ciphers),
            links: Arc::new(Mutex::new(())),
        }
    }

    pub fn ciphers(&self) -> &CipherSuite {
        &self.ciphers
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Refresh the device's address and liveness, creating it if needed.
    pub fn get_or_create(
        &self,
        service: &str,
        id: &str,
        address: SocketAddr,
        family: Family,
    ) -> DeviceSnapshot {
        let key = DeviceKey::new(service, id);
        let mut created = false;
        let mut entry = self.devices.entry(key.clone()).or_insert_with(|| {
            created = true;
            Device::new(key, address, family)
        });
        entry.address = address;
        entry.heartbeats = 0;
        let snapshot = entry.snapshot(created);
        drop(entry);

        if created {
            tracing::info!(service, id, addr = %address, "discovered device");
        }
        snapshot
    }

    /// Delete a device. Devices linked to it fall back to default security.
    /// Returns false if it did not exist.
    pub fn remove(&self, service: &str, id: &str) -> bool {
        let key = DeviceKey::new(service, id);
        let _links = self.lock_links();
        if self.devices.remove(&key).is_none() {
            return false;
        }
        for mut device in self.devices.iter_mut() {
            if device.security.encryption == Encryption::Linked(key.clone()) {
                tracing::debug!(device = %device.key, target = %key, "link target removed, resetting");
                device.security = SecurityState::default();
            }
        }
        tracing::info!(service, id, "removed device");
        true
    }

    /// One housekeeping tick: reset rate windows, age every device, and
    /// evict those silent for more than `forget_ticks` ticks.
    pub fn tick(&self, forget_ticks: u32) -> Vec<DeviceKey> {
        let mut expired = Vec::new();
        for mut device in self.devices.iter_mut() {
            device.security.rate.tick();
            device.heartbeats = device.heartbeats.saturating_add(1);
            if device.heartbeats > forget_ticks {
                expired.push(device.key.clone());
            }
        }
        for key in &expired {
            tracing::info!(device = %key, "forgetting silent device");
            self.remove(&key.service, &key.id);
        }
        expired
    }

    /// Mark the device alive if `from` is its registered address. Returns
    /// whether the address matched; false for unknown devices.
    pub fn touch(&self, service: &str, id: &str, from: SocketAddr) -> bool {
        match self.devices.get_mut(&DeviceKey::new(service, id)) {
            Some(mut device) if device.address == from => {
                device.heartbeats = 0;
                true
            }
            _ => false,
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn exists(&self, service: &str, id: &str) -> bool {
        self.devices.contains_key(&DeviceKey::new(service, id))
    }

    pub fn address(&self, service: &str, id: &str) -> Result<SocketAddr, ScapeError> {
        self.devices
            .get(&DeviceKey::new(service, id))
            .map(|device| device.address)
            .ok_or_else(|| ScapeError::device_not_found(service, id))
    }

    pub fn snapshot(&self, service: &str, id: &str) -> Option<DeviceSnapshot> {
        self.devices
            .get(&DeviceKey::new(service, id))
            .map(|device| device.snapshot(false))
    }

    /// Device ids of a service, sorted.
    pub fn devices(&self, service: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .devices
            .iter()
            .filter(|device| device.key.service == service)
            .map(|device| device.key.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Services with at least one device, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self
            .devices
            .iter()
            .map(|device| device.key.service.clone())
            .collect();
        services.sort();
        services.dedup();
        services
    }

    /// Every device key, in no particular order.
    pub fn keys(&self) -> Vec<DeviceKey> {
        self.devices.iter().map(|device| device.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Run `f` on the device record itself (no link resolution).
    pub fn with_device<R>(
        &self,
        service: &str,
        id: &str,
        f: impl FnOnce(&mut Device) -> R,
    ) -> Result<R, ScapeError> {
        let mut device = self
            .devices
            .get_mut(&DeviceKey::new(service, id))
            .ok_or_else(|| ScapeError::device_not_found(service, id))?;
        Ok(f(&mut device))
    }

    /// Run `f` on the security state the device resolves to.
    pub fn with_security<R>(
        &self,
        service: &str,
        id: &str,
        f: impl FnOnce(&mut SecurityState) -> R,
    ) -> Result<R, ScapeError> {
        let key = DeviceKey::new(service, id);
        // Release the source entry before touching the target; both may
        // live in the same shard.
        let target = {
            let device = self
                .devices
                .get(&key)
                .ok_or_else(|| ScapeError::device_not_found(service, id))?;
            match &device.security.encryption {
                Encryption::Linked(target) => target.clone(),
                Encryption::Concrete { .. } => key,
            }
        };
        let mut device = self
            .devices
            .get_mut(&target)
            .ok_or_else(|| ScapeError::device_not_found(&target.service, &target.id))?;
        Ok(f(&mut device.security))
    }

    // ── Encryption ────────────────────────────────────────────────────────────

    /// Cipher and key in effect, with one level of link resolved.
    pub fn encryption_state(&self, service: &str, id: &str) -> Result<EncryptionState, ScapeError> {
        self.with_security(service, id, |state| match &state.encryption {
            Encryption::Concrete { cipher, key } => Ok(EncryptionState {
                cipher: cipher.clone(),
                key: key.clone(),
            }),
            Encryption::Linked(_) => Err(ScapeError::CannotLinkToLinkedDevice),
        })?
    }

    pub fn encrypt(&self, service: &str, id: &str, text: &str) -> Result<String, ScapeError> {
        let state = self.encryption_state(service, id)?;
        Ok(self.ciphers.get(&state.cipher)?.encrypt(text, &state.key))
    }

    pub fn decrypt(&self, service: &str, id: &str, text: &str) -> Result<String, ScapeError> {
        let state = self.encryption_state(service, id)?;
        Ok(self.ciphers.get(&state.cipher)?.decrypt(text, &state.key))
    }

    /// Update key and/or cipher.
    ///
    /// Key entries must parse as integers. A key set while the cipher is
    /// `plain` and no cipher is named promotes the cipher to `caesar`.
    /// Cipher names must be registered, except `linked`, which takes the key
    /// as `[service, id]` of the device to link to.
    pub fn set_encryption(
        &self,
        service: &str,
        id: &str,
        key: Option<&[String]>,
        cipher: Option<&str>,
    ) -> Result<(), ScapeError> {
        if let Some(name) = cipher.filter(|name| name.eq_ignore_ascii_case(LINKED)) {
            return match key {
                Some([target_service, target_id]) => self.link(
                    &DeviceKey::new(service, id),
                    &DeviceKey::new(target_service.as_str(), target_id.as_str()),
                ),
                _ => Err(ScapeError::InvalidKey(format!("{name} requires [service, id]"))),
            };
        }

        let key = key.map(parse_key).transpose()?;
        let cipher = cipher.map(str::to_lowercase);
        if let Some(name) = &cipher {
            if !self.ciphers.contains(name) {
                return Err(ScapeError::InvalidCipher(name.clone()));
            }
        }

        self.configure(service, id, |state| {
            let Encryption::Concrete {
                cipher: current_cipher,
                key: current_key,
            } = &mut state.encryption
            else {
                return;
            };
            if let Some(key) = key {
                if cipher.is_none() && current_cipher.as_str() == PLAIN && !key.is_empty() {
                    *current_cipher = CAESAR.to_string();
                }
                *current_key = key;
            }
            if let Some(cipher) = cipher {
                *current_cipher = cipher;
            }
        })?;
        tracing::debug!(service, id, "updated encryption");
        Ok(())
    }

    /// Make `device` use `to`'s security state.
    pub fn link(&self, device: &DeviceKey, to: &DeviceKey) -> Result<(), ScapeError> {
        if device == to {
            return Err(ScapeError::SelfLink);
        }
        let _links = self.lock_links();
        let to_linked = self
            .devices
            .get(to)
            .map(|target| target.security.encryption.is_linked())
            .ok_or_else(|| ScapeError::device_not_found(&to.service, &to.id))?;
        if !self.devices.contains_key(device) {
            return Err(ScapeError::device_not_found(&device.service, &device.id));
        }
        let device_is_target = self
            .devices
            .iter()
            .any(|other| other.security.encryption == Encryption::Linked(device.clone()));
        if to_linked || device_is_target {
            return Err(ScapeError::CannotLinkToLinkedDevice);
        }

        let mut entry = self
            .devices
            .get_mut(device)
            .ok_or_else(|| ScapeError::device_not_found(&device.service, &device.id))?;
        entry.security.encryption = Encryption::Linked(to.clone());
        drop(entry);

        tracing::info!(device = %device, target = %to, "linked device");
        Ok(())
    }

    fn lock_links(&self) -> std::sync::MutexGuard<'_, ()> {
        self.links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Back to `plain` with key `[0]`, no limits, sequence checking off.
    /// Also removes a link.
    pub fn clear_encryption(&self, service: &str, id: &str) -> Result<(), ScapeError> {
        self.with_device(service, id, |device| device.security = SecurityState::default())?;
        tracing::debug!(service, id, "cleared encryption");
        Ok(())
    }

    pub fn reset_sequence(&self, service: &str, id: &str) -> Result<(), ScapeError> {
        self.with_security(service, id, |state| state.last_seq = -1)
    }

    // ── Rates ─────────────────────────────────────────────────────────────────

    pub fn set_client_rate(&self, service: &str, id: &str, rate: i64, penalty: i64) -> Result<(), ScapeError> {
        self.configure(service, id, |state| state.rate.set_client_rate(rate, penalty))
    }

    pub fn set_total_rate(&self, service: &str, id: &str, rate: i64) -> Result<(), ScapeError> {
        self.configure(service, id, |state| state.rate.set_total_rate(rate))
    }

    pub fn reset_rates(&self, service: &str, id: &str) -> Result<(), ScapeError> {
        self.configure(service, id, |state| state.rate.reset())
    }

    /// Apply a configuration change to the device's own state. Linked
    /// devices cannot be reconfigured.
    fn configure(
        &self,
        service: &str,
        id: &str,
        f: impl FnOnce(&mut SecurityState),
    ) -> Result<(), ScapeError> {
        let mut device = self
            .devices
            .get_mut(&DeviceKey::new(service, id))
            .ok_or_else(|| ScapeError::device_not_found(service, id))?;
        if device.security.encryption.is_linked() {
            return Err(ScapeError::LinkedDeviceReadOnly {
                service: service.to_string(),
                id: id.to_string(),
            });
        }
        f(&mut device.security);
        Ok(())
    }
}

/// Parse key entries as integers. Fractions are truncated, like the
/// devices' own parsers do.
pub fn parse_key(entries: &[String]) -> Result<Vec<i64>, ScapeError> {
    entries
        .iter()
        .map(|entry| {
            let trimmed = entry.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| {
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.trunc() as i64)
                })
                .ok_or_else(|| ScapeError::InvalidKey(entry.clone()))
        })
        .collect()
}
