//! Access control oracle.
//!
//! Policy lives outside this crate. The robot front-end only asks one
//! question, whether a user may use a device, through [`AccessControl`].

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use scape_core::ScapeError;

pub trait AccessControl: Send + Sync {
    /// `Ok` if `username` may use `device_id`, `Unauthorized` otherwise.
    fn ensure_authorized(&self, username: Option<&str>, device_id: &str) -> Result<(), ScapeError>;

    /// The subset of `device_ids` the user may use, in input order.
    fn authorized(&self, username: Option<&str>, device_ids: &[String]) -> Vec<String> {
        device_ids
            .iter()
            .filter(|id| self.ensure_authorized(username, id).is_ok())
            .cloned()
            .collect()
    }
}

/// Everyone may use everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn ensure_authorized(&self, _username: Option<&str>, _device_id: &str) -> Result<(), ScapeError> {
        Ok(())
    }
}

/// Explicit per-user grants. Anonymous users and unknown users are refused.
#[derive(Debug, Default, Clone)]
pub struct AllowList {
    grants: Arc<DashMap<String, HashSet<String>>>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, username: &str, device_id: &str) {
        self.grants
            .entry(username.to_string())
            .or_default()
            .insert(device_id.to_string());
    }

    pub fn revoke(&self, username: &str, device_id: &str) {
        if let Some(mut devices) = self.grants.get_mut(username) {
            devices.remove(device_id);
        }
    }
}

impl AccessControl for AllowList {
    fn ensure_authorized(&self, username: Option<&str>, device_id: &str) -> Result<(), ScapeError> {
        let allowed = username
            .and_then(|user| self.grants.get(user))
            .is_some_and(|devices| devices.contains(device_id));
        if allowed {
            Ok(())
        } else {
            Err(ScapeError::Unauthorized(device_id.to_string()))
        }
    }
}
