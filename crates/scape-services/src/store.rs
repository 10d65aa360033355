//! Service store: where announced service definitions outlive the process.
//!
//! The catalog talks to storage through [`ServiceStore`], a three-call
//! contract (find, upsert, clear). Two implementations ship:
//! - [`MemoryStore`]:   nothing survives a restart
//! - [`JsonFileStore`]: one JSON map on disk, rewritten on every change and
//!   reloaded on startup

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use scape_core::message::MethodSpec;
use serde::{Deserialize, Serialize};

/// A service as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub methods: Vec<MethodSpec>,
}

impl ServiceRecord {
    pub fn method_names(&self) -> Vec<&str> {
        self.methods.iter().map(|m| m.name.as_str()).collect()
    }
}

pub trait ServiceStore: Send + Sync {
    fn find_one(&self, name: &str) -> Option<ServiceRecord>;

    /// Insert or replace the record with the same name.
    fn update_one(&self, record: ServiceRecord) -> Result<(), StoreError>;

    /// Remove every record. Returns how many were removed.
    fn delete_many(&self) -> Result<usize, StoreError>;
}

// ── In-memory ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<DashMap<String, ServiceRecord>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `update_one` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ServiceStore for MemoryStore {
    fn find_one(&self, name: &str) -> Option<ServiceRecord> {
        self.records.get(name).map(|r| r.clone())
    }

    fn update_one(&self, record: ServiceRecord) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.records.insert(record.name.clone(), record);
        Ok(())
    }

    fn delete_many(&self) -> Result<usize, StoreError> {
        let count = self.records.len();
        self.records.clear();
        Ok(count)
    }
}

// ── JSON file ─────────────────────────────────────────────────────────────────

/// Records mirrored to a JSON file keyed by service name.
///
/// The in-memory map is authoritative; a failed write is reported to the
/// caller but the update still takes effect for this process.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    records: Arc<DashMap<String, ServiceRecord>>,
    path: Arc<PathBuf>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading existing records if the file exists.
    pub fn open(path: PathBuf) -> Self {
        let store = Self {
            records: Arc::new(DashMap::new()),
            path: Arc::new(path),
        };
        store.load_from_disk();
        store
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn save_to_disk(&self) -> Result<(), StoreError> {
        let snapshot: BTreeMap<String, ServiceRecord> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let json = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(self.path.as_ref(), json)?;
        Ok(())
    }

    /// Called once during construction.
    fn load_from_disk(&self) {
        let path = self.path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read service store");
                return;
            }
        };
        let map: BTreeMap<String, ServiceRecord> = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse service store");
                return;
            }
        };
        let loaded = map.len();
        for (name, record) in map {
            self.records.insert(name, record);
        }
        if loaded > 0 {
            tracing::info!(count = loaded, path = %path.display(), "loaded persisted services");
        }
    }
}

impl ServiceStore for JsonFileStore {
    fn find_one(&self, name: &str) -> Option<ServiceRecord> {
        self.records.get(name).map(|r| r.clone())
    }

    fn update_one(&self, record: ServiceRecord) -> Result<(), StoreError> {
        self.records.insert(record.name.clone(), record);
        self.save_to_disk()
    }

    fn delete_many(&self) -> Result<usize, StoreError> {
        let count = self.records.len();
        self.records.clear();
        self.save_to_disk()?;
        Ok(count)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use scape_core::message::Returns;

    fn record(name: &str, version: i64, methods: &[&str]) -> ServiceRecord {
        ServiceRecord {
            name: name.to_string(),
            description: format!("{name} service"),
            version,
            methods: methods
                .iter()
                .map(|m| MethodSpec {
                    name: m.to_string(),
                    documentation: String::new(),
                    params: vec![],
                    returns: Returns::of(&["void"]),
                })
                .collect(),
        }
    }

    #[test]
    fn memory_store_upserts_and_counts_writes() {
        let store = MemoryStore::new();
        assert!(store.find_one("Light").is_none());

        store.update_one(record("Light", 1, &["turnOn"])).unwrap();
        store.update_one(record("Light", 2, &["turnOn", "turnOff"])).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.writes(), 2);
        assert_eq!(store.find_one("Light").unwrap().method_names(), vec!["turnOn", "turnOff"]);

        assert_eq!(store.delete_many().unwrap(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn json_store_persists_and_reloads() {
        let tmp = std::env::temp_dir().join(format!("scape-store-test-{}", std::process::id()));
        let path = tmp.join("nested").join("services.json");

        {
            let store = JsonFileStore::open(path.clone());
            store.update_one(record("Light", 1, &["turnOn"])).unwrap();
            store.update_one(record("Thermo", 3, &["read"])).unwrap();
        }
        assert!(path.exists());

        let reopened = JsonFileStore::open(path.clone());
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.find_one("Thermo").unwrap().version, 3);

        assert_eq!(reopened.delete_many().unwrap(), 2);
        let cleared = JsonFileStore::open(path);
        assert!(cleared.is_empty());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn unreadable_store_starts_empty() {
        let tmp = std::env::temp_dir().join(format!("scape-store-bad-{}", std::process::id()));
        std::fs::create_dir_all(&tmp).unwrap();
        let path = tmp.join("services.json");
        std::fs::write(&path, "not json").unwrap();

        let store = JsonFileStore::open(path);
        assert!(store.is_empty());

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
