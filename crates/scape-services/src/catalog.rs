//! Service catalog: validated announcements and what clients may call.
//!
//! Two views of every service:
//! - live:   the definition most recently announced, used for dispatch and
//!           discovery queries
//! - stored: the merged record in the [`ServiceStore`], written only when
//!           the announced method names differ from the stored ones
//!
//! Merge rule: the stored method list becomes the union of both name lists;
//! a name present in both keeps the entry from the newer version, ties
//! favouring the stored entry. The stored version is the larger of the two.

use std::sync::Arc;

use dashmap::DashMap;
use rustrict::{CensorStr, Type};
use scape_core::message::{MethodSpec, Returns, ServiceDefinition};
use scape_core::ScapeError;

use crate::store::{ServiceRecord, ServiceStore, StoreError};

/// Method names clients could never call.
pub const RESERVED_METHODS: [&str; 2] = ["serviceName", "COMPATIBILITY"];

/// Names of server-provided services, normalized (lowercase, letters and
/// digits only). A device service may not shadow them.
const RESERVED_SERVICES: &[&str] = &[
    "alexa",
    "autograders",
    "catdog",
    "cats",
    "chucknorrisapi",
    "cloudvariables",
    "connectnai",
    "geolocation",
    "globalbiodiversity",
    "icecoredata",
    "iextrading",
    "iotscape",
    "matlab",
    "mididata",
    "movebank",
    "musicapp",
    "newyorktimes",
    "openai",
    "popularsongs",
    "projectgutenberg",
    "publicroles",
    "roboscape",
    "soundclips",
    "thecatapi",
    "thedogapi",
    "trivia",
    "utils",
    "wildcam",
    "xenocanto",
];

// ── Builtins ──────────────────────────────────────────────────────────────────

/// Methods every JSON-family device answers without declaring them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Heartbeat,
    SetKey,
    SetCipher,
    SetClientRate,
    SetTotalRate,
    ResetRate,
    /// Tells the device which hardware key it was given.
    RequestedKey,
}

impl Builtin {
    pub const ALL: [Builtin; 7] = [
        Builtin::Heartbeat,
        Builtin::SetKey,
        Builtin::SetCipher,
        Builtin::SetClientRate,
        Builtin::SetTotalRate,
        Builtin::ResetRate,
        Builtin::RequestedKey,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Heartbeat => "heartbeat",
            Builtin::SetKey => "setKey",
            Builtin::SetCipher => "setCipher",
            Builtin::SetClientRate => "setClientRate",
            Builtin::SetTotalRate => "setTotalRate",
            Builtin::ResetRate => "resetRate",
            Builtin::RequestedKey => "_requestedKey",
        }
    }

    /// Only the heartbeat waits for an answer.
    pub fn returns(self) -> Returns {
        match self {
            Builtin::Heartbeat => Returns::of(&["boolean"]),
            _ => Returns::of(&["void"]),
        }
    }

    /// Changes server-side security state; refused on linked devices.
    pub fn is_config(self) -> bool {
        matches!(
            self,
            Builtin::SetKey
                | Builtin::SetCipher
                | Builtin::SetClientRate
                | Builtin::SetTotalRate
                | Builtin::ResetRate
        )
    }
}

/// What a method name on a service resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Builtin(Builtin),
    Method(MethodSpec),
}

impl Target {
    pub fn returns(&self) -> Returns {
        match self {
            Target::Builtin(builtin) => builtin.returns(),
            Target::Method(method) => method.returns.clone(),
        }
    }
}

// ── Catalog ───────────────────────────────────────────────────────────────────

/// The definition a service was last announced with.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveService {
    pub description: String,
    pub version: i64,
    pub methods: Vec<MethodSpec>,
    pub events: Vec<(String, Vec<String>)>,
}

/// A definition that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    pub id: String,
    pub service: LiveService,
}

/// Outcome of a successful announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// The stored record was written.
    pub methods_changed: bool,
    /// Version after merging with the stored record.
    pub version: i64,
}

#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn ServiceStore>,
    live: Arc<DashMap<String, LiveService>>,
}

impl Catalog {
    pub fn new(store: Arc<dyn ServiceStore>) -> Self {
        Self {
            store,
            live: Arc::new(DashMap::new()),
        }
    }

    /// Drop every stored definition. Done once at daemon start.
    pub fn clear_store(&self) -> Result<usize, StoreError> {
        self.store.delete_many()
    }

    /// Validate, merge and record an announcement. The caller refreshes
    /// the device record with the returned id.
    pub fn register(
        &self,
        name: &str,
        definition: &ServiceDefinition,
    ) -> Result<(Validated, Registration), ValidationError> {
        let validated = validate(name, definition)?;
        tracing::debug!(
            service = name,
            id = %validated.id,
            version = validated.service.version,
            "received service definition"
        );

        let incoming = ServiceRecord {
            name: name.to_string(),
            description: validated.service.description.clone(),
            version: validated.service.version,
            methods: validated.service.methods.clone(),
        };
        let (merged, methods_changed) = merge(self.store.find_one(name), incoming);
        let registration = Registration {
            methods_changed,
            version: merged.version,
        };

        if methods_changed {
            tracing::info!(service = name, version = merged.version, "service definition updated");
            if let Err(e) = self.store.update_one(merged) {
                tracing::warn!(error = %e, service = name, "failed to persist service definition");
            }
        } else {
            tracing::debug!(service = name, "service already up to date");
        }

        self.live.insert(name.to_string(), validated.service.clone());
        Ok((validated, registration))
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn service_exists(&self, service: &str) -> bool {
        self.live.contains_key(service)
    }

    pub fn ensure_service(&self, service: &str) -> Result<(), ScapeError> {
        if self.service_exists(service) {
            Ok(())
        } else {
            Err(ScapeError::ServiceNotFound(service.to_string()))
        }
    }

    pub fn service(&self, service: &str) -> Option<LiveService> {
        self.live.get(service).map(|s| s.clone())
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.live.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Builtins count for every known service.
    pub fn function_exists(&self, service: &str, function: &str) -> bool {
        self.resolve(service, function).is_some()
    }

    pub fn resolve(&self, service: &str, function: &str) -> Option<Target> {
        let live = self.live.get(service)?;
        if let Some(builtin) = Builtin::parse(function) {
            return Some(Target::Builtin(builtin));
        }
        live.methods
            .iter()
            .find(|m| m.name == function)
            .cloned()
            .map(Target::Method)
    }

    /// `[name, [param names]]` per declared method.
    pub fn methods(&self, service: &str) -> Result<Vec<(String, Vec<String>)>, ScapeError> {
        let live = self
            .live
            .get(service)
            .ok_or_else(|| ScapeError::ServiceNotFound(service.to_string()))?;
        Ok(live
            .methods
            .iter()
            .map(|m| (m.name.clone(), m.params.iter().map(|p| p.name.clone()).collect()))
            .collect())
    }

    /// `[event, ["id", params...]]` per declared event.
    pub fn message_types(&self, service: &str) -> Result<Vec<(String, Vec<String>)>, ScapeError> {
        let live = self
            .live
            .get(service)
            .ok_or_else(|| ScapeError::ServiceNotFound(service.to_string()))?;
        Ok(live
            .events
            .iter()
            .map(|(event, params)| {
                let mut fields = Vec::with_capacity(params.len() + 1);
                fields.push("id".to_string());
                fields.extend(params.iter().cloned());
                (event.clone(), fields)
            })
            .collect())
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Check every string in an announcement.
pub fn validate(name: &str, definition: &ServiceDefinition) -> Result<Validated, ValidationError> {
    if !is_valid_service_name(name) {
        return Err(ValidationError::InvalidServiceName(name.to_string()));
    }

    let methods = definition
        .method_specs()
        .map_err(|e| ValidationError::MalformedMethods(e.to_string()))?;
    for method in &methods {
        if !is_valid_method(method) {
            return Err(ValidationError::InvalidMethod(method.name.clone()));
        }
    }

    let id = definition.id.trim();
    if id.is_empty() {
        return Err(ValidationError::EmptyId);
    }

    if is_profane(&split_capitals(name)) {
        return Err(ValidationError::Profane("service name"));
    }
    if is_profane(&split_capitals(id)) {
        return Err(ValidationError::Profane("id"));
    }
    if is_profane(&definition.service.description) {
        return Err(ValidationError::Profane("description"));
    }
    if methods
        .iter()
        .any(|m| is_profane(&split_capitals(&m.name)) || is_profane(&m.documentation))
    {
        return Err(ValidationError::Profane("method"));
    }

    Ok(Validated {
        id: id.to_string(),
        service: LiveService {
            description: definition.service.description.clone(),
            version: definition.service.version,
            methods,
            events: definition.event_specs(),
        },
    })
}

/// Letter first, letter or digit last, letters, digits, `-`, `_` and spaces
/// between.
pub fn is_valid_ident(ident: &str) -> bool {
    let bytes = ident.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    first.is_ascii_alphabetic()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b' '))
}

/// ASCII letters and digits only, and not a server-provided service.
pub fn is_valid_service_name(name: &str) -> bool {
    is_valid_ident(name)
        && name.bytes().all(|b| b.is_ascii_alphanumeric())
        && !RESERVED_SERVICES.contains(&normalize_service_name(name).as_str())
}

fn is_valid_method(method: &MethodSpec) -> bool {
    is_valid_ident(&method.name)
        && !RESERVED_METHODS.contains(&method.name.as_str())
        && method.params.iter().all(|p| is_valid_ident(&p.name))
}

fn normalize_service_name(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// `LightSwitch` → `" Light Switch"`, so camel-cased words are checked one
/// at a time.
fn split_capitals(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 4);
    for c in text.chars() {
        if c.is_ascii_uppercase() {
            out.push(' ');
        }
        out.push(c);
    }
    out
}

/// Profane, offensive or sexual at any severity.
pub fn is_profane(text: &str) -> bool {
    text.to_lowercase()
        .is(Type::PROFANE | Type::OFFENSIVE | Type::SEXUAL)
}

// ── Merge ─────────────────────────────────────────────────────────────────────

/// Merge an incoming record into the stored one. The flag is true when the
/// record must be written: nothing was stored, or the incoming method names
/// differ (order included) from the stored ones.
pub fn merge(existing: Option<ServiceRecord>, mut incoming: ServiceRecord) -> (ServiceRecord, bool) {
    let Some(existing) = existing else {
        return (incoming, true);
    };

    let methods_changed = incoming.method_names() != existing.method_names();

    let mut names: Vec<String> = Vec::new();
    for method in incoming.methods.iter().chain(existing.methods.iter()) {
        if is_valid_method(method) && !names.contains(&method.name) {
            names.push(method.name.clone());
        }
    }

    let prefer_existing = existing.version >= incoming.version;
    let find = |methods: &[MethodSpec], name: &str| methods.iter().find(|m| m.name == name).cloned();
    incoming.methods = names
        .iter()
        .filter_map(|name| {
            let old = find(&existing.methods, name);
            let new = find(&incoming.methods, name);
            if prefer_existing {
                old.or(new)
            } else {
                new.or(old)
            }
        })
        .collect();
    incoming.version = incoming.version.max(existing.version);

    (incoming, methods_changed)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid service name {0:?}")]
    InvalidServiceName(String),

    #[error("malformed method definitions: {0}")]
    MalformedMethods(String),

    #[error("invalid method {0:?}")]
    InvalidMethod(String),

    #[error("device id is empty")]
    EmptyId,

    #[error("{0} rejected by profanity filter")]
    Profane(&'static str),
}
