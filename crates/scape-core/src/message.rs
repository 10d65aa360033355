//! JSON wire format of IoTScape devices.
//!
//! Four shapes travel over the socket:
//!
//! ```text
//!   announce  {"<Name>": {"service": {...}, "id": "...", "methods": {...}, "events": {...}}}
//!   request   {"id", "service", "device", "function", "params": [...], "clientId"}
//!   response  {"request": "<id>", "response": [...]}
//!   event     {"service", "id", "event": {"type", "args": {...}}}
//! ```
//!
//! Devices are community-built, so ids and versions are accepted as either
//! strings or numbers, and optional sections default to empty.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Requests & responses ──────────────────────────────────────────────────────

/// Server → device method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub id: String,
    pub service: String,
    pub device: String,
    pub function: String,
    pub params: Vec<Value>,
    #[serde(rename = "clientId")]
    pub client_id: String,
}

/// Device → server answer to a [`DeviceRequest`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceResponse {
    #[serde(deserialize_with = "loose_string")]
    pub request: String,
    #[serde(default)]
    pub response: Option<Value>,
}

impl DeviceResponse {
    /// Returned values. `None` when the device sent no `response` field.
    /// A scalar is treated as a one-element list.
    pub fn values(&self) -> Option<Vec<Value>> {
        match &self.response {
            None | Some(Value::Null) => None,
            Some(Value::Array(values)) => Some(values.clone()),
            Some(other) => Some(vec![other.clone()]),
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Unsolicited device → server event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceEvent {
    pub service: String,
    #[serde(deserialize_with = "loose_string")]
    pub id: String,
    pub event: EventBody,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventBody {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// Event types handled by the server instead of being fanned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Reset the device's encryption to defaults.
    Reset,
    /// Generate a hardware key and tell the device.
    RequestKey,
    /// Make the named device share this device's encryption.
    Link,
}

impl ControlEvent {
    pub fn parse(event_type: &str) -> Option<Self> {
        match event_type {
            "_reset" => Some(ControlEvent::Reset),
            "_requestKey" => Some(ControlEvent::RequestKey),
            "_link" => Some(ControlEvent::Link),
            _ => None,
        }
    }
}

// ── Announcements ─────────────────────────────────────────────────────────────

/// Body of an announcement, keyed by service name on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceDefinition {
    pub service: ServiceInfo,
    #[serde(default, deserialize_with = "loose_string")]
    pub id: String,
    #[serde(default)]
    pub methods: Map<String, Value>,
    #[serde(default)]
    pub events: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceInfo {
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "loose_version")]
    pub version: i64,
}

impl ServiceDefinition {
    /// Declared methods in announcement order.
    pub fn method_specs(&self) -> Result<Vec<MethodSpec>, serde_json::Error> {
        self.methods
            .iter()
            .map(|(name, body)| {
                let body: MethodBody = serde_json::from_value(body.clone())?;
                Ok(MethodSpec {
                    name: name.clone(),
                    documentation: body.documentation,
                    params: body.params,
                    returns: body.returns,
                })
            })
            .collect()
    }

    /// Declared events as `(name, parameter names)`.
    pub fn event_specs(&self) -> Vec<(String, Vec<String>)> {
        self.events
            .iter()
            .map(|(name, body)| {
                let params = body
                    .get("params")
                    .and_then(Value::as_array)
                    .map(|params| params.iter().map(value_text).collect())
                    .unwrap_or_default();
                (name.clone(), params)
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct MethodBody {
    #[serde(default)]
    documentation: String,
    #[serde(default)]
    params: Vec<ParamSpec>,
    #[serde(default)]
    returns: Returns,
}

/// A method as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    #[serde(default)]
    pub documentation: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub returns: Returns,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub documentation: String,
}

/// Declared return type tags, e.g. `["void"]`, `["number"]`, `["number", "number"]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Returns {
    #[serde(rename = "type", default, deserialize_with = "string_or_list")]
    pub types: Vec<String>,
}

impl Returns {
    pub fn of(types: &[&str]) -> Self {
        Self {
            types: types.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// No answer is awaited: void, empty, or an event-style return.
    pub fn expects_reply(&self) -> bool {
        match self.types.first() {
            None => false,
            Some(first) => first != "void" && !first.starts_with("event"),
        }
    }

    /// Multi-valued returns resolve with the whole response list.
    pub fn is_multi(&self) -> bool {
        self.types.len() > 1
    }
}

// ── Classification ────────────────────────────────────────────────────────────

/// A parsed JSON-family datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(DeviceResponse),
    Event(DeviceEvent),
    Announce {
        name: String,
        definition: ServiceDefinition,
    },
}

impl Inbound {
    /// Classify a datagram: a `request` field marks a response, an `event`
    /// field an event, anything else must be an announcement.
    pub fn parse(bytes: &[u8]) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(object) = value else {
            return Err(MessageError::NotAnObject);
        };

        if object.get("request").is_some_and(|v| !v.is_null()) {
            let response = serde_json::from_value(Value::Object(object))?;
            return Ok(Inbound::Response(response));
        }

        if object.get("event").is_some_and(|v| !v.is_null()) {
            let event = serde_json::from_value(Value::Object(object))?;
            return Ok(Inbound::Event(event));
        }

        let Some((name, body)) = object.into_iter().next() else {
            return Err(MessageError::Empty);
        };
        if body.get("service").is_none() {
            return Err(MessageError::NoServiceInfo(name));
        }
        let definition = serde_json::from_value(body)?;
        Ok(Inbound::Announce { name, definition })
    }
}

// ── Value helpers ─────────────────────────────────────────────────────────────

/// Text form of a JSON value for command lines and event text: strings
/// without quotes, lists comma-joined, null as empty.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(value_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

fn loose_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(de::Error::custom(format!("expected string or number, got {other}"))),
    }
}

fn loose_version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| de::Error::custom("version out of range")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(|f| f as i64)
            .map_err(|_| de::Error::custom(format!("invalid version {s:?}"))),
        other => Err(de::Error::custom(format!("invalid version {other}"))),
    }
}

fn string_or_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(items) => Ok(items.iter().map(value_text).collect()),
        other => Err(de::Error::custom(format!("invalid return type {other}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a json object")]
    NotAnObject,

    #[error("empty message")]
    Empty,

    #[error("definition for {0} has no service section")]
    NoServiceInfo(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_client_id_in_camel_case() {
        let request = DeviceRequest {
            id: "01700000000000".into(),
            service: "Light".into(),
            device: "a1".into(),
            function: "turnOn".into(),
            params: vec![json!("1")],
            client_id: "server".into(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["clientId"], "server");
        assert_eq!(value["function"], "turnOn");
    }

    #[test]
    fn classifies_responses_with_numeric_ids() {
        let inbound = Inbound::parse(br#"{"request": 17, "response": [true]}"#).unwrap();
        let Inbound::Response(response) = inbound else {
            panic!("expected response");
        };
        assert_eq!(response.request, "17");
        assert_eq!(response.values(), Some(vec![json!(true)]));
    }

    #[test]
    fn response_without_values_is_none() {
        let inbound = Inbound::parse(br#"{"request": "5"}"#).unwrap();
        let Inbound::Response(response) = inbound else {
            panic!("expected response");
        };
        assert_eq!(response.values(), None);
    }

    #[test]
    fn classifies_events_and_keeps_arg_order() {
        let inbound = Inbound::parse(
            br#"{"service": "Light", "id": 7, "event": {"type": "moved", "args": {"z": 1, "a": 2}}}"#,
        )
        .unwrap();
        let Inbound::Event(event) = inbound else {
            panic!("expected event");
        };
        assert_eq!(event.id, "7");
        assert_eq!(event.event.event_type, "moved");
        let keys: Vec<&str> = event.event.args.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn classifies_announcements() {
        let inbound = Inbound::parse(
            br#"{"Light": {
                "service": {"description": "A lamp", "version": "2"},
                "id": " a1 ",
                "methods": {
                    "turnOn": {"documentation": "on", "params": [], "returns": {"type": ["void"]}},
                    "getLevel": {"params": [{"name": "unit", "type": "string"}], "returns": {"type": "number"}}
                },
                "events": {"changed": {"params": ["level"]}}
            }}"#,
        )
        .unwrap();
        let Inbound::Announce { name, definition } = inbound else {
            panic!("expected announcement");
        };
        assert_eq!(name, "Light");
        assert_eq!(definition.service.version, 2);
        assert_eq!(definition.id, " a1 ");

        let methods = definition.method_specs().unwrap();
        assert_eq!(methods[0].name, "turnOn");
        assert!(!methods[0].returns.expects_reply());
        assert_eq!(methods[1].params[0].name, "unit");
        assert_eq!(methods[1].returns.types, vec!["number"]);
        assert!(methods[1].returns.expects_reply());

        assert_eq!(
            definition.event_specs(),
            vec![("changed".to_string(), vec!["level".to_string()])]
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(Inbound::parse(b"not json"), Err(MessageError::Json(_))));
        assert!(matches!(Inbound::parse(b"[1,2]"), Err(MessageError::NotAnObject)));
        assert!(matches!(Inbound::parse(b"{}"), Err(MessageError::Empty)));
        assert!(matches!(
            Inbound::parse(br#"{"Light": {"id": "x"}}"#),
            Err(MessageError::NoServiceInfo(name)) if name == "Light"
        ));
    }

    #[test]
    fn return_type_shapes() {
        assert!(!Returns::default().expects_reply());
        assert!(!Returns::of(&["event"]).expects_reply());
        assert!(Returns::of(&["boolean"]).expects_reply());
        assert!(Returns::of(&["number", "number"]).is_multi());
    }

    #[test]
    fn value_text_matches_event_encoding() {
        assert_eq!(value_text(&json!("on")), "on");
        assert_eq!(value_text(&json!(3)), "3");
        assert_eq!(value_text(&json!([1, 2])), "1,2");
        assert_eq!(value_text(&Value::Null), "");
    }

    #[test]
    fn control_events_are_recognised() {
        assert_eq!(ControlEvent::parse("_link"), Some(ControlEvent::Link));
        assert_eq!(ControlEvent::parse("link"), None);
    }
}
