//! IoTScape front-end: JSON-family devices.
//!
//! Inbound, every datagram is one of:
//!   response      → correlator
//!   event         → control handling (`_reset`, `_requestKey`, `_link`) when
//!                   it comes from the device's registered address, listener
//!                   fan-out otherwise
//!   announcement  → catalog, then the device record
//!
//! Outbound, clients either send a text command (decrypted, parsed and
//! checked by the guard) or call a method directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use scape_core::cipher::CAESAR;
use scape_core::message::{value_text, ControlEvent, DeviceEvent, Inbound, ServiceDefinition};
use scape_core::{CipherSuite, ScapeError};
use serde_json::{Map, Value};
use tokio::task::JoinSet;

use crate::catalog::{Builtin, Catalog, Target, ValidationError};
use crate::correlator::{Correlator, PreparedCall, Reply};
use crate::device::{DeviceKey, DeviceSnapshot, Family};
use crate::guard::Guard;
use crate::interpreter::interpret;
use crate::listeners::{ClientHandle, EventKind, Listeners, DEVICE_COMMAND};
use crate::registry::DeviceRegistry;
use crate::store::ServiceStore;
use crate::transport::DatagramSink;

/// Digits in a hardware key handed out on `_requestKey`.
const HARDWARE_KEY_LEN: usize = 4;

#[derive(Clone)]
pub struct IotScape {
    registry: DeviceRegistry,
    catalog: Catalog,
    correlator: Correlator,
    listeners: Listeners,
    guard: Guard,
    sink: Arc<dyn DatagramSink>,
}

impl IotScape {
    pub fn new(
        ciphers: CipherSuite,
        store: Arc<dyn ServiceStore>,
        response_timeout: Duration,
        sink: Arc<dyn DatagramSink>,
    ) -> Self {
        let registry = DeviceRegistry::new(ciphers);
        Self {
            listeners: Listeners::new(registry.clone()),
            guard: Guard::new(registry.clone()),
            catalog: Catalog::new(store),
            correlator: Correlator::new(response_timeout),
            registry,
            sink,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Route one datagram. Malformed input is logged and dropped.
    pub async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let inbound = match Inbound::parse(datagram) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::debug!(error = %e, from = %from, len = datagram.len(), "dropping datagram");
                return;
            }
        };

        match inbound {
            Inbound::Response(response) => {
                if let Some(device) = self.correlator.pending_device(&response.request) {
                    self.registry.touch(&device.service, &device.id, from);
                }
                self.correlator.resolve(&response);
            }
            Inbound::Event(event) => self.handle_event(event, from).await,
            Inbound::Announce { name, definition } => {
                if let Err(e) = self.announce(&name, &definition, from) {
                    tracing::info!(service = %name, from = %from, error = %e, "rejected service definition");
                }
            }
        }
    }

    /// Register a definition and the device that announced it.
    pub fn announce(
        &self,
        name: &str,
        definition: &ServiceDefinition,
        from: SocketAddr,
    ) -> Result<DeviceSnapshot, ValidationError> {
        let (validated, _) = self.catalog.register(name, definition)?;
        Ok(self.registry.get_or_create(name, &validated.id, from, Family::Json))
    }

    async fn handle_event(&self, event: DeviceEvent, from: SocketAddr) {
        let DeviceEvent { service, id, event } = event;
        if !self.registry.exists(&service, &id) {
            tracing::trace!(service = %service, id = %id, "event from unknown device");
            return;
        }
        let from_device = self.registry.touch(&service, &id, from);

        match ControlEvent::parse(&event.event_type) {
            Some(control) if from_device => {
                if let Err(e) = self.control(control, &service, &id, &event.args).await {
                    tracing::warn!(service = %service, id = %id, ?control, error = %e, "control event failed");
                }
            }
            _ => {
                let kind = if event.event_type == DEVICE_COMMAND {
                    EventKind::Direct
                } else {
                    EventKind::Encrypted
                };
                if let Err(e) = self
                    .listeners
                    .publish(&service, &id, kind, &event.event_type, &event.args)
                {
                    tracing::warn!(service = %service, id = %id, error = %e, "event fan-out failed");
                }
            }
        }
    }

    async fn control(
        &self,
        control: ControlEvent,
        service: &str,
        id: &str,
        args: &Map<String, Value>,
    ) -> Result<(), ScapeError> {
        match control {
            ControlEvent::Reset => {
                tracing::info!(service, id, "resetting encryption");
                self.registry.clear_encryption(service, id)
            }
            ControlEvent::RequestKey => {
                if self.registry.with_device(service, id, |d| d.security.encryption.is_linked())? {
                    tracing::info!(service, id, "refusing hardware key for linked device");
                    return Ok(());
                }
                let key = random_key();
                let entries: Vec<String> = key.iter().map(i64::to_string).collect();
                self.registry
                    .set_encryption(service, id, Some(&entries), Some(CAESAR))?;
                tracing::info!(service, id, "issued hardware key");

                let params = key.into_iter().map(Value::from).collect();
                self.call(service, id, Builtin::RequestedKey.name(), None, params)
                    .await
                    .map(|_| ())
            }
            ControlEvent::Link => {
                let target_service = args.get("service").map(value_text).unwrap_or_default();
                let target_id = args.get("id").map(value_text).unwrap_or_default();
                if !self.registry.exists(&target_service, &target_id) {
                    tracing::info!(
                        service,
                        id,
                        target = %format!("{target_service}:{target_id}"),
                        "link to unknown device requested"
                    );
                    return Ok(());
                }
                // the named device takes on this device's encryption
                self.registry.link(
                    &DeviceKey::new(target_service, target_id),
                    &DeviceKey::new(service, id),
                )
            }
        }
    }

    // ── Client operations ─────────────────────────────────────────────────────

    /// Run a text command from a client.
    ///
    /// `Ok(None)` when the guard refused it (replayed sequence number or
    /// rate limit); refusals are not errors.
    pub async fn send(
        &self,
        service: &str,
        id: &str,
        command: &str,
        client_id: &str,
    ) -> Result<Option<Reply>, ScapeError> {
        self.catalog.ensure_service(service)?;
        if !self.registry.exists(service, id) {
            return Err(ScapeError::device_not_found(service, id));
        }

        let command = interpret(
            command,
            |text| self.registry.decrypt(service, id, text),
            |name| self.catalog.function_exists(service, name),
        )?;

        if !command.backdoor && !self.guard.accepts(service, id, client_id, command.seq)? {
            return Ok(None);
        }

        let params = command.args.into_iter().map(Value::String).collect();
        self.call(service, id, &command.method, Some(client_id), params)
            .await
            .map(Some)
    }

    /// Call a method on a device.
    ///
    /// Configuration builtins update server-side state first (refused on
    /// linked devices) and are then relayed to the device.
    pub async fn call(
        &self,
        service: &str,
        id: &str,
        function: &str,
        client_id: Option<&str>,
        params: Vec<Value>,
    ) -> Result<Reply, ScapeError> {
        let call = self.prepare_call(service, id, function, client_id, params)?;
        self.dispatch(call).await
    }

    /// Validate a call and apply any configuration builtin, without sending
    /// anything. The returned request id can be passed to
    /// [`IotScape::cancel`] once [`IotScape::dispatch`] is running.
    pub fn prepare_call(
        &self,
        service: &str,
        id: &str,
        function: &str,
        client_id: Option<&str>,
        params: Vec<Value>,
    ) -> Result<PreparedCall, ScapeError> {
        self.catalog.ensure_service(service)?;
        if !self.registry.exists(service, id) {
            return Err(ScapeError::device_not_found(service, id));
        }
        let target = self
            .catalog
            .resolve(service, function)
            .ok_or_else(|| ScapeError::function_not_found(service, function))?;

        if let Target::Builtin(builtin) = &target {
            if builtin.is_config() {
                self.configure(service, id, *builtin, &params)?;
            }
        }

        self.correlator.prepare(
            &DeviceKey::new(service, id),
            function,
            client_id,
            params,
            &target.returns(),
        )
    }

    pub async fn dispatch(&self, call: PreparedCall) -> Result<Reply, ScapeError> {
        tracing::debug!(device = %call.device(), request = call.request_id(), "calling device");
        self.correlator
            .dispatch(&self.registry, self.sink.as_ref(), call)
            .await
    }

    /// Reject an in-flight call with `Cancelled`. False if it already
    /// finished.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.correlator.cancel(request_id)
    }

    fn configure(&self, service: &str, id: &str, builtin: Builtin, params: &[Value]) -> Result<(), ScapeError> {
        match builtin {
            Builtin::SetKey => {
                let key = flatten_text(params);
                self.registry.set_encryption(service, id, Some(&key), None)
            }
            Builtin::SetCipher => {
                let cipher = params.first().map(value_text).unwrap_or_default();
                self.registry.set_encryption(service, id, None, Some(&cipher))
            }
            Builtin::SetClientRate => {
                let rate = number_param(params, 0)?;
                let penalty = number_param(params, 1)?;
                self.registry.set_client_rate(service, id, rate, penalty)
            }
            Builtin::SetTotalRate => {
                let rate = number_param(params, 0)?;
                self.registry.set_total_rate(service, id, rate)
            }
            Builtin::ResetRate => self.registry.reset_rates(service, id),
            Builtin::Heartbeat | Builtin::RequestedKey => Ok(()),
        }
    }

    /// Subscribe a client to a device's events. False when the device is
    /// unknown.
    pub fn listen(&self, service: &str, id: &str, client: Arc<dyn ClientHandle>) -> Result<bool, ScapeError> {
        self.catalog.ensure_service(service)?;
        Ok(self.listeners.subscribe(service, id, client))
    }

    pub fn get_devices(&self, service: &str) -> Result<Vec<String>, ScapeError> {
        self.catalog.ensure_service(service)?;
        Ok(self.registry.devices(service))
    }

    pub fn get_services(&self) -> Vec<String> {
        self.catalog.services()
    }

    pub fn get_methods(&self, service: &str) -> Result<Vec<(String, Vec<String>)>, ScapeError> {
        self.catalog.methods(service)
    }

    pub fn get_message_types(&self, service: &str) -> Result<Vec<(String, Vec<String>)>, ScapeError> {
        self.catalog.message_types(service)
    }

    // ── Liveness ──────────────────────────────────────────────────────────────

    /// One housekeeping tick. Returns the evicted devices.
    pub fn tick(&self, forget_ticks: u32) -> Vec<DeviceKey> {
        let evicted = self.registry.tick(forget_ticks);
        for key in &evicted {
            self.forget(key);
        }
        evicted
    }

    /// Remove a device along with its listeners and pending calls.
    pub fn remove_device(&self, service: &str, id: &str) -> bool {
        let removed = self.registry.remove(service, id);
        self.forget(&DeviceKey::new(service, id));
        removed
    }

    fn forget(&self, key: &DeviceKey) {
        self.listeners.clear(&key.service, &key.id);
        let cancelled = self.correlator.cancel_device(key);
        if cancelled > 0 {
            tracing::debug!(device = %key, cancelled, "cancelled pending requests");
        }
    }

    /// Probe every device with a heartbeat call, concurrently. A device that
    /// misses two probes in a row is removed. Returns the removed devices.
    pub async fn probe_heartbeats(&self) -> Vec<DeviceKey> {
        let mut probes = JoinSet::new();
        for key in self.registry.keys() {
            let scape = self.clone();
            probes.spawn(async move {
                let alive = scape.heartbeat(&key).await || scape.heartbeat(&key).await;
                (key, alive)
            });
        }

        let mut removed = Vec::new();
        while let Some(result) = probes.join_next().await {
            match result {
                Ok((key, false)) => {
                    tracing::info!(device = %key, "no heartbeat, removing device");
                    self.remove_device(&key.service, &key.id);
                    removed.push(key);
                }
                Ok((_, true)) => {}
                Err(e) => tracing::warn!(error = %e, "heartbeat probe failed"),
            }
        }
        removed
    }

    async fn heartbeat(&self, key: &DeviceKey) -> bool {
        tracing::trace!(device = %key, "heartbeat");
        match self
            .call(&key.service, &key.id, Builtin::Heartbeat.name(), None, Vec::new())
            .await
        {
            Ok(reply) => !reply.is_timed_out(),
            Err(_) => false,
        }
    }
}

/// Four digits, each 0..=15.
fn random_key() -> Vec<i64> {
    let mut rng = rand::thread_rng();
    (0..HARDWARE_KEY_LEN).map(|_| rng.gen_range(0..16)).collect()
}

/// Text of every parameter, with list parameters expanded in place.
fn flatten_text(params: &[Value]) -> Vec<String> {
    params
        .iter()
        .flat_map(|param| match param {
            Value::Array(items) => items.iter().map(value_text).collect(),
            other => vec![value_text(other)],
        })
        .collect()
}

fn number_param(params: &[Value], index: usize) -> Result<i64, ScapeError> {
    let param = params
        .get(index)
        .ok_or_else(|| ScapeError::MalformedCommand(format!("missing argument {}", index + 1)))?;
    let number = match param {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64),
        _ => None,
    };
    number.ok_or_else(|| ScapeError::MalformedCommand(format!("not a number: {}", value_text(param))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::TIMEOUT_SENTINEL;
    use crate::listeners::{MemoryClient, DEVICE_MESSAGE};
    use crate::store::MemoryStore;
    use crate::transport::MemorySink;
    use scape_core::message::DeviceRequest;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_millis(3000);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn setup() -> (IotScape, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let scape = IotScape::new(
            CipherSuite::with_defaults(),
            Arc::new(MemoryStore::new()),
            TIMEOUT,
            sink.clone(),
        );
        (scape, sink)
    }

    fn announcement(id: &str) -> Vec<u8> {
        json!({
            "Robot": {
                "service": {"description": "A test robot", "version": 1},
                "id": id,
                "methods": {
                    "setSpeed": {
                        "documentation": "Set wheel speeds",
                        "params": [{"name": "left", "type": "number"}, {"name": "right", "type": "number"}],
                        "returns": {"type": ["void"]}
                    },
                    "getRange": {"params": [], "returns": {"type": ["number"]}}
                },
                "events": {"bumped": {"params": ["side"]}}
            }
        })
        .to_string()
        .into_bytes()
    }

    async fn announced() -> (IotScape, Arc<MemorySink>) {
        let (scape, sink) = setup();
        scape.handle_datagram(&announcement("r1"), addr(7001)).await;
        (scape, sink)
    }

    fn requests(sink: &MemorySink) -> Vec<DeviceRequest> {
        sink.take()
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn announcement_registers_service_and_device() {
        let (scape, _) = announced().await;
        assert_eq!(scape.get_services(), vec!["Robot"]);
        assert_eq!(scape.get_devices("Robot").unwrap(), vec!["r1"]);
        assert_eq!(scape.registry().address("Robot", "r1").unwrap(), addr(7001));
        assert_eq!(scape.get_methods("Robot").unwrap().len(), 2);
        assert_eq!(
            scape.get_message_types("Robot").unwrap(),
            vec![("bumped".to_string(), vec!["id".to_string(), "side".to_string()])]
        );
        assert!(matches!(scape.get_devices("Nope"), Err(ScapeError::ServiceNotFound(_))));
    }

    #[tokio::test]
    async fn invalid_datagrams_are_dropped() {
        let (scape, _) = setup();
        scape.handle_datagram(b"\xff\x00garbage", addr(7001)).await;
        scape.handle_datagram(b"[1, 2]", addr(7001)).await;
        let bad_name = json!({"Robo-Scape": {"service": {}, "id": "x", "methods": {}}});
        scape.handle_datagram(bad_name.to_string().as_bytes(), addr(7001)).await;
        assert!(scape.get_services().is_empty());
        assert!(scape.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_parses_and_guards_commands() {
        let (scape, sink) = announced().await;

        let reply = scape.send("Robot", "r1", "5 set speed 10,-10", "c1").await.unwrap();
        assert_eq!(reply, Some(Reply::Void));
        let sent = requests(&sink);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].function, "setSpeed");
        assert_eq!(sent[0].params, vec![json!("10"), json!("-10")]);
        assert_eq!(sent[0].client_id, "c1");

        // replayed sequence number
        assert_eq!(scape.send("Robot", "r1", "5 set speed 1 1", "c1").await.unwrap(), None);
        assert!(sink.is_empty());

        assert!(matches!(
            scape.send("Robot", "r1", "fly away", "c1").await,
            Err(ScapeError::FunctionNotFound { .. })
        ));
        assert!(matches!(
            scape.send("Robot", "zz", "setSpeed 1 1", "c1").await,
            Err(ScapeError::DeviceNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn responses_resolve_calls() {
        let (scape, sink) = announced().await;
        let call = {
            let scape = scape.clone();
            tokio::spawn(async move { scape.call("Robot", "r1", "getRange", None, vec![]).await })
        };
        tokio::task::yield_now().await;

        let request = requests(&sink).remove(0);
        let response = json!({"request": request.id, "response": [42]});
        scape.handle_datagram(response.to_string().as_bytes(), addr(7001)).await;
        assert_eq!(call.await.unwrap().unwrap(), Reply::Value(json!(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out() {
        let (scape, _) = announced().await;
        let reply = scape.call("Robot", "r1", "getRange", None, vec![]).await.unwrap();
        assert_eq!(reply.into_value(), json!(TIMEOUT_SENTINEL));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_calls_do_not_stay_pending() {
        let (scape, sink) = announced().await;
        let call = scape.call("Robot", "r1", "getRange", None, vec![]);
        assert!(tokio::time::timeout(Duration::from_millis(10), call).await.is_err());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(scape.correlator().pending_count(), 0);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_calls_cancel_by_request_id() {
        let (scape, sink) = announced().await;
        let prepared = scape.prepare_call("Robot", "r1", "getRange", Some("c1"), vec![]).unwrap();
        let request_id = prepared.request_id().to_string();
        assert!(sink.is_empty());

        let call = {
            let scape = scape.clone();
            tokio::spawn(async move { scape.dispatch(prepared).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(requests(&sink)[0].id, request_id);

        assert!(scape.cancel(&request_id));
        assert!(matches!(call.await.unwrap(), Err(ScapeError::Cancelled(_))));
        assert!(!scape.cancel(&request_id));
    }

    #[tokio::test]
    async fn events_fan_out_encrypted() {
        let (scape, _) = announced().await;
        scape.registry().set_encryption("Robot", "r1", Some(&["2".to_string()]), None).unwrap();
        let client = MemoryClient::new("c1");
        assert!(scape.listen("Robot", "r1", client.clone()).unwrap());

        let event = json!({"service": "Robot", "id": "r1", "event": {"type": "bumped", "args": {"side": "left"}}});
        scape.handle_datagram(event.to_string().as_bytes(), addr(7001)).await;

        let received = client.take();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].msg_type, DEVICE_MESSAGE);
        let message = received[0].content["message"].as_str().unwrap();
        assert_eq!(scape.registry().decrypt("Robot", "r1", message).unwrap(), "bumped left");
    }

    #[tokio::test]
    async fn control_events_only_from_the_device_address() {
        let (scape, _) = announced().await;
        scape.registry().set_encryption("Robot", "r1", Some(&["3".to_string()]), None).unwrap();
        let client = MemoryClient::new("c1");
        scape.listen("Robot", "r1", client.clone()).unwrap();

        let reset = json!({"service": "Robot", "id": "r1", "event": {"type": "_reset"}});
        scape.handle_datagram(reset.to_string().as_bytes(), addr(9999)).await;
        assert!(scape.registry().encryption_state("Robot", "r1").unwrap().is_caesar());
        // spoofed control events are just events
        assert_eq!(client.take().len(), 1);

        scape.handle_datagram(reset.to_string().as_bytes(), addr(7001)).await;
        assert!(scape.registry().encryption_state("Robot", "r1").unwrap().is_plain());
        assert!(client.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn request_key_issues_a_caesar_key() {
        let (scape, sink) = announced().await;
        let event = json!({"service": "Robot", "id": "r1", "event": {"type": "_requestKey"}});
        scape.handle_datagram(event.to_string().as_bytes(), addr(7001)).await;

        let state = scape.registry().encryption_state("Robot", "r1").unwrap();
        assert!(state.is_caesar());
        assert_eq!(state.key.len(), 4);
        assert!(state.key.iter().all(|k| (0..16).contains(k)));

        let sent = requests(&sink);
        assert_eq!(sent[0].function, "_requestedKey");
        let digits: Vec<i64> = sent[0].params.iter().map(|p| p.as_i64().unwrap()).collect();
        assert_eq!(digits, state.key);
    }

    #[tokio::test(start_paused = true)]
    async fn link_event_and_config_builtins() {
        let (scape, sink) = announced().await;
        scape.handle_datagram(&announcement("r2"), addr(7002)).await;
        scape.call("Robot", "r1", "setKey", None, vec![json!(1), json!(2)]).await.unwrap();
        assert_eq!(requests(&sink)[0].function, "setKey");

        // r1 asks for r2 to share its encryption
        let link = json!({"service": "Robot", "id": "r1", "event": {"type": "_link", "args": {"service": "Robot", "id": "r2"}}});
        scape.handle_datagram(link.to_string().as_bytes(), addr(7001)).await;
        assert_eq!(
            scape.registry().encryption_state("Robot", "r2").unwrap().key,
            vec![1, 2]
        );

        assert!(matches!(
            scape.call("Robot", "r2", "setCipher", None, vec![json!("plain")]).await,
            Err(ScapeError::LinkedDeviceReadOnly { .. })
        ));
        assert!(sink.is_empty());

        scape.call("Robot", "r1", "setClientRate", None, vec![json!("2"), json!(5)]).await.unwrap();
        assert!(matches!(
            scape.call("Robot", "r1", "setTotalRate", None, vec![json!("fast")]).await,
            Err(ScapeError::MalformedCommand(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_devices_fail_heartbeats_and_are_removed() {
        let (scape, sink) = announced().await;
        let client = MemoryClient::new("c1");
        scape.listen("Robot", "r1", client).unwrap();

        let removed = scape.probe_heartbeats().await;
        assert_eq!(removed, vec![DeviceKey::new("Robot", "r1")]);
        // two probes, each sent twice
        assert_eq!(sink.len(), 4);
        assert!(!scape.registry().exists("Robot", "r1"));
        assert!(scape.listeners().clients("Robot", "r1").is_empty());
        // the service itself stays known
        assert!(scape.catalog().service_exists("Robot"));
    }

    #[tokio::test(start_paused = true)]
    async fn answering_devices_survive_heartbeats() {
        let (scape, sink) = announced().await;
        let probe = {
            let scape = scape.clone();
            tokio::spawn(async move { scape.probe_heartbeats().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let request = requests(&sink).remove(0);
        assert_eq!(request.function, "heartbeat");
        let answer = json!({"request": request.id, "response": [true]});
        scape.handle_datagram(answer.to_string().as_bytes(), addr(7001)).await;

        assert!(probe.await.unwrap().is_empty());
        assert!(scape.registry().exists("Robot", "r1"));
    }

    #[tokio::test]
    async fn tick_forgets_silent_devices() {
        let (scape, _) = announced().await;
        let client = MemoryClient::new("c1");
        scape.listen("Robot", "r1", client).unwrap();

        for _ in 0..3 {
            assert!(scape.tick(3).is_empty());
        }
        assert_eq!(scape.tick(3), vec![DeviceKey::new("Robot", "r1")]);
        assert!(scape.listeners().clients("Robot", "r1").is_empty());
    }
}
