//! RoboScape front-end: binary-family robots.
//!
//! Robots identify themselves by MAC address in every frame and are all
//! registered under the `RoboScape` service. Clients address a robot by any
//! suffix of 4 to 12 characters of its id; the access oracle decides whether
//! the caller may use it.
//!
//! Two client surfaces, enabled by [`RoboScapeMode`]:
//! - native:   typed method calls, typed telemetry messages
//! - security: encrypted text commands through [`RoboScape::send`],
//!             telemetry as encrypted `robot message` envelopes
//!
//! The robot's button doubles as a key-management gesture in security mode:
//!
//! ```text
//!   press, release within 1 s   →  new random 4-digit key, blinked and shown
//!   press, hold for 1 s         →  encryption, sequence and rates reset
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use scape_core::config::RoboScapeMode;
use scape_core::message::value_text;
use scape_core::wire::{decode_frame, robot_id, LedState, RobotCommand, Telemetry};
use scape_core::{CipherSuite, ScapeError};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::access::AccessControl;
use crate::correlator::Correlator;
use crate::device::{DeviceKey, Family};
use crate::guard::Guard;
use crate::interpreter::{camel_case, interpret, is_backdoor, Command};
use crate::listeners::{event_text, ClientHandle, ClientMessage, Listeners};
use crate::registry::DeviceRegistry;
use crate::transport::{send_logged, DatagramSink};

/// Service every robot is registered under.
pub const ROBOSCAPE: &str = "RoboScape";

/// Raw client commands echoed to listeners.
pub const ROBOT_COMMAND: &str = "robot command";

/// Encrypted telemetry envelope.
pub const ROBOT_MESSAGE: &str = "robot message";

/// A robot is alive while it has missed at most this many ticks.
const ALIVE_HEARTBEATS: u32 = 2;

const BUTTON_HOLD: Duration = Duration::from_millis(1000);
const DEFAULT_NUMBER_MSEC: i64 = 3500;
const NUMBER_DELAY: Duration = Duration::from_millis(4000);

/// Robot methods, by their camelCase names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RobotMethod {
    SetSpeed,
    Drive,
    TurnWheels,
    Beep,
    SetLed,
    ShowNumber,
    InfraLight,
    GetRange,
    GetTicks,
    IsAlive,
    SetKey,
    SetEncryption,
    SetTotalRate,
    SetClientRate,
    ResetSeq,
    ResetRates,
}

impl RobotMethod {
    pub const ALL: [RobotMethod; 16] = [
        RobotMethod::SetSpeed,
        RobotMethod::Drive,
        RobotMethod::TurnWheels,
        RobotMethod::Beep,
        RobotMethod::SetLed,
        RobotMethod::ShowNumber,
        RobotMethod::InfraLight,
        RobotMethod::GetRange,
        RobotMethod::GetTicks,
        RobotMethod::IsAlive,
        RobotMethod::SetKey,
        RobotMethod::SetEncryption,
        RobotMethod::SetTotalRate,
        RobotMethod::SetClientRate,
        RobotMethod::ResetSeq,
        RobotMethod::ResetRates,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            RobotMethod::SetSpeed => "setSpeed",
            RobotMethod::Drive => "drive",
            RobotMethod::TurnWheels => "turnWheels",
            RobotMethod::Beep => "beep",
            RobotMethod::SetLed => "setLed",
            RobotMethod::ShowNumber => "showNumber",
            RobotMethod::InfraLight => "infraLight",
            RobotMethod::GetRange => "getRange",
            RobotMethod::GetTicks => "getTicks",
            RobotMethod::IsAlive => "isAlive",
            RobotMethod::SetKey => "setKey",
            RobotMethod::SetEncryption => "setEncryption",
            RobotMethod::SetTotalRate => "setTotalRate",
            RobotMethod::SetClientRate => "setClientRate",
            RobotMethod::ResetSeq => "resetSeq",
            RobotMethod::ResetRates => "resetRates",
        }
    }
}

/// Outcome of a robot command.
#[derive(Debug, Clone, PartialEq)]
pub enum RobotReply {
    /// Carried out, nothing to report.
    Done,
    /// Refused by the guard, or not a well-formed command.
    Refused,
    /// An answer. Queries the robot did not answer in time give `false`.
    Value(Value),
}

impl RobotReply {
    pub fn into_value(self) -> Value {
        match self {
            RobotReply::Done => Value::Bool(true),
            RobotReply::Refused => Value::Bool(false),
            RobotReply::Value(value) => value,
        }
    }
}

#[derive(Clone)]
pub struct RoboScape {
    registry: DeviceRegistry,
    correlator: Correlator,
    listeners: Listeners,
    guard: Guard,
    access: Arc<dyn AccessControl>,
    sink: Arc<dyn DatagramSink>,
    mode: RoboScapeMode,
    response_timeout: Duration,
    /// Latest blink sequence per robot; older sequences stop.
    blinks: Arc<DashMap<String, u64>>,
}

impl RoboScape {
    pub fn new(
        ciphers: CipherSuite,
        mode: RoboScapeMode,
        response_timeout: Duration,
        access: Arc<dyn AccessControl>,
        sink: Arc<dyn DatagramSink>,
    ) -> Self {
        let registry = DeviceRegistry::new(ciphers);
        Self {
            listeners: Listeners::new(registry.clone()),
            guard: Guard::new(registry.clone()),
            correlator: Correlator::new(response_timeout),
            registry,
            access,
            sink,
            mode,
            response_timeout,
            blinks: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    pub fn mode(&self) -> RoboScapeMode {
        self.mode
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Route one robot datagram. Malformed frames are logged and dropped;
    /// any datagram of at least six bytes refreshes its robot.
    pub fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let Some(id) = robot_id(datagram) else {
            tracing::trace!(from = %from, len = datagram.len(), "datagram too short for a robot id");
            return;
        };
        self.registry.get_or_create(ROBOSCAPE, &id, from, Family::Binary);

        let frame = match decode_frame(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(robot = %id, from = %from, error = %e, "dropping frame");
                return;
            }
        };

        let timestamp = i64::from(frame.timestamp);
        let previous = self
            .registry
            .with_device(ROBOSCAPE, &id, |robot| std::mem::replace(&mut robot.timestamp, timestamp))
            .unwrap_or(-1);

        match frame.telemetry {
            Telemetry::Identify => {
                if timestamp < previous {
                    tracing::info!(robot = %id, "robot rebooted");
                    if let Err(e) = self.registry.clear_encryption(ROBOSCAPE, &id) {
                        tracing::warn!(robot = %id, error = %e, "failed to reset rebooted robot");
                    }
                }
            }
            Telemetry::Button { pressed } => {
                if self.mode.native() {
                    self.deliver(&id, "button", Telemetry::Button { pressed }.fields());
                }
                if self.mode.security() {
                    self.button(&id, pressed);
                }
            }
            telemetry => {
                if let Some(event_type) = telemetry.event_type() {
                    self.deliver(&id, event_type, telemetry.fields());
                }
            }
        }
    }

    /// Hand an event to query waiters and listening clients.
    fn deliver(&self, id: &str, event_type: &str, fields: Map<String, Value>) {
        let time = self
            .registry
            .with_device(ROBOSCAPE, id, |robot| robot.timestamp)
            .unwrap_or(-1);

        let mut text_values = vec![json!(time)];
        text_values.extend(fields.values().cloned());

        let mut content = fields;
        content.insert("robot".into(), json!(id));
        content.insert("time".into(), json!(time));

        if event_type != "set led" {
            tracing::debug!(robot = id, event = event_type, "robot event");
        }
        self.correlator
            .notify_event(&DeviceKey::new(ROBOSCAPE, id), event_type, &content);

        let envelope = self.mode == RoboScapeMode::Both
            || (self.mode == RoboScapeMode::Security && event_type != "set led");
        let text = event_text(event_type, text_values.iter());

        for client in self.listeners.clients(ROBOSCAPE, id) {
            if let Err(e) = self.access.ensure_authorized(client.username().as_deref(), id) {
                tracing::debug!(robot = id, client = %client.identity().client_id, error = %e, "skipping listener");
                continue;
            }
            if self.mode.native() {
                client.send_message(ClientMessage {
                    msg_type: event_type.to_string(),
                    content: content.clone(),
                });
            }
            if envelope {
                let message = match self.registry.encrypt(ROBOSCAPE, id, &text) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(robot = id, error = %e, "failed to encrypt robot message");
                        continue;
                    }
                };
                let mut body = Map::new();
                body.insert("robot".into(), json!(id));
                body.insert("message".into(), json!(message));
                client.send_message(ClientMessage {
                    msg_type: ROBOT_MESSAGE.to_string(),
                    content: body,
                });
            }
        }
    }

    // ── Button gesture ────────────────────────────────────────────────────────

    fn button(&self, id: &str, pressed: bool) {
        if pressed {
            let now = Instant::now();
            if self
                .registry
                .with_device(ROBOSCAPE, id, |robot| robot.button_down_at = Some(now))
                .is_err()
            {
                return;
            }
            let scape = self.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(BUTTON_HOLD).await;
                let held = scape
                    .registry
                    .with_device(ROBOSCAPE, &id, |robot| robot.button_down_at == Some(now))
                    .unwrap_or(false);
                if held {
                    scape.reset_robot(&id);
                }
            });
        } else {
            let pressed_at = self
                .registry
                .with_device(ROBOSCAPE, id, |robot| robot.button_down_at.take())
                .ok()
                .flatten();
            if pressed_at.is_some_and(|at| at.elapsed() < BUTTON_HOLD) {
                self.random_encryption(id);
            }
        }
    }

    /// New random key, announced on the robot's LEDs and display.
    fn random_encryption(&self, id: &str) {
        let mut rng = rand::thread_rng();
        let key: Vec<i64> = (0..4).map(|_| rng.gen_range(0..16)).collect();

        let mut blinks: Vec<u8> = Vec::with_capacity(17);
        for digit in &key {
            for bit in [0x8, 0x4, 0x2, 0x1] {
                blinks.push(if digit & bit != 0 { 2 } else { 1 });
            }
        }
        blinks.push(3);

        let entries: Vec<String> = key.iter().map(i64::to_string).collect();
        let result = self
            .registry
            .reset_sequence(ROBOSCAPE, id)
            .and_then(|_| self.registry.reset_rates(ROBOSCAPE, id))
            .and_then(|_| self.registry.set_encryption(ROBOSCAPE, id, Some(&entries), None));
        if let Err(e) = result {
            tracing::warn!(robot = id, error = %e, "failed to set random key");
            return;
        }
        tracing::info!(robot = id, "random key set from button");
        self.play_blinks(id, blinks);
        self.play_numbers(id, key);
    }

    /// Encryption, sequence numbering and rate limits back to defaults.
    fn reset_robot(&self, id: &str) {
        tracing::info!(robot = id, "resetting robot");
        if let Err(e) = self.registry.clear_encryption(ROBOSCAPE, id) {
            tracing::warn!(robot = id, error = %e, "failed to reset robot");
            return;
        }
        self.play_blinks(id, vec![3]);
    }

    /// Show each state on the two LEDs (bit 0 → LED 0, bit 1 → LED 1),
    /// separated by a short dark pause. A newer sequence stops this one.
    fn play_blinks(&self, id: &str, states: Vec<u8>) {
        let generation = {
            let mut current = self.blinks.entry(id.to_string()).or_insert(0);
            *current += 1;
            *current
        };
        let scape = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let stale = |scape: &RoboScape| scape.blinks.get(&id).map(|g| *g) != Some(generation);
            for state in states {
                if stale(&scape) {
                    return;
                }
                for _ in 0..3 {
                    scape.command(&id, RobotCommand::led(0, LedState::Off));
                    scape.command(&id, RobotCommand::led(1, LedState::Off));
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                if stale(&scape) {
                    return;
                }
                let on = |bit: u8| if state & bit != 0 { LedState::On } else { LedState::Off };
                for _ in 0..2 {
                    scape.command(&id, RobotCommand::led(0, on(0x1)));
                    scape.command(&id, RobotCommand::led(1, on(0x2)));
                }
                tokio::time::sleep(Duration::from_millis(800)).await;
            }
        });
    }

    fn play_numbers(&self, id: &str, numbers: Vec<i64>) {
        let scape = self.clone();
        let id = id.to_string();
        let msec = NUMBER_DELAY.as_millis() as i64 - 500;
        tokio::spawn(async move {
            for number in numbers {
                if let Some(command) = RobotCommand::show_number(number, msec) {
                    for _ in 0..3 {
                        scape.command(&id, command.clone());
                    }
                }
                tokio::time::sleep(NUMBER_DELAY).await;
            }
        });
    }

    // ── Client operations ─────────────────────────────────────────────────────

    /// Resolve a client-supplied robot id (any 4 to 12 character suffix)
    /// and check the caller may use it.
    pub fn find_robot(&self, partial: &str, username: Option<&str>) -> Result<String, ScapeError> {
        let partial = partial.trim();
        let not_found = || ScapeError::device_not_found(ROBOSCAPE, partial);
        if !(4..=12).contains(&partial.len()) {
            return Err(not_found());
        }
        let found = if partial.len() == 12 {
            self.registry
                .exists(ROBOSCAPE, partial)
                .then(|| partial.to_string())
        } else {
            self.registry
                .devices(ROBOSCAPE)
                .into_iter()
                .find(|id| id.ends_with(partial))
        };
        let id = found.ok_or_else(not_found)?;
        self.access.ensure_authorized(username, &id)?;
        Ok(id)
    }

    /// Replace the client's subscriptions with the listed robots (separated
    /// by commas or spaces). False if any of them could not be used.
    pub fn listen(&self, client: Arc<dyn ClientHandle>, robots: &str) -> bool {
        self.listeners.unsubscribe_all(&client.identity());
        let username = client.username();
        let mut ok = true;
        for robot in robots.split([',', ' ']).filter(|r| !r.is_empty()) {
            match self.find_robot(robot, username.as_deref()) {
                Ok(id) => {
                    self.listeners.subscribe(ROBOSCAPE, &id, client.clone());
                }
                Err(e) => {
                    tracing::debug!(robot, error = %e, "cannot listen to robot");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Robots the user may use, sorted.
    pub fn get_robots(&self, username: Option<&str>) -> Vec<String> {
        self.access
            .authorized(username, &self.registry.devices(ROBOSCAPE))
    }

    /// Typed method call (native surface). Subject to rate limits, not to
    /// sequence numbering.
    pub async fn call(
        &self,
        caller: &dyn ClientHandle,
        robot: &str,
        method: RobotMethod,
        args: &[Value],
    ) -> Result<RobotReply, ScapeError> {
        if !self.mode.native() {
            return Err(ScapeError::function_not_found(ROBOSCAPE, method.name()));
        }
        let id = self.find_robot(robot, caller.username().as_deref())?;
        if !self.guard.accepts(ROBOSCAPE, &id, &caller.identity().client_id, -1)? {
            return Ok(RobotReply::Refused);
        }
        self.execute(&id, method, args).await
    }

    /// Text command (security surface): optionally `backdoor`-prefixed,
    /// otherwise encrypted and optionally sequence-numbered.
    pub async fn send(
        &self,
        caller: &dyn ClientHandle,
        robot: &str,
        command: &str,
    ) -> Result<RobotReply, ScapeError> {
        if !self.mode.security() {
            return Err(ScapeError::function_not_found(ROBOSCAPE, "send"));
        }
        let id = self.find_robot(robot, caller.username().as_deref())?;

        if !is_backdoor(command) {
            self.command_to_clients(&id, command);
        }

        let parsed = interpret(
            command,
            |text| self.registry.decrypt(ROBOSCAPE, &id, text),
            |name| RobotMethod::parse(name).is_some(),
        );
        let mut parsed = match parsed {
            Ok(parsed) => parsed,
            Err(ScapeError::MalformedCommand(reason)) => {
                tracing::debug!(robot = %id, reason = %reason, "malformed robot command");
                return Ok(RobotReply::Refused);
            }
            Err(e) => return Err(e),
        };
        join_phrase(&mut parsed);

        let client_id = caller.identity().client_id;
        if !parsed.backdoor && !self.guard.accepts(ROBOSCAPE, &id, &client_id, parsed.seq)? {
            return Ok(RobotReply::Refused);
        }

        let Some(method) = RobotMethod::parse(&parsed.method) else {
            tracing::debug!(robot = %id, method = %parsed.method, "unknown robot command");
            return Ok(RobotReply::Refused);
        };
        let args: Vec<Value> = parsed.args.into_iter().map(Value::String).collect();
        self.execute(&id, method, &args).await
    }

    /// Echo a raw client command to the robot's listeners.
    fn command_to_clients(&self, id: &str, command: &str) {
        if !self.mode.security() {
            return;
        }
        for client in self.listeners.clients(ROBOSCAPE, id) {
            let mut content = Map::new();
            content.insert("robot".into(), json!(id));
            content.insert("command".into(), json!(command));
            client.send_message(ClientMessage {
                msg_type: ROBOT_COMMAND.to_string(),
                content,
            });
        }
    }

    async fn execute(&self, id: &str, method: RobotMethod, args: &[Value]) -> Result<RobotReply, ScapeError> {
        let pair = || Some((int_arg(args, 0)?, int_arg(args, 1)?)).filter(|_| args.len() == 2);

        let command = match method {
            RobotMethod::SetSpeed => pair().map(|(l, r)| RobotCommand::set_speed(l, r)),
            RobotMethod::Drive | RobotMethod::TurnWheels => pair().map(|(l, r)| RobotCommand::drive(l, r)),
            RobotMethod::Beep => pair().map(|(msec, tone)| RobotCommand::beep(msec, tone)),
            RobotMethod::InfraLight => pair().map(|(msec, pwr)| RobotCommand::infra_light(msec, pwr)),
            RobotMethod::SetLed => match (int_arg(args, 0), args.get(1)) {
                (Some(led), Some(state)) if args.len() == 2 => {
                    Some(RobotCommand::led(led, LedState::parse(&value_text(state))))
                }
                _ => None,
            },
            RobotMethod::ShowNumber => {
                let number = int_arg(args, 0);
                let msec = match args.len() {
                    1 => Some(DEFAULT_NUMBER_MSEC),
                    2 => int_arg(args, 1),
                    _ => None,
                };
                match (number, msec) {
                    (Some(number), Some(msec)) => {
                        if let Some(command) = RobotCommand::show_number(number, msec) {
                            self.command(id, command);
                        }
                        return Ok(RobotReply::Done);
                    }
                    _ => None,
                }
            }
            RobotMethod::GetRange => {
                let answer = self.query(id, RobotCommand::Range, "range").await;
                let value = answer.and_then(|mut content| content.remove("range"));
                return Ok(RobotReply::Value(value.unwrap_or(Value::Bool(false))));
            }
            RobotMethod::GetTicks => {
                let answer = self.query(id, RobotCommand::Ticks, "ticks").await;
                let value = answer.map(|content| json!([content["left"], content["right"]]));
                return Ok(RobotReply::Value(value.unwrap_or(Value::Bool(false))));
            }
            RobotMethod::IsAlive => {
                self.deliver(id, "alive", Map::new());
                let heartbeats = self
                    .registry
                    .snapshot(ROBOSCAPE, id)
                    .map(|robot| robot.heartbeats)
                    .ok_or_else(|| ScapeError::device_not_found(ROBOSCAPE, id))?;
                return Ok(RobotReply::Value(Value::Bool(heartbeats <= ALIVE_HEARTBEATS)));
            }
            RobotMethod::SetKey => {
                let key = text_args(args);
                return self.configure(self.registry.set_encryption(ROBOSCAPE, id, Some(&key), None));
            }
            RobotMethod::SetEncryption => {
                let Some((cipher, key)) = text_args(args).split_first().map(|(c, k)| (c.clone(), k.to_vec())) else {
                    return Ok(RobotReply::Refused);
                };
                return self.configure(self.registry.set_encryption(ROBOSCAPE, id, Some(&key), Some(&cipher)));
            }
            RobotMethod::SetTotalRate => {
                return match int_arg(args, 0) {
                    Some(rate) if args.len() == 1 => {
                        self.configure(self.registry.set_total_rate(ROBOSCAPE, id, rate))
                    }
                    _ => Ok(RobotReply::Refused),
                };
            }
            RobotMethod::SetClientRate => {
                return match pair() {
                    Some((rate, penalty)) => {
                        self.configure(self.registry.set_client_rate(ROBOSCAPE, id, rate, penalty))
                    }
                    None => Ok(RobotReply::Refused),
                };
            }
            RobotMethod::ResetSeq => return self.configure(self.registry.reset_sequence(ROBOSCAPE, id)),
            RobotMethod::ResetRates => return self.configure(self.registry.reset_rates(ROBOSCAPE, id)),
        };

        match command {
            Some(command) => {
                self.command(id, command);
                Ok(RobotReply::Done)
            }
            None => {
                tracing::debug!(robot = id, method = method.name(), "bad robot arguments");
                Ok(RobotReply::Refused)
            }
        }
    }

    /// Bad keys and unknown ciphers refuse the command; anything else is an
    /// error.
    fn configure(&self, result: Result<(), ScapeError>) -> Result<RobotReply, ScapeError> {
        match result {
            Ok(()) => Ok(RobotReply::Done),
            Err(ScapeError::InvalidKey(_) | ScapeError::InvalidCipher(_)) => Ok(RobotReply::Refused),
            Err(e) => Err(e),
        }
    }

    async fn query(&self, id: &str, command: RobotCommand, event: &str) -> Option<Map<String, Value>> {
        self.correlator
            .expect_event(&DeviceKey::new(ROBOSCAPE, id), event, self.response_timeout, || {
                self.command(id, command)
            })
            .await
    }

    /// Send a binary command to a robot.
    fn command(&self, id: &str, command: RobotCommand) {
        match self.registry.address(ROBOSCAPE, id) {
            Ok(addr) => {
                tracing::trace!(robot = id, ?command, "robot command");
                send_logged(self.sink.as_ref(), &command.encode(), addr);
            }
            Err(e) => tracing::debug!(robot = id, error = %e, "robot gone"),
        }
    }

    // ── Liveness ──────────────────────────────────────────────────────────────

    /// One housekeeping tick. Returns the robots forgotten.
    pub fn tick(&self, forget_ticks: u32) -> Vec<DeviceKey> {
        let evicted = self.registry.tick(forget_ticks);
        for key in &evicted {
            self.listeners.clear(&key.service, &key.id);
            self.correlator.cancel_device(key);
            self.blinks.remove(&key.id);
        }
        evicted
    }
}

/// `is alive`, `turn wheels`, `show number` and `infra light` are two-word
/// commands without a `set`/`get`/`reset` prefix.
fn join_phrase(command: &mut Command) {
    if RobotMethod::parse(&command.method).is_some() || command.args.is_empty() {
        return;
    }
    let joined = camel_case(&[command.method.clone(), command.args[0].clone()]);
    if RobotMethod::parse(&joined).is_some() {
        command.method = joined;
        command.args.remove(0);
    }
}

/// Integer argument; strings must be plain integers.
fn int_arg(args: &[Value], index: usize) -> Option<i64> {
    match args.get(index)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_args(args: &[Value]) -> Vec<String> {
    args.iter().map(value_text).collect()
}
