//! RoboScape binary wire format.
//!
//! Device → server datagrams start with an 11-byte header:
//!
//! ```text
//!   mac[6] timestamp[4] tag[1] payload...
//! ```
//!
//! Server → device commands are `tag[1] payload...` with no header; that is
//! what the robot firmware parses. All integers are little-endian.
//!
//! Fixed-layout types use zerocopy derives with explicit little-endian field
//! types, so there is no unsafe code and no alignment padding in this module.

use serde_json::{json, Map, Value};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, I16, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Header ────────────────────────────────────────────────────────────────────

/// Length of the device identifier (a MAC address).
pub const ID_LEN: usize = 6;

/// Common prefix of every device → server datagram.
///
/// Wire size: 11 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    /// Device MAC address. Hex-encoded it becomes the robot id.
    pub mac: [u8; 6],

    /// Device-local clock. A value lower than the previous one means the
    /// robot rebooted.
    pub timestamp: U32<LittleEndian>,

    /// Single ASCII letter selecting the payload layout.
    pub tag: u8,
}

assert_eq_size!(FrameHeader, [u8; 11]);

/// Wire size of [`FrameHeader`].
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

// ── Commands (server → device) ────────────────────────────────────────────────

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct PairCommand {
    tag: u8,
    left: I16<LittleEndian>,
    right: I16<LittleEndian>,
}

assert_eq_size!(PairCommand, [u8; 5]);

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct BeepCommand {
    tag: u8,
    msec: U16<LittleEndian>,
    tone: U16<LittleEndian>,
}

assert_eq_size!(BeepCommand, [u8; 5]);

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct LedCommand {
    tag: u8,
    led: u8,
    state: u8,
}

assert_eq_size!(LedCommand, [u8; 3]);

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct InfraCommand {
    tag: u8,
    msec: U16<LittleEndian>,
    pwr: u8,
}

assert_eq_size!(InfraCommand, [u8; 4]);

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct NumberCommand {
    tag: u8,
    number: u8,
    msec: U16<LittleEndian>,
}

assert_eq_size!(NumberCommand, [u8; 4]);

/// LED command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LedState {
    Off = 0,
    On = 1,
    Toggle = 2,
}

impl LedState {
    /// `false`/`off`/`0` → Off, `true`/`on`/`1` → On, anything else toggles.
    /// A leading underscore marks internal blink commands and is ignored.
    pub fn parse(text: &str) -> Self {
        let text = text.trim_start_matches('_').to_ascii_lowercase();
        match text.as_str() {
            "false" | "off" => LedState::Off,
            "true" | "on" => LedState::On,
            other => match other.parse::<f64>() {
                Ok(n) if n == 0.0 => LedState::Off,
                Ok(n) if n == 1.0 => LedState::On,
                _ => LedState::Toggle,
            },
        }
    }
}

/// A command the server sends to a robot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RobotCommand {
    SetSpeed { left: i16, right: i16 },
    Beep { msec: u16, tone: u16 },
    Range,
    Ticks,
    Drive { left: i16, right: i16 },
    Led { led: u8, state: LedState },
    InfraLight { msec: u16, pwr: u8 },
    ShowNumber { number: u8, msec: u16 },
}

impl RobotCommand {
    /// Wheel speed, clamped to [-128, 128].
    pub fn set_speed(left: i64, right: i64) -> Self {
        RobotCommand::SetSpeed {
            left: left.clamp(-128, 128) as i16,
            right: right.clamp(-128, 128) as i16,
        }
    }

    /// Drive distance in ticks, clamped to [-64, 64].
    pub fn drive(left: i64, right: i64) -> Self {
        RobotCommand::Drive {
            left: left.clamp(-64, 64) as i16,
            right: right.clamp(-64, 64) as i16,
        }
    }

    /// Beep for up to one second at up to 20 kHz.
    pub fn beep(msec: i64, tone: i64) -> Self {
        RobotCommand::Beep {
            msec: msec.clamp(0, 1000) as u16,
            tone: tone.clamp(0, 20_000) as u16,
        }
    }

    /// LED 0 or 1.
    pub fn led(led: i64, state: LedState) -> Self {
        RobotCommand::Led {
            led: led.clamp(0, 1) as u8,
            state,
        }
    }

    /// Infra-red light; `power` is a percentage, inverted onto [255, 0].
    pub fn infra_light(msec: i64, power: i64) -> Self {
        let power = power.clamp(0, 100) as f64;
        RobotCommand::InfraLight {
            msec: msec.clamp(0, 1000) as u16,
            pwr: (2.55 * (100.0 - power)).round() as u8,
        }
    }

    /// Numeric display. Numbers outside [0, 255] are not representable.
    pub fn show_number(number: i64, msec: i64) -> Option<Self> {
        if !(0..=255).contains(&number) {
            return None;
        }
        Some(RobotCommand::ShowNumber {
            number: number as u8,
            msec: msec.clamp(0, u16::MAX as i64) as u16,
        })
    }

    pub fn tag(&self) -> u8 {
        match self {
            RobotCommand::SetSpeed { .. } => b'S',
            RobotCommand::Beep { .. } => b'B',
            RobotCommand::Range => b'R',
            RobotCommand::Ticks => b'T',
            RobotCommand::Drive { .. } => b'D',
            RobotCommand::Led { .. } => b'L',
            RobotCommand::InfraLight { .. } => b'G',
            RobotCommand::ShowNumber { .. } => b'n',
        }
    }

    /// Serialize to the bytes the firmware expects.
    pub fn encode(&self) -> Vec<u8> {
        let tag = self.tag();
        match *self {
            RobotCommand::SetSpeed { left, right } | RobotCommand::Drive { left, right } => {
                PairCommand {
                    tag,
                    left: I16::new(left),
                    right: I16::new(right),
                }
                .as_bytes()
                .to_vec()
            }
            RobotCommand::Beep { msec, tone } => BeepCommand {
                tag,
                msec: U16::new(msec),
                tone: U16::new(tone),
            }
            .as_bytes()
            .to_vec(),
            RobotCommand::Range | RobotCommand::Ticks => vec![tag],
            RobotCommand::Led { led, state } => LedCommand {
                tag,
                led,
                state: state as u8,
            }
            .as_bytes()
            .to_vec(),
            RobotCommand::InfraLight { msec, pwr } => InfraCommand {
                tag,
                msec: U16::new(msec),
                pwr,
            }
            .as_bytes()
            .to_vec(),
            RobotCommand::ShowNumber { number, msec } => NumberCommand {
                tag,
                number,
                msec: U16::new(msec),
            }
            .as_bytes()
            .to_vec(),
        }
    }
}

// ── Telemetry (device → server) ───────────────────────────────────────────────

/// Decoded payload of a device → server datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    /// Identification heartbeat, sent every second.
    Identify,
    Speed { left: i16, right: i16 },
    Beep { msec: i16, tone: i16 },
    Whiskers { left: bool, right: bool },
    Button { pressed: bool },
    Range(i16),
    Lidar(Vec<i16>),
    Ticks { left: i32, right: i32 },
    Drive { left: i16, right: i16 },
    Led { led: u8, command: u8 },
    Number { number: u8, duration: u16 },
    Infra { left: bool, right: bool },
    InfraLight { msec: i16, pwr: u8 },
}

impl Telemetry {
    /// Message type forwarded to listening clients. `None` for heartbeats.
    pub fn event_type(&self) -> Option<&'static str> {
        let name = match self {
            Telemetry::Identify => return None,
            Telemetry::Speed { .. } => "speed",
            Telemetry::Beep { .. } => "beep",
            Telemetry::Whiskers { .. } => "whiskers",
            Telemetry::Button { .. } => "button",
            Telemetry::Range(_) | Telemetry::Lidar(_) => "range",
            Telemetry::Ticks { .. } => "ticks",
            Telemetry::Drive { .. } => "drive",
            Telemetry::Led { .. } => "set led",
            Telemetry::Number { .. } => "show number",
            Telemetry::Infra { .. } => "infra event",
            Telemetry::InfraLight { .. } => "infra light",
        };
        Some(name)
    }

    /// Event fields in wire order.
    pub fn fields(&self) -> Map<String, Value> {
        let value = match self {
            Telemetry::Identify => json!({}),
            Telemetry::Speed { left, right } | Telemetry::Drive { left, right } => {
                json!({ "left": left, "right": right })
            }
            Telemetry::Beep { msec, tone } => json!({ "msec": msec, "tone": tone }),
            Telemetry::Whiskers { left, right } | Telemetry::Infra { left, right } => {
                json!({ "left": left, "right": right })
            }
            Telemetry::Button { pressed } => json!({ "pressed": pressed }),
            Telemetry::Range(range) => json!({ "range": range }),
            Telemetry::Lidar(ranges) => json!({ "range": ranges }),
            Telemetry::Ticks { left, right } => json!({ "left": left, "right": right }),
            Telemetry::Led { led, command } => json!({ "led": led, "command": command }),
            Telemetry::Number { number, duration } => {
                json!({ "number": number, "duration": duration })
            }
            Telemetry::InfraLight { msec, pwr } => json!({ "msec": msec, "pwr": pwr }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// A fully decoded device → server datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub mac: [u8; 6],
    pub timestamp: u32,
    pub telemetry: Telemetry,
}

impl Frame {
    /// Robot id: the MAC as 12 lowercase hex characters.
    pub fn robot_id(&self) -> String {
        hex::encode(self.mac)
    }
}

/// Robot id from the first six bytes of a datagram.
pub fn robot_id(datagram: &[u8]) -> Option<String> {
    datagram.get(..ID_LEN).map(hex::encode)
}

/// Decode a device → server datagram. Lengths are checked per tag; a frame
/// with the right tag but the wrong length is an error.
pub fn decode_frame(datagram: &[u8]) -> Result<Frame, WireError> {
    let len = datagram.len();
    let header = FrameHeader::read_from_prefix(datagram).ok_or(WireError::TooShort(len))?;

    let d = datagram;
    let telemetry = match (header.tag, len) {
        (b'I', 11) => Telemetry::Identify,
        (b'B', 15) => Telemetry::Beep {
            msec: i16_at(d, 11),
            tone: i16_at(d, 13),
        },
        (b'S', 15) => Telemetry::Speed {
            left: i16_at(d, 11),
            right: i16_at(d, 13),
        },
        (b'W', 12) => Telemetry::Whiskers {
            left: d[11] & 0x2 == 0,
            right: d[11] & 0x1 == 0,
        },
        (b'P', 12) => Telemetry::Button { pressed: d[11] == 0 },
        (b'R', 13) => Telemetry::Range(i16_at(d, 11)),
        (b'R', n) if n > 13 => Telemetry::Lidar(
            (11..)
                .step_by(2)
                .take_while(|i| i + 1 < n)
                .map(|i| i16_at(d, i))
                .collect(),
        ),
        (b'T', 19) => Telemetry::Ticks {
            left: i32_at(d, 11),
            right: i32_at(d, 15),
        },
        (b'D', 15) => Telemetry::Drive {
            left: i16_at(d, 11),
            right: i16_at(d, 13),
        },
        (b'L', 13) => Telemetry::Led {
            led: d[11],
            command: d[12],
        },
        (b'n', 14) => Telemetry::Number {
            number: d[11],
            duration: u16::from_le_bytes([d[12], d[13]]),
        },
        (b'F', 12) => Telemetry::Infra {
            left: d[11] & 0x2 == 0,
            right: d[11] & 0x1 == 0,
        },
        (b'G', 14) => Telemetry::InfraLight {
            msec: i16_at(d, 11),
            pwr: (100.0 - f64::from(d[13]) / 2.55).round() as u8,
        },
        (b'I' | b'B' | b'S' | b'W' | b'P' | b'R' | b'T' | b'D' | b'L' | b'n' | b'F' | b'G', _) => {
            return Err(WireError::BadLength {
                tag: header.tag,
                len,
            })
        }
        (tag, _) => return Err(WireError::UnknownTag(tag)),
    };

    Ok(Frame {
        mac: header.mac,
        timestamp: header.timestamp.get(),
        telemetry,
    })
}

fn i16_at(d: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([d[at], d[at + 1]])
}

fn i32_at(d: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([d[at], d[at + 1], d[at + 2], d[at + 3]])
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting binary datagrams.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("bad length {len} for tag '{}'", char::from(*tag))]
    BadLength { tag: u8, len: usize },

    #[error("unknown tag 0x{0:02x}")]
    UnknownTag(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
