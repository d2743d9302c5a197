//! Wire-level data model shared by both transports.
//!
//! Every inbound message -- a cloud WebSocket frame or a local poll diff --
//! is normalized into [`StateDelta`] events so the layers above never know
//! which transport produced them.

use serde::{Deserialize, Serialize};

use crate::error::Error;

// ── Program bitmasks (cloud type-240 command payload) ────────────────

pub const MASK_G1: u8 = 0b0001;
pub const MASK_G2: u8 = 0b0010;
pub const MASK_G3: u8 = 0b0100;
pub const MASK_GEXT: u8 = 0b1000;

/// A panel-native arming group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Program {
    G1,
    G2,
    G3,
    GExt,
}

impl Program {
    pub const ALL: [Program; 4] = [Program::G1, Program::G2, Program::G3, Program::GExt];

    pub fn mask(self) -> u8 {
        match self {
            Self::G1 => MASK_G1,
            Self::G2 => MASK_G2,
            Self::G3 => MASK_G3,
            Self::GExt => MASK_GEXT,
        }
    }

    /// Query-parameter name on the EuroNET arm endpoint.
    pub fn query_name(self) -> &'static str {
        match self {
            Self::G1 => "G1",
            Self::G2 => "G2",
            Self::G3 => "G3",
            Self::GExt => "GEXT",
        }
    }
}

/// A set of arming programs, stored as the panel's native bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramSet(u8);

impl ProgramSet {
    pub const EMPTY: ProgramSet = ProgramSet(0);
    pub const ALL: ProgramSet = ProgramSet(MASK_G1 | MASK_G2 | MASK_G3 | MASK_GEXT);

    pub fn from_mask(mask: u8) -> Self {
        Self(mask & Self::ALL.0)
    }

    pub fn mask(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, program: Program) -> bool {
        self.0 & program.mask() != 0
    }

    pub fn with(mut self, program: Program) -> Self {
        self.0 |= program.mask();
        self
    }

    pub fn iter(self) -> impl Iterator<Item = Program> {
        Program::ALL.into_iter().filter(move |p| self.contains(*p))
    }
}

impl FromIterator<Program> for ProgramSet {
    fn from_iter<I: IntoIterator<Item = Program>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::with)
    }
}

impl std::fmt::Display for ProgramSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for p in self.iter() {
            if !first {
                write!(f, "+")?;
            }
            write!(f, "{}", p.query_name())?;
            first = false;
        }
        Ok(())
    }
}

// ── Zone status ──────────────────────────────────────────────────────

/// Wired or radio input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Wired,
    Radio,
}

/// Runtime status of a single zone.
///
/// `low_battery` and `supervision_lost` are only ever set for radio
/// zones; wired zones report them as `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ZoneStatus {
    /// Input currently open.
    pub open: bool,
    /// 24h/tamper line in alarm.
    pub alarm: bool,
    /// Zone excluded from arming.
    pub excluded: bool,
    /// Latched alarm memory.
    pub alarm_memory: bool,
    /// Latched sabotage (24h) memory.
    pub sabotage: bool,
    /// Radio sensor battery low.
    pub low_battery: bool,
    /// Radio sensor missed its supervision window.
    pub supervision_lost: bool,
}

// ── Panel status & diagnostics ───────────────────────────────────────

/// Electrical and environmental readings reported by the panel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Diagnostics {
    /// Battery voltage in volts.
    pub battery_voltage: f64,
    /// Bus voltage in volts.
    pub bus_voltage: f64,
    /// Board temperature in degrees Celsius.
    pub temperature: f64,
    /// Mains (220V) power present.
    pub mains_power: bool,
    pub internal_battery_ok: bool,
    pub external_battery_ok: bool,
    /// Firmware release, e.g. `7.12`.
    pub firmware_release: f64,
}

/// Aggregate panel status carried by a full-state snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PanelStatus {
    /// Currently armed programs.
    pub programs: ProgramSet,
    /// General alarm active.
    pub alarm: bool,
    /// Panel-level sabotage (tamper) active.
    pub sabotage: bool,
    /// Fault condition reported.
    pub fault: bool,
    /// Any zone currently open.
    pub zones_open: bool,
    /// Any zone currently excluded.
    pub zones_excluded: bool,
    pub diagnostics: Diagnostics,
}

/// Full panel + zone state, as fetched by a local poll or pushed in a
/// cloud snapshot frame. Zone vectors are index-ordered (zone 1 first).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FullState {
    pub panel: PanelStatus,
    pub wired: Vec<ZoneStatus>,
    pub radio: Vec<ZoneStatus>,
}

/// PIN-authorization result and per-program capability, pushed by the
/// cloud service after a PIN frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Authorization {
    pub authorized: bool,
    /// Programs this PIN may operate.
    pub capabilities: ProgramSet,
}

// ── StateDelta ───────────────────────────────────────────────────────

/// A unit of change describing new panel/zone/diagnostic values.
///
/// Both transports produce exactly these; the cloud parses push frames,
/// the local transport synthesizes them by diffing consecutive polls.
#[derive(Debug, Clone, PartialEq)]
pub enum StateDelta {
    /// Full-state snapshot: replaces every field it covers.
    Snapshot(FullState),
    /// Armed-program change.
    Programs(ProgramSet),
    /// Single-zone change.
    Zone {
        kind: ZoneKind,
        /// 1-based zone number.
        number: u8,
        status: ZoneStatus,
    },
    /// Diagnostic readings update.
    Diagnostics(Diagnostics),
    /// General alarm raised or cleared.
    Alarm(bool),
    /// PIN authorization outcome.
    Authorization(Authorization),
}

// ── Cloud frame envelope ─────────────────────────────────────────────

/// Inbound cloud WebSocket frame: `{"type": "...", "payload": ...}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
enum CloudFrame {
    Status(FullState),
    Programs { mask: u8 },
    Zone { kind: ZoneKind, number: u8, status: ZoneStatus },
    Diagnostics(Diagnostics),
    Alarm { active: bool },
    Auth(Authorization),
}

/// Parse one cloud text frame into state deltas.
///
/// Unknown frame types fail with [`Error::MalformedResponse`]; the caller
/// decides whether to drop or count toward the tear-down threshold.
pub fn parse_cloud_frame(text: &str) -> Result<Vec<StateDelta>, Error> {
    let frame: CloudFrame =
        serde_json::from_str(text).map_err(|e| Error::malformed(e.to_string()))?;

    let deltas = match frame {
        CloudFrame::Status(state) => {
            // A snapshot implies program and alarm changes too, but those
            // are already covered by the snapshot itself.
            vec![StateDelta::Snapshot(state)]
        }
        CloudFrame::Programs { mask } => vec![StateDelta::Programs(ProgramSet::from_mask(mask))],
        CloudFrame::Zone { kind, number, status } => {
            vec![StateDelta::Zone { kind, number, status }]
        }
        CloudFrame::Diagnostics(d) => vec![StateDelta::Diagnostics(d)],
        CloudFrame::Alarm { active } => vec![StateDelta::Alarm(active)],
        CloudFrame::Auth(auth) => vec![StateDelta::Authorization(auth)],
    };

    Ok(deltas)
}

// ── Outbound command frames ──────────────────────────────────────────

/// A user PIN: exactly six digits, held without Debug/Display exposure.
#[derive(Clone)]
pub struct Pin {
    digits: [u8; 6],
}

impl Pin {
    /// Parse a PIN string. The panel protocol wants exactly six digits
    /// (the type-251 payload is a fixed six-element array).
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 6 || !bytes.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let mut digits = [0u8; 6];
        for (d, b) in digits.iter_mut().zip(bytes) {
            *d = b - b'0';
        }
        Some(Self { digits })
    }

    pub fn digits(&self) -> &[u8; 6] {
        &self.digits
    }

    /// The PIN as its original string form (for the local login ritual).
    pub fn as_code(&self) -> String {
        self.digits.iter().map(|d| char::from(b'0' + d)).collect()
    }
}

impl std::fmt::Debug for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Pin(******)")
    }
}

/// A command bound for the active transport.
#[derive(Debug, Clone)]
pub enum PanelCommand {
    /// Arm exactly this program set (an empty set is a disarm on the
    /// cloud wire, but use [`PanelCommand::Disarm`] for intent clarity).
    Arm { programs: ProgramSet, pin: Pin },
    /// Disarm all programs.
    Disarm { pin: Pin },
}

impl PanelCommand {
    /// The program set this command drives the panel toward.
    pub fn target(&self) -> ProgramSet {
        match self {
            Self::Arm { programs, .. } => *programs,
            Self::Disarm { .. } => ProgramSet::EMPTY,
        }
    }

    pub fn pin(&self) -> &Pin {
        match self {
            Self::Arm { pin, .. } | Self::Disarm { pin } => pin,
        }
    }
}

/// Build the cloud PIN-login frame: `{"type":251,"payload":[d0..d5]}`.
pub fn pin_frame(pin: &Pin) -> String {
    let payload: Vec<u8> = pin.digits().to_vec();
    serde_json::json!({ "type": 251, "payload": payload }).to_string()
}

/// Build the cloud program-activation frame: `{"type":240,"payload":[mask]}`.
/// A zero mask disarms everything.
pub fn activation_frame(programs: ProgramSet) -> String {
    serde_json::json!({ "type": 240, "payload": [programs.mask()] }).to_string()
}
