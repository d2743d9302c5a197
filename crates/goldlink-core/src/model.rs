// ── Domain model ──
//
// Value objects consumers read out of the store. Wire-level types that
// are already domain-shaped (programs, zones, diagnostics) are
// re-exported from goldlink-api rather than mirrored.

use serde::{Deserialize, Serialize};

pub use goldlink_api::wire::{
    Authorization, Diagnostics, Program, ProgramSet, ZoneKind, ZoneStatus,
};

/// Panel hardware family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProductFamily {
    EuroPlus,
    Gold,
    Gr868,
}

impl std::fmt::Display for ProductFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::EuroPlus => "EuroPlus",
            Self::Gold => "Gold",
            Self::Gr868 => "GR868",
        };
        f.write_str(name)
    }
}

/// Which of the two mutually-exclusive transports a panel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Cloud,
    Local,
}

/// Consumer-facing arming state.
///
/// `Arming` and `Disarming` come only from the command dispatcher's
/// optimistic overlay; the panel itself never reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArmedState {
    Disarmed,
    Arming,
    Armed,
    Disarming,
    Alarm,
    #[default]
    Unknown,
}

impl ArmedState {
    /// Derive the state the panel actually reports (no overlay).
    pub fn observed(programs: ProgramSet, alarm: bool) -> Self {
        if alarm {
            Self::Alarm
        } else if programs.is_empty() {
            Self::Disarmed
        } else {
            Self::Armed
        }
    }
}

/// User-level arming profile, mapped to a [`ProgramSet`] by options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Home,
    Away,
    Night,
    Vacation,
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Home => "home",
            Self::Away => "away",
            Self::Night => "night",
            Self::Vacation => "vacation",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of everything known about a panel.
///
/// Plain values, cheap to clone behind the store's `Arc`. `stale` is
/// set while the link is down: values are the last known good ones, not
/// live.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PanelSnapshot {
    pub armed: ArmedState,
    pub programs: ProgramSet,
    pub alarm: bool,
    pub sabotage: bool,
    pub fault: bool,
    pub zones_open: bool,
    pub zones_excluded: bool,
    pub wired: Vec<ZoneStatus>,
    pub radio: Vec<ZoneStatus>,
    pub diagnostics: Diagnostics,
    /// Latest cloud authorization report, if any has arrived.
    pub authorization: Option<Authorization>,
    pub stale: bool,
}
