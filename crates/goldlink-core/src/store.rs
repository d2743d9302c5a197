// ── Reactive panel state cache ──
//
// One `PanelStore` per panel, written exclusively by that panel's link
// task and read by any number of consumers through cheap `Arc` snapshots
// or a `watch` subscription. Delta application is idempotent: a delta
// that changes nothing leaves the snapshot untouched and does not wake
// watchers.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::debug;

use goldlink_api::wire::{FullState, StateDelta, ZoneKind, ZoneStatus};

use crate::model::{ArmedState, PanelSnapshot};

pub struct PanelStore {
    tx: watch::Sender<Arc<PanelSnapshot>>,
    /// Optimistic arming overlay owned by the command dispatcher.
    /// While set it masks the observed armed state; clearing it restores
    /// the observed state exactly.
    overlay: Mutex<Option<ArmedState>>,
}

impl Default for PanelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PanelStore {
    pub fn new() -> Self {
        // Nothing known yet: Unknown + stale until the first snapshot.
        let initial = PanelSnapshot { stale: true, ..PanelSnapshot::default() };
        let (tx, _) = watch::channel(Arc::new(initial));
        Self { tx, overlay: Mutex::new(None) }
    }

    /// Current snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<PanelSnapshot> {
        self.tx.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PanelSnapshot>> {
        self.tx.subscribe()
    }

    /// Apply one delta. Newest value wins wholesale for the fields the
    /// delta covers; nothing is merged across points in time.
    pub fn apply(&self, delta: &StateDelta) {
        let overlay = *self.overlay.lock().expect("overlay lock");
        self.tx.send_if_modified(|current| {
            let mut next = (**current).clone();
            apply_delta(&mut next, delta);
            next.armed = overlay.unwrap_or(ArmedState::observed(next.programs, next.alarm));
            if next == **current {
                false
            } else {
                *current = Arc::new(next);
                true
            }
        });
    }

    /// Mark the cached values as last-known-good rather than live.
    /// Called on disconnect; the next full snapshot clears it.
    pub fn set_stale(&self) {
        self.tx.send_if_modified(|current| {
            if current.stale {
                return false;
            }
            let mut next = (**current).clone();
            next.stale = true;
            *current = Arc::new(next);
            debug!("panel state marked stale");
            true
        });
    }

    /// Install or clear the optimistic overlay and republish.
    pub fn set_overlay(&self, overlay: Option<ArmedState>) {
        *self.overlay.lock().expect("overlay lock") = overlay;
        self.tx.send_if_modified(|current| {
            let armed = overlay.unwrap_or(ArmedState::observed(current.programs, current.alarm));
            if armed == current.armed {
                return false;
            }
            let mut next = (**current).clone();
            next.armed = armed;
            *current = Arc::new(next);
            true
        });
    }
}

fn apply_delta(snapshot: &mut PanelSnapshot, delta: &StateDelta) {
    match delta {
        StateDelta::Snapshot(full) => apply_full_state(snapshot, full),
        StateDelta::Programs(programs) => snapshot.programs = *programs,
        // Zone numbers are 1-based; 0 is malformed and dropped.
        StateDelta::Zone { number: 0, .. } => {
            debug!("ignoring zone delta with number 0");
        }
        StateDelta::Zone { kind, number, status } => {
            let zones = match kind {
                ZoneKind::Wired => &mut snapshot.wired,
                ZoneKind::Radio => &mut snapshot.radio,
            };
            let index = usize::from(number - 1);
            if index >= zones.len() {
                zones.resize(index + 1, ZoneStatus::default());
            }
            zones[index] = *status;
        }
        StateDelta::Diagnostics(diagnostics) => snapshot.diagnostics = *diagnostics,
        StateDelta::Alarm(active) => snapshot.alarm = *active,
        StateDelta::Authorization(auth) => snapshot.authorization = Some(*auth),
    }
}

/// A full snapshot replaces every field it covers and ends staleness.
fn apply_full_state(snapshot: &mut PanelSnapshot, full: &FullState) {
    snapshot.programs = full.panel.programs;
    snapshot.alarm = full.panel.alarm;
    snapshot.sabotage = full.panel.sabotage;
    snapshot.fault = full.panel.fault;
    snapshot.zones_open = full.panel.zones_open;
    snapshot.zones_excluded = full.panel.zones_excluded;
    snapshot.diagnostics = full.panel.diagnostics;
    snapshot.wired = full.wired.clone();
    snapshot.radio = full.radio.clone();
    snapshot.stale = false;
}
