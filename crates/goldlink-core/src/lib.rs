//! Connection lifecycle and reactive state layer for Lince alarm panels.
//!
//! This crate owns the domain logic above the `goldlink-api` wire layer:
//!
//! - **[`Panel`]** — Entry-point handle. [`connect()`](Panel::connect)
//!   spawns a background link task that authenticates, streams state, and
//!   reconnects with backoff; [`arm()`](Panel::arm) /
//!   [`disarm()`](Panel::disarm) issue commands and hand back a
//!   [`CommandTicket`] that resolves on confirmation, rejection or timeout.
//!
//! - **[`PanelStore`]** — Reactive cache built on `tokio::sync::watch`.
//!   Applies transport deltas idempotently, keeps last-known-good values
//!   (marked stale) across disconnects, and carries the dispatcher's
//!   optimistic arming overlay.
//!
//! - **[`LinkState`]** — Observable connection lifecycle
//!   (`Idle → Connecting → Connected`, `Reconnecting` with backoff,
//!   terminal `Failed` on a stolen session).
//!
//! - **[`NotificationPolicy`]** — Debounced user-facing events handed to
//!   an application-supplied [`NotificationSink`]; alarms bypass the
//!   cooldown.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod link;
pub mod model;
pub mod notify;
pub mod panel;
pub mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{BackoffConfig, PanelCredentials, PanelOptions, default_profiles};
pub use dispatch::CommandTicket;
pub use error::CoreError;
pub use link::LinkState;
pub use notify::{EventKind, NotificationRequest, NotificationSink, Priority};
pub use panel::Panel;
pub use store::PanelStore;

// Re-export model types at the crate root for ergonomics.
pub use model::{
    ArmedState, Authorization, ConnectionMode, Diagnostics, PanelSnapshot, ProductFamily,
    Profile, Program, ProgramSet, ZoneKind, ZoneStatus,
};
