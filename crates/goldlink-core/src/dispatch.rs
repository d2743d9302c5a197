// ── Command dispatcher ──
//
// Tracks the single in-flight arm/disarm command for a panel. The wire
// has no command acknowledgement and no request ids, so confirmation is
// correlated heuristically: the first programs report arriving after the
// command went out on the wire that matches the target set counts as
// the ack.
// Until then the store carries an optimistic Arming/Disarming overlay;
// resolution (confirm, reject, timeout) always clears it, so the cache
// never shows a phantom state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use goldlink_api::wire::{ProgramSet, StateDelta};

use crate::error::CoreError;
use crate::model::ArmedState;
use crate::notify::{EventKind, NotificationPolicy};
use crate::store::PanelStore;

/// Resolves once the command confirms, is rejected, or times out.
pub struct CommandTicket {
    rx: oneshot::Receiver<Result<(), CoreError>>,
}

impl CommandTicket {
    pub async fn outcome(self) -> Result<(), CoreError> {
        self.rx.await.unwrap_or(Err(CoreError::Disconnected))
    }
}

struct PendingCommand {
    /// Program set the panel should end up with (empty = disarm).
    target: ProgramSet,
    issued_at: Instant,
    deadline: Instant,
    /// Set once the command actually went out on the wire. Reports that
    /// arrived before that describe the pre-command state and must not
    /// confirm or refuse it.
    sent: bool,
    reply: oneshot::Sender<Result<(), CoreError>>,
}

pub struct CommandDispatcher {
    store: Arc<PanelStore>,
    notify: Arc<NotificationPolicy>,
    timeout: Duration,
    pending: Mutex<Option<PendingCommand>>,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<PanelStore>,
        notify: Arc<NotificationPolicy>,
        timeout: Duration,
    ) -> Self {
        Self { store, notify, timeout, pending: Mutex::new(None) }
    }

    /// Register a new pending command and install its overlay.
    /// Fails with [`CoreError::NotReady`] while another is in flight.
    pub fn begin(&self, target: ProgramSet) -> Result<CommandTicket, CoreError> {
        let mut pending = self.pending.lock().expect("pending lock");
        if pending.is_some() {
            return Err(CoreError::NotReady);
        }

        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        *pending = Some(PendingCommand {
            target,
            issued_at: now,
            deadline: now + self.timeout,
            sent: false,
            reply: tx,
        });
        drop(pending);

        let overlay =
            if target.is_empty() { ArmedState::Disarming } else { ArmedState::Arming };
        self.store.set_overlay(Some(overlay));

        debug!(%target, "command pending");
        Ok(CommandTicket { rx })
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().expect("pending lock").is_some()
    }

    /// The link task delivered the command to the transport; from here
    /// on matching reports count as confirmation.
    pub fn mark_sent(&self) {
        if let Some(pending) = self.pending.lock().expect("pending lock").as_mut() {
            pending.sent = true;
        }
    }

    /// Absolute deadline of the in-flight command, for the link task's
    /// timeout arm.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.lock().expect("pending lock").as_ref().map(|p| p.deadline)
    }

    /// Inspect a freshly-applied delta for the confirmation signal.
    pub async fn observe_delta(&self, delta: &StateDelta) {
        match delta {
            StateDelta::Programs(programs) => self.observe_programs(*programs),
            StateDelta::Snapshot(full) => self.observe_programs(full.panel.programs),
            StateDelta::Authorization(auth) if !auth.authorized => {
                // The panel explicitly refused the operator; no point
                // waiting out the deadline. A refusal queued from before
                // the command went out is not about this command.
                let refused =
                    self.pending.lock().expect("pending lock").as_ref().is_some_and(|p| p.sent);
                if !refused {
                    return;
                }
                if let Some(pending) = self.take_pending() {
                    self.store.set_overlay(None);
                    warn!("command refused by panel authorization");
                    self.notify
                        .notify(EventKind::PinRejected, "Command refused", "PIN not authorized")
                        .await;
                    let _ = pending
                        .reply
                        .send(Err(CoreError::CommandRejected { message: "not authorized".into() }));
                }
            }
            _ => {}
        }
    }

    fn observe_programs(&self, programs: ProgramSet) {
        let mut guard = self.pending.lock().expect("pending lock");
        let confirmed = guard.as_ref().is_some_and(|p| p.sent && p.target == programs);
        if !confirmed {
            return;
        }
        let pending = guard.take();
        drop(guard);

        if let Some(pending) = pending {
            self.store.set_overlay(None);
            debug!(
                elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
                "command confirmed"
            );
            let _ = pending.reply.send(Ok(()));
        }
    }

    /// Deadline expired: revert the overlay exactly and report a timeout.
    pub fn resolve_timeout(&self) {
        if let Some(pending) = self.take_pending() {
            self.store.set_overlay(None);
            warn!(target = %pending.target, "command timed out");
            let _ = pending.reply.send(Err(CoreError::CommandTimeout));
        }
    }

    /// The transport reported an explicit rejection (e.g. bad PIN).
    pub async fn resolve_rejected(&self, message: String) {
        if let Some(pending) = self.take_pending() {
            self.store.set_overlay(None);
            warn!(message, "command rejected");
            self.notify.notify(EventKind::PinRejected, "Command rejected", &message).await;
            let _ = pending.reply.send(Err(CoreError::CommandRejected { message }));
        }
    }

    /// Fail the pending command without a notification (send error,
    /// connection torn down, shutdown).
    pub fn fail_pending(&self, error: CoreError) {
        if let Some(pending) = self.take_pending() {
            self.store.set_overlay(None);
            let _ = pending.reply.send(Err(error));
        }
    }

    fn take_pending(&self) -> Option<PendingCommand> {
        self.pending.lock().expect("pending lock").take()
    }
}
