// ── Notification policy ──
//
// Decides *whether* a user-facing notification goes out; delivery
// itself belongs to the embedding application through `NotificationSink`.
// Every kind except AlarmTriggered is debounced by a per-(device, kind)
// cooldown so a flapping link or a retry loop cannot spam the user.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

/// What happened, from the user's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Armed,
    Disarmed,
    AlarmTriggered,
    PinRejected,
    ConnectionLost,
    ConnectionRestored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    /// Bypasses quiet hours on most delivery backends.
    Critical,
}

/// Opaque delivery request handed to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub device_id: String,
    pub kind: EventKind,
    pub title: String,
    pub body: String,
    pub priority: Priority,
}

/// Delivery backend supplied by the embedding application.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, request: NotificationRequest);
}

/// Per-panel notification gatekeeper.
pub struct NotificationPolicy {
    device_id: String,
    enabled: bool,
    cooldown: Duration,
    sink: Option<Arc<dyn NotificationSink>>,
    last_emitted: Mutex<HashMap<EventKind, Instant>>,
}

impl NotificationPolicy {
    pub fn new(
        device_id: String,
        enabled: bool,
        cooldown: Duration,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> Self {
        Self { device_id, enabled, cooldown, sink, last_emitted: Mutex::new(HashMap::new()) }
    }

    /// Emit `kind` unless disabled or still cooling down.
    /// AlarmTriggered is never suppressed by the cooldown.
    pub async fn notify(&self, kind: EventKind, title: &str, body: &str) {
        if !self.enabled {
            return;
        }

        if !self.should_emit(kind) {
            debug!(?kind, "notification suppressed by cooldown");
            return;
        }

        let request = NotificationRequest {
            device_id: self.device_id.clone(),
            kind,
            title: title.to_string(),
            body: body.to_string(),
            priority: if kind == EventKind::AlarmTriggered {
                Priority::Critical
            } else {
                Priority::Normal
            },
        };

        debug!(?kind, "notification emitted");
        if let Some(ref sink) = self.sink {
            sink.deliver(request).await;
        }
    }

    /// Cooldown check + bookkeeping. Separated for testability.
    fn should_emit(&self, kind: EventKind) -> bool {
        let now = Instant::now();
        let mut last = self.last_emitted.lock().expect("cooldown lock");

        if kind != EventKind::AlarmTriggered {
            if let Some(previous) = last.get(&kind) {
                if now.duration_since(*previous) < self.cooldown {
                    return false;
                }
            }
        }
        last.insert(kind, now);
        true
    }
}
