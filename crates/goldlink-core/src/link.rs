// ── Link controller ──
//
// One link task per panel owns the session and the transport
// exclusively: connects, streams deltas into the store, executes
// commands, and reconnects with exponential backoff. Consumers observe
// the lifecycle through a `watch<LinkState>` and never touch the
// transport directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use goldlink_api::session::{Authenticator, Session};
use goldlink_api::transport::PanelTransport;
use goldlink_api::wire::{PanelCommand, StateDelta};

use crate::config::BackoffConfig;
use crate::dispatch::CommandDispatcher;
use crate::error::CoreError;
use crate::model::ArmedState;
use crate::notify::{EventKind, NotificationPolicy};
use crate::store::PanelStore;

pub(crate) const DELTA_CHANNEL_SIZE: usize = 256;
pub(crate) const COMMAND_CHANNEL_SIZE: usize = 16;

/// Consecutive failed logins before the user is told about it.
const AUTH_FAILURE_ALERT_THRESHOLD: u32 = 2;

// ── LinkState ────────────────────────────────────────────────────────

/// Connection lifecycle observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
    },
    /// Terminal: a fatal error (stolen session) stopped the retry loop.
    Failed,
}

// ── Backoff ──────────────────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25% to spread out reconnection storms from multiple
/// panels behind the same uplink. Deterministic (sin-seeded from the
/// attempt number) so tests stay stable.
pub(crate) fn calculate_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(attempt.min(16) as i32);
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter_factor = 1.0 + 0.25 * ((f64::from(attempt) * 7.3).sin());
    Duration::from_secs_f64((capped * jitter_factor).max(0.0))
}

// ── Link task ────────────────────────────────────────────────────────

/// Everything the link task needs, bundled so `Panel` can hand it to
/// `tokio::spawn` in one move.
pub(crate) struct LinkContext {
    pub device_id: String,
    pub backoff: BackoffConfig,
    pub authenticator: Arc<dyn Authenticator>,
    pub transport: Arc<dyn PanelTransport>,
    pub store: Arc<PanelStore>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub notify: Arc<NotificationPolicy>,
    pub state_tx: watch::Sender<LinkState>,
    pub cancel: CancellationToken,
}

enum ConnectionEnd {
    Cancelled,
    Transport(Result<(), goldlink_api::Error>),
}

/// Main loop: authenticate → run transport → classify the end →
/// renew / back off / fail — until cancelled.
pub(crate) async fn run_link(ctx: LinkContext, mut command_rx: mpsc::Receiver<PanelCommand>) {
    let mut session: Option<Session> = None;
    let mut attempt: u32 = 0;
    let mut auth_failures: u32 = 0;
    let mut was_lost = false;

    loop {
        if ctx.cancel.is_cancelled() {
            shutdown(&ctx, session).await;
            return;
        }

        // send_replace: the state must be stored even with no subscriber,
        // so Panel::link_state() stays truthful.
        ctx.state_tx.send_replace(if attempt == 0 {
            LinkState::Connecting
        } else {
            LinkState::Reconnecting { attempt }
        });

        // ── Session (proactive renewal before every connect) ─────────
        let current = match session.take() {
            Some(s) if !s.is_expired() => s,
            stale => {
                let result = match stale {
                    Some(ref old) => ctx.authenticator.renew(old).await,
                    None => ctx.authenticator.authenticate().await,
                };
                match result {
                    Ok(s) => {
                        auth_failures = 0;
                        s
                    }
                    Err(e) if e.is_fatal() => {
                        fail(&ctx, &e).await;
                        return;
                    }
                    Err(e) => {
                        auth_failures += 1;
                        warn!(
                            device = %ctx.device_id,
                            error = %e,
                            consecutive = auth_failures,
                            "login failed"
                        );
                        if auth_failures >= AUTH_FAILURE_ALERT_THRESHOLD {
                            ctx.notify
                                .notify(
                                    EventKind::ConnectionLost,
                                    "Panel authentication failing",
                                    "Repeated logins were rejected; check the credentials",
                                )
                                .await;
                        }
                        if !backoff_sleep(&ctx, attempt).await {
                            shutdown(&ctx, None).await;
                            return;
                        }
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                }
            }
        };

        // ── One connection lifetime ──────────────────────────────────
        let mut connected_at: Option<Instant> = None;

        let end = {
            let (delta_tx, mut delta_rx) = mpsc::channel(DELTA_CHANNEL_SIZE);
            let run = ctx.transport.run(&current, delta_tx, &ctx.cancel);
            tokio::pin!(run);

            loop {
                tokio::select! {
                    biased;
                    () = ctx.cancel.cancelled() => break ConnectionEnd::Cancelled,
                    result = &mut run => {
                        // Deltas queued before the failure still describe
                        // real panel state; apply them before classifying.
                        while let Ok(delta) = delta_rx.try_recv() {
                            handle_delta(&ctx, &delta).await;
                        }
                        break ConnectionEnd::Transport(result);
                    }
                    Some(delta) = delta_rx.recv() => {
                        if connected_at.is_none() {
                            connected_at = Some(Instant::now());
                            ctx.state_tx.send_replace(LinkState::Connected);
                            info!(device = %ctx.device_id, "panel link up");
                            if was_lost {
                                was_lost = false;
                                ctx.notify
                                    .notify(
                                        EventKind::ConnectionRestored,
                                        "Panel connection restored",
                                        "The panel is reachable again",
                                    )
                                    .await;
                            }
                        }
                        handle_delta(&ctx, &delta).await;
                    }
                    Some(command) = command_rx.recv() => {
                        handle_command(&ctx, &command).await;
                    }
                    () = deadline_wait(ctx.dispatcher.deadline()) => {
                        ctx.dispatcher.resolve_timeout();
                    }
                }
            }
        };

        // ── Classify the end of the connection ───────────────────────
        match end {
            ConnectionEnd::Cancelled => {
                shutdown(&ctx, Some(current)).await;
                return;
            }
            ConnectionEnd::Transport(Ok(())) => {
                // Server-side close; reconnect immediately with a fresh
                // attempt counter, like any healthy long-poll cycle.
                info!(device = %ctx.device_id, "connection ended cleanly, reconnecting");
                ctx.store.set_stale();
                session = Some(current);
                attempt = 0;
            }
            ConnectionEnd::Transport(Err(e)) if e.is_fatal() => {
                fail(&ctx, &e).await;
                return;
            }
            ConnectionEnd::Transport(Err(e)) if e.is_auth_expired() => {
                // Renew straight away -- no backoff, no attempt charge.
                info!(device = %ctx.device_id, "session rejected mid-stream, renewing");
                ctx.store.set_stale();
                match ctx.authenticator.renew(&current).await {
                    Ok(s) => {
                        auth_failures = 0;
                        session = Some(s);
                    }
                    Err(re) if re.is_fatal() => {
                        fail(&ctx, &re).await;
                        return;
                    }
                    Err(re) => {
                        warn!(device = %ctx.device_id, error = %re, "renewal failed");
                        auth_failures += 1;
                        if auth_failures >= AUTH_FAILURE_ALERT_THRESHOLD {
                            ctx.notify
                                .notify(
                                    EventKind::ConnectionLost,
                                    "Panel authentication failing",
                                    "Repeated logins were rejected; check the credentials",
                                )
                                .await;
                        }
                        if !backoff_sleep(&ctx, attempt).await {
                            shutdown(&ctx, None).await;
                            return;
                        }
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
            ConnectionEnd::Transport(Err(e)) => {
                warn!(device = %ctx.device_id, error = %e, attempt, "connection lost");
                ctx.store.set_stale();
                was_lost = true;
                ctx.notify
                    .notify(
                        EventKind::ConnectionLost,
                        "Panel connection lost",
                        "Reconnecting in the background",
                    )
                    .await;

                // A connection that stayed up past the stability window
                // earns a fresh attempt counter.
                let stable = connected_at
                    .is_some_and(|t| t.elapsed() >= ctx.backoff.stability_window);
                if stable {
                    attempt = 0;
                }

                session = Some(current);
                if !backoff_sleep(&ctx, attempt).await {
                    shutdown(&ctx, session.take()).await;
                    return;
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Apply a delta and report user-visible transitions.
async fn handle_delta(ctx: &LinkContext, delta: &StateDelta) {
    let before = ctx.store.snapshot().armed;
    ctx.store.apply(delta);
    ctx.dispatcher.observe_delta(delta).await;
    let after = ctx.store.snapshot().armed;

    if before == after {
        return;
    }
    match after {
        ArmedState::Alarm => {
            ctx.notify.notify(EventKind::AlarmTriggered, "Alarm!", "The panel is in alarm").await;
        }
        ArmedState::Armed if before != ArmedState::Unknown => {
            ctx.notify.notify(EventKind::Armed, "Panel armed", "Programs are active").await;
        }
        ArmedState::Disarmed
            if matches!(
                before,
                ArmedState::Armed | ArmedState::Disarming | ArmedState::Alarm
            ) =>
        {
            ctx.notify.notify(EventKind::Disarmed, "Panel disarmed", "All programs off").await;
        }
        _ => {}
    }
}

async fn handle_command(ctx: &LinkContext, command: &PanelCommand) {
    debug!(device = %ctx.device_id, target = %command.target(), "sending command");
    match ctx.transport.send_command(command).await {
        Ok(()) => ctx.dispatcher.mark_sent(),
        Err(goldlink_api::Error::CommandRejected { message }) => {
            ctx.dispatcher.resolve_rejected(message).await;
        }
        Err(other) => ctx.dispatcher.fail_pending(other.into()),
    }
}

/// Sleep for the pending-command deadline, or forever when none is
/// pending (another select arm will wake the loop first).
async fn deadline_wait(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Cancellable backoff sleep. Returns false when cancelled.
///
/// The pending-command deadline stays armed here too: an outage must
/// not extend a command's life past its deadline.
async fn backoff_sleep(ctx: &LinkContext, attempt: u32) -> bool {
    let delay = calculate_backoff(attempt, &ctx.backoff);
    ctx.state_tx.send_replace(LinkState::Reconnecting { attempt });
    #[allow(clippy::cast_possible_truncation)]
    {
        info!(device = %ctx.device_id, delay_ms = delay.as_millis() as u64, attempt, "waiting before reconnect");
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return false,
            () = deadline_wait(ctx.dispatcher.deadline()) => {
                ctx.dispatcher.resolve_timeout();
            }
            () = &mut sleep => return true,
        }
    }
}

/// Terminal failure: no more retries until the user reconnects.
async fn fail(ctx: &LinkContext, e: &goldlink_api::Error) {
    error!(device = %ctx.device_id, error = %e, "panel connection failed permanently");
    ctx.dispatcher.fail_pending(CoreError::from_api(e));
    ctx.store.set_stale();
    ctx.state_tx.send_replace(LinkState::Failed);
    ctx.notify
        .notify(
            EventKind::ConnectionLost,
            "Panel connection failed",
            &format!("Not retrying: {e}"),
        )
        .await;
}

/// Orderly teardown on cancellation.
async fn shutdown(ctx: &LinkContext, session: Option<Session>) {
    // An in-flight command can never confirm now.
    ctx.dispatcher.fail_pending(CoreError::CommandTimeout);
    ctx.store.set_stale();
    if let Some(session) = session {
        ctx.authenticator.invalidate(session).await;
    }
    ctx.state_tx.send_replace(LinkState::Idle);
    debug!(device = %ctx.device_id, "link task exiting");
}

impl CoreError {
    fn from_api(e: &goldlink_api::Error) -> Self {
        if e.is_fatal() {
            CoreError::SessionStolen
        } else {
            CoreError::ConnectionFailed { reason: e.to_string() }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc::Sender;

    use goldlink_api::wire::{FullState, PanelStatus, ProgramSet};

    use crate::notify::NotificationPolicy;

    // ── Backoff math ─────────────────────────────────────────────────

    #[test]
    fn backoff_increases_exponentially() {
        let config = BackoffConfig::default();

        let d0 = calculate_backoff(0, &config);
        let d1 = calculate_backoff(1, &config);
        let d2 = calculate_backoff(2, &config);

        // Each step should roughly double (within jitter bounds)
        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = BackoffConfig {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            stability_window: Duration::from_secs(60),
        };

        // With jitter factor up to 1.25, max effective is 375s.
        let d20 = calculate_backoff(20, &config);
        assert!(
            d20 <= Duration::from_secs(375),
            "delay at attempt 20 ({d20:?}) should be capped near max_delay"
        );
        assert!(d20 >= Duration::from_secs(225));
    }

    #[test]
    fn backoff_starts_at_initial_delay() {
        let config = BackoffConfig::default();
        assert_eq!(calculate_backoff(0, &config), Duration::from_secs(2));
    }

    // ── Scripted doubles ─────────────────────────────────────────────

    #[derive(Clone, Copy)]
    enum ErrKind {
        Transient,
        AuthExpired,
        Fatal,
    }

    impl ErrKind {
        fn to_error(self) -> goldlink_api::Error {
            match self {
                Self::Transient => goldlink_api::Error::Connect("scripted failure".into()),
                Self::AuthExpired => goldlink_api::Error::SessionExpired,
                Self::Fatal => goldlink_api::Error::SessionStolen,
            }
        }
    }

    enum RunScript {
        /// Fail before emitting anything.
        Fail(ErrKind),
        /// Emit deltas, then fail.
        EmitThenFail(Vec<StateDelta>, ErrKind),
        /// Emit deltas, stay up for a while, then fail.
        EmitHoldThenFail(Vec<StateDelta>, Duration, ErrKind),
        /// Emit deltas, then hold the connection until cancel.
        EmitThenHold(Vec<StateDelta>),
    }

    struct ScriptedTransport {
        runs: Mutex<VecDeque<RunScript>>,
    }

    impl ScriptedTransport {
        fn new(runs: Vec<RunScript>) -> Arc<Self> {
            Arc::new(Self { runs: Mutex::new(runs.into_iter().collect()) })
        }
    }

    #[async_trait]
    impl PanelTransport for ScriptedTransport {
        async fn run(
            &self,
            _session: &Session,
            tx: Sender<StateDelta>,
            cancel: &CancellationToken,
        ) -> Result<(), goldlink_api::Error> {
            let script = self.runs.lock().unwrap().pop_front();
            let Some(script) = script else {
                // Script exhausted: hold the connection open.
                cancel.cancelled().await;
                return Ok(());
            };
            match script {
                RunScript::Fail(kind) => Err(kind.to_error()),
                RunScript::EmitThenFail(deltas, kind) => {
                    for delta in deltas {
                        let _ = tx.send(delta).await;
                    }
                    Err(kind.to_error())
                }
                RunScript::EmitHoldThenFail(deltas, up_for, kind) => {
                    for delta in deltas {
                        let _ = tx.send(delta).await;
                    }
                    tokio::time::sleep(up_for).await;
                    Err(kind.to_error())
                }
                RunScript::EmitThenHold(deltas) => {
                    for delta in deltas {
                        let _ = tx.send(delta).await;
                    }
                    cancel.cancelled().await;
                    Ok(())
                }
            }
        }

        async fn send_command(&self, _command: &PanelCommand) -> Result<(), goldlink_api::Error> {
            Ok(())
        }
    }

    struct ScriptedAuth {
        failures: Mutex<VecDeque<ErrKind>>,
        authenticate_calls: Mutex<u32>,
        renew_calls: Mutex<u32>,
    }

    impl ScriptedAuth {
        fn ok() -> Arc<Self> {
            Self::failing(vec![])
        }

        fn failing(failures: Vec<ErrKind>) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures.into_iter().collect()),
                authenticate_calls: Mutex::new(0),
                renew_calls: Mutex::new(0),
            })
        }

        fn next(&self) -> Result<Session, goldlink_api::Error> {
            match self.failures.lock().unwrap().pop_front() {
                Some(kind) => Err(kind.to_error()),
                None => Ok(Session::local()),
            }
        }
    }

    #[async_trait]
    impl Authenticator for ScriptedAuth {
        async fn authenticate(&self) -> Result<Session, goldlink_api::Error> {
            *self.authenticate_calls.lock().unwrap() += 1;
            self.next()
        }

        async fn renew(&self, _current: &Session) -> Result<Session, goldlink_api::Error> {
            *self.renew_calls.lock().unwrap() += 1;
            self.next()
        }

        async fn invalidate(&self, _session: Session) {}
    }

    fn snapshot_delta() -> StateDelta {
        StateDelta::Snapshot(FullState {
            panel: PanelStatus { programs: ProgramSet::ALL, ..PanelStatus::default() },
            wired: vec![],
            radio: vec![],
        })
    }

    struct Harness {
        store: Arc<PanelStore>,
        dispatcher: Arc<CommandDispatcher>,
        state_rx: watch::Receiver<LinkState>,
        states: Arc<Mutex<Vec<LinkState>>>,
        cancel: CancellationToken,
        auth: Arc<ScriptedAuth>,
        _command_tx: mpsc::Sender<PanelCommand>,
    }

    fn spawn_link(transport: Arc<ScriptedTransport>, auth: Arc<ScriptedAuth>) -> Harness {
        let store = Arc::new(PanelStore::new());
        let notify = Arc::new(NotificationPolicy::new(
            "panel-1".into(),
            false,
            Duration::from_secs(900),
            None,
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&notify),
            Duration::from_secs(30),
        ));
        let (state_tx, state_rx) = watch::channel(LinkState::Idle);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let cancel = CancellationToken::new();

        // Record every state the link publishes.
        let states = Arc::new(Mutex::new(Vec::new()));
        {
            let states = Arc::clone(&states);
            let mut rx = state_rx.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    states.lock().unwrap().push(rx.borrow().clone());
                }
            });
        }

        let ctx = LinkContext {
            device_id: "panel-1".into(),
            backoff: BackoffConfig {
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(300),
                stability_window: Duration::from_secs(60),
            },
            authenticator: Arc::clone(&auth) as Arc<dyn Authenticator>,
            transport,
            store: Arc::clone(&store),
            dispatcher: Arc::clone(&dispatcher),
            notify,
            state_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(run_link(ctx, command_rx));

        Harness { store, dispatcher, state_rx, states, cancel, auth, _command_tx: command_tx }
    }

    async fn wait_for(harness: &mut Harness, want: &LinkState) {
        let want = want.clone();
        tokio::time::timeout(
            Duration::from_secs(3600),
            harness.state_rx.wait_for(|s| *s == want),
        )
        .await
        .expect("state not reached")
        .expect("state channel closed");
    }

    // ── Loop behavior ────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_recover() {
        let transport = ScriptedTransport::new(vec![
            RunScript::Fail(ErrKind::Transient),
            RunScript::Fail(ErrKind::Transient),
            RunScript::EmitThenHold(vec![snapshot_delta()]),
        ]);
        let mut harness = spawn_link(transport, ScriptedAuth::ok());

        wait_for(&mut harness, &LinkState::Connected).await;

        let states = harness.states.lock().unwrap().clone();
        assert!(states.contains(&LinkState::Reconnecting { attempt: 0 }));
        assert!(states.contains(&LinkState::Reconnecting { attempt: 1 }));

        let snap = harness.store.snapshot();
        assert!(!snap.stale);
        assert_eq!(snap.programs, ProgramSet::ALL);

        harness.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_terminal() {
        let transport = ScriptedTransport::new(vec![RunScript::Fail(ErrKind::Fatal)]);
        let mut harness = spawn_link(transport, ScriptedAuth::ok());

        wait_for(&mut harness, &LinkState::Failed).await;

        // Give the loop room to (incorrectly) retry; it must not.
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(*harness.state_rx.borrow(), LinkState::Failed);
        assert_eq!(*harness.auth.authenticate_calls.lock().unwrap(), 1);
        assert!(harness.store.snapshot().stale);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_expiry_renews_without_backoff() {
        let transport = ScriptedTransport::new(vec![
            RunScript::EmitThenFail(vec![snapshot_delta()], ErrKind::AuthExpired),
            RunScript::EmitThenHold(vec![snapshot_delta()]),
        ]);
        let mut harness = spawn_link(transport, ScriptedAuth::ok());

        // Drive until the expiry + renewal + reconnect played out.
        for _ in 0..100 {
            if *harness.auth.renew_calls.lock().unwrap() == 1
                && *harness.state_rx.borrow() == LinkState::Connected
            {
                break;
            }
            tokio::time::advance(Duration::from_millis(100)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(*harness.auth.renew_calls.lock().unwrap(), 1);
        assert_eq!(*harness.state_rx.borrow(), LinkState::Connected);
        // No backoff attempt was charged for the renewal.
        let states = harness.states.lock().unwrap().clone();
        assert!(states.iter().all(|s| !matches!(s, LinkState::Reconnecting { attempt } if *attempt > 0)));

        harness.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn stability_window_resets_the_attempt_counter() {
        let transport = ScriptedTransport::new(vec![
            RunScript::Fail(ErrKind::Transient),
            RunScript::EmitHoldThenFail(
                vec![snapshot_delta()],
                Duration::from_secs(61),
                ErrKind::Transient,
            ),
            RunScript::EmitThenHold(vec![snapshot_delta()]),
        ]);
        let mut harness = spawn_link(transport, ScriptedAuth::ok());

        // Drive through both outages and the final reconnect.
        for _ in 0..300 {
            let resets = harness
                .states
                .lock()
                .unwrap()
                .iter()
                .filter(|s| **s == (LinkState::Reconnecting { attempt: 0 }))
                .count();
            if resets >= 2 && *harness.state_rx.borrow() == LinkState::Connected {
                break;
            }
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        // The long-lived connection earned a fresh counter: the second
        // outage backs off from attempt 0 again, never reaching 2.
        let states = harness.states.lock().unwrap().clone();
        let resets = states
            .iter()
            .filter(|s| **s == (LinkState::Reconnecting { attempt: 0 }))
            .count();
        assert!(resets >= 2, "states: {states:?}");
        assert!(!states.contains(&LinkState::Reconnecting { attempt: 2 }));
        assert_eq!(*harness.state_rx.borrow(), LinkState::Connected);

        harness.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn stolen_session_during_login_is_terminal() {
        let transport = ScriptedTransport::new(vec![]);
        let auth = ScriptedAuth::failing(vec![ErrKind::Fatal]);
        let mut harness = spawn_link(transport, auth);

        wait_for(&mut harness, &LinkState::Failed).await;
        assert_eq!(*harness.state_rx.borrow(), LinkState::Failed);
        // The transport was never even tried.
        assert_eq!(*harness.auth.renew_calls.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn command_deadline_holds_through_an_outage() {
        let transport = ScriptedTransport::new(vec![
            RunScript::EmitHoldThenFail(
                vec![snapshot_delta()],
                Duration::from_secs(5),
                ErrKind::Transient,
            ),
            RunScript::Fail(ErrKind::Transient),
            RunScript::Fail(ErrKind::Transient),
            RunScript::Fail(ErrKind::Transient),
            RunScript::Fail(ErrKind::Transient),
        ]);
        let mut harness = spawn_link(transport, ScriptedAuth::ok());

        wait_for(&mut harness, &LinkState::Connected).await;
        let issued = Instant::now();
        let ticket = harness.dispatcher.begin(ProgramSet::ALL).unwrap();

        // The connection drops 5s in; the 30s deadline must still fire
        // while the loop is backing off between retries.
        let outcome = ticket.outcome().await;
        assert!(matches!(outcome, Err(CoreError::CommandTimeout)));
        let waited = issued.elapsed();
        assert!(waited <= Duration::from_secs(31), "timeout resolved after {waited:?}");
        assert!(!harness.dispatcher.has_pending());
        // Overlay reverted: the cache shows the last reported programs.
        assert_eq!(harness.store.snapshot().armed, ArmedState::Armed);

        harness.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn deltas_queued_at_failure_are_still_applied() {
        let transport = ScriptedTransport::new(vec![
            RunScript::EmitThenFail(
                vec![snapshot_delta(), StateDelta::Alarm(true)],
                ErrKind::Transient,
            ),
            RunScript::EmitThenHold(vec![]),
        ]);
        let mut harness = spawn_link(transport, ScriptedAuth::ok());

        // The transport fails right after queueing its deltas; they must
        // land in the store anyway.
        wait_for(&mut harness, &LinkState::Reconnecting { attempt: 0 }).await;

        let snap = harness.store.snapshot();
        assert_eq!(snap.programs, ProgramSet::ALL);
        assert!(snap.alarm);
        assert!(snap.stale);

        harness.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_tears_down_to_idle() {
        let transport =
            ScriptedTransport::new(vec![RunScript::EmitThenHold(vec![snapshot_delta()])]);
        let mut harness = spawn_link(transport, ScriptedAuth::ok());

        wait_for(&mut harness, &LinkState::Connected).await;
        harness.cancel.cancel();
        wait_for(&mut harness, &LinkState::Idle).await;

        assert!(harness.store.snapshot().stale);
    }
}
