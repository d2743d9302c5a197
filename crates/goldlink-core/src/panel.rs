// ── Panel handle ──
//
// The public entry point. Wires authenticator + transport (chosen by
// the credential mode), store, dispatcher and notification policy
// together, and owns the background link task. Cheaply cloneable via
// the inner Arc.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use goldlink_api::cloud::CloudTransport;
use goldlink_api::local::{LocalAuthenticator, LocalClient, LocalTransport};
use goldlink_api::session::{Authenticator, CloudAuthenticator};
use goldlink_api::transport::{PanelTransport, TransportConfig};
use goldlink_api::wire::{PanelCommand, Pin, ProgramSet};

use crate::config::{PanelCredentials, PanelOptions};
use crate::dispatch::{CommandDispatcher, CommandTicket};
use crate::error::CoreError;
use crate::link::{COMMAND_CHANNEL_SIZE, LinkContext, LinkState, run_link};
use crate::model::{PanelSnapshot, Profile};
use crate::notify::{NotificationPolicy, NotificationSink};
use crate::store::PanelStore;

/// Handle to one alarm panel.
#[derive(Clone)]
pub struct Panel {
    inner: Arc<PanelInner>,
}

struct PanelInner {
    options: PanelOptions,
    store: Arc<PanelStore>,
    dispatcher: Arc<CommandDispatcher>,
    notify: Arc<NotificationPolicy>,
    state_tx: watch::Sender<LinkState>,
    command_tx: Mutex<Option<mpsc::Sender<PanelCommand>>>,
    cancel: CancellationToken,
    /// Child token for the current connection -- cancelled on
    /// disconnect, replaced on reconnect.
    cancel_child: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Kept for local-only extras (module reboot).
    local_client: Mutex<Option<Arc<LocalClient>>>,
}

impl Panel {
    /// Create a panel handle. Does NOT connect -- call
    /// [`connect()`](Self::connect) to start the link task.
    pub fn new(
        options: PanelOptions,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> Result<Self, CoreError> {
        options.validate()?;

        let store = Arc::new(PanelStore::new());
        let notify = Arc::new(NotificationPolicy::new(
            options.device_id.clone(),
            options.notifications_enabled,
            options.notification_cooldown,
            sink,
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&notify),
            options.command_timeout,
        ));
        let (state_tx, _) = watch::channel(LinkState::Idle);
        let cancel = CancellationToken::new();
        let cancel_child = cancel.child_token();

        Ok(Self {
            inner: Arc::new(PanelInner {
                options,
                store,
                dispatcher,
                notify,
                state_tx,
                command_tx: Mutex::new(None),
                cancel,
                cancel_child: Mutex::new(cancel_child),
                task: Mutex::new(None),
                local_client: Mutex::new(None),
            }),
        })
    }

    pub fn options(&self) -> &PanelOptions {
        &self.inner.options
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Spawn the link task for this panel. Idempotent while a task is
    /// already running.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            debug!(device = %self.inner.options.device_id, "already connected");
            return Ok(());
        }

        // Fresh child token for this connection (supports reconnect).
        let child = self.inner.cancel.child_token();
        *self.inner.cancel_child.lock().await = child.clone();

        let (authenticator, transport) = self.build_stack().await?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        *self.inner.command_tx.lock().await = Some(command_tx);

        let ctx = LinkContext {
            device_id: self.inner.options.device_id.clone(),
            backoff: self.inner.options.backoff.clone(),
            authenticator,
            transport,
            store: Arc::clone(&self.inner.store),
            dispatcher: Arc::clone(&self.inner.dispatcher),
            notify: Arc::clone(&self.inner.notify),
            state_tx: self.inner.state_tx.clone(),
            cancel: child,
        };
        *task = Some(tokio::spawn(run_link(ctx, command_rx)));

        debug!(device = %self.inner.options.device_id, "link task spawned");
        Ok(())
    }

    /// Stop the link task. The pending command (if any) resolves as
    /// timed out; cached state is kept, marked stale.
    pub async fn disconnect(&self) {
        self.inner.cancel_child.lock().await.cancel();

        if let Some(handle) = self.inner.task.lock().await.take() {
            let _ = handle.await;
        }

        *self.inner.command_tx.lock().await = None;
        *self.inner.local_client.lock().await = None;
        debug!(device = %self.inner.options.device_id, "disconnected");
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Arm the programs mapped to `profile`. Returns a ticket that
    /// resolves when the panel confirms, rejects, or the deadline hits.
    pub async fn arm(&self, profile: Profile, pin: &str) -> Result<CommandTicket, CoreError> {
        let target = self
            .inner
            .options
            .program_for(profile)
            .ok_or(CoreError::UnknownProfile(profile))?;
        let pin = Pin::parse(pin).ok_or(CoreError::InvalidPin)?;

        self.submit(PanelCommand::Arm { programs: target, pin }, target).await
    }

    /// Disarm all programs.
    pub async fn disarm(&self, pin: &str) -> Result<CommandTicket, CoreError> {
        let pin = Pin::parse(pin).ok_or(CoreError::InvalidPin)?;
        self.submit(PanelCommand::Disarm { pin }, ProgramSet::EMPTY).await
    }

    async fn submit(
        &self,
        command: PanelCommand,
        target: ProgramSet,
    ) -> Result<CommandTicket, CoreError> {
        if *self.inner.state_tx.borrow() != LinkState::Connected {
            return Err(CoreError::Disconnected);
        }
        let Some(command_tx) = self.inner.command_tx.lock().await.clone() else {
            return Err(CoreError::Disconnected);
        };

        let ticket = self.inner.dispatcher.begin(target)?;
        if command_tx.send(command).await.is_err() {
            self.inner.dispatcher.fail_pending(CoreError::Disconnected);
            return Err(CoreError::Disconnected);
        }
        Ok(ticket)
    }

    /// Reboot the EuroNET module (local mode only, needs an active
    /// connection). Not a panel command: no PIN, no pending state.
    pub async fn reboot_module(&self) -> Result<(), CoreError> {
        let client = self.inner.local_client.lock().await.clone();
        let Some(client) = client else {
            return Err(CoreError::Config {
                message: "module reboot requires an active local connection".into(),
            });
        };
        client.reboot().await.map_err(CoreError::from)
    }

    // ── State observation ────────────────────────────────────────────

    /// Current state snapshot. Never blocks.
    pub fn state(&self) -> Arc<PanelSnapshot> {
        self.inner.store.snapshot()
    }

    /// Subscribe to state snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PanelSnapshot>> {
        self.inner.store.subscribe()
    }

    /// Current link state.
    pub fn link_state(&self) -> LinkState {
        self.inner.state_tx.borrow().clone()
    }

    /// Subscribe to link state changes.
    pub fn link_states(&self) -> watch::Receiver<LinkState> {
        self.inner.state_tx.subscribe()
    }

    // ── Transport stack assembly ─────────────────────────────────────

    async fn build_stack(
        &self,
    ) -> Result<(Arc<dyn Authenticator>, Arc<dyn PanelTransport>), CoreError> {
        let options = &self.inner.options;
        let transport_config =
            TransportConfig { timeout: options.timeout, ..TransportConfig::default() };

        match &options.credentials {
            PanelCredentials::Cloud { email, password } => {
                let http = transport_config.build_client().map_err(CoreError::from)?;
                let authenticator = CloudAuthenticator::new(
                    http,
                    &options.cloud_api_url,
                    email.clone(),
                    password.clone(),
                )
                .map_err(CoreError::from)?;

                let ws_url = join_device(&options.cloud_socket_url, &options.device_id)?;
                let rest_url = join_device(&options.cloud_api_url, &options.device_id)?;
                let transport = CloudTransport::new(ws_url, rest_url, &transport_config)
                    .map_err(CoreError::from)?;

                Ok((Arc::new(authenticator), Arc::new(transport)))
            }
            PanelCredentials::Local { host, username, password, installer_code } => {
                let client = Arc::new(
                    LocalClient::new(
                        host.clone(),
                        username.clone(),
                        password.clone(),
                        &transport_config,
                    )
                    .map_err(CoreError::from)?,
                );
                *self.inner.local_client.lock().await = Some(Arc::clone(&client));

                let authenticator =
                    LocalAuthenticator::new(Arc::clone(&client), installer_code.clone());
                let transport = LocalTransport::new(
                    client,
                    options.wired_zones,
                    options.radio_zones,
                    options.poll_interval,
                );
                Ok((Arc::new(authenticator), Arc::new(transport)))
            }
        }
    }
}

fn join_device(base: &Url, device_id: &str) -> Result<Url, CoreError> {
    let mut url = base.clone();
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    url.join(device_id).map_err(|e| CoreError::Config { message: format!("invalid URL: {e}") })
}
