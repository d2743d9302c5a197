// Shared transport plumbing for both panel clients.
//
// The cloud and local clients build their reqwest::Client instances
// through TransportConfig, and both expose the same PanelTransport
// contract so the reconnection layer never knows which one it drives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::session::Session;
use crate::wire::{PanelCommand, StateDelta};

/// Shared configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub cookie_jar: Option<Arc<Jar>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), cookie_jar: None }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("goldlink/", env!("CARGO_PKG_VERSION")));

        if let Some(ref jar) = self.cookie_jar {
            builder = builder.cookie_provider(Arc::clone(jar));
        }

        builder
            .build()
            .map_err(|e| Error::Connect(format!("failed to build HTTP client: {e}")))
    }

    /// Create a config with a fresh cookie jar (for the local session).
    pub fn with_cookie_jar(mut self) -> Self {
        self.cookie_jar = Some(Arc::new(Jar::default()));
        self
    }
}

/// Common contract for the two mutually-exclusive panel transports.
///
/// `run` establishes a connection for `session` and streams
/// [`StateDelta`] events into `tx` until the stream ends. A clean server
/// close returns `Ok(())`; any failure returns the error so the caller
/// can classify it (transient, auth-expired, fatal). Commands go through
/// `send_command` while a `run` is active; the transports guarantee the
/// two never race on the underlying connection.
#[async_trait]
pub trait PanelTransport: Send + Sync {
    async fn run(
        &self,
        session: &Session,
        tx: mpsc::Sender<StateDelta>,
        cancel: &CancellationToken,
    ) -> Result<(), Error>;

    async fn send_command(&self, command: &PanelCommand) -> Result<(), Error>;
}
