// ── Runtime panel configuration ──
//
// These types describe *how* to reach one panel. They carry credential
// data and connection tuning, but never touch disk -- the embedding
// application constructs a `PanelOptions` and hands it in. Options are
// immutable for the lifetime of a connection; changing them means
// disconnect + reconnect.

use std::collections::HashMap;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use goldlink_api::local::{MAX_RADIO_ZONES, MAX_WIRED_ZONES};

use crate::error::CoreError;
use crate::model::{ConnectionMode, ProductFamily, Profile, Program, ProgramSet};

/// GoldCloud service defaults.
pub const DEFAULT_CLOUD_API: &str = "https://goldcloud.lince.net/api";
pub const DEFAULT_CLOUD_SOCKET: &str = "wss://goldcloud.lince.net/socket";

/// How to authenticate with a panel. Picks the transport too: the two
/// modes are mutually exclusive per device.
#[derive(Debug, Clone)]
pub enum PanelCredentials {
    /// GoldCloud account login.
    Cloud { email: String, password: SecretString },
    /// EuroNET module on the LAN.
    Local {
        host: Url,
        username: String,
        password: SecretString,
        /// Installer code for the module session. Optional: status
        /// polling works on HTTP Basic alone.
        installer_code: Option<SecretString>,
    },
}

impl PanelCredentials {
    pub fn mode(&self) -> ConnectionMode {
        match self {
            Self::Cloud { .. } => ConnectionMode::Cloud,
            Self::Local { .. } => ConnectionMode::Local,
        }
    }
}

/// Reconnection backoff tuning.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry. Default: 2s.
    pub initial_delay: Duration,
    /// Upper bound on backoff delay. Default: 300s.
    pub max_delay: Duration,
    /// A connection that survives this long resets the attempt counter.
    /// Default: 60s.
    pub stability_window: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            stability_window: Duration::from_secs(60),
        }
    }
}

/// Configuration for one panel connection.
#[derive(Debug, Clone)]
pub struct PanelOptions {
    /// Stable identifier for this panel (used in notifications and logs).
    pub device_id: String,
    pub family: ProductFamily,
    pub credentials: PanelCredentials,

    /// Configured zone counts; zones beyond these are never fetched.
    pub wired_zones: u8,
    pub radio_zones: u8,

    /// Local poll cadence (clamped to 250ms..=60s by the transport).
    pub poll_interval: Duration,

    /// Profile → program set mapping. Arming a profile missing from the
    /// map fails with [`CoreError::UnknownProfile`].
    pub profiles: HashMap<Profile, ProgramSet>,

    pub notifications_enabled: bool,
    /// Per-(device, kind) notification cooldown.
    pub notification_cooldown: Duration,

    /// How long a command may stay pending before it times out.
    pub command_timeout: Duration,

    /// HTTP request timeout.
    pub timeout: Duration,

    pub backoff: BackoffConfig,

    /// GoldCloud endpoints (cloud mode only).
    pub cloud_api_url: Url,
    pub cloud_socket_url: Url,
}

impl PanelOptions {
    /// Options for a cloud-connected panel with stock defaults.
    pub fn cloud(device_id: impl Into<String>, email: String, password: SecretString) -> Self {
        Self::with_credentials(device_id, PanelCredentials::Cloud { email, password })
    }

    /// Options for a locally-connected panel with stock defaults.
    pub fn local(
        device_id: impl Into<String>,
        host: Url,
        username: String,
        password: SecretString,
    ) -> Self {
        Self::with_credentials(
            device_id,
            PanelCredentials::Local { host, username, password, installer_code: None },
        )
    }

    fn with_credentials(device_id: impl Into<String>, credentials: PanelCredentials) -> Self {
        Self {
            device_id: device_id.into(),
            family: ProductFamily::Gold,
            credentials,
            wired_zones: MAX_WIRED_ZONES,
            radio_zones: 0,
            poll_interval: Duration::from_secs(5),
            profiles: default_profiles(),
            notifications_enabled: true,
            notification_cooldown: Duration::from_secs(15 * 60),
            command_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            cloud_api_url: Url::parse(DEFAULT_CLOUD_API).expect("default URL parses"),
            cloud_socket_url: Url::parse(DEFAULT_CLOUD_SOCKET).expect("default URL parses"),
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        self.credentials.mode()
    }

    /// Program set for a profile, if the profile is mapped.
    pub fn program_for(&self, profile: Profile) -> Option<ProgramSet> {
        self.profiles.get(&profile).copied()
    }

    /// Sanity-check the options before a connection is attempted.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.device_id.is_empty() {
            return Err(CoreError::Config { message: "device_id must not be empty".into() });
        }
        if self.wired_zones > MAX_WIRED_ZONES {
            return Err(CoreError::Config {
                message: format!("wired_zones exceeds panel maximum {MAX_WIRED_ZONES}"),
            });
        }
        if self.radio_zones > MAX_RADIO_ZONES {
            return Err(CoreError::Config {
                message: format!("radio_zones exceeds panel maximum {MAX_RADIO_ZONES}"),
            });
        }
        if self.backoff.initial_delay.is_zero() {
            return Err(CoreError::Config {
                message: "backoff initial_delay must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Stock profile mapping: home=G1, away=everything, night=G2.
/// Vacation is deliberately unmapped until configured.
pub fn default_profiles() -> HashMap<Profile, ProgramSet> {
    HashMap::from([
        (Profile::Home, ProgramSet::EMPTY.with(Program::G1)),
        (Profile::Away, ProgramSet::ALL),
        (Profile::Night, ProgramSet::EMPTY.with(Program::G2)),
    ])
}
