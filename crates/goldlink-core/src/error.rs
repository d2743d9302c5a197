// ── Core error types ──
//
// User-facing errors from goldlink-core. These are NOT wire-specific --
// consumers never see HTTP status codes or frame parse failures
// directly. The `From<goldlink_api::Error>` impl translates
// transport-layer errors into domain-appropriate variants.

use thiserror::Error;

use crate::model::Profile;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot reach panel: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// The single local session slot was taken by another login.
    /// Not retryable; the link goes to `Failed` on this.
    #[error("Panel session taken over by another login")]
    SessionStolen,

    #[error("Panel is disconnected")]
    Disconnected,

    // ── Command errors ───────────────────────────────────────────────
    #[error("Profile {0} has no program mapping")]
    UnknownProfile(Profile),

    #[error("PIN must be exactly 6 digits")]
    InvalidPin,

    /// A command is already pending; one at a time per panel.
    #[error("Another command is still pending")]
    NotReady,

    #[error("Command was not confirmed before the deadline")]
    CommandTimeout,

    #[error("Command rejected by panel: {message}")]
    CommandRejected { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<goldlink_api::Error> for CoreError {
    fn from(err: goldlink_api::Error) -> Self {
        match err {
            goldlink_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            goldlink_api::Error::SessionExpired => CoreError::AuthenticationFailed {
                message: "session expired -- re-authentication required".into(),
            },
            goldlink_api::Error::SessionStolen => CoreError::SessionStolen,
            goldlink_api::Error::CommandRejected { message } => {
                CoreError::CommandRejected { message }
            }
            goldlink_api::Error::NotConnected => CoreError::Disconnected,
            goldlink_api::Error::InvalidUrl(e) => {
                CoreError::Config { message: format!("invalid URL: {e}") }
            }
            other => CoreError::ConnectionFailed { reason: other.to_string() },
        }
    }
}
