use thiserror::Error;

/// Top-level error type for the `goldlink-api` crate.
///
/// Covers every failure mode across both transports: authentication,
/// session lifecycle, HTTP, WebSocket, and wire parsing. `goldlink-core`
/// maps these into user-facing diagnostics and retry decisions.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login failed (wrong credentials, account locked, etc.)
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Bearer token or local session rejected mid-stream -- a fresh
    /// login may resolve it.
    #[error("Session expired -- re-authentication required")]
    SessionExpired,

    /// The single allowed local session was taken by another login
    /// (typically a browser on the EuroNET web UI). Non-retryable:
    /// retrying would never succeed until the other session ends.
    #[error("Session taken by a concurrent login -- user intervention required")]
    SessionStolen,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Connection-level failure (retryable).
    #[error("Connection failed: {0}")]
    Connect(String),

    /// WebSocket connection or stream failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Operation needs an established connection and there is none.
    #[error("Not connected")]
    NotConnected,

    // ── Wire data ───────────────────────────────────────────────────
    /// Payload did not have the expected shape. A single occurrence is
    /// logged and the delta dropped; the connection is only torn down
    /// when these repeat beyond a threshold.
    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    // ── Commands ────────────────────────────────────────────────────
    /// The panel (or module) rejected a command outright.
    #[error("Command rejected: {message}")]
    CommandRejected { message: String },
}

impl Error {
    /// `true` if this error indicates the session is no longer valid
    /// and a re-login might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    /// `true` if this is a transient error worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Connect(_) | Self::WebSocket(_) | Self::NotConnected => true,
            Self::MalformedResponse { .. } => true,
            _ => false,
        }
    }

    /// `true` if the connection loop must stop retrying entirely.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionStolen)
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse { message: message.into() }
    }
}
