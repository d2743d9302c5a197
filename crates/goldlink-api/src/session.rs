// Session lifecycle for both transports.
//
// The cloud service hands out a bearer token with an expiry and offers
// no refresh grant -- renewal is simply a fresh login. The local module
// keeps a cookie-backed session with no fixed expiry, but only allows a
// single concurrent session; see `LocalClient::login` for the stolen-
// session rule.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::Error;

/// TTL assumed when the login response carries no expiry hint.
const TOKEN_FALLBACK_TTL_MINS: i64 = 60;
/// Renewal margin subtracted from the advertised expiry, so we never
/// race the server by presenting a token in its last instants.
const TOKEN_SAFETY_SKEW_SECS: i64 = 30;

/// Which transport a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Cloud,
    Local,
}

/// An authenticated session.
///
/// Cloud sessions carry the bearer token and its (skewed) expiry. Local
/// sessions carry neither -- their credential is the cookie living in
/// the client's jar -- so `is_expired` is always false and staleness is
/// only ever discovered reactively.
pub struct Session {
    kind: SessionKind,
    token: Option<SecretString>,
    expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn cloud(token: SecretString, expires_at: DateTime<Utc>) -> Self {
        Self { kind: SessionKind::Cloud, token: Some(token), expires_at: Some(expires_at) }
    }

    pub fn local() -> Self {
        Self { kind: SessionKind::Local, token: None, expires_at: None }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Bearer token for the cloud WebSocket handshake.
    pub fn bearer(&self) -> Option<&SecretString> {
        self.token.as_ref()
    }

    /// `true` once the session should be renewed before further use.
    pub fn is_expired(&self) -> bool {
        match (self.kind, self.expires_at) {
            (SessionKind::Cloud, Some(expiry)) => Utc::now() >= expiry,
            (SessionKind::Cloud, None) => true,
            (SessionKind::Local, _) => false,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.kind)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Owns credentials and the login/renew/invalidate lifecycle for one
/// device. Exactly one authenticator exists per device; nothing else
/// ever sees the credential material.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> Result<Session, Error>;

    /// Obtain a replacement for a session that expired or was rejected.
    /// Fails with [`Error::SessionStolen`] when the local single-session
    /// slot was taken elsewhere -- callers must not retry that.
    async fn renew(&self, current: &Session) -> Result<Session, Error>;

    async fn invalidate(&self, session: Session);
}

// ── Cloud ────────────────────────────────────────────────────────────

/// Shape of the cloud login response. The expiry may arrive as an
/// ISO-8601 `expiresAt`, a JWT-style epoch `exp`, or a relative
/// `expiresIn` -- or not at all.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudLoginResponse {
    token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl CloudLoginResponse {
    fn effective_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let advertised = self
            .expires_at
            .or_else(|| self.exp.and_then(|e| DateTime::from_timestamp(e, 0)))
            .or_else(|| self.expires_in.map(|s| now + Duration::seconds(s)))
            .unwrap_or_else(|| now + Duration::minutes(TOKEN_FALLBACK_TTL_MINS));
        advertised - Duration::seconds(TOKEN_SAFETY_SKEW_SECS)
    }
}

/// Email/password login against the GoldCloud REST service.
pub struct CloudAuthenticator {
    http: reqwest::Client,
    sessions_url: Url,
    email: String,
    password: SecretString,
}

impl CloudAuthenticator {
    /// `base_url` is the API root, e.g. `https://goldcloud.example.net/api`.
    pub fn new(
        http: reqwest::Client,
        base_url: &Url,
        email: String,
        password: SecretString,
    ) -> Result<Self, Error> {
        let sessions_url = join_path(base_url, "sessions")?;
        Ok(Self { http, sessions_url, email, password })
    }

    async fn login(&self) -> Result<Session, Error> {
        debug!(url = %self.sessions_url, "cloud login");

        let body = serde_json::json!({
            "email": self.email,
            "password": self.password.expose_secret(),
        });

        let resp = self
            .http
            .post(self.sessions_url.clone())
            .json(&body)
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Authentication {
                message: format!("login failed (HTTP {status})"),
            });
        }

        let login: CloudLoginResponse = resp
            .json()
            .await
            .map_err(|e| Error::malformed(format!("login response: {e}")))?;

        let expires_at = login.effective_expiry(Utc::now());
        debug!(%expires_at, "cloud login successful");

        Ok(Session::cloud(SecretString::from(login.token), expires_at))
    }
}

#[async_trait]
impl Authenticator for CloudAuthenticator {
    async fn authenticate(&self) -> Result<Session, Error> {
        self.login().await
    }

    // The protocol has no refresh grant: renewal is a fresh login.
    async fn renew(&self, _current: &Session) -> Result<Session, Error> {
        self.login().await
    }

    async fn invalidate(&self, _session: Session) {
        // The service has no logout endpoint for bearer sessions; the
        // token simply ages out.
    }
}

/// Join a relative path onto a base URL, tolerating a missing trailing
/// slash on the base.
pub(crate) fn join_path(base: &Url, path: &str) -> Result<Url, Error> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    base.join(path).map_err(Error::InvalidUrl)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> CloudLoginResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn expiry_prefers_expires_at() {
        let now = Utc::now();
        let resp =
            response(r#"{"token":"t","expiresAt":"2026-09-01T10:00:00Z","expiresIn":5}"#);
        let expected = "2026-09-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap()
            - Duration::seconds(TOKEN_SAFETY_SKEW_SECS);
        assert_eq!(resp.effective_expiry(now), expected);
    }

    #[test]
    fn expiry_falls_back_to_epoch_then_relative() {
        let now = Utc::now();

        let resp = response(r#"{"token":"t","exp":1790000000}"#);
        let expected = DateTime::from_timestamp(1_790_000_000, 0).unwrap()
            - Duration::seconds(TOKEN_SAFETY_SKEW_SECS);
        assert_eq!(resp.effective_expiry(now), expected);

        let resp = response(r#"{"token":"t","expiresIn":600}"#);
        assert_eq!(
            resp.effective_expiry(now),
            now + Duration::seconds(600 - TOKEN_SAFETY_SKEW_SECS)
        );
    }

    #[test]
    fn expiry_defaults_to_one_hour() {
        let now = Utc::now();
        let resp = response(r#"{"token":"t"}"#);
        assert_eq!(
            resp.effective_expiry(now),
            now + Duration::minutes(TOKEN_FALLBACK_TTL_MINS)
                - Duration::seconds(TOKEN_SAFETY_SKEW_SECS)
        );
    }

    #[test]
    fn cloud_session_expiry() {
        let live = Session::cloud("tok".into(), Utc::now() + Duration::minutes(5));
        assert!(!live.is_expired());

        let stale = Session::cloud("tok".into(), Utc::now() - Duration::seconds(1));
        assert!(stale.is_expired());

        assert!(!Session::local().is_expired());
    }

    #[test]
    fn session_debug_redacts_token() {
        let session = Session::cloud("supersecret".into(), Utc::now());
        let dump = format!("{session:?}");
        assert!(!dump.contains("supersecret"));
        assert!(dump.contains("redacted"));
    }

    #[test]
    fn join_path_tolerates_missing_slash() {
        let base: Url = "https://cloud.example.net/api".parse().unwrap();
        assert_eq!(
            join_path(&base, "sessions").unwrap().as_str(),
            "https://cloud.example.net/api/sessions"
        );

        let base: Url = "https://cloud.example.net/api/".parse().unwrap();
        assert_eq!(
            join_path(&base, "sessions").unwrap().as_str(),
            "https://cloud.example.net/api/sessions"
        );
    }
}
