// EuroNET local HTTP client and polling transport.
//
// The LAN module speaks a terse HTTP dialect: panel and zone state come
// from POSTs to `status.xml` (`Sta=`, `Ing=0`, `Can=<group>`), and login
// is a XOR ritual keyed by 16 per-request values scraped from
// `index.htm`. There is no persistent connection; the transport polls at
// a configured cadence and diffs consecutive fetches into the same
// StateDelta shapes the cloud push produces.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::session::{Authenticator, Session, join_path};
use crate::transport::{PanelTransport, TransportConfig};
use crate::wire::{
    FullState, PanelCommand, PanelStatus, ProgramSet, StateDelta, ZoneKind, ZoneStatus,
};

/// Maximum wired zones a panel can carry.
pub const MAX_WIRED_ZONES: u8 = 35;
/// Maximum radio zones a panel can carry.
pub const MAX_RADIO_ZONES: u8 = 64;
/// Radio zone status is paged in groups of ten.
const RADIO_GROUP_SIZE: u8 = 10;

/// Settle delay between the PIN login and the command request -- the
/// module needs a beat to register the session before it honors
/// program changes.
const COMMAND_SETTLE: Duration = Duration::from_millis(1500);

/// Consecutive unparseable polls tolerated before the connection is
/// declared broken. An isolated truncated page is logged and skipped.
const MALFORMED_POLL_LIMIT: u32 = 5;

// ── LocalClient ──────────────────────────────────────────────────────

/// Raw HTTP client for the EuroNET module.
///
/// Handles URL construction, HTTP Basic credentials, the `NoLogin`
/// bounce pages, and the XML/bitmask payload formats. Higher layers see
/// typed state, never the wire text.
pub struct LocalClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: SecretString,
}

impl LocalClient {
    /// Create a client for the module at `base_url` (e.g.
    /// `http://192.168.1.20`). A cookie jar is added automatically --
    /// the module's session rides on a cookie.
    pub fn new(
        base_url: Url,
        username: String,
        password: SecretString,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let config = if transport.cookie_jar.is_some() {
            transport.clone()
        } else {
            transport.clone().with_cookie_jar()
        };
        let http = config.build_client()?;
        Ok(Self { http, base_url, username, password })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// POST a form body, returning the response text.
    ///
    /// A response that lands on the `NoLogin` page means the module's
    /// single session is held elsewhere (or ours lapsed) and is mapped
    /// to [`Error::SessionExpired`] so the caller can renew.
    async fn post_form(&self, endpoint: &str, body: &'static str) -> Result<String, Error> {
        let url = join_path(&self.base_url, endpoint)?;
        debug!(%url, body, "POST");

        let resp = self
            .http
            .post(url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(Error::Transport)?;

        self.read_checked(endpoint, resp).await
    }

    async fn get(&self, endpoint: &str, query: Option<&str>) -> Result<String, Error> {
        let mut url = join_path(&self.base_url, endpoint)?;
        url.set_query(query);
        debug!(%url, "GET");

        let resp = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .send()
            .await
            .map_err(Error::Transport)?;

        self.read_checked(endpoint, resp).await
    }

    async fn read_checked(
        &self,
        endpoint: &str,
        resp: reqwest::Response,
    ) -> Result<String, Error> {
        let status = resp.status();
        let bounced = resp.url().path().contains("NoLogin");

        if !status.is_success() {
            return Err(Error::Connect(format!("HTTP {status} on {endpoint}")));
        }

        let text = resp.text().await.map_err(Error::Transport)?;
        let head = text.get(..500).unwrap_or(&text);
        if bounced || head.contains("NoLogin") {
            debug!(endpoint, "request bounced to NoLogin");
            return Err(Error::SessionExpired);
        }
        Ok(text)
    }

    // ── Login ritual ─────────────────────────────────────────────────

    /// Fetch the 16 per-request XOR keys embedded in `index.htm`.
    async fn fetch_login_keys(&self) -> Result<Vec<u32>, Error> {
        // The keys rotate per request; the module occasionally serves a
        // truncated page, so retry a few times before giving up.
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            let html = match self.get("index.htm", None).await {
                Ok(html) => html,
                Err(Error::SessionExpired) => return Err(Error::SessionStolen),
                Err(e) => return Err(e),
            };
            if let Some(keys) = extract_login_keys(&html) {
                return Ok(keys);
            }
            warn!(attempt, "XOR keys missing from index.htm");
        }
        Err(Error::malformed("XOR login keys not found in index.htm"))
    }

    /// Authenticate the module session with a numeric code (user PIN or
    /// installer code).
    ///
    /// Fails with [`Error::SessionStolen`] when the single session slot
    /// is held by another login (typically a browser on the web UI) and
    /// with [`Error::Authentication`] when the code is wrong.
    pub async fn login(&self, code: &SecretString) -> Result<(), Error> {
        let keys = self.fetch_login_keys().await?;
        let encoded = encode_code(code.expose_secret(), &keys);
        let body = format!("psw={encoded}");

        let url = join_path(&self.base_url, "login.html")?;
        let resp = self
            .http
            .post(url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(Error::Transport)?;

        let bounced = resp.url().path().contains("NoLogin");
        let text = resp.text().await.map_err(Error::Transport)?;
        if bounced || text.get(..500).unwrap_or(&text).contains("NoLogin") {
            return Err(Error::SessionStolen);
        }

        // The login POST succeeds even for a wrong code; the truth is the
        // logout flag in the next status fetch.
        let status = self.fetch_status().await?;
        if status.logged_out {
            return Err(Error::Authentication { message: "access code rejected".into() });
        }

        debug!("local login successful");
        Ok(())
    }

    /// End the module session (best effort).
    pub async fn logout(&self) {
        if let Err(e) = self.post_form("logout.html", "logout=1").await {
            debug!(error = %e, "logout failed (ignored)");
        }
    }

    /// Reboot the EuroNET module. The module drops off the network for
    /// a few seconds afterwards.
    pub async fn reboot(&self) -> Result<(), Error> {
        self.get("protect/reboot.cgi", None).await?;
        warn!("EuroNET reboot issued");
        Ok(())
    }

    // ── State fetches ────────────────────────────────────────────────

    /// Fetch the aggregate panel status (`Sta=`).
    pub async fn fetch_status(&self) -> Result<LocalStatus, Error> {
        let xml = self.post_form("status.xml", "Sta=").await?;
        parse_status(&xml)
    }

    /// Fetch wired zone status for zones `1..=count` (`Ing=0`).
    pub async fn fetch_wired_zones(&self, count: u8) -> Result<Vec<ZoneStatus>, Error> {
        let count = count.min(MAX_WIRED_ZONES);
        if count == 0 {
            return Ok(Vec::new());
        }
        let xml = self.post_form("status.xml", "Ing=0").await?;
        parse_wired_zones(&xml, count)
    }

    /// Fetch radio zone status for zones `1..=count`, paging through the
    /// ten-zone groups (`Can=<group>`; group 6 holds only zones 61-64).
    pub async fn fetch_radio_zones(&self, count: u8) -> Result<Vec<ZoneStatus>, Error> {
        let count = count.min(MAX_RADIO_ZONES);
        let mut zones = Vec::with_capacity(usize::from(count));
        let groups = count.div_ceil(RADIO_GROUP_SIZE);

        for group in 0..groups {
            let body: &'static str = radio_group_body(group)?;
            let xml = self.post_form("status.xml", body).await?;
            let remaining = count - zones.len() as u8;
            let take = remaining.min(RADIO_GROUP_SIZE);
            zones.extend(parse_radio_group(&xml, take)?);
        }
        Ok(zones)
    }

    /// Fetch panel + all configured zones in one logical snapshot.
    pub async fn fetch_full_state(&self, wired: u8, radio: u8) -> Result<FullState, Error> {
        let status = self.fetch_status().await?;
        let wired = self.fetch_wired_zones(wired).await?;
        let radio = self.fetch_radio_zones(radio).await?;
        Ok(FullState { panel: status.into_panel_status(), wired, radio })
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Arm the given programs: PIN login, program query, logout.
    /// The HTTP response is the authoritative ack.
    pub async fn arm(&self, pin: &SecretString, programs: ProgramSet) -> Result<(), Error> {
        if programs.is_empty() {
            return Err(Error::CommandRejected { message: "no programs to arm".into() });
        }

        self.command_login(pin).await?;

        let query: Vec<String> =
            programs.iter().map(|p| format!("{}=on", p.query_name())).collect();
        let result = self.get("index.htm", Some(&query.join("&"))).await;

        self.logout().await;
        result.map(|_| ()).map_err(command_error)
    }

    /// Disarm all programs.
    pub async fn disarm(&self, pin: &SecretString) -> Result<(), Error> {
        self.command_login(pin).await?;
        let result = self.get("index.htm", Some("dummy=0")).await;
        self.logout().await;
        result.map(|_| ()).map_err(command_error)
    }

    async fn command_login(&self, pin: &SecretString) -> Result<(), Error> {
        match self.login(pin).await {
            Ok(()) => {}
            Err(Error::Authentication { .. }) => {
                return Err(Error::CommandRejected { message: "PIN rejected by panel".into() });
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(COMMAND_SETTLE).await;
        Ok(())
    }
}

fn command_error(e: Error) -> Error {
    match e {
        Error::SessionExpired => {
            Error::CommandRejected { message: "session lapsed mid-command".into() }
        }
        other => other,
    }
}

fn radio_group_body(group: u8) -> Result<&'static str, Error> {
    // The module wants the literal group digit; there are only seven.
    Ok(match group {
        0 => "Can=0",
        1 => "Can=1",
        2 => "Can=2",
        3 => "Can=3",
        4 => "Can=4",
        5 => "Can=5",
        6 => "Can=6",
        _ => return Err(Error::malformed(format!("radio group {group} out of range"))),
    })
}

// ── Status parsing ───────────────────────────────────────────────────

/// Parsed `Sta=` response: the aggregate panel status plus the two
/// local-only flags the transport layer needs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocalStatus {
    pub panel: PanelStatus,
    /// Service (installer) mode active.
    pub service_mode: bool,
    /// Our session is not authenticated on the module.
    pub logged_out: bool,
}

impl LocalStatus {
    fn into_panel_status(self) -> PanelStatus {
        self.panel
    }
}

/// Extract the text of a flat XML tag. The module's XML is a fixed
/// four-element document; a real parser would be more machinery than
/// the format.
fn xml_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(&xml[start..end])
}

fn parse_status(xml: &str) -> Result<LocalStatus, Error> {
    let gstate = xml_text(xml, "gstate")
        .ok_or_else(|| Error::malformed("status.xml missing <gstate>"))?;
    let in_state = xml_text(xml, "in_state").unwrap_or("");

    let mut status = LocalStatus {
        panel: PanelStatus {
            programs: ['1', '2', '3', '4']
                .into_iter()
                .zip(crate::wire::Program::ALL)
                .filter(|(digit, _)| gstate.contains(*digit))
                .map(|(_, p)| p)
                .collect(),
            ..PanelStatus::default()
        },
        service_mode: gstate.contains('S'),
        logged_out: gstate.contains('L'),
    };

    if in_state.contains('%') {
        parse_plant_state(in_state, &mut status.panel)?;
    }

    Ok(status)
}

/// Decode the `%`-separated `temp[0..=9]` word list from a `Sta=`
/// response into panel flags and diagnostics. Bit positions and analog
/// scalings are fixed by the module firmware.
fn parse_plant_state(in_state: &str, panel: &mut PanelStatus) -> Result<(), Error> {
    let temp: Vec<i64> = in_state
        .split('%')
        .filter(|p| !p.is_empty())
        .map(|p| p.trim().parse::<i64>().map_err(|_| Error::malformed("non-numeric plant word")))
        .collect::<Result<_, _>>()?;

    if temp.len() < 10 {
        return Err(Error::malformed(format!("plant state has {} words, need 10", temp.len())));
    }

    let d = &mut panel.diagnostics;
    d.mains_power = temp[0] & 1 != 0;
    d.internal_battery_ok = temp[0] & 2 != 0;
    panel.alarm = temp[0] & 4 != 0;
    panel.fault = temp[0] & 16 != 0;
    d.external_battery_ok = temp[0] & 32 != 0;
    panel.sabotage = temp[0] & 64 != 0 || temp[0] & 128 != 0 || temp[9] & 4 != 0;

    #[allow(clippy::cast_precision_loss)]
    {
        d.battery_voltage = round2(temp[4] as f64 / 46.4);
        d.firmware_release = round2(temp[5] as f64 / 100.0);
        d.bus_voltage = round2(temp[6] as f64 / 183.0);
        d.temperature = round1((temp[7] as f64 - 2000.0) / 12.0);
    }

    panel.zones_excluded = temp[9] & 1 != 0;
    panel.zones_open = temp[9] & 2 != 0;

    Ok(())
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Parse the wired-zone bitmask columns (`Ing=0`): five comma-separated
/// words -- 24h alarm, open, excluded, 24h memory, alarm memory -- where
/// bit `i` is zone `i + 1`.
fn parse_wired_zones(xml: &str, count: u8) -> Result<Vec<ZoneStatus>, Error> {
    let values = bitmask_words(xml, 5)?;
    let zones = (0..count.min(MAX_WIRED_ZONES))
        .map(|i| {
            let bit = 1u64 << i;
            ZoneStatus {
                alarm: values[0] & bit != 0,
                open: values[1] & bit != 0,
                excluded: values[2] & bit != 0,
                sabotage: values[3] & bit != 0,
                alarm_memory: values[4] & bit != 0,
                low_battery: false,
                supervision_lost: false,
            }
        })
        .collect();
    Ok(zones)
}

/// Parse one radio group (`Can=<g>`): six bitmask columns -- 24h alarm,
/// 24h memory, open, alarm memory, supervision, battery.
fn parse_radio_group(xml: &str, take: u8) -> Result<Vec<ZoneStatus>, Error> {
    let values = bitmask_words(xml, 6)?;
    let zones = (0..take.min(RADIO_GROUP_SIZE))
        .map(|i| {
            let bit = 1u64 << i;
            ZoneStatus {
                alarm: values[0] & bit != 0,
                sabotage: values[1] & bit != 0,
                open: values[2] & bit != 0,
                alarm_memory: values[3] & bit != 0,
                supervision_lost: values[4] & bit != 0,
                low_battery: values[5] & bit != 0,
                // Radio groups carry no exclusion bitmask.
                excluded: false,
            }
        })
        .collect();
    Ok(zones)
}

fn bitmask_words(xml: &str, need: usize) -> Result<Vec<u64>, Error> {
    let in_state =
        xml_text(xml, "in_state").ok_or_else(|| Error::malformed("missing <in_state>"))?;
    let values: Vec<u64> = in_state
        .trim_matches(',')
        .split(',')
        .filter(|v| !v.is_empty())
        .map(|v| v.trim().parse::<u64>().map_err(|_| Error::malformed("non-numeric bitmask")))
        .collect::<Result<_, _>>()?;
    if values.len() < need {
        return Err(Error::malformed(format!(
            "zone state has {} bitmask words, need {need}",
            values.len()
        )));
    }
    Ok(values)
}

// ── Login key extraction & code encoding ─────────────────────────────

/// Pull the 16 dynamic XOR keys out of `index.htm` (`arr = "1,2,..."`).
fn extract_login_keys(html: &str) -> Option<Vec<u32>> {
    let at = html.find("arr")?;
    let rest = &html[at..];
    let open = rest.find('"')? + 1;
    let close = rest[open..].find('"')? + open;
    let keys: Vec<u32> = rest[open..close]
        .trim_matches(',')
        .split(',')
        .filter(|k| !k.is_empty())
        .map(|k| k.trim().parse::<u32>().ok())
        .collect::<Option<_>>()?;
    (keys.len() >= 16).then(|| keys.into_iter().take(16).collect())
}

/// XOR-encode an access code for `login.html`.
///
/// Each of six positions (missing digits padded with byte `245 + i`) is
/// XORed with its key and rendered as three zero-padded decimal digits,
/// yielding an 18-character string.
fn encode_code(code: &str, keys: &[u32]) -> String {
    let bytes = code.as_bytes();
    let mut out = String::with_capacity(18);
    for i in 0..6 {
        let ch = bytes.get(i).map_or(245 + i as u32, |b| u32::from(*b));
        let xored = ch ^ keys.get(i).copied().unwrap_or(0);
        out.push_str(&format!("{xored:03}"));
    }
    out
}

// ── Diffing ──────────────────────────────────────────────────────────

/// Synthesize deltas from two consecutive full-state fetches.
///
/// `None` for the previous state (first poll of a connection) yields a
/// single [`StateDelta::Snapshot`], which fully replaces cached values.
pub fn diff_states(prev: Option<&FullState>, next: &FullState) -> Vec<StateDelta> {
    let Some(prev) = prev else {
        return vec![StateDelta::Snapshot(next.clone())];
    };

    let mut deltas = Vec::new();

    if prev.panel.programs != next.panel.programs {
        deltas.push(StateDelta::Programs(next.panel.programs));
    }
    if prev.panel.alarm != next.panel.alarm {
        deltas.push(StateDelta::Alarm(next.panel.alarm));
    }
    if prev.panel.diagnostics != next.panel.diagnostics {
        deltas.push(StateDelta::Diagnostics(next.panel.diagnostics));
    }

    diff_zones(ZoneKind::Wired, &prev.wired, &next.wired, &mut deltas);
    diff_zones(ZoneKind::Radio, &prev.radio, &next.radio, &mut deltas);

    deltas
}

fn diff_zones(
    kind: ZoneKind,
    prev: &[ZoneStatus],
    next: &[ZoneStatus],
    deltas: &mut Vec<StateDelta>,
) {
    for (i, status) in next.iter().enumerate() {
        if prev.get(i) != Some(status) {
            #[allow(clippy::cast_possible_truncation)]
            deltas.push(StateDelta::Zone { kind, number: i as u8 + 1, status: *status });
        }
    }
}

// ── LocalTransport ───────────────────────────────────────────────────

/// Polling transport over a [`LocalClient`].
///
/// Drives periodic full-state fetches at the configured interval and
/// emits diff deltas; the first fetch of every `run` emits a snapshot so
/// a reconnect always fully replaces cached values.
pub struct LocalTransport {
    client: Arc<LocalClient>,
    wired_zones: u8,
    radio_zones: u8,
    poll_interval: Duration,
    last: Mutex<Option<FullState>>,
}

/// Allowed local polling cadence.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

impl LocalTransport {
    pub fn new(
        client: Arc<LocalClient>,
        wired_zones: u8,
        radio_zones: u8,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            wired_zones: wired_zones.min(MAX_WIRED_ZONES),
            radio_zones: radio_zones.min(MAX_RADIO_ZONES),
            poll_interval: poll_interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl PanelTransport for LocalTransport {
    async fn run(
        &self,
        _session: &Session,
        tx: mpsc::Sender<StateDelta>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        // Forget the previous connection's state: the first poll must
        // come back as a full snapshot.
        *self.last.lock().await = None;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut malformed_streak: u32 = 0;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let state = match self
                        .client
                        .fetch_full_state(self.wired_zones, self.radio_zones)
                        .await
                    {
                        Ok(state) => {
                            malformed_streak = 0;
                            state
                        }
                        // The module occasionally serves a truncated
                        // page; skip the tick unless it keeps happening.
                        Err(e @ Error::MalformedResponse { .. }) => {
                            malformed_streak += 1;
                            warn!(
                                error = %e,
                                streak = malformed_streak,
                                "unparseable poll from EuroNET"
                            );
                            if malformed_streak >= MALFORMED_POLL_LIMIT {
                                return Err(e);
                            }
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                    let mut last = self.last.lock().await;
                    let deltas = diff_states(last.as_ref(), &state);
                    *last = Some(state);
                    drop(last);

                    for delta in deltas {
                        if tx.send(delta).await.is_err() {
                            // Receiver gone: consumer shut down first.
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn send_command(&self, command: &PanelCommand) -> Result<(), Error> {
        let pin = SecretString::from(command.pin().as_code());
        match command {
            PanelCommand::Arm { programs, .. } => self.client.arm(&pin, *programs).await,
            PanelCommand::Disarm { .. } => self.client.disarm(&pin).await,
        }
    }
}

/// Local-mode authenticator: establishes (and re-establishes) the module
/// session, using the installer code when one is configured and falling
/// back to a plain status request otherwise.
pub struct LocalAuthenticator {
    client: Arc<LocalClient>,
    access_code: Option<SecretString>,
}

impl LocalAuthenticator {
    pub fn new(client: Arc<LocalClient>, access_code: Option<SecretString>) -> Self {
        Self { client, access_code }
    }

    async fn establish(&self) -> Result<Session, Error> {
        match &self.access_code {
            Some(code) => self.client.login(code).await?,
            None => {
                // No code configured: verify reachability + credentials.
                self.client.fetch_status().await.map_err(|e| match e {
                    Error::SessionExpired => Error::SessionStolen,
                    other => other,
                })?;
            }
        }
        Ok(Session::local())
    }
}

#[async_trait]
impl Authenticator for LocalAuthenticator {
    async fn authenticate(&self) -> Result<Session, Error> {
        self.establish().await
    }

    async fn renew(&self, _current: &Session) -> Result<Session, Error> {
        self.establish().await
    }

    async fn invalidate(&self, _session: Session) {
        self.client.logout().await;
    }
}
