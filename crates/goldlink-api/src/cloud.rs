// GoldCloud WebSocket transport.
//
// One WebSocket per connection, authenticated with the session's bearer
// token on the upgrade request. The panel pushes state frames; commands
// go back over the same socket as a PIN frame followed by a program
// activation frame. Diagnostics are not pushed, so the transport also
// ticks a REST poll while the socket is up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::Error;
use crate::session::{Session, join_path};
use crate::transport::{PanelTransport, TransportConfig};
use crate::wire::{
    Diagnostics, PanelCommand, StateDelta, activation_frame, parse_cloud_frame, pin_frame,
};

/// Consecutive unparseable frames tolerated before the connection is
/// declared broken. Isolated garbage is logged and skipped.
const MALFORMED_FRAME_LIMIT: u32 = 5;

/// Cadence of the REST diagnostics poll alongside the socket.
const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;

/// Push transport over the GoldCloud WebSocket.
pub struct CloudTransport {
    ws_url: Url,
    rest_url: Url,
    http: reqwest::Client,
    writer: Mutex<Option<Arc<Mutex<WsSink>>>>,
}

impl CloudTransport {
    /// `ws_url` is the panel's socket endpoint (`wss://...`), `rest_url`
    /// the HTTP base for the diagnostics resource.
    pub fn new(ws_url: Url, rest_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self { ws_url, rest_url, http, writer: Mutex::new(None) })
    }

    async fn fetch_diagnostics(&self, session: &Session) -> Result<Diagnostics, Error> {
        let url = join_path(&self.rest_url, "diagnostics")?;
        let mut req = self.http.get(url);
        if let Some(token) = session.bearer() {
            req = req.bearer_auth(token.expose_secret());
        }

        let resp = req.send().await.map_err(Error::Transport)?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::SessionExpired);
        }
        if !resp.status().is_success() {
            return Err(Error::Connect(format!("diagnostics HTTP {}", resp.status())));
        }
        resp.json::<Diagnostics>().await.map_err(Error::Transport)
    }

    async fn connect(&self, session: &Session) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, Error> {
        info!(url = %self.ws_url, "connecting to GoldCloud socket");

        let uri: tungstenite::http::Uri = self
            .ws_url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::Connect(e.to_string()))?;

        let mut request = ClientRequestBuilder::new(uri);
        if let Some(token) = session.bearer() {
            request = request
                .with_header("Authorization", format!("Bearer {}", token.expose_secret()));
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(resp) if resp.status().as_u16() == 401 => {
                    Error::SessionExpired
                }
                other => Error::Connect(other.to_string()),
            })?;

        info!("GoldCloud socket connected");
        Ok(ws_stream)
    }
}

#[async_trait]
impl PanelTransport for CloudTransport {
    /// Read loop for a single socket lifetime.
    ///
    /// Returns `Ok(())` on a clean server close and an error otherwise;
    /// either way the write half is torn down so a queued command cannot
    /// land on a dead socket.
    async fn run(
        &self,
        session: &Session,
        tx: mpsc::Sender<StateDelta>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let ws_stream = self.connect(session).await?;
        let (write, mut read) = ws_stream.split();

        let sink = Arc::new(Mutex::new(write));
        *self.writer.lock().await = Some(Arc::clone(&sink));

        let result = async {
            let mut malformed_streak: u32 = 0;
            let mut diag_ticker = tokio::time::interval(DIAGNOSTICS_INTERVAL);
            diag_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(()),
                    frame = read.next() => {
                        match frame {
                            Some(Ok(tungstenite::Message::Text(text))) => {
                                match parse_cloud_frame(&text) {
                                    Ok(deltas) => {
                                        malformed_streak = 0;
                                        for delta in deltas {
                                            if tx.send(delta).await.is_err() {
                                                return Ok(());
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        malformed_streak += 1;
                                        warn!(
                                            error = %e,
                                            streak = malformed_streak,
                                            "unparseable frame from GoldCloud"
                                        );
                                        if malformed_streak >= MALFORMED_FRAME_LIMIT {
                                            return Err(Error::malformed(
                                                "too many consecutive unparseable frames",
                                            ));
                                        }
                                    }
                                }
                            }
                            Some(Ok(tungstenite::Message::Ping(_))) => {
                                // tungstenite answers pongs on its own
                                trace!("socket ping");
                            }
                            Some(Ok(tungstenite::Message::Close(frame))) => {
                                if let Some(ref cf) = frame {
                                    info!(code = %cf.code, reason = %cf.reason, "server close frame");
                                } else {
                                    info!("server close frame (no payload)");
                                }
                                return Ok(());
                            }
                            Some(Err(e)) => {
                                return Err(Error::WebSocket(e.to_string()));
                            }
                            None => {
                                debug!("GoldCloud stream ended");
                                return Ok(());
                            }
                            _ => {
                                // Binary, Pong, Frame -- ignore
                            }
                        }
                    }
                    _ = diag_ticker.tick() => {
                        match self.fetch_diagnostics(session).await {
                            Ok(diagnostics) => {
                                if tx.send(StateDelta::Diagnostics(diagnostics)).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) if e.is_auth_expired() => return Err(e),
                            Err(e) => {
                                // Transient REST hiccups don't kill the socket.
                                debug!(error = %e, "diagnostics poll failed");
                            }
                        }
                    }
                }
            }
        }
        .await;

        *self.writer.lock().await = None;
        result
    }

    /// Send the two-frame command sequence: PIN, then program activation
    /// (a zero mask disarms). The panel acks by pushing new state, which
    /// arrives through the read loop.
    async fn send_command(&self, command: &PanelCommand) -> Result<(), Error> {
        let Some(sink) = self.writer.lock().await.clone() else {
            return Err(Error::NotConnected);
        };
        let mut sink = sink.lock().await;

        sink.send(tungstenite::Message::Text(pin_frame(command.pin()).into()))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        sink.send(tungstenite::Message::Text(activation_frame(command.target()).into()))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        debug!(target = %command.target(), "command frames sent");
        Ok(())
    }
}
