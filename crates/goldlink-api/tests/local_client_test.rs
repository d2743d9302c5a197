// Integration tests for `LocalClient` against a mocked EuroNET module.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{body_string, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use goldlink_api::Error;
use goldlink_api::local::{LocalClient, LocalTransport};
use goldlink_api::session::Session;
use goldlink_api::transport::{PanelTransport, TransportConfig};
use goldlink_api::wire::{Program, ProgramSet, StateDelta};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, LocalClient) {
    let server = MockServer::start().await;
    let client = LocalClient::new(
        Url::parse(&server.uri()).unwrap(),
        "admin".to_string(),
        SecretString::from("panel-password"),
        &TransportConfig::default(),
    )
    .unwrap();
    (server, client)
}

fn status_body(gstate: &str, in_state: &str) -> String {
    format!(
        "<response><dtime>29/08/2026 10:00</dtime><gstate>{gstate}</gstate>\
         <in_state>{in_state}</in_state><aview></aview></response>"
    )
}

/// `index.htm` page carrying sixteen zero XOR keys, so the encoded
/// code for "123456" is the plain char codes: 049050051052053054.
fn zero_key_page() -> &'static str {
    r#"<html><script>var arr = "0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0";</script></html>"#
}

async fn mount_status(server: &MockServer, gstate: &str, in_state: &str) {
    Mock::given(method("POST"))
        .and(path("/status.xml"))
        .and(body_string("Sta="))
        .respond_with(ResponseTemplate::new(200).set_body_string(status_body(gstate, in_state)))
        .mount(server)
        .await;
}

// ── Status fetches ──────────────────────────────────────────────────

#[tokio::test]
async fn test_fetch_status_parses_programs_and_diagnostics() {
    let (server, client) = setup().await;
    mount_status(&server, "13K", "35%0%0%0%633%712%2526%2300%1%0%").await;

    let status = client.fetch_status().await.unwrap();

    assert!(status.panel.programs.contains(Program::G1));
    assert!(status.panel.programs.contains(Program::G3));
    assert!(!status.panel.programs.contains(Program::G2));
    assert!(status.panel.diagnostics.mains_power);
    assert!((status.panel.diagnostics.battery_voltage - 13.64).abs() < 0.01);
    assert!(!status.logged_out);
}

#[tokio::test]
async fn test_fetch_wired_zones() {
    let (server, client) = setup().await;

    // zone 1 open, zone 2 excluded
    Mock::given(method("POST"))
        .and(path("/status.xml"))
        .and(body_string("Ing=0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(status_body("K", "0,1,2,0,0")))
        .mount(&server)
        .await;

    let zones = client.fetch_wired_zones(4).await.unwrap();

    assert_eq!(zones.len(), 4);
    assert!(zones[0].open);
    assert!(zones[1].excluded);
    assert!(!zones[2].open && !zones[3].open);
}

#[tokio::test]
async fn test_fetch_radio_zones_pages_through_groups() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/status.xml"))
        .and(body_string("Can=0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(status_body("K", "0,0,1,0,0,0")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/status.xml"))
        .and(body_string("Can=1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(status_body("K", "0,0,0,0,0,16")))
        .expect(1)
        .mount(&server)
        .await;

    // 15 zones span two groups of ten.
    let zones = client.fetch_radio_zones(15).await.unwrap();

    assert_eq!(zones.len(), 15);
    assert!(zones[0].open);
    assert!(zones[14].low_battery); // zone 15 = bit 4 of group 1
}

#[tokio::test]
async fn test_nologin_bounce_maps_to_session_expired() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/status.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>NoLogin</html>"))
        .mount(&server)
        .await;

    let err = client.fetch_status().await.unwrap_err();
    assert!(matches!(err, Error::SessionExpired));
}

#[tokio::test]
async fn test_http_error_maps_to_connect() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/status.xml"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client.fetch_status().await.unwrap_err();
    assert!(matches!(err, Error::Connect(_)));
    assert!(err.is_transient());
}

// ── Login ritual ────────────────────────────────────────────────────

#[tokio::test]
async fn test_login_posts_xor_encoded_code() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/index.htm"))
        .respond_with(ResponseTemplate::new(200).set_body_string(zero_key_page()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login.html"))
        .and(body_string("psw=049050051052053054"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .expect(1)
        .mount(&server)
        .await;
    mount_status(&server, "K", "").await;

    client.login(&SecretString::from("123456")).await.unwrap();
}

#[tokio::test]
async fn test_login_rejected_code() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/index.htm"))
        .respond_with(ResponseTemplate::new(200).set_body_string(zero_key_page()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .mount(&server)
        .await;
    // Still logged out after the POST: the code was wrong.
    mount_status(&server, "LK", "").await;

    let err = client.login(&SecretString::from("000000")).await.unwrap_err();
    assert!(matches!(err, Error::Authentication { .. }));
}

#[tokio::test]
async fn test_login_bounced_means_session_stolen() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/index.htm"))
        .respond_with(ResponseTemplate::new(200).set_body_string(zero_key_page()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>NoLogin</html>"))
        .mount(&server)
        .await;

    let err = client.login(&SecretString::from("123456")).await.unwrap_err();
    assert!(matches!(err, Error::SessionStolen));
    assert!(err.is_fatal());
}

// ── Commands ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_arm_sequence() {
    let (server, client) = setup().await;

    // Specific mocks first: wiremock picks the first match.
    Mock::given(method("GET"))
        .and(path("/index.htm"))
        .and(query_param("G1", "on"))
        .and(query_param("GEXT", "on"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/index.htm"))
        .respond_with(ResponseTemplate::new(200).set_body_string(zero_key_page()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/logout.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>bye</html>"))
        .expect(1)
        .mount(&server)
        .await;
    mount_status(&server, "K", "").await;

    let programs = ProgramSet::EMPTY.with(Program::G1).with(Program::GExt);
    client.arm(&SecretString::from("123456"), programs).await.unwrap();
}

#[tokio::test]
async fn test_disarm_uses_dummy_query() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/index.htm"))
        .and(query_param("dummy", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/index.htm"))
        .respond_with(ResponseTemplate::new(200).set_body_string(zero_key_page()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/logout.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>bye</html>"))
        .mount(&server)
        .await;
    mount_status(&server, "K", "").await;

    client.disarm(&SecretString::from("123456")).await.unwrap();
}

#[tokio::test]
async fn test_arm_with_wrong_pin_is_rejected() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/index.htm"))
        .respond_with(ResponseTemplate::new(200).set_body_string(zero_key_page()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .mount(&server)
        .await;
    mount_status(&server, "L", "").await;

    let err = client
        .arm(&SecretString::from("999999"), ProgramSet::ALL)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CommandRejected { .. }));
}

#[tokio::test]
async fn test_reboot() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/protect/reboot.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string("rebooting"))
        .expect(1)
        .mount(&server)
        .await;

    client.reboot().await.unwrap();
}

// ── Polling transport ───────────────────────────────────────────────

#[tokio::test]
async fn test_isolated_malformed_polls_are_skipped() {
    let (server, client) = setup().await;

    // The first two polls come back truncated; the third is healthy.
    Mock::given(method("POST"))
        .and(path("/status.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>truncated"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_status(&server, "1K", "").await;

    let transport = LocalTransport::new(Arc::new(client), 0, 0, Duration::from_millis(250));
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { transport.run(&Session::local(), tx, &cancel).await })
    };

    let delta = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no delta within the deadline")
        .expect("delta channel closed");
    assert!(matches!(delta, StateDelta::Snapshot(_)));

    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_persistent_malformed_polls_tear_down() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/status.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>truncated"))
        .mount(&server)
        .await;

    let transport = LocalTransport::new(Arc::new(client), 0, 0, Duration::from_millis(250));
    let (tx, _rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        transport.run(&Session::local(), tx, &cancel),
    )
    .await
    .expect("run did not end")
    .unwrap_err();
    assert!(matches!(err, Error::MalformedResponse { .. }));
}
