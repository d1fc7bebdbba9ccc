use std::io::IsTerminal;
use std::net::TcpListener;
use std::time::{Duration, Instant};

use broker::pki::{Identity, Pki};
use broker::{Broker, Mode};
use tracing_subscriber::EnvFilter;
use transport::{Session, Settings, TlsConfig, TransportError};

// test suite "constructor"
#[ctor::ctor]
fn init() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    // error traces
    let _ = color_eyre::install();
}

struct Fixture {
    pki: Pki,
    client: Identity,
}

impl Fixture {
    fn new() -> eyre::Result<Self> {
        let pki = Pki::new("Test CA")?;
        let client = pki.issue("alice", &[])?;
        Ok(Self { pki, client })
    }

    fn client_tls(&self) -> TlsConfig {
        self.client_tls_builder().build().unwrap()
    }

    fn client_tls_builder(&self) -> transport::TlsConfigBuilder {
        TlsConfig::builder()
            .ca_cert_pem(self.pki.ca_pem())
            .cert_pem(self.client.cert_pem.clone())
            .key_pem(self.client.key_pem.clone())
    }

    fn broker(&self, identity: &Identity) -> eyre::Result<Broker> {
        Broker::start_with(Mode::Echo, Some(self.pki.server_config(identity, true)?))
    }
}

fn connect(port: u16, tls: TlsConfig) -> eyre::Result<(Session, transport::Result<()>)> {
    let session = Session::new("localhost", port, Some(tls), Settings::inherit())?;
    let result = session.connect(Duration::from_secs(5));
    Ok((session, result))
}

fn tls_reason(result: transport::Result<()>) -> String {
    match result {
        Err(TransportError::Tls { reason, .. }) => reason,
        other => panic!("expected a TLS error, got {other:?}"),
    }
}

#[test]
fn mutual_tls_round_trip() -> eyre::Result<()> {
    let fixture = Fixture::new()?;
    let broker = fixture.broker(&fixture.pki.issue("broker", &["localhost"])?)?;

    let (session, result) = connect(broker.port(), fixture.client_tls())?;
    result?;

    session.write(&b"over tls"[..]);
    let mut received = Vec::new();
    while received.len() < 8 {
        match session.read() {
            Some(chunk) => received.extend_from_slice(&chunk),
            None => break,
        }
    }
    assert_eq!(received, b"over tls");
    session.close();
    Ok(())
}

#[test]
fn unknown_ca_is_rejected() -> eyre::Result<()> {
    let fixture = Fixture::new()?;
    let broker = fixture.broker(&fixture.pki.issue("broker", &["localhost"])?)?;

    let other = Pki::new("Other CA")?;
    let tls = TlsConfig::builder()
        .ca_cert_pem(other.ca_pem())
        .cert_pem(fixture.client.cert_pem.clone())
        .key_pem(fixture.client.key_pem.clone())
        .build()?;

    let (session, result) = connect(broker.port(), tls)?;
    let reason = tls_reason(result);
    assert!(reason.contains("certificate verify failed"), "{reason}");
    assert!(session.is_closed());
    Ok(())
}

#[test]
fn revoked_broker_certificate_is_rejected() -> eyre::Result<()> {
    let fixture = Fixture::new()?;
    let revoked = fixture.pki.issue("broker", &["localhost"])?;
    let broker = fixture.broker(&revoked)?;

    let tls = fixture
        .client_tls_builder()
        .crl_pem(fixture.pki.crl(&[&revoked])?)
        .build()?;

    let (_session, result) = connect(broker.port(), tls)?;
    let reason = tls_reason(result);
    assert!(reason.contains("certificate verify failed"), "{reason}");
    assert!(reason.contains("revoked"), "{reason}");
    Ok(())
}

#[test]
fn crl_without_the_broker_allows_the_connection() -> eyre::Result<()> {
    let fixture = Fixture::new()?;
    let somebody_else = fixture.pki.issue("mallory", &["localhost"])?;
    let broker = fixture.broker(&fixture.pki.issue("broker", &["localhost"])?)?;

    let tls = fixture
        .client_tls_builder()
        .crl_pem(fixture.pki.crl(&[&somebody_else])?)
        .build()?;

    let (_session, result) = connect(broker.port(), tls)?;
    result?;
    Ok(())
}

#[test]
fn hostname_mismatch_is_rejected() -> eyre::Result<()> {
    let fixture = Fixture::new()?;
    let broker = fixture.broker(&fixture.pki.issue("broker", &["broker.invalid"])?)?;

    let (_session, result) = connect(broker.port(), fixture.client_tls())?;
    let reason = tls_reason(result);
    assert_eq!(
        reason,
        "hostname \"localhost\" does not match the server certificate"
    );
    Ok(())
}

#[test]
fn unverified_peer_skips_chain_and_hostname_checks() -> eyre::Result<()> {
    let fixture = Fixture::new()?;
    let identity = fixture.pki.issue("broker", &["broker.invalid"])?;
    let broker = Broker::start_with(Mode::Echo, Some(fixture.pki.server_config(&identity, false)?))?;

    let tls = TlsConfig::builder().verify_peer(false).build()?;
    let (_session, result) = connect(broker.port(), tls)?;
    result?;
    Ok(())
}

#[test]
fn plain_tcp_server_fails_the_handshake() -> eyre::Result<()> {
    let fixture = Fixture::new()?;
    let broker = Broker::start(Mode::Hangup(b"HTTP/1.1 400 Bad Request\r\n\r\n".to_vec()))?;

    let (session, result) = connect(broker.port(), fixture.client_tls())?;
    assert!(matches!(result, Err(TransportError::Tls { .. })), "{result:?}");
    assert!(session.is_closed());
    Ok(())
}

#[test]
fn large_writes_arrive_complete_over_tls() -> eyre::Result<()> {
    let fixture = Fixture::new()?;
    let broker = fixture.broker(&fixture.pki.issue("broker", &["localhost"])?)?;

    let (session, result) = connect(broker.port(), fixture.client_tls())?;
    result?;

    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(100_000) {
        session.write(chunk.to_vec());
    }

    let mut received = Vec::with_capacity(payload.len());
    while received.len() < payload.len() {
        match session.read() {
            Some(chunk) => received.extend_from_slice(&chunk),
            None => break,
        }
    }
    assert_eq!(received.len(), payload.len());
    assert!(received == payload, "echoed data differs");
    assert!(session.fault().is_none());
    session.close();
    Ok(())
}

#[test]
fn silent_peer_times_out_the_handshake() -> eyre::Result<()> {
    let fixture = Fixture::new()?;
    // the kernel completes the TCP handshake, nobody ever answers the ClientHello
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();

    let session = Session::new("127.0.0.1", port, Some(fixture.client_tls()), Settings::inherit())?;
    let started = Instant::now();
    let result = session.connect(Duration::from_secs(1));
    let elapsed = started.elapsed();

    match result {
        Err(TransportError::Timeout { seconds, .. }) => assert_eq!(seconds, 1.0),
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(900), "took {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    assert!(session.is_closed());
    Ok(())
}
