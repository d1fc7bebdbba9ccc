use std::io::{self, IsTerminal};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use broker::{Broker, Mode};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;
use transport::{bindings::get_random_tcp_port, Session, Settings, State, TransportError};

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

fn settings() -> Settings {
    Settings::inherit().connect_timeout(Duration::from_secs(5))
}

/// Reads until `expected` bytes have arrived or the stream ends.
fn read_exactly(session: &Session, expected: usize) -> Vec<u8> {
    let mut received = Vec::with_capacity(expected);
    while received.len() < expected {
        match session.read() {
            Some(chunk) => received.extend_from_slice(&chunk),
            None => break,
        }
    }
    received
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Capture {
    type Writer = Capture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn refused_connection_is_reported_and_logged_once() -> eyre::Result<()> {
    let port = get_random_tcp_port()?;
    let capture = Capture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .finish();
    let settings = Settings::with_dispatch(tracing::Dispatch::new(subscriber));

    let session = Session::new("127.0.0.1", port, None, settings)?;
    let error = session.connect(Duration::from_secs(5)).unwrap_err();

    match &error {
        TransportError::Connection { source, .. } => {
            assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused)
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(error.to_string().contains(&format!("127.0.0.1:{port}")));
    assert_eq!(session.state(), State::Closed);

    let logs = capture.contents();
    assert_eq!(logs.matches("could not connect").count(), 1, "{logs}");
    let line = logs
        .lines()
        .find(|line| line.contains("could not connect"))
        .unwrap_or_default();
    assert!(line.contains("ERROR"), "{line}");
    assert!(line.contains("hostname=127.0.0.1"), "{line}");
    assert!(line.contains(&format!("port={port}")), "{line}");
    assert!(line.to_lowercase().contains("refused"), "{line}");
    Ok(())
}

#[test]
fn unresolvable_hostname() -> eyre::Result<()> {
    let session = Session::new("pcp-broker.invalid", 8142, None, settings())?;
    let error = session.connect(Duration::from_secs(5)).unwrap_err();
    assert!(
        matches!(error, TransportError::Resolution { ref hostname, .. } if hostname == "pcp-broker.invalid"),
        "{error:?}"
    );
    assert!(error.to_string().contains("could not resolve the hostname"));
    Ok(())
}

/// A listener that never accepts, with its accept queue full so further
/// connection attempts hang in the TCP handshake.
fn saturated_listener() -> eyre::Result<(TcpListener, Vec<TcpStream>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let address = listener.local_addr()?;
    let mut queued = Vec::new();
    for _ in 0..16_384 {
        match TcpStream::connect_timeout(&address, Duration::from_millis(200)) {
            Ok(stream) => queued.push(stream),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok((listener, queued)),
            Err(e) => return Err(e.into()),
        }
    }
    eyre::bail!("accept queue never filled after {} connections", queued.len())
}

#[test]
fn connect_timeout() -> eyre::Result<()> {
    let (listener, _queued) = saturated_listener()?;
    let port = listener.local_addr()?.port();

    let session = Session::new("127.0.0.1", port, None, settings())?;
    let started = Instant::now();
    let result = session.connect(Duration::from_secs(1));
    let elapsed = started.elapsed();

    match result {
        Err(TransportError::Timeout { seconds, port: p, .. }) => {
            assert_eq!(seconds, 1.0);
            assert_eq!(p, port);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(900), "took {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    assert_eq!(session.state(), State::Closed);
    Ok(())
}

#[test]
fn echo_round_trip() -> eyre::Result<()> {
    let broker = Broker::start(Mode::Echo)?;
    let session = Session::new("127.0.0.1", broker.port(), None, settings())?;
    session.connect(Duration::from_secs(5))?;
    assert_eq!(session.state(), State::Open);

    session.write(&b"hello "[..]);
    session.write(&b"from "[..]);
    session.write(&b"pcp"[..]);

    let received = read_exactly(&session, 14);
    assert_eq!(received, b"hello from pcp");

    session.close();
    assert_eq!(session.state(), State::Closed);
    Ok(())
}

#[test]
fn large_writes_arrive_complete_and_in_order() -> eyre::Result<()> {
    let broker = Broker::start(Mode::Echo)?;
    let session = Session::new("127.0.0.1", broker.port(), None, settings())?;
    session.connect(Duration::from_secs(5))?;

    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(100_000) {
        session.write(chunk.to_vec());
    }

    let received = read_exactly(&session, payload.len());
    assert_eq!(received.len(), payload.len());
    assert!(received == payload, "echoed data differs");
    Ok(())
}

#[test]
fn peer_close_ends_the_stream() -> eyre::Result<()> {
    let broker = Broker::start(Mode::Hangup(b"bye".to_vec()))?;
    let session = Session::new("127.0.0.1", broker.port(), None, settings())?;
    session.connect(Duration::from_secs(5))?;

    assert_eq!(read_exactly(&session, 3), b"bye");
    assert!(session.read().is_none());
    // end of stream is sticky
    assert!(session.read().is_none());
    assert!(session.peer_closed());
    Ok(())
}

#[test]
fn close_releases_a_blocked_reader() -> eyre::Result<()> {
    let broker = Broker::start(Mode::Echo)?;
    let session = Arc::new(Session::new(
        "127.0.0.1",
        broker.port(),
        None,
        settings(),
    )?);
    session.connect(Duration::from_secs(5))?;

    let reader = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.read())
    };
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    session.close();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(reader.join().unwrap().is_none());
    assert!(session.fault().is_none());
    Ok(())
}

#[test]
fn close_is_idempotent_and_reconnect_works() -> eyre::Result<()> {
    let broker = Broker::start(Mode::Echo)?;
    let session = Session::new("127.0.0.1", broker.port(), None, settings())?;

    session.connect(Duration::from_secs(5))?;
    // already open
    session.connect(Duration::from_secs(5))?;
    session.close();
    session.close();
    assert!(session.is_closed());

    session.write(&b"dropped"[..]);
    session.connect(Duration::from_secs(5))?;
    session.write(&b"again"[..]);
    assert_eq!(read_exactly(&session, 5), b"again");
    Ok(())
}
