//! A [`Session`] carrying framed messages.
//!
//! Once connected, a dispatcher worker pumps every chunk the session reads
//! into the framing engine, then hands each decoded message to the
//! subscribers in the order they were registered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use bytes::Bytes;
use crossbeam_channel::Receiver;

use crate::framing::{self, EngineFactory, FramingEngine, Sink};
use crate::session::{Session, State};
use crate::worker::Worker;
use crate::{with_lock, Result, Settings, TransportError};

/// Receives decoded messages from a [`Channel`].
///
/// Any `Fn(&str) + Send + Sync` closure is a subscriber.
pub trait Subscriber: Send + Sync {
    fn on_message(&self, payload: &str);

    /// Called once when the dispatcher stops: on close, on end of stream or
    /// after a fault.
    fn on_close(&self) {}
}

impl<F> Subscriber for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_message(&self, payload: &str) {
        self(payload)
    }
}

type Subscribers = Arc<RwLock<Vec<Arc<dyn Subscriber>>>>;
type Engine = Arc<Mutex<Option<Box<dyn FramingEngine>>>>;

/// Framed message channel over one [`Session`].
pub struct Channel {
    session: Arc<Session>,
    url: String,
    factory: EngineFactory,
    settings: Settings,
    open: Arc<AtomicBool>,
    engine: Engine,
    subscribers: Subscribers,
    dispatcher: Mutex<Option<Worker>>,
    fault: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("url", &self.url)
            .field("session", &self.session)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    /// A WebSocket channel to `url` over `session`.
    pub fn new(session: Session, url: impl Into<String>) -> Self {
        Self::with_engine(session, url, framing::websocket())
    }

    /// A channel using engines built by `factory`.
    pub fn with_engine(session: Session, url: impl Into<String>, factory: EngineFactory) -> Self {
        let settings = session.settings().clone();
        Self {
            session: Arc::new(session),
            url: url.into(),
            factory,
            settings,
            open: Arc::new(AtomicBool::new(false)),
            engine: Arc::new(Mutex::new(None)),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            dispatcher: Mutex::new(None),
            fault: Arc::new(Mutex::new(None)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> State {
        if self.open.load(Ordering::SeqCst) {
            State::Open
        } else {
            State::Closed
        }
    }

    /// First failure seen by the dispatcher or by the session's workers.
    pub fn fault(&self) -> Option<String> {
        with_lock("Channel.fault", &self.fault, |slot| slot.clone()).or_else(|| self.session.fault())
    }

    /// Registers a subscriber for every message decoded from now on.
    pub fn subscribe(&self, subscriber: impl Subscriber + 'static) {
        self.subscribers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Arc::new(subscriber));
    }

    /// Connects the session, starts the framing handshake and the
    /// dispatcher. Does nothing if the channel is already open.
    pub fn connect(&self) -> Result<()> {
        self.settings.in_scope(|| {
            with_lock("Channel.dispatcher", &self.dispatcher, |mut dispatcher| {
                if let Some(worker) = dispatcher.take() {
                    if self.open.load(Ordering::SeqCst) {
                        *dispatcher = Some(worker);
                        return Ok(());
                    }
                    // the previous connection ended underneath us
                    self.session.close();
                    if let Some(fault) = worker.stop(self.settings.close_timeout) {
                        tracing::debug!(%fault, "previous dispatcher");
                    }
                }
                self.session.connect(self.settings.connect_timeout)?;

                let session = Arc::clone(&self.session);
                let sink: Sink = Arc::new(move |bytes: Bytes| session.write(bytes));
                let (decoded_tx, decoded_rx) = crossbeam_channel::unbounded();

                let started = (self.factory)(sink, &self.url).and_then(|mut engine| {
                    engine.on_message(Box::new(move |message| {
                        let _ = decoded_tx.send(message);
                    }));
                    engine.start()?;
                    Ok(engine)
                });
                let engine = match started {
                    Ok(engine) => engine,
                    Err(error) => {
                        tracing::error!(url = %self.url, error = %error, "could not start framing");
                        self.session.close();
                        return Err(error);
                    }
                };

                with_lock("Channel.engine", &self.engine, |mut slot| *slot = Some(engine));
                with_lock("Channel.fault", &self.fault, |mut slot| *slot = None);
                self.open.store(true, Ordering::SeqCst);

                let pipeline = Pipeline {
                    session: Arc::clone(&self.session),
                    engine: Arc::clone(&self.engine),
                    decoded: decoded_rx,
                    subscribers: Arc::clone(&self.subscribers),
                    open: Arc::clone(&self.open),
                    fault: Arc::clone(&self.fault),
                };
                match Worker::spawn("dispatcher", &self.settings, move || pipeline.run()) {
                    Ok(worker) => *dispatcher = Some(worker),
                    Err(e) => {
                        self.open.store(false, Ordering::SeqCst);
                        with_lock("Channel.engine", &self.engine, |mut slot| *slot = None);
                        self.session.close();
                        let error = TransportError::Connection {
                            hostname: self.session.hostname().to_string(),
                            port: self.session.port(),
                            source: e,
                        };
                        tracing::error!(url = %self.url, error = %error, "could not start dispatcher");
                        return Err(error);
                    }
                }

                tracing::info!(url = %self.url, "channel open");
                Ok(())
            })
        })
    }

    /// Writes raw bytes to the session, bypassing the framing engine.
    pub fn write(&self, data: impl Into<Bytes>) {
        self.session.write(data)
    }

    /// Sends one framed text message.
    pub fn send_text(&self, data: &str) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.settings.in_scope(|| {
            with_lock("Channel.engine", &self.engine, |mut slot| match slot.as_mut() {
                Some(engine) => engine.text(data),
                None => Err(TransportError::Closed),
            })
        })
    }

    /// Closes the framing protocol, the session and the dispatcher.
    /// Idempotent.
    pub fn close(&self) {
        self.settings.in_scope(|| {
            with_lock("Channel.dispatcher", &self.dispatcher, |mut dispatcher| {
                let Some(worker) = dispatcher.take() else {
                    return;
                };

                with_lock("Channel.engine", &self.engine, |mut slot| {
                    if let Some(engine) = slot.as_mut() {
                        engine.close();
                    }
                });
                self.open.store(false, Ordering::SeqCst);
                self.session.close();

                // a subscriber closing the channel runs on the dispatcher itself
                if worker.is_current() {
                    tracing::debug!("channel closed from its own dispatcher");
                } else if let Some(fault) = worker.stop(self.settings.close_timeout) {
                    record_fault(&self.fault, fault);
                }

                with_lock("Channel.engine", &self.engine, |mut slot| *slot = None);
                tracing::info!(url = %self.url, "channel closed");
            })
        })
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

fn record_fault(slot: &Mutex<Option<String>>, fault: String) {
    with_lock("Channel.fault", slot, |mut slot| {
        if slot.is_none() {
            *slot = Some(fault);
        }
    });
}

/// Everything the dispatcher worker needs.
struct Pipeline {
    session: Arc<Session>,
    engine: Engine,
    decoded: Receiver<String>,
    subscribers: Subscribers,
    open: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<String>>>,
}

impl Pipeline {
    fn run(self) {
        while let Some(data) = self.session.read() {
            let parsed = with_lock("Channel.engine", &self.engine, |mut slot| match slot.as_mut() {
                Some(engine) => engine.parse(&data),
                None => Ok(()),
            });
            // decoded messages are published after the engine lock is released
            self.publish();

            if let Err(e) = parsed {
                tracing::warn!(error = %e, "error in dispatch loop");
                record_fault(&self.fault, e.to_string());
                break;
            }
            thread::yield_now();
        }

        if self.open.swap(false, Ordering::SeqCst) {
            if self.session.peer_closed() {
                tracing::info!("peer closed the connection");
            } else if let Some(fault) = self.session.fault() {
                tracing::warn!(%fault, "session failed");
            }
        }

        let subscribers = self.snapshot();
        for subscriber in subscribers.iter() {
            subscriber.on_close();
        }
        tracing::trace!("dispatcher exiting");
    }

    fn publish(&self) {
        for message in self.decoded.try_iter() {
            tracing::debug!(%message, "received message");
            // a snapshot lets subscribers subscribe more without deadlocking
            let subscribers = self.snapshot();
            for subscriber in subscribers.iter() {
                subscriber.on_message(&message);
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Subscriber>> {
        self.subscribers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
