use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use transport::{Channel, Session, Settings, State, Subscriber, TlsConfig, DEFAULT_PCP_PORT};

use crate::envelope::{Envelope, EnvelopeOptions};
use crate::{identity, ClientError, Result};

/// Client type used when none is given.
pub const DEFAULT_CLIENT_TYPE: &str = "pcptool";

/// Where and as what a [`Client`] connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub server: String,
    pub port: u16,
    pub client_type: String,
}

impl ClientOptions {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port: DEFAULT_PCP_PORT,
            client_type: DEFAULT_CLIENT_TYPE.to_string(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn client_type(mut self, client_type: impl Into<String>) -> Self {
        self.client_type = client_type.into();
        self
    }

    /// `wss://<server>:<port>/pcp2/<client-type>`
    pub fn url(&self) -> String {
        format!(
            "wss://{}:{}/pcp2/{}",
            self.server, self.port, self.client_type
        )
    }
}

enum Inbound {
    Message(String),
    Closed,
}

/// The channel subscriber feeding the inbox.
struct Inbox(Sender<Inbound>);

impl Subscriber for Inbox {
    fn on_message(&self, payload: &str) {
        let _ = self.0.send(Inbound::Message(payload.to_string()));
    }

    fn on_close(&self) {
        let _ = self.0.send(Inbound::Closed);
    }
}

/// PCP client
///
/// Sends envelopes to a broker and queues everything the broker sends back
/// until [`Client::receive`] picks it up. Replies are not matched to
/// requests; compare [`Envelope::in_reply_to`] with the id returned by
/// [`Client::send`].
pub struct Client {
    identity: String,
    options: ClientOptions,
    settings: Settings,
    channel: Channel,
    inbox_tx: Sender<Inbound>,
    inbox: Receiver<Inbound>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("identity", &self.identity)
            .field("options", &self.options)
            .field("channel", &self.channel)
            .finish()
    }
}

impl Client {
    /// Creates a client for `server:port`.
    ///
    /// `tls` must carry a client certificate; its subject common name
    /// becomes part of the client's identity.
    pub fn new(
        server: impl Into<String>,
        client_type: impl Into<String>,
        port: u16,
        tls: TlsConfig,
        settings: Settings,
    ) -> Result<Self> {
        let options = ClientOptions::new(server)
            .port(port)
            .client_type(client_type);
        Self::with_options(options, tls, settings)
    }

    pub fn with_options(options: ClientOptions, tls: TlsConfig, settings: Settings) -> Result<Self> {
        let identity = settings.in_scope(|| {
            let certificate = tls.certificate().ok_or_else(|| {
                ClientError::Identity("the TLS configuration has no client certificate".into())
            })?;
            identity::derive(certificate, &options.client_type).inspect_err(|error| {
                tracing::error!(%error, "could not derive client identity");
            })
        })?;

        let session = Session::new(
            options.server.clone(),
            options.port,
            Some(tls),
            settings.clone(),
        )?;
        let channel = Channel::new(session, options.url());

        let (inbox_tx, inbox) = crossbeam_channel::unbounded();
        channel.subscribe(Inbox(inbox_tx.clone()));

        Ok(Self {
            identity,
            options,
            settings,
            channel,
            inbox_tx,
            inbox,
        })
    }

    /// `pcp://<common-name>/<client-type>`
    pub fn id(&self) -> &str {
        &self.identity
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn state(&self) -> State {
        self.channel.state()
    }

    /// First background failure of the underlying connection, if any.
    pub fn fault(&self) -> Option<String> {
        self.channel.fault()
    }

    /// Connects to the broker. Does nothing if already connected.
    ///
    /// Messages left over from a previous connection are discarded.
    pub fn connect(&self) -> Result<()> {
        if self.channel.state() == State::Open {
            return Ok(());
        }
        self.inbox.try_iter().for_each(drop);
        self.channel.connect()?;
        self.settings
            .in_scope(|| tracing::info!(identity = %self.identity, "connected to broker"));
        Ok(())
    }

    pub fn close(&self) {
        self.channel.close();
    }

    /// A new envelope from `options`, sent by this client.
    pub fn build_message(&self, options: EnvelopeOptions) -> Envelope {
        Envelope::new(options.sender(self.identity.clone()))
    }

    /// Builds and sends an envelope. Returns what was sent so the caller can
    /// correlate replies by id.
    pub fn send(&self, options: EnvelopeOptions) -> Result<Envelope> {
        let envelope = self.build_message(options);
        let text = envelope.to_json()?;
        self.settings.in_scope(|| {
            tracing::debug!(id = envelope.id(), message_type = envelope.message_type(), "sending");
        });
        self.channel.send_text(&text)?;
        Ok(envelope)
    }

    /// Blocks until an envelope arrives.
    ///
    /// Fails with [`ClientError::Closed`] once the connection has ended and
    /// the inbox is empty.
    pub fn receive(&self) -> Result<Envelope> {
        match self.inbox.recv() {
            Ok(inbound) => self.unpack(inbound),
            Err(_) => Err(ClientError::Closed),
        }
    }

    /// Like [`Client::receive`], but gives up after `timeout` and returns
    /// `Ok(None)`.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Envelope>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(inbound) => self.unpack(inbound).map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Closed),
        }
    }

    fn unpack(&self, inbound: Inbound) -> Result<Envelope> {
        match inbound {
            Inbound::Message(payload) => Envelope::from_json(&payload).inspect_err(|error| {
                self.settings.in_scope(|| {
                    tracing::error!(
                        hostname = %self.options.server,
                        port = self.options.port,
                        %error,
                        "received a payload that is not an envelope"
                    )
                });
            }),
            Inbound::Closed => {
                // every later receive sees the end too
                let _ = self.inbox_tx.send(Inbound::Closed);
                Err(ClientError::Closed)
            }
        }
    }
}
