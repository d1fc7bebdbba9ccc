use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use pcp::{Client, ClientOptions, EnvelopeOptions, Settings, TlsConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
struct Args {
    /// Broker hostname
    #[clap(short, long)]
    server: String,

    #[clap(short, long, default_value_t = pcp::DEFAULT_PCP_PORT)]
    port: u16,

    #[clap(long, default_value = pcp::DEFAULT_CLIENT_TYPE)]
    client_type: String,

    /// CA certificate (PEM) the broker certificate must chain to
    #[clap(long)]
    cacert: PathBuf,

    /// Client certificate (PEM)
    #[clap(long)]
    cert: PathBuf,

    /// Client private key (PEM)
    #[clap(long)]
    key: PathBuf,

    /// Certificate revocation list (PEM); may be repeated
    #[clap(long)]
    crl: Vec<PathBuf>,

    /// Skip broker certificate and hostname verification
    #[clap(long)]
    insecure: bool,

    /// Seconds to wait for the connection; 0 waits forever
    #[clap(long, default_value_t = 30)]
    connect_timeout: u64,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one envelope and print replies as JSON lines
    Send {
        #[clap(short, long)]
        message_type: String,

        /// Destination URI, e.g. pcp://alice/agent
        #[clap(short, long)]
        target: Option<String>,

        /// JSON payload
        #[clap(short, long)]
        data: Option<String>,

        /// Number of envelopes to print before exiting
        #[clap(short, long, default_value_t = 0)]
        wait: usize,

        /// Seconds to wait for each envelope
        #[clap(long, default_value_t = 10)]
        receive_timeout: u64,
    },
}

fn read_pem(path: &Path) -> eyre::Result<Vec<u8>> {
    std::fs::read(path).wrap_err_with(|| format!("reading {}", path.display()))
}

fn tls_config(args: &Args) -> eyre::Result<TlsConfig> {
    let mut builder = TlsConfig::builder()
        .ca_cert_pem(read_pem(&args.cacert)?)
        .cert_pem(read_pem(&args.cert)?)
        .key_pem(read_pem(&args.key)?)
        .verify_peer(!args.insecure);
    for crl in &args.crl {
        builder = builder.crl_pem(read_pem(crl)?);
    }
    builder.build().wrap_err("building TLS configuration")
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!(?args, "parsed command line arguments");

    let tls = tls_config(&args)?;
    let settings =
        Settings::inherit().connect_timeout(Duration::from_secs(args.connect_timeout));
    let options = ClientOptions::new(args.server.clone())
        .port(args.port)
        .client_type(args.client_type.clone());
    let client = Client::with_options(options, tls, settings).wrap_err("creating client")?;

    client.connect().wrap_err("connecting to broker")?;
    tracing::info!(identity = client.id(), "connected");

    match args.command {
        Command::Send {
            message_type,
            target,
            data,
            wait,
            receive_timeout,
        } => {
            let mut message = EnvelopeOptions::new(message_type);
            if let Some(target) = target {
                message = message.target(target);
            }
            if let Some(data) = data {
                message = message.data(serde_json::from_str(&data).wrap_err("parsing --data")?);
            }
            let sent = client.send(message).wrap_err("sending envelope")?;
            tracing::info!(id = sent.id(), "sent");

            for _ in 0..wait {
                match client
                    .receive_timeout(Duration::from_secs(receive_timeout))
                    .wrap_err("receiving envelope")?
                {
                    Some(envelope) => println!("{}", envelope.to_json()?),
                    None => {
                        tracing::warn!(receive_timeout, "no envelope received in time");
                        break;
                    }
                }
            }
        }
    }

    client.close();
    Ok(())
}
