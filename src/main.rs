use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;

use peer_socks_tunnel::config::{Framing, TunnelConfig};
use peer_socks_tunnel::socks5::probe::probe;
use peer_socks_tunnel::transport::{Descriptor, PeerTransport};
use peer_socks_tunnel::transport::quic::{IrohTransport, Role};
use peer_socks_tunnel::tunnel::persistence::{DEFAULT_KEY_PATH, get_or_create_secret_key};
use peer_socks_tunnel::tunnel::session::{SessionRole, SessionSummary, TunnelSession};
use peer_socks_tunnel::utils::logging::init_logging;
use peer_socks_tunnel::utils::signaling::{print_descriptor, read_descriptor_from_stdin};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multiplexed SOCKS5 tunnel over a peer-to-peer channel", long_about = None)]
struct Args {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct TransportOpts {
    /// Wire framing of control messages (both endpoints must agree)
    #[arg(short, long, value_enum, default_value_t = Framing::Multiplexed)]
    framing: Framing,

    /// Keep the endpoint key on disk so the descriptor survives restarts
    #[arg(long)]
    persist_key: bool,

    /// Where the persisted key lives
    #[arg(long, default_value = DEFAULT_KEY_PATH)]
    key_file: PathBuf,

    /// Seconds to wait for the peer channel to open
    #[arg(long, default_value = "60")]
    connect_timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SOCKS5 side: publish an offer, accept the answer, serve clients
    Ingress {
        /// Local SOCKS5 proxy port
        #[arg(short, long, default_value = "1080")]
        port: u16,

        /// Address the SOCKS5 proxy binds to
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: IpAddr,

        /// Answer descriptor from the remote endpoint (prompted for if absent)
        #[arg(short = 'c', long)]
        peer: Option<String>,

        #[command(flatten)]
        transport: TransportOpts,
    },
    /// Run the dialing side: accept an offer, publish an answer, dial destinations
    Remote {
        /// Offer descriptor from the SOCKS5 endpoint (prompted for if absent)
        #[arg(short, long)]
        offer: Option<String>,

        /// Allow connections to loopback SOCKS ports
        #[arg(long)]
        allow_loopback: bool,

        #[command(flatten)]
        transport: TransportOpts,
    },
    /// Check that a SOCKS5 front door answers
    Probe {
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,

        #[arg(short, long, default_value = "1080")]
        port: u16,

        /// Also CONNECT to this host:port through the proxy
        #[arg(short, long)]
        target: Option<String>,
    },
}

impl TransportOpts {
    fn config(&self) -> TunnelConfig {
        TunnelConfig {
            framing: self.framing,
            connect_timeout: Duration::from_secs(self.connect_timeout),
            ..TunnelConfig::default()
        }
    }

    async fn bind(&self, role: Role, config: &TunnelConfig) -> Result<IrohTransport> {
        let secret_key = get_or_create_secret_key(self.persist_key, &self.key_file).await?;
        IrohTransport::bind(
            secret_key,
            role,
            config.connect_timeout,
            config.channel_capacity,
        )
        .await
        .context("Failed to bind iroh endpoint")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    match args.command {
        Command::Ingress {
            port,
            bind,
            peer,
            transport,
        } => run_ingress(SocketAddr::new(bind, port), peer, transport).await,
        Command::Remote {
            offer,
            allow_loopback,
            transport,
        } => run_remote(offer, allow_loopback, transport).await,
        Command::Probe { host, port, target } => run_probe(SocketAddr::new(host, port), target).await,
    }
}

async fn run_ingress(socks_addr: SocketAddr, peer: Option<String>, opts: TransportOpts) -> Result<()> {
    let config = TunnelConfig {
        socks_addr,
        ..opts.config()
    };
    config.validate()?;

    let mut transport = opts.bind(Role::Offer, &config).await?;
    print_descriptor("OFFER", &transport.create_local_descriptor()?);

    let answer = match peer {
        Some(peer) => peer.parse::<Descriptor>()?,
        None => read_descriptor_from_stdin("Paste the answer descriptor from the remote endpoint:").await?,
    };
    transport
        .accept_remote_descriptor(&answer)
        .context("Failed to accept answer descriptor")?;

    let listener = TcpListener::bind(config.socks_addr)
        .await
        .context("Failed to bind SOCKS5 server")?;
    tracing::info!(
        "SOCKS5 proxy will listen on {} once the peer channel opens",
        config.socks_addr
    );

    let channel = transport.open().await.context("Failed to open peer channel")?;
    let session = TunnelSession::new(&config, SessionRole::Ingress(listener), &channel);
    let summary = session.run(channel).await;
    report(&summary);
    Ok(())
}

async fn run_remote(offer: Option<String>, allow_loopback: bool, opts: TransportOpts) -> Result<()> {
    let config = TunnelConfig {
        allow_loopback,
        ..opts.config()
    };
    config.validate()?;

    let mut transport = opts.bind(Role::Answer, &config).await?;
    let offer = match offer {
        Some(offer) => offer.parse::<Descriptor>()?,
        None => read_descriptor_from_stdin("Paste the offer descriptor from the SOCKS5 endpoint:").await?,
    };
    transport
        .accept_remote_descriptor(&offer)
        .context("Failed to accept offer descriptor")?;
    print_descriptor("ANSWER", &transport.create_local_descriptor()?);

    let channel = transport.open().await.context("Failed to open peer channel")?;
    let session = TunnelSession::new(&config, SessionRole::Dialer, &channel);
    let summary = session.run(channel).await;
    report(&summary);
    Ok(())
}

async fn run_probe(addr: SocketAddr, target: Option<String>) -> Result<()> {
    let target = match target.as_deref() {
        Some(target) => {
            let (host, port) = target
                .rsplit_once(':')
                .context("Target must be host:port")?;
            Some((host.to_string(), port.parse::<u16>().context("Invalid target port")?))
        }
        None => None,
    };

    let outcome = probe(
        addr,
        target.as_ref().map(|(host, port)| (host.as_str(), *port)),
        Duration::from_secs(5),
    )
    .await
    .with_context(|| format!("Probe of {} failed", addr))?;

    if outcome.is_healthy() {
        println!("SOCKS5 proxy at {} is responding ({:?})", addr, outcome);
        Ok(())
    } else {
        anyhow::bail!("SOCKS5 proxy at {} is not healthy: {:?}", addr, outcome)
    }
}

fn report(summary: &SessionSummary) {
    let duration = summary
        .opened_at
        .map(|opened| summary.closed_at - opened)
        .map(|d| format!("{}s", d.num_seconds()))
        .unwrap_or_else(|| "never opened".to_string());
    println!(
        "Tunnel closed after {} ({} messages, {} discarded, {} connections force-closed)",
        duration,
        summary.messages,
        summary.discarded,
        summary.force_closed.len()
    );
}
