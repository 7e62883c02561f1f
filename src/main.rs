//! Socketace - TCP over DNS
//!
//! The client accepts local TCP connections and carries each one through its
//! own DNS tunnel session; the server answers the queries authoritatively and
//! connects every session to a fixed upstream TCP service.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use socketace::{
    relay, DnsClient, DnsServer, DnsTransport, Encoder, QueryType, TunnelConfig, TunnelStream,
    UdpTransport,
};

#[derive(Parser)]
#[command(name = "socketace")]
#[command(version, long_version = env!("SOCKETACE_LONG_VERSION"))]
#[command(about = "Tunnel TCP connections through DNS queries", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Authoritative domain of the tunnel
    #[arg(short, long, global = true)]
    domain: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept local TCP connections and tunnel them
    Client {
        /// Local bind address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// DNS resolver to send queries to
        #[arg(short, long)]
        resolver: Option<SocketAddr>,

        /// Skip query type detection
        #[arg(long)]
        query_type: Option<QueryType>,

        /// Skip upstream encoder detection
        #[arg(long)]
        upstream_encoder: Option<Encoder>,

        /// Skip downstream encoder detection
        #[arg(long)]
        downstream_encoder: Option<Encoder>,

        /// Skip downstream fragment size probing
        #[arg(long)]
        fragment_size: Option<usize>,
    },

    /// Answer tunnel queries and connect sessions upstream
    Server {
        /// UDP bind address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// TCP service sessions are connected to
        #[arg(short, long)]
        upstream: Option<SocketAddr>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let mut config = match &cli.config {
        Some(path) => TunnelConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => TunnelConfig::default(),
    };
    if let Some(domain) = cli.domain {
        config.domain = domain;
    }

    match cli.command {
        Commands::Client {
            listen,
            resolver,
            query_type,
            upstream_encoder,
            downstream_encoder,
            fragment_size,
        } => {
            let client = &mut config.client;
            if let Some(listen) = listen {
                client.listen = listen;
            }
            if let Some(resolver) = resolver {
                client.resolver = resolver;
            }
            client.query_type = query_type.or(client.query_type);
            client.upstream_encoder = upstream_encoder.or(client.upstream_encoder);
            client.downstream_encoder = downstream_encoder.or(client.downstream_encoder);
            client.fragment_size = fragment_size.or(client.fragment_size);

            config.validate().context("Invalid configuration")?;
            run_client(config).await
        }
        Commands::Server { listen, upstream } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(upstream) = upstream {
                config.server.upstream = upstream;
            }

            config.validate().context("Invalid configuration")?;
            run_server(config).await
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run_client(config: TunnelConfig) -> Result<()> {
    let client = DnsClient::new(config.client_options());
    let resolver = config.client.resolver;
    let listener = TcpListener::bind(config.client.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.client.listen))?;
    info!(
        "Tunnelling {} through {} via resolver {}",
        config.client.listen, config.domain, resolver
    );

    loop {
        let (tcp, peer) = listener.accept().await?;
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = tunnel_connection(&client, resolver, tcp).await {
                warn!("Connection from {} failed: {:#}", peer, e);
            }
        });
    }
}

async fn tunnel_connection(client: &DnsClient, resolver: SocketAddr, tcp: TcpStream) -> Result<()> {
    let transport: Arc<dyn DnsTransport> = Arc::new(
        UdpTransport::connect(resolver)
            .await
            .context("Failed to open resolver socket")?,
    );
    let conn = client
        .connect(transport)
        .await
        .context("Tunnel handshake failed")?;
    info!("Session {:?} established", conn.user_id());

    let stream: Arc<dyn TunnelStream> = Arc::new(conn);
    let (sent, received) = relay(stream, tcp).await?;
    info!("Session done: {} bytes up, {} bytes down", sent, received);
    Ok(())
}

async fn run_server(config: TunnelConfig) -> Result<()> {
    let socket = UdpSocket::bind(config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    let server = Arc::new(DnsServer::new(config.server_options()));
    let upstream = config.server.upstream;

    let mut serve = tokio::spawn(server.clone().serve_udp(socket));

    loop {
        tokio::select! {
            result = &mut serve => {
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e).context("DNS service failed"),
                    Err(e) => Err(e).context("DNS service panicked"),
                };
            }
            accepted = server.accept() => {
                let Some(conn) = accepted else {
                    return Ok(());
                };
                tokio::spawn(async move {
                    let user = conn.user_id();
                    let stream: Arc<dyn TunnelStream> = Arc::new(conn);
                    match TcpStream::connect(upstream).await {
                        Ok(tcp) => match relay(stream, tcp).await {
                            Ok((sent, received)) => {
                                info!("User {} done: {} bytes down, {} bytes up", user, sent, received)
                            }
                            Err(e) => warn!("User {} relay failed: {}", user, e),
                        },
                        Err(e) => {
                            error!("User {}: cannot reach {}: {}", user, upstream, e);
                            let _ = stream.close().await;
                        }
                    }
                });
            }
        }
    }
}
