//! `notifyd` entrypoint and subcommand orchestration.

mod config;
mod daemon;
#[cfg(test)]
mod test_support;

use axum::body::Bytes;
use clap::{Parser, Subcommand};
use notify::{Dispatcher, RouteTable};
use proto::{DispatchError, Envelope, IDENTITY_KEY, Metadata, msg_id};
use tracing::info;

#[cfg(not(test))]
use std::sync::Arc;

#[cfg(not(test))]
use anyhow::Context;
#[cfg(not(test))]
use config::Config;
#[cfg(not(test))]
use notify::{PeerSpec, ProxyServer, QuicProxyClient, Registry, peer_handler};
#[cfg(not(test))]
use tokio_util::sync::CancellationToken;
#[cfg(not(test))]
use tracing::warn;
#[cfg(not(test))]
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Top-level command-line arguments.
#[derive(Parser)]
#[command(name = "notifyd")]
#[command(about = "Multiplexed notify streams to downstream peers", version = "0.1.0")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug logging to ~/.notifyd/logs/
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every configured peer and log inbound traffic
    Start,
    /// Run a demo peer that answers connect announcements with heartbeats
    Serve,
    /// Print the inbound route table
    Routes,
}

impl Commands {
    fn label(&self) -> &'static str {
        match self {
            Commands::Start => "start",
            Commands::Serve => "serve",
            Commands::Routes => "routes",
        }
    }
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>;

    if cli.debug {
        let log_dir = Config::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from(".notifyd"))
            .join("logs");
        std::fs::create_dir_all(&log_dir).ok();
        let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _file_guard = Some(guard);

        let console = fmt::layer().with_target(false).with_filter(console_filter);
        let file = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .with_filter(EnvFilter::new("debug,quinn=info,quinn_proto=info,rustls=info"));
        tracing_subscriber::registry()
            .with(console)
            .with(file)
            .init();

        info!(
            version = env!("CARGO_PKG_VERSION"),
            command = cli.command.label(),
            log_level = %cli.log_level,
            "========== notifyd session start =========="
        );
    } else {
        _file_guard = None;
        fmt()
            .with_env_filter(console_filter)
            .with_target(false)
            .init();
    }

    let config = Config::load(cli.config.as_deref()).context("loading config")?;

    match cli.command {
        Commands::Start => cmd_start(config).await,
        Commands::Serve => cmd_serve(config).await,
        Commands::Routes => {
            println!("{}", format_routes(&RouteTable::standard()));
            Ok(())
        }
    }
}

#[cfg(not(test))]
/// Connects to every configured peer and runs until a shutdown signal.
async fn cmd_start(config: Config) -> anyhow::Result<()> {
    info!("Starting notifyd");

    let peers = build_peers(&config)?;
    if peers.is_empty() {
        warn!("No peers configured, nothing will be sent or received");
    }
    let dispatcher = logging_dispatcher(RouteTable::standard())?;
    let registry = Registry::with_dispatcher(Arc::new(dispatcher), peers);

    let pid_file = daemon::PidFile::create(daemon::default_pid_path())
        .await
        .context("writing PID file")?;

    let signal = daemon::shutdown_signal().await;
    registry.shutdown().await;
    pid_file.remove().await;
    let signal = signal.context("waiting for shutdown signal")?;
    info!(signal = signal.as_str(), "notifyd stopped");
    Ok(())
}

/// Dispatcher that logs every inbound envelope on every route.
fn logging_dispatcher(routes: RouteTable) -> Result<Dispatcher, DispatchError> {
    let dispatcher = Dispatcher::new(routes);
    for (id, path) in routes.iter() {
        dispatcher.register_handler(id, move |body: Bytes| async move {
            info!(
                route = path,
                bytes = body.len(),
                "Inbound {}",
                String::from_utf8_lossy(&body)
            );
        })?;
    }
    Ok(dispatcher)
}

#[cfg(not(test))]
/// Opens a QUIC client per configured peer.
fn build_peers(config: &Config) -> anyhow::Result<Vec<PeerSpec>> {
    config
        .peers
        .iter()
        .map(|peer| {
            let ca_pem = std::fs::read(&peer.ca_cert).with_context(|| {
                format!(
                    "reading CA certificate {} for peer {}",
                    peer.ca_cert.display(),
                    peer.name
                )
            })?;
            let client =
                QuicProxyClient::from_pem(peer.socket_addr()?, peer.server_name.clone(), &ca_pem)?;
            Ok(PeerSpec::new(peer.name.clone(), Arc::new(client))
                .with_options(peer.options(&config.connection)))
        })
        .collect()
}

#[cfg(not(test))]
/// Runs the demo peer until a shutdown signal.
async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let addr = config.server.bind_addr()?;
    let handler = peer_handler(|metadata: Metadata, envelope: Envelope| async move {
        info!(
            msg_id = envelope.msg_id(),
            identity = metadata.first(IDENTITY_KEY).unwrap_or("-"),
            "Envelope from client"
        );
        demo_replies(&metadata, &envelope)
    });

    let server = match (&config.server.cert, &config.server.key) {
        (Some(cert), Some(key)) => {
            let cert_pem = std::fs::read(cert)
                .with_context(|| format!("reading certificate {}", cert.display()))?;
            let key_pem = std::fs::read(key)
                .with_context(|| format!("reading private key {}", key.display()))?;
            ProxyServer::new_with_certs(addr, &cert_pem, &key_pem, handler)?
        }
        _ => ProxyServer::new_self_signed(addr, handler)?,
    };

    if let (Some(path), Some(pem)) = (&config.server.cert_out, server.certificate_pem()) {
        std::fs::write(path, pem)
            .with_context(|| format!("writing certificate to {}", path.display()))?;
        info!("Self-signed certificate written to {}", path.display());
    }

    let cancel = CancellationToken::new();
    let accept_loop = tokio::spawn(server.run(cancel.clone()));

    let signal = daemon::shutdown_signal().await;
    cancel.cancel();
    accept_loop.await?;
    let signal = signal.context("waiting for shutdown signal")?;
    info!(signal = signal.as_str(), "Demo peer stopped");
    Ok(())
}

/// Replies the demo peer sends for `envelope`: heartbeats for a connect, nothing otherwise.
fn demo_replies(metadata: &Metadata, envelope: &Envelope) -> Vec<Envelope> {
    if !envelope.is_connect() {
        return Vec::new();
    }
    let body = serde_json::json!({
        "gid": metadata.first(IDENTITY_KEY).unwrap_or_default(),
        "status": "online",
    })
    .to_string()
    .into_bytes();

    vec![
        Envelope::new(msg_id::NODE_HEARTBEAT_RESP, body.clone()),
        Envelope::new(msg_id::WORKER_HEARTBEAT_RESP, body),
    ]
}

/// One `id  path` line per route.
fn format_routes(routes: &RouteTable) -> String {
    routes
        .iter()
        .map(|(id, path)| format!("{id:>6}  {path}"))
        .collect::<Vec<_>>()
        .join("\n")
}
