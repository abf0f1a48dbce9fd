//! moqx agent.
//!
//! Runs one transport over QUIC, either as an echo server or as a probe
//! client that publishes objects and waits for them to come back.
//!
//! Usage:
//!   moqx-agent server --bind 0.0.0.0:4433
//!   moqx-agent client --peer 192.168.1.2:4433 --cert moqx-server.der

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ---

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---

use moqx_domain::TransportConfig;
use moqx_quic::{read_cert, CertBundle, QuinnEngine};
use moqx_transport::Transport;

// ---

mod agent;
mod config;
mod delegate;

// ---

use agent::{Echo, Probe, ProbeOptions};
use config::{Config, Mode};

pub use delegate::{AgentEvent, AgentEventRx, ChannelDelegate};

/// Name the server certificate is issued for.
const SERVER_NAME: &str = "moqx";

/// How long the client waits for echoes after its last object.
const ECHO_LINGER: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    let cfg = Config::parse();
    init_tracing(cfg.debug);

    info!(version = env!("CARGO_PKG_VERSION"), "moqx-agent starting");
    let tcfg = cfg.transport_config()?;

    match cfg.mode {
        Mode::Server { bind, cert_out } => run_server(tcfg, bind, &cert_out).await,

        Mode::Client {
            peer,
            server_name,
            cert,
            objects,
            object_size,
            interval_ms,
            datagrams,
        } => {
            let opts = ProbeOptions {
                objects,
                object_size,
                datagrams,
            };
            let interval = Duration::from_millis(interval_ms.max(1));
            run_client(tcfg, peer, &server_name, &cert, opts, interval).await
        }
    }
}

fn init_tracing(debug: bool) {
    // ---
    let no_color = std::env::var("NO_COLOR").is_ok() || !std::io::IsTerminal::is_terminal(&std::io::stdout());
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(!no_color)
        .with_env_filter(filter)
        .init();
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

async fn run_server(tcfg: TransportConfig, bind: SocketAddr, cert_out: &Path) -> anyhow::Result<()> {
    // ---
    let bundle = CertBundle::generate(SERVER_NAME)?;
    bundle.write_cert(cert_out)?;
    info!("server cert written to {}", cert_out.display());

    let engine = QuinnEngine::server(bundle, bind, &tcfg)?;
    let (delegate, mut events) = ChannelDelegate::new();
    let transport = Transport::start_server(tcfg, engine, Arc::new(delegate))?;
    let mut echo = Echo::new(transport.clone());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => echo.handle(event),
                None => break,
            },
            _ = &mut ctrl_c => {
                info!("shutting down");
                break;
            }
        }
    }

    info!(echoed_bytes = echo.echoed_bytes(), "server done");
    stop(transport).await
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

async fn run_client(
    tcfg: TransportConfig,
    peer: SocketAddr,
    server_name: &str,
    cert: &Path,
    opts: ProbeOptions,
    interval: Duration,
) -> anyhow::Result<()> {
    // ---
    let engine = QuinnEngine::client(read_cert(cert)?, &tcfg)?;
    let (delegate, mut events) = ChannelDelegate::new();
    let (transport, conn) = Transport::start_client(tcfg, engine, peer, server_name, Arc::new(delegate))?;
    info!(conn_id = %conn, %peer, "connecting");

    let mut probe = Probe::new(transport.clone(), conn, opts);
    let mut tick = tokio::time::interval(interval);
    let mut give_up: Option<tokio::time::Instant> = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !probe.is_done() {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => probe.handle(event),
                None => break,
            },
            _ = tick.tick() => {
                probe.publish_next()?;
                if probe.all_published() {
                    let at = *give_up.get_or_insert_with(|| tokio::time::Instant::now() + ECHO_LINGER);
                    if tokio::time::Instant::now() >= at {
                        tracing::warn!("echoes still missing, giving up");
                        break;
                    }
                }
            },
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    let summary = probe.summary();
    info!(
        published = summary.published,
        sent_bytes = summary.sent_bytes,
        echoed_bytes = summary.echoed_bytes,
        "client done",
    );
    stop(transport).await
}

/// `Transport::stop` joins threads, so keep it off the async workers.
async fn stop(transport: Transport) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || transport.stop()).await?;
    Ok(())
}
