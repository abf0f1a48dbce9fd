//! CLI configuration for `moqx-agent`.
//!
//! Run modes:
//!   moqx-agent [--config moqx.json] server [--bind 0.0.0.0:4433]
//!   moqx-agent [--config moqx.json] client --peer 192.168.1.2:4433 --cert moqx-server.der

use std::net::SocketAddr;
use std::path::PathBuf;

// ---

use anyhow::Context;
use clap::{Parser, Subcommand};

// ---

use moqx_domain::TransportConfig;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "moqx-agent", about = "moqx QUIC transport agent")]
pub struct Config {
    // ---
    #[command(subcommand)]
    pub mode: Mode,

    /// Log at debug level (RUST_LOG still wins when set).
    #[arg(long)]
    pub debug: bool,

    /// JSON transport config. Missing fields take their defaults; flags
    /// below override the file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Sacrifice one congested flow's backlog to relieve the connection.
    #[arg(long)]
    pub reset_wait: bool,

    /// Use the loss-based congestion controller instead of BBR.
    #[arg(long)]
    pub no_bbr: bool,

    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,
}

// ---

#[derive(Debug, Subcommand)]
pub enum Mode {
    // ---
    /// Accept connections and echo everything received.
    Server {
        /// UDP address to bind the QUIC endpoint on.
        #[arg(long, default_value = "0.0.0.0:4433")]
        bind: SocketAddr,

        /// Where the self-signed certificate is written for clients.
        #[arg(long, default_value = "moqx-server.der")]
        cert_out: PathBuf,
    },

    /// Publish objects to a server and count what comes back.
    Client {
        // ---
        /// UDP address of the server.
        #[arg(long)]
        peer: SocketAddr,

        /// TLS server name; must match the server certificate.
        #[arg(long, default_value = "moqx")]
        server_name: String,

        /// Server certificate DER written by `server`.
        #[arg(long)]
        cert: PathBuf,

        #[arg(long, default_value_t = 10)]
        objects: u32,

        #[arg(long, default_value_t = 1_000)]
        object_size: usize,

        #[arg(long, default_value_t = 100)]
        interval_ms: u64,

        /// Publish over datagrams instead of streams.
        #[arg(long)]
        datagrams: bool,
    },
}

// ---

impl Config {
    // ---
    /// Transport config from the optional file, then the flags.
    pub fn transport_config(&self) -> anyhow::Result<TransportConfig> {
        // ---
        let mut cfg = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => TransportConfig::default(),
        };

        cfg.debug |= self.debug;
        cfg.use_reset_wait_strategy |= self.reset_wait;
        if self.no_bbr {
            cfg.use_bbr = false;
        }
        if let Some(ms) = self.idle_timeout_ms {
            cfg.idle_timeout_ms = ms;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn flags_override_defaults() {
        // ---
        let cfg = Config::parse_from([
            "moqx-agent",
            "--reset-wait",
            "--no-bbr",
            "--idle-timeout-ms",
            "9000",
            "server",
        ]);
        let tc = cfg.transport_config().unwrap();
        assert!(tc.use_reset_wait_strategy);
        assert!(!tc.use_bbr);
        assert_eq!(tc.idle_timeout_ms, 9_000);
        assert_eq!(tc.runner_queue_size, TransportConfig::default().runner_queue_size);
    }

    #[test]
    fn file_values_apply_and_flags_win() {
        // ---
        let path = std::env::temp_dir().join(format!("moqx-agent-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "idle_timeout_ms": 1234, "metrics_interval_ms": 250 }"#).unwrap();

        let file = path.to_string_lossy().into_owned();
        let cfg = Config::parse_from(["moqx-agent", "--config", &file, "server"]);
        let tc = cfg.transport_config().unwrap();
        assert_eq!((tc.idle_timeout_ms, tc.metrics_interval_ms), (1_234, 250));

        let cfg = Config::parse_from(["moqx-agent", "--config", &file, "--idle-timeout-ms", "5", "server"]);
        let tc = cfg.transport_config().unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(tc.idle_timeout_ms, 5);
    }

    #[test]
    fn client_defaults() {
        // ---
        let cfg = Config::parse_from(["moqx-agent", "client", "--peer", "127.0.0.1:4433", "--cert", "c.der"]);
        match cfg.mode {
            Mode::Client {
                objects,
                object_size,
                datagrams,
                server_name,
                ..
            } => {
                assert_eq!((objects, object_size, datagrams), (10, 1_000, false));
                assert_eq!(server_name, "moqx");
            }
            Mode::Server { .. } => panic!("expected client mode"),
        }
    }
}
