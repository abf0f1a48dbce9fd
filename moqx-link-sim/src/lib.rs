//! In-process QUIC engine for moqx testing.
//!
//! [`LinkSimEngine`] implements [`moqx_domain::QuicEngine`] over crossbeam
//! channels instead of sockets. [`LinkSimConfig`] controls injected
//! impairments:
//!
//! - Datagram drop probability
//! - Datagram duplication probability
//! - Bandwidth cap (token bucket shared by streams and datagrams)
//! - Deterministic RNG seed for reproducible runs
//!
//! Path quality is synthesised from the config and can be changed while
//! running through a [`LinkSimHandle`].
//!
//! # Quick start
//!
//! ```rust
//! use moqx_link_sim::{LinkSimConfig, LinkSimEngine};
//!
//! let (client, server) = LinkSimEngine::pair(LinkSimConfig::degraded());
//! ```

mod bucket;
mod config;
mod control;
mod engine;
mod frame;

// --- public API
pub use config::LinkSimConfig;
pub use control::LinkSimHandle;
pub use engine::LinkSimEngine;
