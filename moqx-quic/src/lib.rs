//! quinn-backed QUIC engine for the moqx transport.
//!
//! Implements [`moqx_domain::QuicEngine`] on top of the `quinn` crate.
//!
//! # Quick start
//!
//! ```ignore
//! // --- server side ---
//! use moqx_quic::{CertBundle, QuinnEngine};
//!
//! let bundle = CertBundle::generate("moqx")?;
//! bundle.write_cert("moqx-server.der".as_ref())?;
//! let engine = QuinnEngine::server(bundle, "0.0.0.0:4433".parse()?, &config)?;
//! let server = Transport::start_server(config, engine, delegate)?;
//!
//! // --- client side ---
//! let cert = moqx_quic::read_cert("moqx-server.der".as_ref())?;
//! let engine = QuinnEngine::client(cert, &config)?;
//! let (client, conn) = Transport::start_client(config, engine, peer, "moqx", delegate)?;
//! ```

mod config;
mod control;
mod engine;
mod error;
mod tasks;
mod tls;

pub use engine::QuinnEngine;
pub use error::QuicError;
pub use tls::{read_cert, CertBundle, ALPN};
