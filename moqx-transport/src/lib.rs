//! Connection and flow multiplexing over a QUIC engine.
//!
//! The crate turns application objects into stream and datagram writes on
//! whatever [`QuicEngine`](moqx_domain::QuicEngine) it is started with, and
//! delivers received bytes back through a
//! [`TransportDelegate`](moqx_domain::TransportDelegate).
//!
//! # Structure
//!
//! - [`transport`]  : [`Transport`] handle, the application entry points
//! - `network`      : network thread and the engine callback handler
//! - `scheduler`    : per-stream and datagram send scheduling
//! - `receive`      : stream and datagram receive path
//! - `congestion`   : periodic congestion sweep and reset-and-wait
//! - `notifier`     : delegate thread
//! - `dispatch`     : command queue into the network thread
//! - `state`        : connection and flow records
//! - [`fragment`]   : datagram fragmentation and reassembly
//!
//! # Threads
//!
//! Starting a transport spawns two named threads, `moqx-network` and
//! `moqx-notifier`. Engine callbacks run only on the first; delegate
//! callbacks only on the second.

mod congestion;
mod dispatch;
mod network;
mod notifier;
mod receive;
mod scheduler;
mod state;

pub mod fragment;
pub mod transport;

#[cfg(test)]
mod test_support;

// ---

pub use fragment::{Fragment, ReassemblyRing};
pub use transport::{SendOptions, Transport};
