//! Core types and traits for the moqx transport data plane.
//!
//! This crate defines the vocabulary of the system. The transport core,
//! the engine adapters, and the agent binary all speak these types. No
//! threads are started here.
//!
//! # Structure
//!
//! - [`error`]          : [`TransportError`] and [`Result<T>`] alias
//! - [`ids`]            : connection, flow and stream identifiers
//! - [`priority`]       : [`Priority`] (0..=127, lower is more urgent)
//! - [`clock`]          : [`Clock`] with system and manual implementations
//! - [`time_queue`]     : single-level TTL queue
//! - [`priority_queue`] : per-priority [`TimeQueue`] set
//! - [`unit`]           : [`SendUnit`], [`StreamAction`], [`EnqueueFlags`]
//! - [`buffer`]         : receive-side [`StreamBuffer`] and [`DatagramQueue`]
//! - [`metrics`]        : connection and flow counters
//! - [`config`]         : [`TransportConfig`]
//! - [`engine`]         : QUIC engine contract
//! - [`delegate`]       : application callback trait

pub mod buffer;
pub mod clock;
pub mod config;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod priority;
pub mod priority_queue;
pub mod time_queue;
pub mod unit;

// --- error
pub use error::{Result, TransportError};

// --- ids
pub use ids::{ConnId, FlowId, Role, StreamId};

// --- priority
pub use priority::Priority;

// --- clock
pub use clock::{Clock, ClockPtr, ManualClock, SystemClock};

// --- queues
pub use priority_queue::PriorityQueue;
pub use time_queue::{QueueElement, TimeQueue};

// --- unit
pub use unit::{EnqueueFlags, SendUnit, StreamAction};

// --- buffer
pub use buffer::{DatagramQueue, StreamBuffer};

// --- metrics
pub use metrics::{ConnectionMetrics, FlowMetrics, MinMaxAvg};

// --- config
pub use config::{CongestionConfig, TransportConfig};

// --- engine
pub use engine::{
    // ---
    CloseReason,
    DatagramStatus,
    EngineControl,
    EngineEvents,
    EngineWaker,
    PathQuality,
    QuicEngine,
    SendBuffer,
    VecSendBuffer,
};

// --- delegate
pub use delegate::{
    // ---
    DisconnectReason,
    StreamCloseReason,
    TransportDelegate,
    TransportDelegatePtr,
    TransportStatus,
};
