//! Outbound dispatch: network thread ──► application delegate.
//!
//! # Design
//!
//! - A dedicated `std::thread` owns the delegate and loops on
//!   `blocking_recv` of a tokio channel.
//! - The network thread posts [`Notification`]s and never waits. Data and
//!   metrics events are admitted up to `notify_queue_size`; past that the
//!   event is dropped with a warning and `NotifierQueueFull` goes back to
//!   the caller, which only logs it.
//! - Lifecycle events ([`Notification::is_lifecycle`]) are always queued,
//!   in order with everything else. A connection's closure status and the
//!   final `Stop` are never lost to a slow delegate.
//! - [`Notification::Stop`] ends the thread. Senders may outlive the
//!   transport (the delegate can hold a transport handle), so channel
//!   closure alone cannot be relied on.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

// ---

use tokio::sync::mpsc;

// ---

use moqx_domain::{
    // ---
    ConnId,
    ConnectionMetrics,
    DisconnectReason,
    FlowId,
    FlowMetrics,
    Result,
    StreamCloseReason,
    StreamId,
    TransportDelegatePtr,
    TransportError,
    TransportStatus,
};

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Notification {
    // ---
    ConnectionStatus {
        conn: ConnId,
        status: TransportStatus,
        reason: Option<DisconnectReason>,
    },

    NewConnection {
        conn: ConnId,
        peer: SocketAddr,
    },

    NewFlow {
        conn: ConnId,
        flow: FlowId,
    },

    RecvReady {
        conn: ConnId,
        stream: Option<StreamId>,
        flow: Option<FlowId>,
    },

    StreamClosed {
        conn: ConnId,
        stream: StreamId,
        reason: StreamCloseReason,
    },

    // --- periodic -----------------------------------------------------------
    ConnectionMetrics {
        conn: ConnId,
        metrics: ConnectionMetrics,
    },

    FlowMetrics {
        conn: ConnId,
        flow: FlowId,
        metrics: FlowMetrics,
    },

    Stop,
}

impl Notification {
    /// Connection announcements, status changes and `Stop`. These bypass
    /// the queue bound.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Notification::ConnectionStatus { .. } | Notification::NewConnection { .. } | Notification::Stop
        )
    }
}

// ---------------------------------------------------------------------------
// NotifierTx / NotifierRx
// ---------------------------------------------------------------------------

/// Cheap-clone sender handle used by the network thread.
#[derive(Debug, Clone)]
pub(crate) struct NotifierTx {
    // ---
    tx: mpsc::UnboundedSender<Notification>,
    pending: Arc<AtomicUsize>,
    capacity: usize,
}

/// Receiving half; releases a queue slot per event taken.
#[derive(Debug)]
pub(crate) struct NotifierRx {
    // ---
    rx: mpsc::UnboundedReceiver<Notification>,
    pending: Arc<AtomicUsize>,
}

impl NotifierTx {
    // ---
    pub fn channel(capacity: usize) -> (Self, NotifierRx) {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let sender = Self {
            tx,
            pending: pending.clone(),
            capacity: capacity.max(1),
        };
        (sender, NotifierRx { rx, pending })
    }

    pub fn post(&self, event: Notification) -> Result<()> {
        // ---
        if event.is_lifecycle() {
            self.pending.fetch_add(1, Ordering::AcqRel);
        } else {
            let capacity = self.capacity;
            let admitted = self
                .pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < capacity).then_some(n + 1))
                .is_ok();
            if !admitted {
                tracing::warn!(?event, "notifier queue full, dropping event");
                return Err(TransportError::NotifierQueueFull);
            }
        }

        self.tx.send(event).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            TransportError::NotRunning
        })
    }

    /// Events posted but not yet delivered.
    pub fn backlog(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl NotifierRx {
    // ---
    pub fn blocking_recv(&mut self) -> Option<Notification> {
        let event = self.rx.blocking_recv()?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(event)
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        let event = self.rx.try_recv().ok()?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(event)
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

pub(crate) struct Notifier {
    // ---
    rx: NotifierRx,
    delegate: TransportDelegatePtr,
}

impl Notifier {
    // ---
    /// Spawn the notifier thread over an existing channel.
    pub fn spawn(
        rx: NotifierRx,
        delegate: TransportDelegatePtr,
    ) -> Result<JoinHandle<()>> {
        // ---
        let notifier = Notifier { rx, delegate };

        let handle = std::thread::Builder::new()
            .name("moqx-notifier".into())
            .spawn(move || notifier.run())?;

        Ok(handle)
    }

    fn run(mut self) {
        // ---
        while let Some(event) = self.rx.blocking_recv() {
            if event == Notification::Stop {
                tracing::debug!("notifier stopping");
                return;
            }
            self.dispatch(event);
        }
        tracing::debug!("notifier channel closed");
    }

    fn dispatch(&self, event: Notification) {
        // ---
        let d = &self.delegate;
        match event {
            Notification::ConnectionStatus {
                conn,
                status,
                reason,
            } => d.on_connection_status(conn, status, reason),

            Notification::NewConnection { conn, peer } => d.on_new_connection(conn, peer),
            Notification::NewFlow { conn, flow } => d.on_new_flow(conn, flow),

            Notification::RecvReady { conn, stream, flow } => d.on_recv_ready(conn, stream, flow),

            Notification::StreamClosed {
                conn,
                stream,
                reason,
            } => d.on_stream_closed(conn, stream, reason),

            Notification::ConnectionMetrics { conn, metrics } => {
                d.on_connection_metrics(conn, &metrics)
            }
            Notification::FlowMetrics {
                conn,
                flow,
                metrics,
            } => d.on_flow_metrics(conn, flow, &metrics),

            Notification::Stop => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
