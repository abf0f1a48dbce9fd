//! [`Transport`]: the application-facing handle.
//!
//! # Threads
//!
//! ```text
//!   app threads ──► Transport ──► state lock / send queues
//!                        │
//!                        └─► RunnerTx ──► network thread (owns the engine)
//!                                              │
//!                                              └─► NotifierTx ──► notifier thread ──► delegate
//! ```
//!
//! Entry points either update shared state under the state lock (creating
//! a flow, pushing into a send queue, changing a priority) or post a
//! command for the network thread when the engine must be involved. None
//! of them block on network I/O.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

// ---

use bytes::Bytes;
use parking_lot::Mutex;

// ---

use moqx_domain::{
    // ---
    ClockPtr,
    ConnId,
    EnqueueFlags,
    FlowId,
    Priority,
    QuicEngine,
    Result,
    Role,
    SendUnit,
    StreamBuffer,
    StreamId,
    SystemClock,
    TransportConfig,
    TransportDelegatePtr,
    TransportError,
    TransportStatus,
};

// ---

use crate::dispatch::{NetCmd, RunnerTx};
use crate::fragment::{self, Fragment};
use crate::network::{self, NetworkCore};
use crate::notifier::{Notifier, NotifierTx};
use crate::receive;
use crate::state::{ConnectionRecord, FlowRecord, SendQueue, TransportState};

// ---------------------------------------------------------------------------
// SendOptions
// ---------------------------------------------------------------------------

/// Per-object send parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    // ---
    /// 0..=127, lower is more urgent.
    pub priority: u8,

    /// Zero means the configured maximum. Larger values are clamped.
    pub ttl_ms: u32,

    /// Hold the object back from the scheduler for this long.
    pub delay_ms: u32,

    /// Opaque tag stored with the queued object.
    pub group_key: u64,

    pub flags: EnqueueFlags,
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

/// State reachable from the handle, the network thread, and tests.
pub(crate) struct Shared {
    // ---
    pub config: TransportConfig,
    pub clock: ClockPtr,
    pub state: Mutex<TransportState>,
    pub status: Mutex<TransportStatus>,
    pub runner: RunnerTx,
    pub notifier: NotifierTx,
    pub stop_requested: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    // ---
    pub fn new(config: TransportConfig, clock: ClockPtr, runner: RunnerTx, notifier: NotifierTx) -> Self {
        // ---
        Self {
            config,
            clock,
            state: Mutex::new(TransportState::default()),
            status: Mutex::new(TransportStatus::Connecting),
            runner,
            notifier,
            stop_requested: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn set_status(&self, status: TransportStatus) {
        *self.status.lock() = status;
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Cheap-clone handle to a running transport.
#[derive(Clone)]
pub struct Transport {
    // ---
    shared: Arc<Shared>,
}

impl Transport {
    // ---
    /// Start a transport that accepts connections on `engine`.
    pub fn start_server<E: QuicEngine>(
        config: TransportConfig,
        engine: E,
        delegate: TransportDelegatePtr,
    ) -> Result<Self> {
        // ---
        let transport = Self::start(config, SystemClock::shared(), engine, delegate, None)?;
        Ok(transport.0)
    }

    /// Start a transport and open one client connection to `remote`.
    ///
    /// The connection id is usable immediately; flows created before the
    /// handshake completes start sending once it does.
    pub fn start_client<E: QuicEngine>(
        config: TransportConfig,
        engine: E,
        remote: SocketAddr,
        server_name: &str,
        delegate: TransportDelegatePtr,
    ) -> Result<(Self, ConnId)> {
        // ---
        let (transport, conn) = Self::start(
            config,
            SystemClock::shared(),
            engine,
            delegate,
            Some((remote, server_name)),
        )?;
        let conn = conn.ok_or(TransportError::NotRunning)?;
        Ok((transport, conn))
    }

    fn start<E: QuicEngine>(
        config: TransportConfig,
        clock: ClockPtr,
        mut engine: E,
        delegate: TransportDelegatePtr,
        connect: Option<(SocketAddr, &str)>,
    ) -> Result<(Self, Option<ConnId>)> {
        // ---
        config.validate()?;

        let (runner, runner_rx) = RunnerTx::new(config.runner_queue_size, engine.waker());
        let (notifier, notifier_rx) = NotifierTx::channel(config.notify_queue_size);
        let shared = Arc::new(Shared::new(config, clock, runner, notifier));

        // Connect before the engine moves to the network thread.
        let conn = match connect {
            Some((remote, server_name)) => {
                let conn_id = engine.connect(remote, server_name)?;
                let record = ConnectionRecord::new(
                    conn_id,
                    remote,
                    Role::Client,
                    &shared.config,
                    shared.clock.clone(),
                );
                shared.state.lock().conns.insert(conn_id, record);
                tracing::info!(conn_id = %conn_id, %remote, server_name, "connecting");
                Some(conn_id)
            }
            None => {
                shared.set_status(TransportStatus::Ready);
                None
            }
        };

        let notifier_thread = Notifier::spawn(notifier_rx, delegate)?;
        let core = NetworkCore::new(shared.clone());
        let network_thread = network::spawn(engine, core, runner_rx)?;

        shared.threads.lock().extend([network_thread, notifier_thread]);
        Ok((Self { shared }, conn))
    }

    #[cfg(test)]
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn status(&self) -> TransportStatus {
        *self.shared.status.lock()
    }

    /// Close every connection and stop both threads.
    ///
    /// Safe to call more than once and from a delegate callback; a thread
    /// never joins itself.
    pub fn stop(&self) {
        // ---
        if !self.shared.stop_requested.swap(true, Ordering::AcqRel) {
            tracing::info!("transport stopping");
        }
        self.shared.runner.wake();

        let current = std::thread::current().id();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.threads.lock());
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("transport thread panicked");
            }
        }
    }

    /// Application-initiated close.
    pub fn close(&self, conn: ConnId, app_reason_code: u64) -> Result<()> {
        // ---
        self.with_conn(conn, |_| Ok(()))?;
        self.shared.runner.send(NetCmd::CloseConnection {
            conn,
            code: app_reason_code,
        })
    }

    pub fn connection_ids(&self) -> Vec<ConnId> {
        self.shared.state.lock().conns.keys().copied().collect()
    }

    pub fn peer_addr(&self, conn: ConnId) -> Result<SocketAddr> {
        self.with_conn(conn, |c| Ok(c.peer))
    }

    // -----------------------------------------------------------------------
    // Flows
    // -----------------------------------------------------------------------

    /// Create a flow. Unreliable flows share the connection's datagram channel.
    pub fn create_flow(&self, conn: ConnId, reliable: bool, priority: u8, bidir: bool) -> Result<FlowId> {
        // ---
        Priority::new(priority)?;
        let shared = &self.shared;

        self.with_conn(conn, |c| {
            let flow_id = c.allocate_flow_id();
            let tx = if reliable {
                Arc::new(SendQueue::new(&shared.config, shared.clock.clone()))
            } else {
                c.dgram_tx.clone()
            };
            c.flows
                .insert(flow_id, FlowRecord::new(reliable, reliable && bidir, priority, tx));

            tracing::debug!(conn_id = %conn, %flow_id, reliable, bidir, priority, "flow created");
            Ok(flow_id)
        })
    }

    /// Delete a flow.
    ///
    /// With `delete_on_empty` the record stays until its queue drains and
    /// the stream is finished; otherwise queued data is discarded and the
    /// stream reset now.
    pub fn delete_flow(&self, conn: ConnId, flow: FlowId, delete_on_empty: bool) -> Result<()> {
        // ---
        let close = self.with_flow(conn, flow, |c, _| {
            let Some(record) = c.flows.get_mut(&flow) else {
                return Err(TransportError::InvalidFlow {
                    conn_id: conn,
                    flow_id: flow,
                });
            };

            if delete_on_empty && record.backlog() > 0 {
                record.delete_on_empty = true;
                tracing::debug!(conn_id = %conn, flow_id = %flow, backlog = record.backlog(), "flow deletes once drained");
                return Ok(None);
            }

            let stream = record.current_stream;
            if let Some(stream) = stream {
                c.release_stream(stream, !delete_on_empty);
            }
            let Some(record) = c.flows.remove(&flow) else {
                return Ok(None);
            };

            let mut discarded = usize::from(record.tx_object.is_some());
            if record.reliable {
                discarded += record.tx.queue.lock().clear();
            }
            tracing::debug!(conn_id = %conn, flow_id = %flow, discarded, "flow deleted");

            Ok(stream.map(|stream| NetCmd::CloseStream {
                conn,
                stream,
                reset: !delete_on_empty,
            }))
        })?;

        match close {
            Some(cmd) => self.shared.runner.send(cmd),
            None => Ok(()),
        }
    }

    /// New priority for subsequently queued objects and the current stream.
    pub fn set_flow_priority(&self, conn: ConnId, flow: FlowId, priority: u8) -> Result<()> {
        // ---
        Priority::new(priority)?;
        let has_stream = self.with_flow(conn, flow, |c, _| {
            let record = c.flows.get_mut(&flow).ok_or(TransportError::InvalidFlow {
                conn_id: conn,
                flow_id: flow,
            })?;
            record.priority = priority;
            Ok(record.current_stream.is_some())
        })?;

        if has_stream {
            self.shared.runner.send(NetCmd::SetStreamPriority { conn, flow })?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Send
    // -----------------------------------------------------------------------

    pub fn enqueue(
        &self,
        conn: ConnId,
        flow: FlowId,
        data: Bytes,
        priority: u8,
        ttl_ms: u32,
        flags: EnqueueFlags,
    ) -> Result<()> {
        // ---
        let opts = SendOptions {
            priority,
            ttl_ms,
            flags,
            ..Default::default()
        };
        self.enqueue_with(conn, flow, data, &opts)
    }

    /// Queue one object on a flow.
    ///
    /// Returns once the object is queued. A full runner queue delays the
    /// flow's activation until the next congestion sweep; it is logged,
    /// not returned.
    pub fn enqueue_with(&self, conn: ConnId, flow: FlowId, data: Bytes, opts: &SendOptions) -> Result<()> {
        // ---
        Priority::new(opts.priority)?;
        let action = opts.flags.stream_action();

        let (tx, reliable) = self.with_flow(conn, flow, |c, _| {
            let Some(record) = c.flows.get_mut(&flow) else {
                return Err(TransportError::InvalidFlow {
                    conn_id: conn,
                    flow_id: flow,
                });
            };
            if record.delete_on_empty {
                return Err(TransportError::InvalidFlow {
                    conn_id: conn,
                    flow_id: flow,
                });
            }
            if record.reliable && data.is_empty() {
                tracing::warn!(conn_id = %conn, flow_id = %flow, "zero length object rejected");
                return Err(TransportError::ZeroLengthObject);
            }

            if record.reliable {
                if opts.flags.clear_queue {
                    let cleared = record.tx.queue.lock().clear();
                    record.metrics.tx_queue_discards += cleared as u64;
                    tracing::debug!(conn_id = %conn, flow_id = %flow, cleared, "queue cleared on enqueue");
                }
                if action.is_replace() {
                    record.pending_action = action;
                }
            }
            record.metrics.enqueued_objs += 1;
            Ok((record.tx.clone(), record.reliable))
        })?;

        let unit = SendUnit {
            conn_id: conn,
            flow_id: flow,
            priority: opts.priority,
            action,
            enqueued_at: self.shared.clock.now(),
            data,
        };
        tx.queue
            .lock()
            .push(opts.group_key, unit, opts.ttl_ms, opts.priority, opts.delay_ms)?;

        if tx.request_activation() {
            let cmd = if reliable {
                NetCmd::MarkStreamActive { conn, flow }
            } else {
                NetCmd::MarkDatagramReady { conn }
            };
            if let Err(e) = self.shared.runner.send(cmd) {
                tx.clear_activation();
                tracing::warn!(conn_id = %conn, flow_id = %flow, "activation deferred: {e}");
            }
        }
        Ok(())
    }

    /// Split `data` into numbered datagram fragments on an unreliable flow.
    pub fn enqueue_fragmented(&self, conn: ConnId, flow: FlowId, data: Bytes, priority: u8, ttl_ms: u32) -> Result<()> {
        // ---
        let msg_id = self.with_flow(conn, flow, |c, _| {
            let reliable = c.flows.get(&flow).is_some_and(|f| f.reliable);
            if reliable {
                return Err(TransportError::InvalidFlow {
                    conn_id: conn,
                    flow_id: flow,
                });
            }
            let id = c.next_msg_id;
            c.next_msg_id += 1;
            Ok(id)
        })?;

        let opts = SendOptions {
            priority,
            ttl_ms,
            group_key: msg_id,
            ..Default::default()
        };
        for frag in fragment::split(msg_id, &data, fragment::DEFAULT_MAX_FRAGMENT) {
            self.enqueue_with(conn, flow, frag, &opts)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Receive
    // -----------------------------------------------------------------------

    pub fn dequeue_datagram(&self, conn: ConnId) -> Result<Option<Bytes>> {
        let queue = self.with_conn(conn, |c| Ok(c.dgram_rx.clone()))?;
        Ok(queue.pop())
    }

    /// Pop received fragments until a message completes.
    pub fn dequeue_reassembled(&self, conn: ConnId) -> Result<Option<Bytes>> {
        // ---
        let (queue, ring) = self.with_conn(conn, |c| Ok((c.dgram_rx.clone(), c.reassembly.clone())))?;

        while let Some(datagram) = queue.pop() {
            let Some(frag) = Fragment::parse(datagram) else {
                tracing::debug!(conn_id = %conn, "short datagram is not a fragment");
                continue;
            };
            if let Some(message) = ring.lock().insert(frag) {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Shared receive buffer of a stream, if the stream has one.
    pub fn stream_buffer(&self, conn: ConnId, stream: StreamId) -> Result<Option<Arc<StreamBuffer>>> {
        self.with_conn(conn, |c| Ok(c.rx_streams.get(&stream).map(|rx| rx.buffer.clone())))
    }

    /// Attribute a received stream to a local flow.
    pub fn bind_stream_to_flow(&self, conn: ConnId, flow: FlowId, stream: StreamId) -> Result<()> {
        self.with_flow(conn, flow, |c, _| {
            receive::bind_stream(c, flow, stream);
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn with_conn<T>(&self, conn: ConnId, f: impl FnOnce(&mut ConnectionRecord) -> Result<T>) -> Result<T> {
        // ---
        let mut state = self.shared.state.lock();
        let record = state
            .conns
            .get_mut(&conn)
            .ok_or(TransportError::InvalidConnection(conn))?;
        f(record)
    }

    /// Like `with_conn`, but fails with `InvalidFlow` if `flow` is unknown.
    fn with_flow<T>(
        &self,
        conn: ConnId,
        flow: FlowId,
        f: impl FnOnce(&mut ConnectionRecord, FlowId) -> Result<T>,
    ) -> Result<T> {
        // ---
        self.with_conn(conn, |c| {
            if !c.flows.contains_key(&flow) {
                return Err(TransportError::InvalidFlow {
                    conn_id: conn,
                    flow_id: flow,
                });
            }
            f(c, flow)
        })
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
