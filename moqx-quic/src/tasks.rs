//! Async side of the engine.
//!
//! Every task runs on the engine's current-thread runtime, so it only
//! makes progress while the network thread is inside `poll`. Tasks never
//! touch the core; they report through one unbounded channel that `poll`
//! drains.
//!
//! ```text
//!   accept ──► Connected ──► watch_connection ─┬─► accept_uni / accept_bi ──► read_stream
//!                                              ├─► read_datagrams
//!                                              └─► closed
//!   StreamWriter ──► run_writer (opens the quinn stream lazily)
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

// ---

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

// ---

use moqx_domain::{CloseReason, ConnId, Role, StreamId};

/// Largest chunk handed up from one stream read.
const READ_CHUNK: usize = 64 * 1024;

/// Queued-but-unwritten bytes per stream before the engine stops asking
/// the core for more.
pub(crate) const WRITER_HIGH_WATER: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

pub(crate) enum Event {
    // ---
    /// Ends a blocking wait; also sent when a writer drops below its high-water mark.
    Wake,

    Connected {
        conn: ConnId,
        connection: quinn::Connection,
        role: Role,
    },

    ConnectFailed {
        conn: ConnId,
        reason: CloseReason,
    },

    Closed {
        conn: ConnId,
        reason: CloseReason,
    },

    /// Send half of a peer-opened bidirectional stream.
    PeerStream {
        conn: ConnId,
        stream: StreamId,
        send: quinn::SendStream,
    },

    StreamData {
        conn: ConnId,
        stream: StreamId,
        data: Bytes,
        fin: bool,
    },

    StreamReset {
        conn: ConnId,
        stream: StreamId,
    },

    Datagram {
        conn: ConnId,
        data: Bytes,
    },
}

pub(crate) type EventTx = UnboundedSender<Event>;

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

pub(crate) async fn accept_connections(endpoint: quinn::Endpoint, next_conn: Arc<AtomicU64>, events: EventTx) {
    // ---
    while let Some(incoming) = endpoint.accept().await {
        let next_conn = next_conn.clone();
        let events = events.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(connection) => {
                    let conn = ConnId(next_conn.fetch_add(1, Ordering::Relaxed));
                    tracing::debug!(conn_id = %conn, peer = %connection.remote_address(), "accepted");
                    let _ = events.send(Event::Connected {
                        conn,
                        connection: connection.clone(),
                        role: Role::Server,
                    });
                    watch_connection(conn, connection, events);
                }
                Err(e) => {
                    tracing::warn!("incoming connection failed: {e}");
                }
            }
        });
    }
}

pub(crate) async fn complete_connect(conn: ConnId, connecting: quinn::Connecting, events: EventTx) {
    // ---
    match connecting.await {
        Ok(connection) => {
            let _ = events.send(Event::Connected {
                conn,
                connection: connection.clone(),
                role: Role::Client,
            });
            watch_connection(conn, connection, events);
        }
        Err(e) => {
            tracing::warn!(conn_id = %conn, "connect failed: {e}");
            let reason = match e {
                quinn::ConnectionError::TimedOut => CloseReason::Unreachable,
                other => close_reason(&other),
            };
            let _ = events.send(Event::ConnectFailed { conn, reason });
        }
    }
}

/// Spawn the per-connection receive tasks. Must run inside the runtime.
fn watch_connection(conn: ConnId, connection: quinn::Connection, events: EventTx) {
    // ---
    tokio::spawn(accept_uni(conn, connection.clone(), events.clone()));
    tokio::spawn(accept_bi(conn, connection.clone(), events.clone()));
    tokio::spawn(read_datagrams(conn, connection.clone(), events.clone()));
    tokio::spawn(async move {
        let err = connection.closed().await;
        tracing::debug!(conn_id = %conn, "connection closed: {err}");
        let _ = events.send(Event::Closed {
            conn,
            reason: close_reason(&err),
        });
    });
}

pub(crate) fn close_reason(err: &quinn::ConnectionError) -> CloseReason {
    // ---
    use quinn::ConnectionError as E;

    match err {
        E::TimedOut => CloseReason::IdleTimeout,
        E::ApplicationClosed(close) => CloseReason::RemoteClose {
            code: close.error_code.into_inner(),
        },
        E::ConnectionClosed(_) | E::Reset => CloseReason::RemoteClose { code: 0 },
        E::LocallyClosed => CloseReason::LocalClose { code: 0 },
        other => CloseReason::Error(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Receive
// ---------------------------------------------------------------------------

fn peer_stream_id(id: quinn::StreamId) -> StreamId {
    // ---
    let initiator = match id.initiator() {
        quinn::Side::Client => Role::Client,
        quinn::Side::Server => Role::Server,
    };
    StreamId::new(initiator, id.dir() == quinn::Dir::Bi, id.index())
}

async fn accept_uni(conn: ConnId, connection: quinn::Connection, events: EventTx) {
    // ---
    while let Ok(recv) = connection.accept_uni().await {
        let stream = peer_stream_id(recv.id());
        tokio::spawn(read_stream(conn, stream, recv, events.clone()));
    }
}

async fn accept_bi(conn: ConnId, connection: quinn::Connection, events: EventTx) {
    // ---
    while let Ok((send, recv)) = connection.accept_bi().await {
        let stream = peer_stream_id(recv.id());
        if events.send(Event::PeerStream { conn, stream, send }).is_err() {
            return;
        }
        tokio::spawn(read_stream(conn, stream, recv, events.clone()));
    }
}

/// Forward one receive stream. `stream` is the id the core knows it by.
async fn read_stream(conn: ConnId, stream: StreamId, mut recv: quinn::RecvStream, events: EventTx) {
    // ---
    loop {
        let event = match recv.read_chunk(READ_CHUNK, true).await {
            Ok(Some(chunk)) => Event::StreamData {
                conn,
                stream,
                data: chunk.bytes,
                fin: false,
            },
            Ok(None) => {
                let _ = events.send(Event::StreamData {
                    conn,
                    stream,
                    data: Bytes::new(),
                    fin: true,
                });
                return;
            }
            Err(quinn::ReadError::Reset(code)) => {
                tracing::trace!(conn_id = %conn, %stream, %code, "peer reset");
                let _ = events.send(Event::StreamReset { conn, stream });
                return;
            }
            Err(e) => {
                tracing::trace!(conn_id = %conn, %stream, "read ended: {e}");
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

async fn read_datagrams(conn: ConnId, connection: quinn::Connection, events: EventTx) {
    // ---
    while let Ok(data) = connection.read_datagram().await {
        if events.send(Event::Datagram { conn, data }).is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// StreamWriter
// ---------------------------------------------------------------------------

enum WriteCmd {
    Data(Bytes),
    Priority(i32),
    Finish,
    Reset(u64),
}

/// Where the writer task gets its quinn stream from.
pub(crate) enum Opener {
    /// Locally initiated: opened on the first write.
    Local { connection: quinn::Connection, bidir: bool },

    /// Peer-initiated bidirectional stream, already open.
    Peer(quinn::SendStream),
}

/// Engine-side handle on one stream's writer task.
///
/// Commands are applied in order, so a FIN or reset always follows the
/// data queued before it.
pub(crate) struct StreamWriter {
    // ---
    tx: UnboundedSender<WriteCmd>,
    pending: Arc<AtomicUsize>,
}

impl StreamWriter {
    // ---
    pub(crate) fn spawn(
        rt: &Handle,
        conn: ConnId,
        stream: StreamId,
        opener: Opener,
        priority: Option<u8>,
        events: EventTx,
    ) -> Self {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let writer = Self {
            tx,
            pending: pending.clone(),
        };
        if let Some(p) = priority {
            writer.set_priority(p);
        }
        rt.spawn(run_writer(conn, stream, opener, rx, pending, events));
        writer
    }

    /// Bytes queued but not yet accepted by quinn.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn room(&self) -> usize {
        WRITER_HIGH_WATER.saturating_sub(self.pending())
    }

    pub(crate) fn write(&self, data: Bytes) {
        // ---
        let len = data.len();
        self.pending.fetch_add(len, Ordering::AcqRel);
        if self.tx.send(WriteCmd::Data(data)).is_err() {
            self.pending.fetch_sub(len, Ordering::AcqRel);
        }
    }

    /// `priority` is the core's engine value, lower is more urgent.
    pub(crate) fn set_priority(&self, priority: u8) {
        let _ = self.tx.send(WriteCmd::Priority(-i32::from(priority)));
    }

    pub(crate) fn finish(&self) {
        let _ = self.tx.send(WriteCmd::Finish);
    }

    pub(crate) fn reset(&self, code: u64) {
        let _ = self.tx.send(WriteCmd::Reset(code));
    }
}

async fn run_writer(
    conn: ConnId,
    stream: StreamId,
    opener: Opener,
    mut rx: UnboundedReceiver<WriteCmd>,
    pending: Arc<AtomicUsize>,
    events: EventTx,
) {
    // ---
    let mut send = match opener {
        Opener::Peer(send) => send,
        Opener::Local { connection, bidir: false } => match connection.open_uni().await {
            Ok(send) => send,
            Err(e) => {
                tracing::debug!(conn_id = %conn, %stream, "open failed: {e}");
                return;
            }
        },
        Opener::Local { connection, bidir: true } => match connection.open_bi().await {
            Ok((send, recv)) => {
                // The peer answers on our stream; report it under the core's id.
                tokio::spawn(read_stream(conn, stream, recv, events.clone()));
                send
            }
            Err(e) => {
                tracing::debug!(conn_id = %conn, %stream, "open failed: {e}");
                return;
            }
        },
    };

    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriteCmd::Data(data) => {
                let len = data.len();
                let result = send.write_chunk(data).await;

                let before = pending.fetch_sub(len, Ordering::AcqRel);
                if before >= WRITER_HIGH_WATER && before - len < WRITER_HIGH_WATER {
                    let _ = events.send(Event::Wake);
                }

                match result {
                    Ok(()) => {}
                    Err(quinn::WriteError::Stopped(code)) => {
                        tracing::debug!(conn_id = %conn, %stream, %code, "peer stopped stream");
                        let _ = events.send(Event::StreamReset { conn, stream });
                        return;
                    }
                    Err(e) => {
                        tracing::trace!(conn_id = %conn, %stream, "write ended: {e}");
                        return;
                    }
                }
            }
            WriteCmd::Priority(p) => {
                let _ = send.set_priority(p);
            }
            WriteCmd::Finish => {
                let _ = send.finish();
                return;
            }
            WriteCmd::Reset(code) => {
                let code = quinn::VarInt::from_u64(code).unwrap_or(quinn::VarInt::MAX);
                let _ = send.reset(code);
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
