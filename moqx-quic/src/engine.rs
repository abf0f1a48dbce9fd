//! [`QuinnEngine`]: a [`QuicEngine`] backed by quinn.
//!
//! ```text
//!   network thread
//!   ┌───────────────────────────────────────────────────────────────┐
//!   │ poll()                                                        │
//!   │   rt.block_on(wait for first Event) ◄── tasks (accept, read,  │
//!   │   drain Event channel ──► core callbacks      write, closed)  │
//!   │   service active streams ──► StreamWriter ──► writer task     │
//!   │   service datagrams ──► Connection::send_datagram             │
//!   └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The runtime is current-thread and owned by the engine; quinn's I/O and
//! every task only run while `poll` is blocked in `block_on`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---

use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

// ---

use moqx_domain::{
    // ---
    CloseReason,
    ConnId,
    DatagramStatus,
    EngineControl,
    EngineEvents,
    EngineWaker,
    QuicEngine,
    Result,
    Role,
    TransportConfig,
    TransportError,
    VecSendBuffer,
};

// ---

use crate::config::transport_config;
use crate::control::{CtlOp, QuinnControl};
use crate::error::QuicError;
use crate::tasks::{self, Event};
use crate::tls::{client_config, server_config, CertBundle};

const STREAM_CHUNK: usize = 16 * 1024;
const MAX_WRITES_PER_STREAM: usize = 16;
const MAX_DATAGRAMS_PER_POLL: usize = 64;
const MAX_EVENTS_PER_POLL: usize = 1_024;

/// How long shutdown waits for close frames to leave.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// QuinnEngine
// ---------------------------------------------------------------------------

pub struct QuinnEngine {
    // ---
    role: Role,
    rt: Runtime,
    endpoint: quinn::Endpoint,

    ctl: QuinnControl,
    events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,

    next_conn: Arc<AtomicU64>,
}

impl QuinnEngine {
    // ---
    /// Listen on `bind` and accept any number of clients.
    pub fn server(bundle: CertBundle, bind: SocketAddr, cfg: &TransportConfig) -> Result<Self> {
        // ---
        let tls = server_config(&bundle)?;
        let quinn_tls = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
            .map_err(|e| QuicError::Tls(e.to_string()))?;

        let mut scfg = quinn::ServerConfig::with_crypto(Arc::new(quinn_tls));
        scfg.transport_config(Arc::new(transport_config(cfg)?));

        let rt = runtime()?;
        let endpoint = {
            let _guard = rt.enter();
            quinn::Endpoint::server(scfg, bind).map_err(QuicError::from)?
        };

        let engine = Self::new(Role::Server, rt, endpoint);
        engine.rt.spawn(tasks::accept_connections(
            engine.endpoint.clone(),
            engine.next_conn.clone(),
            engine.events_tx.clone(),
        ));
        tracing::info!(bind = %engine.local_addr()?, "quic server listening");
        Ok(engine)
    }

    /// Client endpoint trusting only `server_cert_der`.
    pub fn client(server_cert_der: rustls_pki_types::CertificateDer<'static>, cfg: &TransportConfig) -> Result<Self> {
        // ---
        let tls = client_config(server_cert_der)?;
        let quinn_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .map_err(|e| QuicError::Tls(e.to_string()))?;

        let mut ccfg = quinn::ClientConfig::new(Arc::new(quinn_tls));
        ccfg.transport_config(Arc::new(transport_config(cfg)?));

        let rt = runtime()?;
        let mut endpoint = {
            let _guard = rt.enter();
            quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0))).map_err(QuicError::from)?
        };
        endpoint.set_default_client_config(ccfg);

        Ok(Self::new(Role::Client, rt, endpoint))
    }

    fn new(role: Role, rt: Runtime, endpoint: quinn::Endpoint) -> Self {
        // ---
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            role,
            ctl: QuinnControl::new(rt.handle().clone(), events_tx.clone()),
            rt,
            endpoint,
            events_tx,
            events_rx,
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    // -----------------------------------------------------------------------
    // Events in
    // -----------------------------------------------------------------------

    fn on_event(&mut self, event: Event, events: &mut dyn EngineEvents) {
        // ---
        match event {
            Event::Wake => {}

            Event::Connected { conn, connection, role } => {
                let peer = connection.remote_address();
                self.ctl.insert_connected(conn, connection, role);
                tracing::debug!(conn_id = %conn, %peer, ?role, "quic connection ready");
                events.on_connection_ready(&mut self.ctl, conn, peer, role);
            }

            Event::ConnectFailed { conn, reason } | Event::Closed { conn, reason } => {
                if self.ctl.remove(conn) {
                    events.on_connection_closed(&mut self.ctl, conn, reason);
                }
            }

            Event::PeerStream { conn, stream, send } => {
                self.ctl.attach_peer_stream(conn, stream, send);
            }

            Event::StreamData { conn, stream, data, fin } => {
                events.on_stream_data(&mut self.ctl, conn, stream, data, fin);
            }

            Event::StreamReset { conn, stream } => {
                self.ctl.reset(conn, stream, 0);
                events.on_stream_reset(&mut self.ctl, conn, stream);
            }

            Event::Datagram { conn, data } => {
                events.on_datagram(&mut self.ctl, conn, data);
            }
        }
        self.apply_ops(events);
    }

    // -----------------------------------------------------------------------
    // Data out
    // -----------------------------------------------------------------------

    /// Apply FIN / reset / close issued since the last call, in order.
    fn apply_ops(&mut self, events: &mut dyn EngineEvents) {
        // ---
        loop {
            let ops = self.ctl.take_ops();
            if ops.is_empty() {
                return;
            }
            for op in ops {
                match op {
                    CtlOp::Finish(conn, stream) => self.ctl.finish(conn, stream),
                    CtlOp::Reset(conn, stream, code) => self.ctl.reset(conn, stream, code),
                    CtlOp::Close(conn, code) => {
                        if self.ctl.close(conn, code) {
                            events.on_connection_closed(&mut self.ctl, conn, CloseReason::LocalClose { code });
                        }
                    }
                }
            }
        }
    }

    fn service_streams(&mut self, events: &mut dyn EngineEvents) {
        // ---
        for (conn, stream) in self.ctl.writable_streams() {
            for _ in 0..MAX_WRITES_PER_STREAM {
                let room = self.ctl.room(conn, stream);
                if room == 0 {
                    break;
                }

                let mut buf = VecSendBuffer::new(room.min(STREAM_CHUNK));
                events.prepare_to_send(&mut self.ctl, conn, stream, &mut buf);
                let provided = buf.was_provided();
                let still_active = buf.still_active();
                let data = buf.into_bytes();
                let wrote = !data.is_empty();

                if wrote {
                    self.ctl.write(conn, stream, data);
                }
                self.apply_ops(events);

                if !provided {
                    break;
                }
                if !still_active {
                    self.ctl.set_inactive(conn, stream);
                    break;
                }
                if !wrote {
                    break;
                }
            }
        }
    }

    fn service_datagrams(&mut self, events: &mut dyn EngineEvents) {
        // ---
        for conn in self.ctl.datagram_ready_conns() {
            for _ in 0..MAX_DATAGRAMS_PER_POLL {
                let Some(max) = self.ctl.datagram_room(conn) else {
                    break;
                };

                let mut buf = VecSendBuffer::new(max);
                events.prepare_datagram(&mut self.ctl, conn, &mut buf);
                let provided = buf.was_provided();
                let still_active = buf.still_active();
                let data = buf.into_bytes();
                let wrote = !data.is_empty();

                if wrote {
                    if let Err(e) = self.ctl.send_datagram(conn, data) {
                        tracing::debug!(conn_id = %conn, "datagram refused: {e}");
                        events.on_datagram_status(conn, DatagramStatus::Lost);
                    }
                }
                self.apply_ops(events);

                if provided && !still_active {
                    self.ctl.mark_datagram_ready(conn, false);
                }
                if !provided || !wrote {
                    break;
                }
            }
        }
    }
}

fn runtime() -> Result<Runtime> {
    // ---
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| QuicError::Runtime(e.to_string()).into())
}

// ---------------------------------------------------------------------------
// QuicEngine
// ---------------------------------------------------------------------------

impl QuicEngine for QuinnEngine {
    // ---
    fn connect(&mut self, remote: SocketAddr, server_name: &str) -> Result<ConnId> {
        // ---
        if self.role != Role::Client {
            return Err(QuicError::Unsupported("connect() called on a server engine").into());
        }

        let connecting = {
            let _guard = self.rt.enter();
            self.endpoint.connect(remote, server_name).map_err(QuicError::from)?
        };
        let conn = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        self.ctl.insert_connecting(conn);
        self.rt
            .spawn(tasks::complete_connect(conn, connecting, self.events_tx.clone()));

        tracing::debug!(conn_id = %conn, %remote, server_name, "quic connecting");
        Ok(conn)
    }

    fn control(&mut self) -> &mut dyn EngineControl {
        &mut self.ctl
    }

    fn waker(&self) -> EngineWaker {
        // ---
        let tx = self.events_tx.clone();
        Arc::new(move || {
            let _ = tx.send(Event::Wake);
        })
    }

    fn poll(&mut self, max_wait: Duration, events: &mut dyn EngineEvents) -> Result<()> {
        // ---
        self.apply_ops(events);

        let first = if self.ctl.has_work() {
            self.rt.block_on(tokio::task::yield_now());
            None
        } else {
            let rx = &mut self.events_rx;
            self.rt
                .block_on(async { tokio::time::timeout(max_wait, rx.recv()).await })
                .ok()
                .flatten()
        };

        if let Some(event) = first {
            self.on_event(event, events);
        }
        for _ in 0..MAX_EVENTS_PER_POLL {
            match self.events_rx.try_recv() {
                Ok(event) => self.on_event(event, events),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(TransportError::Engine("quinn event channel closed".into()));
                }
            }
        }

        self.service_streams(events);
        self.service_datagrams(events);

        events.on_time_check(&mut self.ctl);
        self.apply_ops(events);
        Ok(())
    }

    fn shutdown(&mut self) {
        // ---
        for op in self.ctl.take_ops() {
            if let CtlOp::Close(conn, code) = op {
                self.ctl.close(conn, code);
            }
        }
        self.ctl.close_all(0);
        self.endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");

        let endpoint = self.endpoint.clone();
        self.rt.block_on(async {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, endpoint.wait_idle()).await;
        });
        tracing::debug!(role = ?self.role, "quic engine shut down");
    }
}
