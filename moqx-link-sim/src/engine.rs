//! [`LinkSimEngine`]: an in-process [`QuicEngine`] over crossbeam channels.
//!
//! ```text
//!   client engine                              server engine
//!   ┌──────────────┐   Frame (crossbeam)      ┌──────────────┐
//!   │ peer_tx ─────┼─────────────────────────►│ inbox        │
//!   │ inbox   ◄────┼──────────────────────────┼───── peer_tx │
//!   │   ▲          │                          │          ▲   │
//!   │   └─ waker (Frame::Wake)                │ waker ───┘   │
//!   └──────────────┘                          └──────────────┘
//! ```
//!
//! Each engine carries at most one connection. Streams are reliable and
//! ordered; datagrams are subject to the configured drop and duplication
//! rates.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// ---

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

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
    TransportError,
    VecSendBuffer,
};

// ---

use crate::bucket::TokenBucket;
use crate::config::LinkSimConfig;
use crate::control::{CtlOp, LinkSimControl, LinkSimHandle};
use crate::frame::Frame;

/// Writes per active stream per poll, so receive stays responsive.
const MAX_WRITES_PER_STREAM: usize = 16;
const MAX_DATAGRAMS_PER_POLL: usize = 64;
const MAX_FRAMES_PER_POLL: usize = 1_024;

// ---------------------------------------------------------------------------
// LinkSimEngine
// ---------------------------------------------------------------------------

pub struct LinkSimEngine {
    // ---
    role: Role,
    local_addr: SocketAddr,
    config: LinkSimConfig,

    peer_tx: Sender<Frame>,
    inbox: Receiver<Frame>,
    self_tx: Sender<Frame>,

    ctl: LinkSimControl,
    handle: LinkSimHandle,
    rng: SmallRng,
    bucket: Option<TokenBucket>,

    ready: bool,
    next_conn: u64,
}

impl LinkSimEngine {
    // ---
    /// Create a connected `(client, server)` pair sharing `config`.
    pub fn pair(config: LinkSimConfig) -> (Self, Self) {
        // ---
        let (to_client, client_inbox) = channel::unbounded();
        let (to_server, server_inbox) = channel::unbounded();

        let seed = config.seed;
        let client = Self::new(
            Role::Client,
            SocketAddr::from(([127, 0, 0, 1], 40_000)),
            config.clone(),
            to_server.clone(),
            client_inbox,
            to_client.clone(),
            seed,
        );
        let server = Self::new(
            Role::Server,
            SocketAddr::from(([127, 0, 0, 1], 4_433)),
            config,
            to_client,
            server_inbox,
            to_server,
            seed.map(|s| s.wrapping_add(1)),
        );
        (client, server)
    }

    fn new(
        role: Role,
        local_addr: SocketAddr,
        config: LinkSimConfig,
        peer_tx: Sender<Frame>,
        inbox: Receiver<Frame>,
        self_tx: Sender<Frame>,
        seed: Option<u64>,
    ) -> Self {
        // ---
        let handle = LinkSimHandle::new(config.cwin_bytes, config.rtt_us);
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        Self {
            role,
            local_addr,
            peer_tx,
            inbox,
            self_tx,
            ctl: LinkSimControl::new(handle.clone()),
            handle,
            rng,
            bucket: config.bw_cap_bps.map(TokenBucket::new),
            config,
            ready: false,
            next_conn: 1,
        }
    }

    /// Address this side reports to its peer.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for adjusting this side's simulated path at runtime.
    pub fn handle(&self) -> LinkSimHandle {
        self.handle.clone()
    }

    // -----------------------------------------------------------------------
    // Frames in
    // -----------------------------------------------------------------------

    fn on_frame(&mut self, frame: Frame, events: &mut dyn EngineEvents) {
        // ---
        match frame {
            Frame::Wake => {}

            Frame::Hello { addr } => {
                if self.role != Role::Server || self.ctl.conn.is_some() {
                    tracing::debug!(%addr, "unexpected hello ignored");
                    return;
                }
                let conn = self.allocate_conn();
                self.ready = true;
                self.send(Frame::HelloAck {
                    addr: self.local_addr,
                });
                tracing::debug!(conn_id = %conn, %addr, "link-sim accepted");
                events.on_connection_ready(&mut self.ctl, conn, addr, Role::Server);
            }

            Frame::HelloAck { addr } => {
                let Some(conn) = self.ctl.conn else {
                    return;
                };
                if self.role != Role::Client || self.ready {
                    return;
                }
                self.ready = true;
                events.on_connection_ready(&mut self.ctl, conn, addr, Role::Client);
            }

            Frame::StreamData { stream, data } => {
                let Some(conn) = self.ctl.conn else {
                    return;
                };
                self.handle.record_rx(data.len());
                events.on_stream_data(&mut self.ctl, conn, stream, data, false);
            }

            Frame::Fin { stream } => {
                let Some(conn) = self.ctl.conn else {
                    return;
                };
                events.on_stream_data(&mut self.ctl, conn, stream, Bytes::new(), true);
            }

            Frame::Reset { stream, code } => {
                let Some(conn) = self.ctl.conn else {
                    return;
                };
                tracing::trace!(conn_id = %conn, %stream, code, "peer reset");
                self.ctl.forget(stream);
                events.on_stream_reset(&mut self.ctl, conn, stream);
            }

            Frame::Datagram(data) => {
                let Some(conn) = self.ctl.conn else {
                    return;
                };
                self.handle.record_rx(data.len());
                events.on_datagram(&mut self.ctl, conn, data);
            }

            Frame::Close { code } => {
                let Some(conn) = self.ctl.conn else {
                    return;
                };
                self.ctl.clear();
                self.ready = false;
                events.on_connection_closed(&mut self.ctl, conn, CloseReason::RemoteClose { code });
            }
        }
        self.apply_ops(events);
    }

    // -----------------------------------------------------------------------
    // Frames out
    // -----------------------------------------------------------------------

    fn send(&self, frame: Frame) {
        if self.peer_tx.send(frame).is_err() {
            tracing::debug!("link-sim peer gone, frame dropped");
        }
    }

    /// Send FIN / reset / close issued since the last call, in order.
    fn apply_ops(&mut self, events: &mut dyn EngineEvents) {
        // ---
        for op in self.ctl.take_ops() {
            let Some(conn) = self.ctl.conn else {
                break;
            };
            match op {
                CtlOp::Finish(stream) => {
                    self.send(Frame::Fin { stream });
                    self.ctl.forget(stream);
                }
                CtlOp::Reset(stream, code) => {
                    self.send(Frame::Reset { stream, code });
                    self.ctl.forget(stream);
                }
                CtlOp::Close(code) => {
                    self.send(Frame::Close { code });
                    self.ctl.clear();
                    self.ready = false;
                    events.on_connection_closed(&mut self.ctl, conn, CloseReason::LocalClose { code });
                }
            }
        }
    }

    fn service_streams(&mut self, events: &mut dyn EngineEvents) {
        // ---
        for stream in self.ctl.active_streams() {
            for _ in 0..MAX_WRITES_PER_STREAM {
                let Some(conn) = self.ctl.conn else {
                    return;
                };
                let mut max = self.config.stream_chunk;
                if let Some(bucket) = self.bucket.as_mut() {
                    max = bucket.grant(max);
                    if max == 0 {
                        return;
                    }
                }

                let mut buf = VecSendBuffer::new(max);
                events.prepare_to_send(&mut self.ctl, conn, stream, &mut buf);
                let provided = buf.was_provided();
                let still_active = buf.still_active();
                let data = buf.into_bytes();
                let wrote = !data.is_empty();

                if wrote {
                    self.charge(data.len());
                    self.send(Frame::StreamData { stream, data });
                }
                self.apply_ops(events);

                if !provided {
                    // Allocation failed; the stream stays active for the next poll.
                    break;
                }
                if !still_active {
                    self.ctl.set_active(stream, false);
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
        let max = self.config.max_datagram_size;
        for _ in 0..MAX_DATAGRAMS_PER_POLL {
            let Some(conn) = self.ctl.conn else {
                return;
            };
            if !self.ctl.dgram_ready {
                return;
            }
            if let Some(bucket) = self.bucket.as_mut() {
                if bucket.grant(max) == 0 {
                    return;
                }
            }

            let mut buf = VecSendBuffer::new(max);
            events.prepare_datagram(&mut self.ctl, conn, &mut buf);
            let provided = buf.was_provided();
            let still_active = buf.still_active();
            let data = buf.into_bytes();
            let wrote = !data.is_empty();

            if wrote {
                self.transmit_datagram(conn, data, events);
            }
            self.apply_ops(events);

            if provided && !still_active {
                self.ctl.dgram_ready = false;
            }
            if !provided || !wrote {
                return;
            }
        }
    }

    fn transmit_datagram(&mut self, conn: ConnId, data: Bytes, events: &mut dyn EngineEvents) {
        // ---
        let (drop_p, dup_p) = self.config.probabilities();
        self.charge(data.len());

        if self.rng.gen_bool(drop_p) {
            self.handle.record_loss();
            events.on_datagram_status(conn, DatagramStatus::Lost);
            return;
        }
        if self.rng.gen_bool(dup_p) {
            self.send(Frame::Datagram(data.clone()));
        }
        self.send(Frame::Datagram(data));
        events.on_datagram_status(conn, DatagramStatus::Acked);
    }

    fn charge(&mut self, len: usize) {
        // ---
        if let Some(bucket) = self.bucket.as_mut() {
            bucket.consume(len);
        }
        self.handle.record_tx(len);
    }

    fn throttled(&mut self) -> bool {
        self.bucket.as_mut().is_some_and(|b| b.grant(1) == 0)
    }

    fn allocate_conn(&mut self) -> ConnId {
        // ---
        let conn = ConnId(self.next_conn);
        self.next_conn += 1;
        self.ctl.conn = Some(conn);
        conn
    }
}

// ---------------------------------------------------------------------------
// QuicEngine
// ---------------------------------------------------------------------------

impl QuicEngine for LinkSimEngine {
    // ---
    fn connect(&mut self, remote: SocketAddr, server_name: &str) -> Result<ConnId> {
        // ---
        if self.role != Role::Client {
            return Err(TransportError::Engine("link-sim server cannot connect".into()));
        }
        if self.ctl.conn.is_some() {
            return Err(TransportError::Engine("link-sim carries one connection".into()));
        }

        let conn = self.allocate_conn();
        self.peer_tx
            .send(Frame::Hello {
                addr: self.local_addr,
            })
            .map_err(|_| TransportError::Engine("link-sim peer gone".into()))?;

        tracing::debug!(conn_id = %conn, %remote, server_name, "link-sim connecting");
        Ok(conn)
    }

    fn control(&mut self) -> &mut dyn EngineControl {
        &mut self.ctl
    }

    fn waker(&self) -> EngineWaker {
        // ---
        let tx = self.self_tx.clone();
        Arc::new(move || {
            let _ = tx.send(Frame::Wake);
        })
    }

    fn poll(&mut self, max_wait: Duration, events: &mut dyn EngineEvents) -> Result<()> {
        // ---
        self.apply_ops(events);

        let busy = self.ready && self.ctl.has_work() && !self.throttled();
        let first = if busy {
            self.inbox.try_recv().ok()
        } else {
            self.inbox.recv_timeout(max_wait).ok()
        };

        if let Some(frame) = first {
            self.on_frame(frame, events);
            for _ in 1..MAX_FRAMES_PER_POLL {
                let Ok(frame) = self.inbox.try_recv() else {
                    break;
                };
                self.on_frame(frame, events);
            }
        }

        if self.ready {
            self.service_streams(events);
            self.service_datagrams(events);
        }

        events.on_time_check(&mut self.ctl);
        self.apply_ops(events);
        Ok(())
    }

    fn shutdown(&mut self) {
        // ---
        if self.ctl.conn.is_some() {
            self.send(Frame::Close { code: 0 });
        }
        self.ctl.clear();
        self.ready = false;
        tracing::debug!(role = ?self.role, "link-sim engine shut down");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
