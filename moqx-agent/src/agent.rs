//! The two agent roles.
//!
//! - [`Echo`] (server): every stream object goes back on the flow it
//!   arrived on, every datagram goes back on a per-connection datagram flow.
//! - [`Probe`] (client): publishes numbered objects, each on a new stream,
//!   and counts the echoed bytes.
//!
//! Both are driven by [`AgentEvent`]s and only call the transport's
//! non-blocking API, so they run equally well in a tokio task or a test loop.

use std::collections::HashMap;

// ---

use bytes::Bytes;

// ---

use moqx_domain::{
    // ---
    ConnId,
    EnqueueFlags,
    FlowId,
    StreamCloseReason,
    StreamId,
    TransportStatus,
};
use moqx_transport::Transport;

// ---

use super::AgentEvent;

const ECHO_PRIORITY: u8 = 2;
const PROBE_PRIORITY: u8 = 2;

fn log_err(what: &str, result: moqx_domain::Result<()>) {
    if let Err(e) = result {
        tracing::warn!("{what}: {e}");
    }
}

// ---------------------------------------------------------------------------
// Echo
// ---------------------------------------------------------------------------

pub struct Echo {
    // ---
    transport: Transport,
    dgram_flows: HashMap<ConnId, FlowId>,
    stream_flows: HashMap<(ConnId, StreamId), FlowId>,
    echoed_bytes: u64,
}

impl Echo {
    // ---
    pub fn new(transport: Transport) -> Self {
        // ---
        Self {
            transport,
            dgram_flows: HashMap::new(),
            stream_flows: HashMap::new(),
            echoed_bytes: 0,
        }
    }

    pub fn echoed_bytes(&self) -> u64 {
        self.echoed_bytes
    }

    pub fn handle(&mut self, event: AgentEvent) {
        // ---
        match event {
            AgentEvent::NewConnection { conn, peer } => {
                tracing::info!(conn_id = %conn, %peer, "client connected");
            }

            AgentEvent::Recv {
                conn,
                stream: Some(stream),
                flow: Some(flow),
            } => {
                self.stream_flows.insert((conn, stream), flow);
                log_err("stream echo", self.echo_stream(conn, stream, flow));
            }

            AgentEvent::Recv {
                conn,
                stream: Some(stream),
                flow: None,
            } => {
                // Unidirectional: nowhere to answer.
                if let Ok(Some(buffer)) = self.transport.stream_buffer(conn, stream) {
                    let dropped = buffer.read_all().len();
                    tracing::debug!(conn_id = %conn, %stream, dropped, "one-way stream data discarded");
                }
            }

            AgentEvent::Recv { conn, stream: None, .. } => {
                log_err("datagram echo", self.echo_datagrams(conn));
            }

            AgentEvent::StreamClosed { conn, stream, reason } => {
                let Some(flow) = self.stream_flows.remove(&(conn, stream)) else {
                    return;
                };
                let graceful = reason == StreamCloseReason::Fin;
                if graceful {
                    log_err("stream echo", self.echo_stream(conn, stream, flow));
                }
                log_err("delete flow", self.transport.delete_flow(conn, flow, graceful));
            }

            AgentEvent::Status { conn, status, reason } => {
                if !matches!(status, TransportStatus::Connecting | TransportStatus::Ready) {
                    tracing::info!(conn_id = %conn, ?status, ?reason, "client gone");
                    self.dgram_flows.remove(&conn);
                    self.stream_flows.retain(|(c, _), _| *c != conn);
                }
            }

            AgentEvent::NewFlow { .. } => {}
        }
    }

    fn echo_stream(&mut self, conn: ConnId, stream: StreamId, flow: FlowId) -> moqx_domain::Result<()> {
        // ---
        let Some(buffer) = self.transport.stream_buffer(conn, stream)? else {
            return Ok(());
        };
        let data = buffer.read_all();
        if data.is_empty() {
            return Ok(());
        }
        self.echoed_bytes += data.len() as u64;
        self.transport
            .enqueue(conn, flow, data, ECHO_PRIORITY, 0, EnqueueFlags::default())
    }

    fn echo_datagrams(&mut self, conn: ConnId) -> moqx_domain::Result<()> {
        // ---
        let flow = match self.dgram_flows.get(&conn) {
            Some(&flow) => flow,
            None => {
                let flow = self.transport.create_flow(conn, false, ECHO_PRIORITY, false)?;
                self.dgram_flows.insert(conn, flow);
                flow
            }
        };
        while let Some(d) = self.transport.dequeue_datagram(conn)? {
            self.echoed_bytes += d.len() as u64;
            self.transport
                .enqueue(conn, flow, d, ECHO_PRIORITY, 0, EnqueueFlags::default())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    pub objects: u32,
    pub object_size: usize,
    pub datagrams: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub published: u32,
    pub sent_bytes: u64,
    pub echoed_bytes: u64,
}

pub struct Probe {
    // ---
    transport: Transport,
    conn: ConnId,
    opts: ProbeOptions,
    flow: Option<FlowId>,
    summary: ProbeSummary,
    closed: bool,
}

impl Probe {
    // ---
    pub fn new(transport: Transport, conn: ConnId, opts: ProbeOptions) -> Self {
        // ---
        Self {
            transport,
            conn,
            opts,
            flow: None,
            summary: ProbeSummary::default(),
            closed: false,
        }
    }

    pub fn summary(&self) -> ProbeSummary {
        self.summary
    }

    pub fn all_published(&self) -> bool {
        self.summary.published >= self.opts.objects
    }

    /// Everything published and echoed, or the connection is gone.
    pub fn is_done(&self) -> bool {
        self.closed || (self.all_published() && self.summary.echoed_bytes >= self.summary.sent_bytes)
    }

    pub fn handle(&mut self, event: AgentEvent) {
        // ---
        match event {
            AgentEvent::Status { conn, status, reason } if conn == self.conn => match status {
                TransportStatus::Ready => {
                    let reliable = !self.opts.datagrams;
                    match self.transport.create_flow(conn, reliable, PROBE_PRIORITY, reliable) {
                        Ok(flow) => {
                            tracing::info!(conn_id = %conn, flow_id = %flow, reliable, "connected, publishing");
                            self.flow = Some(flow);
                        }
                        Err(e) => {
                            tracing::error!(conn_id = %conn, "flow not created: {e}");
                            self.closed = true;
                        }
                    }
                }
                TransportStatus::Connecting => {}
                _ => {
                    tracing::info!(conn_id = %conn, ?status, ?reason, "connection ended");
                    self.closed = true;
                }
            },

            AgentEvent::Recv {
                conn,
                stream: Some(stream),
                ..
            } => {
                if let Ok(Some(buffer)) = self.transport.stream_buffer(conn, stream) {
                    self.summary.echoed_bytes += buffer.read_all().len() as u64;
                }
            }

            AgentEvent::Recv { conn, stream: None, .. } => {
                while let Ok(Some(msg)) = self.transport.dequeue_reassembled(conn) {
                    self.summary.echoed_bytes += msg.len() as u64;
                }
            }

            _ => {}
        }
    }

    /// Publish the next object. Returns `false` when nothing was sent.
    pub fn publish_next(&mut self) -> moqx_domain::Result<bool> {
        // ---
        let Some(flow) = self.flow else {
            return Ok(false);
        };
        if self.all_published() {
            return Ok(false);
        }

        let index = self.summary.published;
        let object = Bytes::from(vec![(index % 251) as u8; self.opts.object_size]);
        let len = object.len() as u64;

        if self.opts.datagrams {
            self.transport
                .enqueue_fragmented(self.conn, flow, object, PROBE_PRIORITY, 0)?;
        } else {
            self.transport
                .enqueue(self.conn, flow, object, PROBE_PRIORITY, 0, EnqueueFlags::new_stream_fin())?;
        }
        self.summary.published += 1;
        self.summary.sent_bytes += len;
        tracing::debug!(conn_id = %self.conn, index, len, "object published");

        if self.all_published() && !self.opts.datagrams {
            // FIN the last stream once it drains.
            self.transport.delete_flow(self.conn, flow, true)?;
            self.flow = None;
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use moqx_domain::TransportConfig;
    use moqx_link_sim::{LinkSimConfig, LinkSimEngine};

    use super::super::ChannelDelegate;
    use super::*;

    /// Run an echo server and a probe over the link simulator until the
    /// probe has everything back.
    fn run(opts: ProbeOptions) -> (ProbeSummary, u64) {
        // ---
        let cfg = TransportConfig::default();
        let (client_engine, server_engine) = LinkSimEngine::pair(LinkSimConfig::perfect());
        let server_addr = server_engine.local_addr();

        let (sd, mut server_events) = ChannelDelegate::new();
        let server = Transport::start_server(cfg.clone(), server_engine, Arc::new(sd)).unwrap();
        let (cd, mut client_events) = ChannelDelegate::new();
        let (client, conn) = Transport::start_client(cfg, client_engine, server_addr, "moqx", Arc::new(cd)).unwrap();

        let mut echo = Echo::new(server.clone());
        let mut probe = Probe::new(client.clone(), conn, opts);

        let deadline = Instant::now() + Duration::from_secs(10);
        while !probe.is_done() {
            assert!(Instant::now() < deadline, "probe incomplete: {:?}", probe.summary());
            while let Ok(ev) = server_events.try_recv() {
                echo.handle(ev);
            }
            while let Ok(ev) = client_events.try_recv() {
                probe.handle(ev);
            }
            probe.publish_next().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }

        client.stop();
        server.stop();
        (probe.summary(), echo.echoed_bytes())
    }

    #[test]
    fn stream_objects_are_echoed() {
        // ---
        let (summary, echoed) = run(ProbeOptions {
            objects: 5,
            object_size: 3_000,
            datagrams: false,
        });
        assert_eq!(summary.published, 5);
        assert_eq!(summary.sent_bytes, 15_000);
        assert_eq!(summary.echoed_bytes, 15_000, "every byte came back");
        assert_eq!(echoed, 15_000);
    }

    #[test]
    fn fragmented_datagrams_are_echoed() {
        // ---
        let (summary, _) = run(ProbeOptions {
            objects: 3,
            object_size: 2_500,
            datagrams: true,
        });
        assert_eq!(summary.published, 3);
        assert_eq!(summary.echoed_bytes, 7_500);
    }
}
