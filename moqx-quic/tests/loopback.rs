//! Two transports over real QUIC on the loopback interface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---

use bytes::{Bytes, BytesMut};
use crossbeam::channel::{self, Receiver, Sender};

// ---

use moqx_domain::{
    // ---
    ConnId,
    DisconnectReason,
    EnqueueFlags,
    StreamCloseReason,
    StreamId,
    TransportConfig,
    TransportDelegate,
    TransportStatus,
};
use moqx_quic::{CertBundle, QuinnEngine};
use moqx_transport::Transport;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum Event {
    Status(TransportStatus, Option<DisconnectReason>),
    NewConnection(ConnId),
    Recv(Option<StreamId>),
    Fin(StreamId),
}

struct Forwarder(Sender<Event>);

impl TransportDelegate for Forwarder {
    // ---
    fn on_connection_status(&self, _conn: ConnId, status: TransportStatus, reason: Option<DisconnectReason>) {
        let _ = self.0.send(Event::Status(status, reason));
    }

    fn on_new_connection(&self, conn: ConnId, _peer: SocketAddr) {
        let _ = self.0.send(Event::NewConnection(conn));
    }

    fn on_recv_ready(&self, _conn: ConnId, stream: Option<StreamId>, _flow: Option<moqx_domain::FlowId>) {
        let _ = self.0.send(Event::Recv(stream));
    }

    fn on_stream_closed(&self, _conn: ConnId, stream: StreamId, reason: StreamCloseReason) {
        if reason == StreamCloseReason::Fin {
            let _ = self.0.send(Event::Fin(stream));
        }
    }
}

fn wait_for<T>(rx: &Receiver<Event>, mut pick: impl FnMut(&Event) -> Option<T>) -> T {
    // ---
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let event = rx.recv_timeout(left).expect("expected event did not arrive in time");
        if let Some(v) = pick(&event) {
            return v;
        }
    }
}

struct Pair {
    client: Transport,
    client_events: Receiver<Event>,
    server: Transport,
    server_events: Receiver<Event>,
    conn: ConnId,
    server_conn: ConnId,
}

fn start() -> Pair {
    // ---
    let _ = tracing_subscriber::fmt()
        .with_env_filter("moqx=debug")
        .with_test_writer()
        .try_init();

    let config = TransportConfig::default();
    let bundle = CertBundle::generate("moqx").unwrap();
    let cert = bundle.cert_der.clone();

    let server_engine = QuinnEngine::server(bundle, SocketAddr::from(([127, 0, 0, 1], 0)), &config).unwrap();
    let server_addr = server_engine.local_addr().unwrap();
    let (stx, server_events) = channel::unbounded();
    let server = Transport::start_server(config.clone(), server_engine, Arc::new(Forwarder(stx))).unwrap();

    let client_engine = QuinnEngine::client(cert, &config).unwrap();
    let (ctx, client_events) = channel::unbounded();
    let (client, conn) =
        Transport::start_client(config, client_engine, server_addr, "moqx", Arc::new(Forwarder(ctx))).unwrap();

    wait_for(&client_events, |e| matches!(e, Event::Status(TransportStatus::Ready, _)).then_some(()));
    let server_conn = wait_for(&server_events, |e| match e {
        Event::NewConnection(c) => Some(*c),
        _ => None,
    });

    Pair {
        client,
        client_events,
        server,
        server_events,
        conn,
        server_conn,
    }
}

#[test]
fn object_crosses_quic_and_ends_with_fin() {
    // ---
    let p = start();
    let flow = p.client.create_flow(p.conn, true, 1, false).unwrap();
    let object: Bytes = (0..50_000u32).map(|i| (i % 199) as u8).collect::<Vec<u8>>().into();

    p.client
        .enqueue(p.conn, flow, object.clone(), 1, 0, EnqueueFlags::default())
        .unwrap();
    p.client.delete_flow(p.conn, flow, true).unwrap();

    let mut got = BytesMut::new();
    let stream = loop {
        let (s, fin) = wait_for(&p.server_events, |e| match e {
            Event::Recv(Some(s)) => Some((*s, false)),
            Event::Fin(s) => Some((*s, true)),
            _ => None,
        });
        if let Some(buffer) = p.server.stream_buffer(p.server_conn, s).unwrap() {
            got.extend_from_slice(&buffer.read_all());
        }
        if fin {
            break s;
        }
    };

    assert!(!stream.is_bidir());
    assert_eq!(got.freeze(), object);

    p.client.stop();
    p.server.stop();
}

#[test]
fn datagram_crosses_quic() {
    // ---
    let p = start();
    let flow = p.client.create_flow(p.conn, false, 1, false).unwrap();
    p.client
        .enqueue(p.conn, flow, Bytes::from_static(b"hello"), 1, 0, EnqueueFlags::default())
        .unwrap();

    wait_for(&p.server_events, |e| matches!(e, Event::Recv(None)).then_some(()));
    let d = p.server.dequeue_datagram(p.server_conn).unwrap();
    assert_eq!(d, Some(Bytes::from_static(b"hello")));

    p.client.stop();
    p.server.stop();
}

#[test]
fn client_stop_is_seen_as_remote_close() {
    // ---
    let p = start();
    p.client.stop();

    let reason = wait_for(&p.client_events, |e| match e {
        Event::Status(TransportStatus::Disconnected, r) => Some(*r),
        _ => None,
    });
    assert_eq!(reason, Some(DisconnectReason::LocalShutdown));

    let (status, reason) = wait_for(&p.server_events, |e| match e {
        Event::Status(s, r) if *s != TransportStatus::Ready => Some((*s, *r)),
        _ => None,
    });
    assert_eq!(status, TransportStatus::RemoteRequestClose);
    assert_eq!(reason, Some(DisconnectReason::RemoteClose));

    p.server.stop();
}
