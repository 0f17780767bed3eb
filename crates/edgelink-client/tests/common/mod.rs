//! Shared fixtures: a scripted in-memory relay and a real loopback target
#![allow(dead_code)]

use edgelink_client::{
    MemoryConnector, MemoryRelay, OutboundFrame, ProxyClient, ProxyClientConfig,
    ProxyClientOptions, RelayConnection, SessionSnapshot,
};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Fixture {
    pub client: ProxyClient,
    pub relay: MemoryRelay,
    pub conn: RelayConnection,
    pub target: TcpListener,
}

pub struct Timing {
    pub end_grace: Duration,
    pub teardown_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            end_grace: Duration::from_millis(300),
            teardown_grace: Duration::from_secs(10),
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("edgelink_client=debug")
        .with_test_writer()
        .try_init();
}

pub fn config(target_port: u16, timing: &Timing) -> ProxyClientConfig {
    ProxyClientConfig::builder()
        .endpoint("wss://relay.test")
        .hostname("H")
        .server_type("HTTPS")
        .target("127.0.0.1", target_port)
        .end_grace(timing.end_grace)
        .teardown_grace(timing.teardown_grace)
        .build()
        .unwrap()
}

/// Port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Client connected to an in-memory relay, registration already consumed
pub async fn connected(timing: Timing, options: ProxyClientOptions) -> Fixture {
    init_tracing();

    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = target.local_addr().unwrap().port();

    let (connector, mut relay) = MemoryConnector::pair(64);
    let client = ProxyClient::with_connector(config(port, &timing), options, connector);

    client.connect().await.unwrap();
    let mut conn = relay.accept().await.unwrap();

    match next_frame(&mut conn).await {
        OutboundFrame::RegisterServer(reg) => {
            assert_eq!(reg.hostname, "H");
            assert_eq!(reg.server_type, "HTTPS");
        }
        other => panic!("expected register_server, got {:?}", other),
    }

    Fixture {
        client,
        relay,
        conn,
        target,
    }
}

pub async fn next_frame(conn: &mut RelayConnection) -> OutboundFrame {
    tokio::time::timeout(WAIT, conn.recv())
        .await
        .expect("timed out waiting for a client frame")
        .expect("client closed the link")
}

/// Assert the client sends nothing for `period`
pub async fn assert_quiet(conn: &mut RelayConnection, period: Duration) {
    tokio::time::sleep(period).await;
    if let Some(frame) = conn.try_recv() {
        panic!("unexpected frame {:?}", frame);
    }
}

pub async fn accept_local(target: &TcpListener) -> TcpStream {
    let (stream, _) = tokio::time::timeout(WAIT, target.accept())
        .await
        .expect("timed out waiting for a local connect")
        .unwrap();
    stream
}

/// Poll the session snapshot until `pred` holds
pub async fn wait_sessions<F>(client: &ProxyClient, pred: F) -> Vec<SessionSnapshot>
where
    F: Fn(&[SessionSnapshot]) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let sessions = client.sessions().await.unwrap();
        if pred(&sessions) {
            return sessions;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("sessions never matched, last: {:?}", sessions);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Read until EOF or reset; returns whatever bytes arrived first
pub async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    use tokio::io::AsyncReadExt;

    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match tokio::time::timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("local socket was never closed")
        {
            Ok(0) | Err(_) => return received,
            Ok(n) => received.extend_from_slice(&buf[..n]),
        }
    }
}

/// Listener whose accept queue is full: further connects to it hang in SYN-SENT
#[cfg(target_os = "linux")]
pub async fn saturated_listener() -> (TcpListener, Vec<TcpStream>, u16) {
    let socket = tokio::net::TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(0).unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut queued = Vec::new();
    for _ in 0..16 {
        match tokio::time::timeout(
            Duration::from_millis(200),
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        {
            Ok(Ok(stream)) => queued.push(stream),
            _ => return (listener, queued, port),
        }
    }
    panic!("accept queue never filled");
}
