//! Session lifecycle against a scripted relay and real loopback targets
mod common;

use bytes::Bytes;
use common::*;
use edgelink_client::{
    InboundFrame, MemoryConnector, OutboundFrame, ProxyClient, ProxyClientOptions, SessionState,
    TimerKind,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn connect(id: &str) -> InboundFrame {
    InboundFrame::Connect {
        socket_id: id.to_string(),
    }
}

fn data(id: &str, bytes: &'static [u8]) -> InboundFrame {
    InboundFrame::Data {
        socket_id: id.to_string(),
        data: Bytes::from_static(bytes),
    }
}

fn is_active(id: &'static str) -> impl Fn(&[edgelink_client::SessionSnapshot]) -> bool {
    move |sessions| {
        sessions
            .iter()
            .any(|s| s.id == id && s.state == SessionState::Active)
    }
}

#[tokio::test]
async fn test_session_bridges_bytes_both_ways() {
    let mut f = connected(Timing::default(), ProxyClientOptions::default()).await;

    f.conn.send(connect("S1")).await;
    let mut local = accept_local(&f.target).await;

    local.write_all(b"hello").await.unwrap();
    assert_eq!(
        next_frame(&mut f.conn).await,
        OutboundFrame::Data {
            socket_id: "S1".to_string(),
            data: Bytes::from_static(b"hello"),
        }
    );

    f.conn.send(data("S1", b"world")).await;
    let mut buf = [0u8; 5];
    local.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    // Exactly one local connect for the session
    assert!(
        tokio::time::timeout(Duration::from_millis(200), f.target.accept())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_refused_target_aborts_session() {
    init_tracing();
    let port = closed_port().await;
    let (connector, mut relay) = MemoryConnector::pair(64);
    let client = ProxyClient::with_connector(
        config(port, &Timing::default()),
        ProxyClientOptions::default(),
        connector,
    );
    client.connect().await.unwrap();
    let mut conn = relay.accept().await.unwrap();
    assert!(matches!(
        next_frame(&mut conn).await,
        OutboundFrame::RegisterServer(_)
    ));

    conn.send(connect("abc")).await;

    assert_eq!(
        next_frame(&mut conn).await,
        OutboundFrame::AbortClient {
            socket_id: "abc".to_string()
        }
    );
    // No error, no disconnect_client
    assert_quiet(&mut conn, Duration::from_millis(300)).await;

    let sessions = client.sessions().await.unwrap();
    assert!(sessions.is_empty());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_local_connect_timeout_reports_error_then_disconnect() {
    init_tracing();
    let (_listener, _queued, port) = saturated_listener().await;

    let config = edgelink_client::ProxyClientConfig::builder()
        .endpoint("wss://relay.test")
        .hostname("H")
        .target("127.0.0.1", port)
        .connect_timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let (connector, mut relay) = MemoryConnector::pair(64);
    let client = ProxyClient::with_connector(config, ProxyClientOptions::default(), connector);
    client.connect().await.unwrap();
    let mut conn = relay.accept().await.unwrap();
    assert!(matches!(
        next_frame(&mut conn).await,
        OutboundFrame::RegisterServer(_)
    ));

    conn.send(connect("slow")).await;
    let sessions = wait_sessions(&client, |s| !s.is_empty()).await;
    assert_eq!(sessions[0].state, SessionState::Connecting);

    match next_frame(&mut conn).await {
        OutboundFrame::Error { socket_id, message } => {
            assert_eq!(socket_id, "slow");
            assert!(message.contains("timed out"), "{}", message);
        }
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(
        next_frame(&mut conn).await,
        OutboundFrame::DisconnectClient {
            socket_id: "slow".to_string()
        }
    );
    assert_quiet(&mut conn, Duration::from_millis(200)).await;
    assert!(client.sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_data_for_unknown_session_is_dropped() {
    let mut f = connected(Timing::default(), ProxyClientOptions::default()).await;

    f.conn.send(data("ghost", b"boo")).await;
    f.conn
        .send(InboundFrame::End {
            socket_id: "ghost".to_string(),
        })
        .await;
    f.conn
        .send(InboundFrame::SocketError {
            socket_id: "ghost".to_string(),
        })
        .await;

    assert_quiet(&mut f.conn, Duration::from_millis(200)).await;
    assert!(f.client.sessions().await.unwrap().is_empty());
    assert!(
        tokio::time::timeout(Duration::from_millis(100), f.target.accept())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_end_destroys_after_grace() {
    let timing = Timing {
        end_grace: Duration::from_millis(300),
        ..Timing::default()
    };
    let mut f = connected(timing, ProxyClientOptions::default()).await;

    f.conn.send(connect("S1")).await;
    let mut local = accept_local(&f.target).await;
    wait_sessions(&f.client, is_active("S1")).await;

    let ended_at = Instant::now();
    f.conn
        .send(InboundFrame::End {
            socket_id: "S1".to_string(),
        })
        .await;

    let sessions = wait_sessions(&f.client, |s| {
        s.first().map(|s| s.state) == Some(SessionState::Closing)
    })
    .await;
    assert_eq!(sessions[0].timer, Some(TimerKind::EndGrace));

    // Still writable during the grace window
    f.conn.send(data("S1", b"tail")).await;
    let mut buf = [0u8; 4];
    local.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tail");

    // A repeated end does not restart the timer
    f.conn
        .send(InboundFrame::End {
            socket_id: "S1".to_string(),
        })
        .await;

    let rest = read_to_close(&mut local).await;
    assert!(rest.is_empty());
    assert!(ended_at.elapsed() >= Duration::from_millis(300));

    wait_sessions(&f.client, |s| s.is_empty()).await;
    assert_quiet(&mut f.conn, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_socket_error_then_data_never_reaches_local() {
    let mut f = connected(Timing::default(), ProxyClientOptions::default()).await;

    f.conn.send(connect("S1")).await;
    let mut local = accept_local(&f.target).await;
    wait_sessions(&f.client, is_active("S1")).await;

    f.conn
        .send(InboundFrame::SocketError {
            socket_id: "S1".to_string(),
        })
        .await;
    f.conn.send(data("S1", b"late")).await;

    let received = read_to_close(&mut local).await;
    assert!(received.is_empty());

    wait_sessions(&f.client, |s| s.is_empty()).await;
    // Relay-initiated aborts are silent
    assert_quiet(&mut f.conn, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_local_close_sends_data_then_disconnect() {
    let mut f = connected(Timing::default(), ProxyClientOptions::default()).await;

    f.conn.send(connect("S1")).await;
    let mut local = accept_local(&f.target).await;
    wait_sessions(&f.client, is_active("S1")).await;

    local.write_all(b"bye").await.unwrap();
    drop(local);

    let mut payload = Vec::new();
    loop {
        match next_frame(&mut f.conn).await {
            OutboundFrame::Data { socket_id, data } => {
                assert_eq!(socket_id, "S1");
                payload.extend_from_slice(&data);
            }
            OutboundFrame::DisconnectClient { socket_id } => {
                assert_eq!(socket_id, "S1");
                break;
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(payload, b"bye");

    wait_sessions(&f.client, |s| s.is_empty()).await;
    assert_quiet(&mut f.conn, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_local_reset_reports_error_before_disconnect() {
    let mut f = connected(Timing::default(), ProxyClientOptions::default()).await;

    f.conn.send(connect("S1")).await;
    let local = accept_local(&f.target).await;
    wait_sessions(&f.client, is_active("S1")).await;

    local.set_linger(Some(Duration::ZERO)).unwrap();
    drop(local);

    let mut frames = Vec::new();
    loop {
        let frame = next_frame(&mut f.conn).await;
        let done = matches!(frame, OutboundFrame::DisconnectClient { .. });
        frames.push(frame);
        if done {
            break;
        }
    }

    // A reset normally surfaces as an error; either way the disconnect comes last
    if frames.len() == 2 {
        assert!(matches!(&frames[0], OutboundFrame::Error { socket_id, .. } if socket_id == "S1"));
    } else {
        assert_eq!(frames.len(), 1);
    }
    wait_sessions(&f.client, |s| s.is_empty()).await;
}

#[tokio::test]
async fn test_duplicate_connect_keeps_first_session() {
    let mut f = connected(Timing::default(), ProxyClientOptions::default()).await;

    f.conn.send(connect("S1")).await;
    let mut local = accept_local(&f.target).await;
    wait_sessions(&f.client, is_active("S1")).await;

    f.conn.send(connect("S1")).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), f.target.accept())
            .await
            .is_err()
    );

    f.conn.send(data("S1", b"still")).await;
    let mut buf = [0u8; 5];
    local.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still");
    assert_eq!(f.client.sessions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_on_connection_hook_sees_session_ids() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook_seen = seen.clone();
    let options = ProxyClientOptions::default().on_connection(move |id| {
        hook_seen.lock().unwrap().push(id.to_string());
    });

    let f = connected(Timing::default(), options).await;
    f.conn.send(connect("a")).await;
    f.conn.send(connect("b")).await;
    let _a = accept_local(&f.target).await;
    let _b = accept_local(&f.target).await;

    wait_sessions(&f.client, |s| s.len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
}
