//! WebSocket control channel against a real tungstenite server on loopback
use bytes::Bytes;
use edgelink_proto::{FrameCodec, InboundFrame, OutboundFrame, Registration};
use edgelink_transport::{ChannelConfig, ControlConnector, LinkEvent, WebSocketConnector};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

type ServerStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

async fn relay_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    (listener, endpoint)
}

async fn accept_relay(listener: &TcpListener, path: Arc<Mutex<String>>) -> ServerStream {
    let (stream, _) = listener.accept().await.unwrap();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        *path.lock().unwrap() = req.uri().path().to_string();
        Ok(resp)
    };
    tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .unwrap()
}

async fn next_text(server: &mut ServerStream) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), server.next())
            .await
            .expect("timed out waiting for client frame")
            .expect("client stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return text;
        }
    }
}

async fn next_event(inbound: &mut tokio::sync::mpsc::Receiver<LinkEvent>) -> LinkEvent {
    tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("timed out waiting for link event")
        .expect("link closed without event")
}

#[tokio::test]
async fn test_frames_cross_the_control_namespace() {
    let (listener, endpoint) = relay_listener().await;
    let path = Arc::new(Mutex::new(String::new()));

    let server_path = path.clone();
    let server = tokio::spawn(async move { accept_relay(&listener, server_path).await });

    let connector = WebSocketConnector::new(ChannelConfig::new(endpoint)).unwrap();
    let link = connector.connect().await.unwrap();
    assert!(link.connection_id.starts_with("ws-"));
    let mut server = server.await.unwrap();
    assert_eq!(path.lock().unwrap().as_str(), "/control");

    let (outbound, mut inbound, _tasks) = link.into_parts();

    // Client -> relay
    outbound
        .send(OutboundFrame::RegisterServer(Registration::new(
            "edge-1", "HTTPS",
        )))
        .await
        .unwrap();
    outbound
        .send(OutboundFrame::Data {
            socket_id: "S1".to_string(),
            data: Bytes::from_static(b"pong"),
        })
        .await
        .unwrap();

    let register: serde_json::Value = serde_json::from_str(&next_text(&mut server).await).unwrap();
    assert_eq!(
        register,
        serde_json::json!({
            "event": "register_server",
            "payload": {"hostname": "edge-1", "type": "HTTPS"}
        })
    );
    assert_eq!(
        FrameCodec::decode_outbound(&next_text(&mut server).await).unwrap(),
        OutboundFrame::Data {
            socket_id: "S1".to_string(),
            data: Bytes::from_static(b"pong"),
        }
    );

    // Relay -> client
    let connect = FrameCodec::encode_inbound(&InboundFrame::Connect {
        socket_id: "S1".to_string(),
    })
    .unwrap();
    server.send(Message::Text(connect)).await.unwrap();

    assert_eq!(
        next_event(&mut inbound).await,
        LinkEvent::Frame(InboundFrame::Connect {
            socket_id: "S1".to_string()
        })
    );
}

#[tokio::test]
async fn test_undecodable_frames_are_skipped() {
    let (listener, endpoint) = relay_listener().await;
    let path = Arc::new(Mutex::new(String::new()));
    let server = tokio::spawn(async move { accept_relay(&listener, path).await });

    let connector = WebSocketConnector::new(ChannelConfig::new(endpoint)).unwrap();
    let link = connector.connect().await.unwrap();
    let mut server = server.await.unwrap();
    let (_outbound, mut inbound, _tasks) = link.into_parts();

    for text in [
        "garbage",
        r#"{"event":"ping"}"#,
        r#"{"event":"_end"}"#,
        r#"{"event":"data","payload":{"socketId":"S1","data":"!!"}}"#,
    ] {
        server.send(Message::Text(text.to_string())).await.unwrap();
    }
    server
        .send(Message::Text(
            r#"{"event":"end","payload":{"socketId":"S2"}}"#.to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(
        next_event(&mut inbound).await,
        LinkEvent::Frame(InboundFrame::End {
            socket_id: "S2".to_string()
        })
    );
}

#[tokio::test]
async fn test_relay_close_surfaces_closed_event() {
    let (listener, endpoint) = relay_listener().await;
    let path = Arc::new(Mutex::new(String::new()));
    let server = tokio::spawn(async move { accept_relay(&listener, path).await });

    let connector = WebSocketConnector::new(ChannelConfig::new(endpoint)).unwrap();
    let link = connector.connect().await.unwrap();
    let mut server = server.await.unwrap();
    let (_outbound, mut inbound, _tasks) = link.into_parts();

    server.close(None).await.unwrap();

    match next_event(&mut inbound).await {
        LinkEvent::Closed(_) => {}
        other => panic!("expected Closed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_relay_vanishing_surfaces_closed_event() {
    let (listener, endpoint) = relay_listener().await;
    let path = Arc::new(Mutex::new(String::new()));
    let server = tokio::spawn(async move { accept_relay(&listener, path).await });

    let connector = WebSocketConnector::new(ChannelConfig::new(endpoint)).unwrap();
    let link = connector.connect().await.unwrap();
    let server = server.await.unwrap();
    let (_outbound, mut inbound, _tasks) = link.into_parts();

    drop(server);

    // Abrupt disconnects may be reported as an error first
    loop {
        match next_event(&mut inbound).await {
            LinkEvent::Closed(_) => break,
            LinkEvent::Error(_) => continue,
            other => panic!("unexpected event {:?}", other),
        }
    }
}
