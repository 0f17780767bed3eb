//! WebSocket control channel
//!
//! One text message per frame. A writer task drains the bounded outbound
//! queue into the socket; a reader task decodes relay messages into
//! [`LinkEvent`]s. Both tasks are owned by the returned [`ControlLink`].

use crate::config::ChannelConfig;
use crate::{ControlConnector, ControlLink, LinkEvent, TransportError, TransportResult};
use async_trait::async_trait;
use edgelink_proto::{CodecError, FrameCodec, OutboundFrame};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream};
use tracing::{debug, error, info, trace, warn};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

const INBOUND_CAPACITY: usize = 1024;

/// WebSocket connector for the relay's control namespace
pub struct WebSocketConnector {
    config: ChannelConfig,
    tls_config: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("endpoint", &self.config.endpoint)
            .field("path", &self.config.path)
            .finish()
    }
}

impl WebSocketConnector {
    pub fn new(config: ChannelConfig) -> TransportResult<Self> {
        config.validate()?;

        let tls_config = config.build_tls_config()?;

        debug!("WebSocket connector created for {}", config.endpoint);

        Ok(Self { config, tls_config })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Writer task - encodes outbound frames onto the socket
    async fn writer_task(
        mut sink: SplitSink<WsStream, Message>,
        mut rx: mpsc::Receiver<OutboundFrame>,
        events: mpsc::Sender<LinkEvent>,
        conn_id: String,
    ) {
        while let Some(frame) = rx.recv().await {
            let text = match FrameCodec::encode_outbound(&frame) {
                Ok(text) => text,
                Err(e) => {
                    error!(
                        "[{}] Failed to encode '{}' frame: {}",
                        conn_id,
                        frame.event(),
                        e
                    );
                    continue;
                }
            };

            trace!(
                "[{}] -> {} ({} bytes)",
                conn_id,
                frame.event(),
                text.len()
            );

            if let Err(e) = sink.send(Message::Text(text)).await {
                error!("[{}] WebSocket send error: {}", conn_id, e);
                let _ = events.send(LinkEvent::Error(e.to_string())).await;
                let _ = events
                    .send(LinkEvent::Closed(Some(format!("send failed: {}", e))))
                    .await;
                return;
            }
        }

        debug!("[{}] WebSocket writer task ended", conn_id);
        let _ = sink.close().await;
    }

    /// Reader task - decodes relay messages into link events
    async fn reader_task(
        mut source: SplitStream<WsStream>,
        events: mpsc::Sender<LinkEvent>,
        conn_id: String,
    ) {
        let mut reason = None;

        while let Some(result) = source.next().await {
            let text = match result {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("[{}] Dropping non UTF-8 binary message", conn_id);
                        continue;
                    }
                },
                Ok(Message::Ping(_)) => {
                    // Pong is automatically handled by tungstenite
                    trace!("[{}] Received ping", conn_id);
                    continue;
                }
                Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(frame)) => {
                    debug!("[{}] WebSocket close received: {:?}", conn_id, frame);
                    reason = frame.map(|f| f.reason.to_string());
                    break;
                }
                Ok(Message::Frame(_)) => continue,
                Err(e) => {
                    error!("[{}] WebSocket read error: {}", conn_id, e);
                    let _ = events.send(LinkEvent::Error(e.to_string())).await;
                    reason = Some(e.to_string());
                    break;
                }
            };

            match FrameCodec::decode_inbound(&text) {
                Ok(frame) => {
                    trace!("[{}] <- {}", conn_id, frame.event());
                    if events.send(LinkEvent::Frame(frame)).await.is_err() {
                        debug!("[{}] Link consumer gone", conn_id);
                        return;
                    }
                }
                Err(CodecError::MissingSocketId(event)) => {
                    debug!("[{}] Ignoring '{}' frame without socketId", conn_id, event);
                }
                Err(e) => {
                    warn!("[{}] Ignoring undecodable frame: {}", conn_id, e);
                }
            }
        }

        debug!("[{}] WebSocket reader task ended", conn_id);
        let _ = events.send(LinkEvent::Closed(reason)).await;
    }
}

#[async_trait]
impl ControlConnector for WebSocketConnector {
    async fn connect(&self) -> TransportResult<ControlLink> {
        let url = self.config.control_url()?;
        debug!("Connecting to relay control channel: {}", url);

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);
        ws_config.max_frame_size = Some(self.config.max_message_size);

        let handshake = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            Some(ws_config),
            true,
            Some(Connector::Rustls(self.tls_config.clone())),
        );

        let (ws_stream, _response) = tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                TransportError::ConnectionError(format!("WebSocket handshake failed: {}", e))
            })?;

        let connection_id = format!("ws-{}", uuid::Uuid::new_v4());
        info!("[{}] Control channel established to {}", connection_id, url);

        let (sink, source) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let writer = tokio::spawn(Self::writer_task(
            sink,
            outbound_rx,
            inbound_tx.clone(),
            connection_id.clone(),
        ));
        let reader = tokio::spawn(Self::reader_task(
            source,
            inbound_tx,
            connection_id.clone(),
        ));

        Ok(ControlLink::new(connection_id, outbound_tx, inbound_rx).with_tasks(vec![writer, reader]))
    }

    fn name(&self) -> &str {
        "websocket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_rejects_invalid_config() {
        let result = WebSocketConnector::new(ChannelConfig::new("not a url"));
        assert!(matches!(
            result,
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_connector_debug_shows_endpoint() {
        let connector = WebSocketConnector::new(ChannelConfig::new("wss://relay.example.com")).unwrap();
        let debug = format!("{:?}", connector);
        assert!(debug.contains("relay.example.com"));
        assert_eq!(connector.name(), "websocket");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector =
            WebSocketConnector::new(ChannelConfig::new(format!("ws://127.0.0.1:{}", port))).unwrap();
        let result = connector.connect().await;
        assert!(matches!(result, Err(TransportError::ConnectionError(_))));
    }
}
