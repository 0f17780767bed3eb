//! Proxy client - public handle over the dispatch loop

use crate::config::ProxyClientConfig;
use crate::dispatcher::{Command, DispatchEvent, Dispatcher, DispatcherSettings};
use crate::registry::SessionSnapshot;
use edgelink_proto::Registration;
use edgelink_transport::{ControlConnector, TransportError, WebSocketConnector};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Proxy client errors
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Client destroyed")]
    ChannelClosed,
}

impl ClientError {
    /// Returns true if this error is non-recoverable and retrying won't help
    pub fn is_non_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::ConfigError(_) | ClientError::ChannelClosed
        )
    }

    /// Returns true if this error is recoverable and retrying might succeed
    pub fn is_recoverable(&self) -> bool {
        !self.is_non_recoverable()
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConfigurationError(msg) | TransportError::TlsError(msg) => {
                ClientError::ConfigError(msg)
            }
            other => ClientError::ConnectionError(other.to_string()),
        }
    }
}

/// Control channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

pub type ConnectHook = Arc<dyn Fn() + Send + Sync>;
pub type LocalServerCreatedHook = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;
pub type ConnectionHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional callbacks. They run inside the dispatch loop and must not block.
#[derive(Clone, Default)]
pub struct ProxyClientOptions {
    /// Fired once per successful registration
    pub on_connect: Option<ConnectHook>,
    /// Fired once, on the first registration ack, with the relay's payload
    pub on_local_server_created: Option<LocalServerCreatedHook>,
    /// Fired after a local connect was started for a new session
    pub on_connection: Option<ConnectionHook>,
}

impl ProxyClientOptions {
    pub fn on_connect(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    pub fn on_local_server_created(
        mut self,
        hook: impl Fn(&serde_json::Value) + Send + Sync + 'static,
    ) -> Self {
        self.on_local_server_created = Some(Arc::new(hook));
        self
    }

    pub fn on_connection(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_connection = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for ProxyClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClientOptions")
            .field("on_connect", &self.on_connect.is_some())
            .field(
                "on_local_server_created",
                &self.on_local_server_created.is_some(),
            )
            .field("on_connection", &self.on_connection.is_some())
            .finish()
    }
}

/// Edge proxy client
///
/// Owns the dispatch loop that multiplexes relay sessions onto local TCP
/// connections. Connecting is explicit: call [`ProxyClient::connect`] again
/// after the channel drops to resume. Sessions survive a short outage and
/// are torn down after the teardown grace if the channel stays down.
pub struct ProxyClient {
    events: mpsc::UnboundedSender<DispatchEvent>,
    state_rx: watch::Receiver<ChannelState>,
    task: JoinHandle<()>,
}

impl ProxyClient {
    /// Create a client talking to the relay over WebSocket. Must be called
    /// from within a Tokio runtime.
    pub fn new(config: ProxyClientConfig, options: ProxyClientOptions) -> Result<Self, ClientError> {
        config.validate()?;
        let connector = WebSocketConnector::new(config.channel_config())?;
        Ok(Self::with_connector(config, options, connector))
    }

    /// Create a client over any control channel transport
    pub fn with_connector<C: ControlConnector>(
        config: ProxyClientConfig,
        options: ProxyClientOptions,
        connector: C,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);

        let settings = DispatcherSettings {
            registration: Registration::new(config.hostname, config.server_type),
            target_host: config.target_host,
            target_port: config.target_port,
            connect_timeout: config.connect_timeout,
            read_buffer_size: config.read_buffer_size,
            end_grace: config.end_grace,
            teardown_grace: config.teardown_grace,
        };

        let dispatcher = Dispatcher::new(
            settings,
            Arc::new(connector),
            options,
            events_tx.clone(),
            events_rx,
            state_tx,
        );
        let task = tokio::spawn(dispatcher.run());

        Self {
            events: events_tx,
            state_rx,
            task,
        }
    }

    /// Establish the control channel and register. Resolves once registered;
    /// a no-op while already connected.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect { reply })?;
        rx.await.map_err(|_| ClientError::ChannelClosed)?
    }

    /// Snapshot of the live sessions, ordered by id
    pub async fn sessions(&self) -> Result<Vec<SessionSnapshot>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Sessions { reply })?;
        rx.await.map_err(|_| ClientError::ChannelClosed)
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Watch channel state changes
    pub fn channel_state(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Resolve once the channel is not (or no longer) connected
    pub async fn wait_disconnected(&self) {
        let mut state = self.state_rx.clone();
        let _ = state
            .wait_for(|state| *state != ChannelState::Connected)
            .await;
    }

    /// Close every session and the control channel, then stop the dispatch loop
    pub async fn destroy(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.events
            .send(DispatchEvent::Command(command))
            .map_err(|_| ClientError::ChannelClosed)
    }
}

impl Drop for ProxyClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recoverability() {
        assert!(ClientError::ConnectionError("refused".to_string()).is_recoverable());
        assert!(ClientError::ProtocolError("bad frame".to_string()).is_recoverable());
        assert!(ClientError::ConfigError("no hostname".to_string()).is_non_recoverable());
        assert!(ClientError::ChannelClosed.is_non_recoverable());
    }

    #[test]
    fn test_transport_error_mapping() {
        let err: ClientError = TransportError::TlsError("bad key".to_string()).into();
        assert!(matches!(err, ClientError::ConfigError(_)));

        let err: ClientError = TransportError::Timeout.into();
        assert!(matches!(err, ClientError::ConnectionError(_)));
    }

    #[test]
    fn test_options_debug_hides_closures() {
        let options = ProxyClientOptions::default().on_connect(|| {});
        let debug = format!("{:?}", options);
        assert!(debug.contains("on_connect: true"));
        assert!(debug.contains("on_connection: false"));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let result = ProxyClient::new(ProxyClientConfig::default(), ProxyClientOptions::default());
        assert!(matches!(result, Err(ClientError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_destroyed_client_rejects_commands() {
        let config = ProxyClientConfig::builder()
            .endpoint("ws://127.0.0.1:9")
            .hostname("h")
            .target("127.0.0.1", 9)
            .build()
            .unwrap();
        let client = ProxyClient::new(config, ProxyClientOptions::default()).unwrap();

        client.destroy().await;
        assert!(matches!(
            client.connect().await,
            Err(ClientError::ChannelClosed)
        ));
        assert!(client.sessions().await.is_err());
        assert_eq!(client.state(), ChannelState::Disconnected);
    }
}
