//! Control channel transport
//!
//! A control channel is one exclusive, authenticated connection from the edge
//! client to the relay. Every transport hands the client a [`ControlLink`]:
//!
//! - `outbound`: bounded queue of frames to write to the relay. A full queue
//!   makes senders wait, which is how local sockets get paused when the relay
//!   cannot keep up.
//! - `inbound`: decoded relay frames plus transport-level error and close
//!   signals, in arrival order.
//!
//! Connectors never reconnect on their own; retry policy belongs to whoever
//! drives the client.

pub mod config;
pub mod memory;
pub mod websocket;

pub use config::{ChannelConfig, TlsCredentials};
pub use memory::{MemoryConnector, MemoryRelay, RelayConnection};
pub use websocket::WebSocketConnector;

use async_trait::async_trait;
use edgelink_proto::{InboundFrame, OutboundFrame};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Events surfaced by an established control link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A decoded relay frame
    Frame(InboundFrame),
    /// Transport-level failure; informational, a `Closed` follows if the link is gone
    Error(String),
    /// The link is gone
    Closed(Option<String>),
}

/// An established control channel
#[derive(Debug)]
pub struct ControlLink {
    /// Identifier used in log lines
    pub connection_id: String,
    /// Frames to write to the relay
    pub outbound: mpsc::Sender<OutboundFrame>,
    /// Frames and signals read from the relay
    pub inbound: mpsc::Receiver<LinkEvent>,
    tasks: LinkTasks,
}

impl ControlLink {
    pub fn new(
        connection_id: String,
        outbound: mpsc::Sender<OutboundFrame>,
        inbound: mpsc::Receiver<LinkEvent>,
    ) -> Self {
        Self {
            connection_id,
            outbound,
            inbound,
            tasks: LinkTasks::default(),
        }
    }

    /// Attach I/O tasks that must not outlive the link
    pub fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = LinkTasks(tasks);
        self
    }

    /// Split into the outbound queue, the inbound stream and a guard that
    /// aborts the link's I/O tasks when dropped
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<OutboundFrame>,
        mpsc::Receiver<LinkEvent>,
        LinkTasks,
    ) {
        (self.outbound, self.inbound, self.tasks)
    }
}

/// I/O tasks owned by a link, aborted on drop
#[derive(Debug, Default)]
pub struct LinkTasks(Vec<JoinHandle<()>>);

impl Drop for LinkTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Opens control links to the relay
#[async_trait]
pub trait ControlConnector: Send + Sync + 'static {
    /// Establish a new link. Each call is one connect attempt.
    async fn connect(&self) -> TransportResult<ControlLink>;

    /// Human-readable transport name
    fn name(&self) -> &str;
}
