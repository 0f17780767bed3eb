//! In-process control channel
//!
//! `MemoryConnector` hands out links whose other end is a [`RelayConnection`]
//! accepted from a [`MemoryRelay`]. Used to script a relay in tests and to
//! embed the client next to a relay in the same process.

use crate::{ControlConnector, ControlLink, LinkEvent, TransportError, TransportResult};
use async_trait::async_trait;
use edgelink_proto::{InboundFrame, OutboundFrame};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const INBOUND_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Shared {
    accepting: AtomicBool,
    attempts: AtomicUsize,
}

/// Client side of an in-process relay
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<RelayConnection>,
    shared: Arc<Shared>,
    outbound_buffer: usize,
}

/// Relay side: yields one [`RelayConnection`] per successful connect
#[derive(Debug)]
pub struct MemoryRelay {
    accept_rx: mpsc::UnboundedReceiver<RelayConnection>,
    shared: Arc<Shared>,
}

impl MemoryConnector {
    /// Create a connected connector/relay pair. `outbound_buffer` bounds the
    /// client-to-relay frame queue of every link.
    pub fn pair(outbound_buffer: usize) -> (MemoryConnector, MemoryRelay) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            accepting: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
        });

        (
            MemoryConnector {
                accept_tx,
                shared: shared.clone(),
                outbound_buffer: outbound_buffer.max(1),
            },
            MemoryRelay { accept_rx, shared },
        )
    }
}

#[async_trait]
impl ControlConnector for MemoryConnector {
    async fn connect(&self) -> TransportResult<ControlLink> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);

        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(
                "relay refused the connection".to_string(),
            ));
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let connection_id = format!("mem-{}", uuid::Uuid::new_v4());

        let connection = RelayConnection {
            connection_id: connection_id.clone(),
            outbound: outbound_rx,
            inbound: inbound_tx,
        };

        self.accept_tx
            .send(connection)
            .map_err(|_| TransportError::ConnectionError("relay is gone".to_string()))?;

        debug!("[{}] In-memory control link established", connection_id);
        Ok(ControlLink::new(connection_id, outbound_tx, inbound_rx))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

impl MemoryRelay {
    /// Wait for the next client link
    pub async fn accept(&mut self) -> Option<RelayConnection> {
        self.accept_rx.recv().await
    }

    /// Refuse (or accept again) subsequent connect attempts
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Number of connect attempts seen so far, refused ones included
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

/// Relay end of one in-memory link. Dropping it closes the link.
#[derive(Debug)]
pub struct RelayConnection {
    connection_id: String,
    outbound: mpsc::Receiver<OutboundFrame>,
    inbound: mpsc::Sender<LinkEvent>,
}

impl RelayConnection {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Deliver a frame to the client. Returns false once the client is gone.
    pub async fn send(&self, frame: InboundFrame) -> bool {
        self.inbound.send(LinkEvent::Frame(frame)).await.is_ok()
    }

    /// Raise a non-fatal transport error on the client side
    pub async fn error(&self, message: impl Into<String>) -> bool {
        self.inbound
            .send(LinkEvent::Error(message.into()))
            .await
            .is_ok()
    }

    /// Next frame written by the client; `None` once the client dropped the link
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }

    /// Next already-queued frame, without waiting
    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.try_recv().ok()
    }

    /// Close the link with a reason
    pub async fn close(self, reason: impl Into<String>) {
        let _ = self
            .inbound
            .send(LinkEvent::Closed(Some(reason.into())))
            .await;
    }
}
