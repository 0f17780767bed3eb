//! Local connector - one TCP connection to the fixed target per session

use crate::dispatcher::DispatchEvent;
use crate::session::{LocalFailure, SessionEvent};
use bytes::Bytes;
use edgelink_proto::OutboundFrame;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Shared view of the current control link's outbound queue.
/// `None` while the channel is down.
#[derive(Debug, Clone)]
pub(crate) struct OutboundLink {
    current: watch::Receiver<Option<mpsc::Sender<OutboundFrame>>>,
}

impl OutboundLink {
    pub(crate) fn new(current: watch::Receiver<Option<mpsc::Sender<OutboundFrame>>>) -> Self {
        Self { current }
    }

    /// Queue a frame on the current link, waiting while the queue is full.
    /// Returns false when there is no link to send on.
    pub(crate) async fn send(&self, frame: OutboundFrame) -> bool {
        // Clone out of the watch so the borrow is not held across the await
        let sender = self.current.borrow().clone();
        match sender {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }
}

/// Opens local sockets and pumps bytes for them
#[derive(Debug, Clone)]
pub(crate) struct LocalConnector {
    target: String,
    connect_timeout: Duration,
    read_buffer_size: usize,
    events: mpsc::UnboundedSender<DispatchEvent>,
    outbound: OutboundLink,
}

/// Handle to a session's local socket task.
/// Dropping it aborts the task, which closes the socket.
#[derive(Debug)]
pub(crate) struct LocalSocket {
    writer: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

impl LocalSocket {
    /// Queue bytes for the local socket. Bytes queued before the connect
    /// completes are written once it does.
    pub(crate) fn write(&self, data: Bytes) -> bool {
        self.writer.send(data).is_ok()
    }
}

impl Drop for LocalSocket {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum PumpEnd {
    Closed,
    Failed(LocalFailure),
    /// The session dropped its writer; it is being destroyed
    Detached,
}

impl LocalConnector {
    pub(crate) fn new(
        target_host: &str,
        target_port: u16,
        connect_timeout: Duration,
        read_buffer_size: usize,
        events: mpsc::UnboundedSender<DispatchEvent>,
        outbound: OutboundLink,
    ) -> Self {
        Self {
            target: format!("{}:{}", target_host, target_port),
            connect_timeout,
            read_buffer_size: read_buffer_size.max(1),
            events,
            outbound,
        }
    }

    pub(crate) fn target(&self) -> &str {
        &self.target
    }

    /// Start connecting to the target on behalf of `session_id`
    pub(crate) fn open(&self, session_id: &str, generation: u64) -> LocalSocket {
        let (writer, rx) = mpsc::unbounded_channel();
        let this = self.clone();
        let session_id = session_id.to_string();

        let task = tokio::spawn(async move {
            this.run(session_id, generation, rx).await;
        });

        LocalSocket { writer, task }
    }

    fn report(&self, session_id: &str, generation: u64, event: SessionEvent) {
        let _ = self.events.send(DispatchEvent::Local {
            session_id: session_id.to_string(),
            generation,
            event,
        });
    }

    async fn run(self, session_id: String, generation: u64, rx: mpsc::UnboundedReceiver<Bytes>) {
        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&self.target),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let failure = LocalFailure::from_io(&e);
                if failure.is_refusal() {
                    debug!(
                        "Local target {} refused session {}",
                        self.target, session_id
                    );
                } else {
                    error!(
                        "Failed to connect to local target {} (session {}): {}",
                        self.target, session_id, e
                    );
                }
                self.report(
                    &session_id,
                    generation,
                    SessionEvent::LocalConnectFailed(failure),
                );
                return;
            }
            Err(_) => {
                error!(
                    "Timed out connecting to local target {} (session {})",
                    self.target, session_id
                );
                self.report(
                    &session_id,
                    generation,
                    SessionEvent::LocalConnectFailed(LocalFailure::other(format!(
                        "connect to {} timed out",
                        self.target
                    ))),
                );
                return;
            }
        };

        debug!(
            "Connected to local target {} (session {})",
            self.target, session_id
        );
        let _ = stream.set_nodelay(true);
        self.report(&session_id, generation, SessionEvent::LocalConnected);

        let (read_half, write_half) = stream.into_split();

        let end = tokio::select! {
            end = self.read_pump(&session_id, read_half) => end,
            end = Self::write_pump(&session_id, write_half, rx) => end,
        };

        match end {
            PumpEnd::Closed => {
                debug!("Local target closed session {}", session_id);
                self.report(&session_id, generation, SessionEvent::LocalClosed);
            }
            PumpEnd::Failed(failure) => {
                error!(
                    "Error talking to {} (session {}): {}",
                    self.target, session_id, failure.message
                );
                self.report(&session_id, generation, SessionEvent::LocalError(failure));
            }
            PumpEnd::Detached => {
                trace!("Session {} detached from its local socket", session_id);
            }
        }
    }

    // Local -> relay. Awaiting the bounded outbound queue pauses reading while the relay is slow.
    async fn read_pump(&self, session_id: &str, mut read_half: OwnedReadHalf) -> PumpEnd {
        let mut buffer = vec![0u8; self.read_buffer_size];
        loop {
            match read_half.read(&mut buffer).await {
                Ok(0) => return PumpEnd::Closed,
                Ok(n) => {
                    trace!("Read {} bytes from local target (session {})", n, session_id);
                    let frame = OutboundFrame::Data {
                        socket_id: session_id.to_string(),
                        data: Bytes::copy_from_slice(&buffer[..n]),
                    };
                    if !self.outbound.send(frame).await {
                        debug!(
                            "Control channel down, dropped {} bytes (session {})",
                            n, session_id
                        );
                    }
                }
                Err(e) => return PumpEnd::Failed(LocalFailure::from_io(&e)),
            }
        }
    }

    // Relay -> local
    async fn write_pump(
        session_id: &str,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> PumpEnd {
        while let Some(data) = rx.recv().await {
            trace!(
                "Writing {} bytes to local target (session {})",
                data.len(),
                session_id
            );
            if let Err(e) = write_half.write_all(&data).await {
                return PumpEnd::Failed(LocalFailure::from_io(&e));
            }
        }
        PumpEnd::Detached
    }
}
