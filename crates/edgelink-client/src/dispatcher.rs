//! Dispatch loop
//!
//! Every input (client commands, connect results, relay frames, local socket
//! events, timers) funnels through one unbounded queue and is handled here,
//! one at a time. The loop is the only owner of the session registry and the
//! control link, and it never waits on the link's outbound queue: session
//! notices are handed to a per-link notice pump instead.

use crate::client::{ChannelState, ClientError, ProxyClientOptions};
use crate::connector::{LocalConnector, OutboundLink};
use crate::registry::{SessionRegistry, SessionSnapshot};
use crate::session::{Notice, SessionError, SessionEvent};
use edgelink_proto::{InboundFrame, OutboundFrame, Registration, SessionId};
use edgelink_transport::{ControlConnector, ControlLink, LinkEvent, LinkTasks, TransportResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Requests from the public client handle
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
pub(crate) enum DispatchEvent {
    Command(Command),
    /// Outcome of the connect attempt started for `epoch`
    ConnectFinished {
        epoch: u64,
        result: TransportResult<ControlLink>,
    },
    /// Something happened on the link established for `epoch`
    Link { epoch: u64, event: LinkEvent },
    /// Reported by a session's local socket task
    Local {
        session_id: SessionId,
        generation: u64,
        event: SessionEvent,
    },
    Timer { session_id: SessionId, token: u64 },
}

/// Settings the dispatcher needs beyond its channels
pub(crate) struct DispatcherSettings {
    pub registration: Registration,
    pub target_host: String,
    pub target_port: u16,
    pub connect_timeout: Duration,
    pub read_buffer_size: usize,
    pub end_grace: Duration,
    pub teardown_grace: Duration,
}

struct ActiveLink {
    epoch: u64,
    connection_id: String,
    notices: mpsc::UnboundedSender<OutboundFrame>,
    forwarder: JoinHandle<()>,
    notice_pump: JoinHandle<()>,
    _tasks: LinkTasks,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.forwarder.abort();
        self.notice_pump.abort();
    }
}

// Moves session notices into the bounded outbound queue in order. A notice is
// produced after its session's reader has queued its last data frame, so
// data still precedes disconnect_client on the wire.
async fn pump_notices(
    connection_id: String,
    outbound: mpsc::Sender<OutboundFrame>,
    mut notices: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    while let Some(frame) = notices.recv().await {
        if outbound.send(frame).await.is_err() {
            debug!("[{}] Outbound queue closed, notice pump stopped", connection_id);
            return;
        }
    }
}

pub(crate) struct Dispatcher {
    registration: Registration,
    connector: Arc<dyn ControlConnector>,
    registry: SessionRegistry,
    options: ProxyClientOptions,
    events_tx: mpsc::UnboundedSender<DispatchEvent>,
    events_rx: mpsc::UnboundedReceiver<DispatchEvent>,
    state_tx: watch::Sender<ChannelState>,
    outbound_tx: watch::Sender<Option<mpsc::Sender<OutboundFrame>>>,
    link: Option<ActiveLink>,
    epoch: u64,
    pending_connects: Vec<oneshot::Sender<Result<(), ClientError>>>,
    server_created: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        settings: DispatcherSettings,
        connector: Arc<dyn ControlConnector>,
        options: ProxyClientOptions,
        events_tx: mpsc::UnboundedSender<DispatchEvent>,
        events_rx: mpsc::UnboundedReceiver<DispatchEvent>,
        state_tx: watch::Sender<ChannelState>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = watch::channel(None);

        let local = LocalConnector::new(
            &settings.target_host,
            settings.target_port,
            settings.connect_timeout,
            settings.read_buffer_size,
            events_tx.clone(),
            OutboundLink::new(outbound_rx),
        );
        let registry = SessionRegistry::new(
            local,
            events_tx.clone(),
            settings.end_grace,
            settings.teardown_grace,
        );

        Self {
            registration: settings.registration,
            connector,
            registry,
            options,
            events_tx,
            events_rx,
            state_tx,
            outbound_tx,
            link: None,
            epoch: 0,
            pending_connects: Vec::new(),
            server_created: false,
        }
    }

    fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_replace(state);
    }

    pub(crate) async fn run(mut self) {
        debug!(
            "Dispatcher started for {} via {}",
            self.registration.hostname,
            self.connector.name()
        );

        while let Some(event) = self.events_rx.recv().await {
            match event {
                DispatchEvent::Command(Command::Shutdown { reply }) => {
                    self.shutdown();
                    let _ = reply.send(());
                    break;
                }
                DispatchEvent::Command(Command::Connect { reply }) => self.handle_connect(reply),
                DispatchEvent::Command(Command::Sessions { reply }) => {
                    let _ = reply.send(self.registry.snapshot());
                }
                DispatchEvent::ConnectFinished { epoch, result } => {
                    self.handle_connect_finished(epoch, result);
                }
                DispatchEvent::Link { epoch, event } => self.handle_link_event(epoch, event),
                DispatchEvent::Local {
                    session_id,
                    generation,
                    event,
                } => {
                    let notices = self.registry.local_event(&session_id, generation, event);
                    self.send_notices(&session_id, notices);
                }
                DispatchEvent::Timer { session_id, token } => {
                    if let Some(event) = self.registry.timer_fired(&session_id, token) {
                        let notices = self.registry.transition(&session_id, event);
                        self.send_notices(&session_id, notices);
                    }
                }
            }
        }

        debug!("Dispatcher stopped");
    }

    fn handle_connect(&mut self, reply: oneshot::Sender<Result<(), ClientError>>) {
        match self.state() {
            ChannelState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ChannelState::Connecting => {
                // Share the attempt already in flight
                self.pending_connects.push(reply);
            }
            ChannelState::Disconnected => {
                self.epoch += 1;
                let epoch = self.epoch;
                self.pending_connects.push(reply);
                self.set_state(ChannelState::Connecting);

                info!(
                    "Connecting control channel ({}) for {}",
                    self.connector.name(),
                    self.registration.hostname
                );

                let connector = self.connector.clone();
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = connector.connect().await;
                    let _ = events.send(DispatchEvent::ConnectFinished { epoch, result });
                });
            }
        }
    }

    fn handle_connect_finished(&mut self, epoch: u64, result: TransportResult<ControlLink>) {
        if epoch != self.epoch || self.state() != ChannelState::Connecting {
            debug!("Discarding result of superseded connect attempt");
            return;
        }

        let link = match result {
            Ok(link) => link,
            Err(e) => {
                warn!("Control channel connect failed: {}", e);
                self.set_state(ChannelState::Disconnected);
                let err = ClientError::from(e);
                for reply in self.pending_connects.drain(..) {
                    let _ = reply.send(Err(err.clone()));
                }
                return;
            }
        };

        let connection_id = link.connection_id.clone();
        let (outbound, mut inbound, tasks) = link.into_parts();

        // Registration goes out before any session frame can use the link.
        // The queue is fresh, so anything but a closed link leaves room for it.
        let register = OutboundFrame::RegisterServer(self.registration.clone());
        if let Err(e) = outbound.try_send(register) {
            warn!(
                "[{}] Could not queue registration: {}",
                connection_id, e
            );
            self.set_state(ChannelState::Disconnected);
            for reply in self.pending_connects.drain(..) {
                let _ = reply.send(Err(ClientError::ConnectionError(
                    "control channel closed before registration".to_string(),
                )));
            }
            return;
        }

        let events = self.events_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let closed = matches!(event, LinkEvent::Closed(_));
                if events.send(DispatchEvent::Link { epoch, event }).is_err() || closed {
                    return;
                }
            }
            let _ = events.send(DispatchEvent::Link {
                epoch,
                event: LinkEvent::Closed(None),
            });
        });

        let (notices, notice_rx) = mpsc::unbounded_channel();
        let notice_pump = tokio::spawn(pump_notices(
            connection_id.clone(),
            outbound.clone(),
            notice_rx,
        ));

        self.outbound_tx.send_replace(Some(outbound));
        self.link = Some(ActiveLink {
            epoch,
            connection_id: connection_id.clone(),
            notices,
            forwarder,
            notice_pump,
            _tasks: tasks,
        });
        self.set_state(ChannelState::Connected);

        let cancelled = self.registry.cancel_teardown();
        if cancelled > 0 {
            info!(
                "[{}] Control channel back, kept {} sessions",
                connection_id, cancelled
            );
        }

        info!(
            "[{}] Registered {} ({}) with relay",
            connection_id, self.registration.hostname, self.registration.server_type
        );

        if let Some(on_connect) = &self.options.on_connect {
            on_connect();
        }

        for reply in self.pending_connects.drain(..) {
            let _ = reply.send(Ok(()));
        }
    }

    fn handle_link_event(&mut self, epoch: u64, event: LinkEvent) {
        if self.link.as_ref().map(|link| link.epoch) != Some(epoch) {
            trace!("Ignoring event from stale control link");
            return;
        }

        match event {
            LinkEvent::Frame(frame) => self.handle_frame(frame),
            LinkEvent::Error(message) => {
                warn!("Control channel error: {}", message);
            }
            LinkEvent::Closed(reason) => self.channel_dropped(reason),
        }
    }

    fn channel_dropped(&mut self, reason: Option<String>) {
        let connection_id = self
            .link
            .take()
            .map(|link| link.connection_id.clone())
            .unwrap_or_default();
        self.outbound_tx.send_replace(None);
        self.set_state(ChannelState::Disconnected);

        let scheduled = self.registry.arm_teardown();
        warn!(
            "[{}] Control channel closed ({}); {} sessions open, {} scheduled for teardown",
            connection_id,
            reason.as_deref().unwrap_or("no reason"),
            self.registry.len(),
            scheduled
        );
    }

    fn handle_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Connect { socket_id } => match self.registry.create(&socket_id) {
                Ok(()) => {
                    if let Some(on_connection) = &self.options.on_connection {
                        on_connection(&socket_id);
                    }
                }
                Err(SessionError::DuplicateSession(id)) => {
                    warn!("Relay requested session {} which already exists", id);
                }
            },
            InboundFrame::Data { socket_id, data } => {
                let len = data.len();
                if !self.registry.write(&socket_id, data) {
                    trace!(
                        "Dropping {} bytes for unknown session {}",
                        len,
                        socket_id
                    );
                }
            }
            InboundFrame::SocketError { socket_id } => {
                let notices = self.registry.transition(&socket_id, SessionEvent::RelayAbort);
                self.send_notices(&socket_id, notices);
            }
            InboundFrame::End { socket_id } => {
                let notices = self.registry.transition(&socket_id, SessionEvent::RelayEnd);
                self.send_notices(&socket_id, notices);
            }
            InboundFrame::Registered { info } => {
                if self.server_created {
                    debug!("Relay repeated registration ack");
                    return;
                }
                self.server_created = true;
                info!("Relay acknowledged {}", self.registration.hostname);
                if let Some(on_local_server_created) = &self.options.on_local_server_created {
                    on_local_server_created(&info);
                }
            }
        }
    }

    fn send_notices(&self, session_id: &str, notices: Option<Vec<Notice>>) {
        let Some(notices) = notices else {
            return;
        };

        for notice in notices {
            let frame = notice.into_frame(session_id);
            let Some(link) = &self.link else {
                debug!(
                    "Control channel down, dropped '{}' for session {}",
                    frame.event(),
                    session_id
                );
                continue;
            };
            if link.notices.send(frame).is_err() {
                error!(
                    "[{}] Notice pump gone, frame for session {} lost",
                    link.connection_id, session_id
                );
            }
        }
    }

    fn shutdown(&mut self) {
        let destroyed = self.registry.destroy_all();
        self.link = None;
        self.outbound_tx.send_replace(None);
        self.set_state(ChannelState::Disconnected);

        for reply in self.pending_connects.drain(..) {
            let _ = reply.send(Err(ClientError::ChannelClosed));
        }

        info!(
            "Proxy client for {} destroyed ({} sessions closed)",
            self.registration.hostname, destroyed
        );
    }
}
