//! Session registry
//!
//! Single-owner map from session id to session, living inside the dispatch
//! loop. Each session exclusively owns its local socket and at most one
//! pending timer; both are released when the session is destroyed.

use crate::connector::{LocalConnector, LocalSocket};
use crate::dispatcher::DispatchEvent;
use crate::session::{Notice, SessionError, SessionEvent, SessionState};
use bytes::Bytes;
use edgelink_proto::SessionId;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// What a pending timer will do when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimerKind {
    /// Relay ended the session; close after the grace window
    EndGrace,
    /// Control channel dropped; close unless it comes back in time
    ChannelTeardown,
}

impl TimerKind {
    fn event(self) -> SessionEvent {
        match self {
            TimerKind::EndGrace => SessionEvent::GraceElapsed,
            TimerKind::ChannelTeardown => SessionEvent::TeardownElapsed,
        }
    }
}

/// Point-in-time view of a live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: SessionState,
    pub timer: Option<TimerKind>,
}

impl SessionSnapshot {
    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }
}

/// Scheduled transition owned by a session. Dropping it cancels the timer.
#[derive(Debug)]
struct PendingTimer {
    kind: TimerKind,
    token: u64,
    handle: JoinHandle<()>,
}

impl Drop for PendingTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    generation: u64,
    socket: LocalSocket,
    timer: Option<PendingTimer>,
}

#[derive(Debug)]
pub(crate) struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    connector: LocalConnector,
    events: mpsc::UnboundedSender<DispatchEvent>,
    end_grace: Duration,
    teardown_grace: Duration,
    next_token: u64,
}

impl SessionRegistry {
    pub(crate) fn new(
        connector: LocalConnector,
        events: mpsc::UnboundedSender<DispatchEvent>,
        end_grace: Duration,
        teardown_grace: Duration,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            connector,
            events,
            end_grace,
            teardown_grace,
            next_token: 0,
        }
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Insert a new session in Connecting and start its local connect
    pub(crate) fn create(&mut self, session_id: &str) -> Result<(), SessionError> {
        if self.sessions.contains_key(session_id) {
            return Err(SessionError::DuplicateSession(session_id.to_string()));
        }

        let generation = self.token();
        let socket = self.connector.open(session_id, generation);

        debug!(
            "Session {} created, connecting to {}",
            session_id,
            self.connector.target()
        );
        self.sessions.insert(
            session_id.to_string(),
            Session {
                state: SessionState::Connecting,
                generation,
                socket,
                timer: None,
            },
        );
        Ok(())
    }

    /// Advance a session's state machine. Unknown ids and inapplicable events
    /// yield `None`; otherwise the frames owed to the relay.
    pub(crate) fn transition(
        &mut self,
        session_id: &str,
        event: SessionEvent,
    ) -> Option<Vec<Notice>> {
        let session = self.sessions.get_mut(session_id)?;
        let Some(transition) = session.state.on(&event) else {
            trace!(
                "Session {} ignores {:?} in {:?}",
                session_id,
                event,
                session.state
            );
            return None;
        };

        debug!(
            "Session {}: {:?} -> {:?} on {:?}",
            session_id, session.state, transition.to, event
        );
        session.state = transition.to;

        if transition.to == SessionState::Closed {
            self.destroy(session_id);
        } else if transition.arm_grace {
            self.arm_timer(session_id, TimerKind::EndGrace);
        }

        Some(transition.notices)
    }

    /// Event reported by a session's local socket task. Events from a socket
    /// that no longer belongs to the session are dropped.
    pub(crate) fn local_event(
        &mut self,
        session_id: &str,
        generation: u64,
        event: SessionEvent,
    ) -> Option<Vec<Notice>> {
        let current = self.sessions.get(session_id).map(|s| s.generation);
        if current != Some(generation) {
            trace!("Dropping stale local event for session {}", session_id);
            return None;
        }
        self.transition(session_id, event)
    }

    /// Close the owned socket, cancel any pending timer and remove the entry.
    /// Returns false if the session did not exist.
    pub(crate) fn destroy(&mut self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some(_session) => {
                debug!("Session {} destroyed", session_id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn destroy_all(&mut self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        count
    }

    /// Queue relay bytes for the session's local socket
    pub(crate) fn write(&self, session_id: &str, data: Bytes) -> bool {
        match self.sessions.get(session_id) {
            Some(session) => session.socket.write(data),
            None => false,
        }
    }

    /// Arm (or replace) the session's timer
    pub(crate) fn arm_timer(&mut self, session_id: &str, kind: TimerKind) -> bool {
        let token = self.token();
        let delay = match kind {
            TimerKind::EndGrace => self.end_grace,
            TimerKind::ChannelTeardown => self.teardown_grace,
        };
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };

        let events = self.events.clone();
        let id = session_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(DispatchEvent::Timer {
                session_id: id,
                token,
            });
        });

        trace!(
            "Session {}: {:?} timer armed for {:?}",
            session_id,
            kind,
            delay
        );
        session.timer = Some(PendingTimer {
            kind,
            token,
            handle,
        });
        true
    }

    /// Resolve a fired timer into the session event it stands for. Returns
    /// `None` when the session is gone or the timer was replaced or cancelled.
    pub(crate) fn timer_fired(&mut self, session_id: &str, token: u64) -> Option<SessionEvent> {
        let session = self.sessions.get_mut(session_id)?;
        let kind = match &session.timer {
            Some(timer) if timer.token == token => timer.kind,
            _ => {
                trace!("Ignoring stale timer for session {}", session_id);
                return None;
            }
        };
        session.timer = None;
        Some(kind.event())
    }

    /// Schedule deferred destruction of every session that has no timer yet
    pub(crate) fn arm_teardown(&mut self) -> usize {
        let pending: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.timer.is_none())
            .map(|(id, _)| id.clone())
            .collect();

        for id in &pending {
            self.arm_timer(id, TimerKind::ChannelTeardown);
        }
        pending.len()
    }

    /// Cancel every pending channel-teardown timer
    pub(crate) fn cancel_teardown(&mut self) -> usize {
        let mut cancelled = 0;
        for session in self.sessions.values_mut() {
            if matches!(&session.timer, Some(t) if t.kind == TimerKind::ChannelTeardown) {
                session.timer = None;
                cancelled += 1;
            }
        }
        cancelled
    }

    pub(crate) fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|(id, session)| SessionSnapshot {
                id: id.clone(),
                state: session.state,
                timer: session.timer.as_ref().map(|t| t.kind),
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }
}

#[cfg(test)]
impl SessionRegistry {
    fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }
}
