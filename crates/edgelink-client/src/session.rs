//! Session lifecycle state machine
//!
//! Pure transition table: given the current state and an event it yields the
//! next state, the frames owed to the relay and whether the end-grace timer
//! must be armed. Side effects (sockets, timers, frames) are applied by the
//! registry and the dispatcher.

use edgelink_proto::OutboundFrame;
use serde::Serialize;
use std::io;
use thiserror::Error;

/// Session registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session {0} already exists")]
    DuplicateSession(String),
}

/// Lifecycle state of one tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Local connect in flight
    Connecting,
    /// Bytes flow both ways
    Active,
    /// Relay ended the session; waiting out the grace window
    Closing,
    /// Terminal; the registry never holds a closed session
    Closed,
}

/// Why a local socket operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The target actively refused the connection
    Refused,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl LocalFailure {
    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Refused,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Other,
            message: message.into(),
        }
    }

    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::refused(err.to_string()),
            _ => Self::other(err.to_string()),
        }
    }

    pub fn is_refusal(&self) -> bool {
        self.kind == FailureKind::Refused
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LocalConnected,
    LocalConnectFailed(LocalFailure),
    /// Local socket reached EOF
    LocalClosed,
    LocalError(LocalFailure),
    /// Relay sent `end`
    RelayEnd,
    /// Relay sent `socket_error`
    RelayAbort,
    /// End-grace timer fired
    GraceElapsed,
    /// Channel-teardown timer fired
    TeardownElapsed,
}

/// Frame owed to the relay as part of a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Error(String),
    Disconnect,
    Abort,
}

impl Notice {
    pub fn into_frame(self, socket_id: &str) -> OutboundFrame {
        let socket_id = socket_id.to_string();
        match self {
            Notice::Error(message) => OutboundFrame::Error { socket_id, message },
            Notice::Disconnect => OutboundFrame::DisconnectClient { socket_id },
            Notice::Abort => OutboundFrame::AbortClient { socket_id },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: SessionState,
    pub notices: Vec<Notice>,
    pub arm_grace: bool,
}

impl Transition {
    fn to(state: SessionState) -> Self {
        Self {
            to: state,
            notices: Vec::new(),
            arm_grace: false,
        }
    }

    fn closed(notices: Vec<Notice>) -> Self {
        Self {
            to: SessionState::Closed,
            notices,
            arm_grace: false,
        }
    }

    fn closing() -> Self {
        Self {
            to: SessionState::Closing,
            notices: Vec::new(),
            arm_grace: true,
        }
    }
}

// Refusal gets its own lower-severity notice; anything else reports the error first
fn failure_notices(failure: &LocalFailure) -> Vec<Notice> {
    if failure.is_refusal() {
        vec![Notice::Abort]
    } else {
        vec![Notice::Error(failure.message.clone()), Notice::Disconnect]
    }
}

impl SessionState {
    /// Apply `event`. `None` means the event does not apply in this state.
    pub fn on(self, event: &SessionEvent) -> Option<Transition> {
        use SessionEvent::*;
        use SessionState::*;

        match (self, event) {
            (Closed, _) => None,

            (Connecting, LocalConnected) => Some(Transition::to(Active)),
            (Connecting, LocalConnectFailed(failure)) => {
                Some(Transition::closed(failure_notices(failure)))
            }
            (Connecting, RelayEnd) => Some(Transition::closing()),

            (Active | Closing, LocalClosed) => Some(Transition::closed(vec![Notice::Disconnect])),
            (Active | Closing, LocalError(failure)) => {
                Some(Transition::closed(failure_notices(failure)))
            }
            (Active, RelayEnd) => Some(Transition::closing()),

            // The relay has already ended this session, nothing left to report
            (Closing, LocalConnectFailed(_)) => Some(Transition::closed(Vec::new())),
            (Closing, GraceElapsed) => Some(Transition::closed(Vec::new())),

            (Connecting | Active | Closing, RelayAbort | TeardownElapsed) => {
                Some(Transition::closed(Vec::new()))
            }

            _ => None,
        }
    }
}
