//! Edge proxy client library - Public API
//!
//! Exposes a service on a private host through a public relay. One control
//! channel carries many relay sessions; each session is bridged to its own
//! TCP connection to a fixed local target.
//!
//! ```no_run
//! use edgelink_client::{ProxyClient, ProxyClientConfig, ProxyClientOptions};
//!
//! # async fn run() -> Result<(), edgelink_client::ClientError> {
//! let config = ProxyClientConfig::builder()
//!     .endpoint("wss://relay.example.com")
//!     .hostname("edge-1.example.net")
//!     .target("127.0.0.1", 8443)
//!     .build()?;
//!
//! let client = ProxyClient::new(config, ProxyClientOptions::default())?;
//! client.connect().await?;
//! client.wait_disconnected().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
mod connector;
mod dispatcher;
pub mod registry;
pub mod session;

pub use client::{ChannelState, ClientError, ProxyClient, ProxyClientOptions};
pub use config::{
    ProxyClientConfig, ProxyClientConfigBuilder, DEFAULT_END_GRACE, DEFAULT_TEARDOWN_GRACE,
};
pub use registry::{SessionSnapshot, TimerKind};
pub use session::{SessionError, SessionState};

pub use edgelink_proto::{InboundFrame, OutboundFrame, Registration};
pub use edgelink_transport::{
    ChannelConfig, ControlConnector, MemoryConnector, MemoryRelay, RelayConnection, TlsCredentials,
};
