//! Client configuration

use crate::client::ClientError;
use edgelink_transport::{ChannelConfig, TlsCredentials};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay between a relay `end` and destroying the session
pub const DEFAULT_END_GRACE: Duration = Duration::from_secs(1);

/// Delay between losing the control channel and destroying its sessions
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(10);

pub const DEFAULT_LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Proxy client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyClientConfig {
    /// Relay endpoint URL
    pub endpoint: String,
    /// Hostname advertised in the registration
    pub hostname: String,
    /// Server type advertised in the registration
    pub server_type: String,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default)]
    pub credentials: Option<TlsCredentials>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(with = "duration_millis")]
    pub end_grace: Duration,
    #[serde(with = "duration_millis")]
    pub teardown_grace: Duration,
    /// Timeout for local connects
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Capacity of the outbound frame queue
    pub outbound_buffer: usize,
    /// Read chunk size for local sockets
    pub read_buffer_size: usize,
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for ProxyClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            hostname: String::new(),
            server_type: "HTTPS".to_string(),
            target_host: "localhost".to_string(),
            target_port: 0,
            credentials: None,
            insecure: false,
            end_grace: DEFAULT_END_GRACE,
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
            connect_timeout: DEFAULT_LOCAL_CONNECT_TIMEOUT,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ProxyClientConfig {
    pub fn builder() -> ProxyClientConfigBuilder {
        ProxyClientConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ClientError::ConfigError("endpoint is required".to_string()));
        }
        if !["ws://", "wss://", "http://", "https://"]
            .iter()
            .any(|scheme| endpoint.starts_with(scheme))
        {
            return Err(ClientError::ConfigError(format!(
                "endpoint '{}' must be a ws(s):// or http(s):// URL",
                endpoint
            )));
        }
        if self.hostname.trim().is_empty() {
            return Err(ClientError::ConfigError("hostname is required".to_string()));
        }
        if self.target_host.trim().is_empty() {
            return Err(ClientError::ConfigError("target host is required".to_string()));
        }
        if self.target_port == 0 {
            return Err(ClientError::ConfigError(
                "target port must be non-zero".to_string(),
            ));
        }
        if self.end_grace > self.teardown_grace {
            return Err(ClientError::ConfigError(format!(
                "end grace ({:?}) must not exceed teardown grace ({:?})",
                self.end_grace, self.teardown_grace
            )));
        }
        if self.outbound_buffer == 0 || self.read_buffer_size == 0 {
            return Err(ClientError::ConfigError(
                "buffer sizes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Control channel settings derived from this configuration
    pub fn channel_config(&self) -> ChannelConfig {
        let mut channel =
            ChannelConfig::new(self.endpoint.trim()).with_outbound_buffer(self.outbound_buffer);
        if let Some(credentials) = &self.credentials {
            channel = channel.with_credentials(credentials.clone());
        }
        if self.insecure {
            channel = channel.with_insecure_skip_verify();
        }
        channel
    }
}

/// Builder for ProxyClientConfig
#[derive(Default)]
pub struct ProxyClientConfigBuilder {
    config: ProxyClientConfig,
}

impl ProxyClientConfigBuilder {
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    pub fn server_type(mut self, server_type: impl Into<String>) -> Self {
        self.config.server_type = server_type.into();
        self
    }

    pub fn target(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.target_host = host.into();
        self.config.target_port = port;
        self
    }

    pub fn credentials(mut self, credentials: TlsCredentials) -> Self {
        self.config.credentials = Some(credentials);
        self
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.config.insecure = insecure;
        self
    }

    pub fn end_grace(mut self, grace: Duration) -> Self {
        self.config.end_grace = grace;
        self
    }

    pub fn teardown_grace(mut self, grace: Duration) -> Self {
        self.config.teardown_grace = grace;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn outbound_buffer(mut self, capacity: usize) -> Self {
        self.config.outbound_buffer = capacity;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    pub fn build(self) -> Result<ProxyClientConfig, ClientError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
