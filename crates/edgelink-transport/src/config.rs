//! Control channel configuration

use crate::{TransportError, TransportResult};
use edgelink_proto::CONTROL_PATH;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// PEM-encoded client credentials used to authenticate the control channel
///
/// The transport only forwards this material to the TLS layer; issuing,
/// storing and validating it is the credential store's business.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsCredentials {
    /// Client certificate chain (PEM)
    pub cert: String,
    /// Client private key (PEM)
    pub key: String,
    /// CA bundle used to verify the relay (PEM); system roots when absent
    #[serde(default)]
    pub ca: Option<String>,
}

impl std::fmt::Debug for TlsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCredentials")
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .field("key", &"<redacted>")
            .field("ca", &self.ca.as_ref().map(|ca| ca.len()))
            .finish()
    }
}

/// Control channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Relay endpoint (`wss://relay.example.com`, `https://...` is accepted too)
    pub endpoint: String,

    /// Namespace path appended to the endpoint
    pub path: String,

    /// Optional client credentials
    pub credentials: Option<TlsCredentials>,

    /// Skip relay certificate verification (development only)
    pub insecure: bool,

    /// Capacity of the outbound frame queue
    pub outbound_buffer: usize,

    /// Maximum WebSocket message size
    pub max_message_size: usize,

    /// Timeout for the TCP + TLS + WebSocket handshake
    pub connect_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            path: CONTROL_PATH.to_string(),
            credentials: None,
            insecure: false,
            outbound_buffer: 256,
            max_message_size: edgelink_proto::MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Attach client credentials
    pub fn with_credentials(mut self, credentials: TlsCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the namespace path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Disable relay certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.insecure = true;
        self
    }

    pub fn with_outbound_buffer(mut self, capacity: usize) -> Self {
        self.outbound_buffer = capacity;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if !self.path.starts_with('/') {
            return Err(TransportError::ConfigurationError(
                "Control path must start with '/'".to_string(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(TransportError::ConfigurationError(
                "Outbound buffer must hold at least one frame".to_string(),
            ));
        }
        self.control_url().map(|_| ())
    }

    /// Full WebSocket URL of the control namespace
    pub fn control_url(&self) -> TransportResult<Url> {
        let mut url = Url::parse(&self.endpoint).map_err(|e| {
            TransportError::ConfigurationError(format!(
                "Invalid relay endpoint '{}': {}",
                self.endpoint, e
            ))
        })?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(TransportError::ConfigurationError(format!(
                    "Unsupported relay scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            TransportError::ConfigurationError(format!("Cannot use scheme '{}'", scheme))
        })?;

        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}{}", base, self.path));

        Ok(url)
    }

    /// Whether the control URL needs TLS
    pub fn is_secure(&self) -> bool {
        self.control_url()
            .map(|url| url.scheme() == "wss")
            .unwrap_or(false)
    }

    /// Build the rustls client configuration, attaching client credentials when present
    pub fn build_tls_config(&self) -> TransportResult<Arc<rustls::ClientConfig>> {
        ensure_crypto_provider();

        let ca = self.credentials.as_ref().and_then(|c| c.ca.as_deref());

        let builder = if self.insecure {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
        } else {
            let mut roots = rustls::RootCertStore::empty();
            match ca {
                Some(pem) => {
                    for cert in parse_certs(pem)? {
                        roots.add(cert).map_err(|e| {
                            TransportError::TlsError(format!("Invalid CA certificate: {}", e))
                        })?;
                    }
                }
                None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            }
            rustls::ClientConfig::builder().with_root_certificates(roots)
        };

        let config = match &self.credentials {
            Some(credentials) => {
                let certs = parse_certs(&credentials.cert)?;
                let key = parse_private_key(&credentials.key)?;
                builder.with_client_auth_cert(certs, key).map_err(|e| {
                    TransportError::TlsError(format!("Invalid client certificate/key: {}", e))
                })?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn parse_certs(pem: &str) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(
            "No certificates found in PEM".to_string(),
        ));
    }
    Ok(certs)
}

fn parse_private_key(pem: &str) -> TransportResult<rustls::pki_types::PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
