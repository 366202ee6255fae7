// Shared transport configuration for building reqwest::Client instances.
//
// The REST client and the WebSocket dialer share TLS and timeout settings
// through this module. Session-cookie credentials ride in the cookie jar.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use url::Url;

use crate::error::Error;

const USER_AGENT: &str = concat!("matterlink/", env!("CARGO_PKG_VERSION"));

/// TLS verification mode (api-level mirror of core's TLS settings).
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Use the system certificate store.
    #[default]
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (self-signed servers).
    DangerAcceptInvalid,
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    pub timeout: Duration,
    pub cookie_jar: Option<Arc<Jar>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            timeout: Duration::from_secs(10),
            cookie_jar: None,
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT);

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        if let Some(ref jar) = self.cookie_jar {
            builder = builder.cookie_provider(Arc::clone(jar));
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }

    /// Create a config whose cookie jar already carries a session cookie
    /// scoped to `server`.
    pub fn with_session_cookie(mut self, server: &Url, name: &str, value: &str) -> Self {
        let jar = Jar::default();
        jar.add_cookie_str(&format!("{name}={value}; Path=/"), server);
        self.cookie_jar = Some(Arc::new(jar));
        self
    }

    /// Whether certificate verification is disabled.
    pub fn accepts_invalid_certs(&self) -> bool {
        matches!(self.tls, TlsMode::DangerAcceptInvalid)
    }
}
