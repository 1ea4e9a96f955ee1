//! Configuration types for SMTP sessions.
//!
//! Two structs drive a session:
//! - [`ServerTarget`]: where to connect, how to secure the line and which
//!   credentials to present
//! - [`SessionConfig`]: how the composer behaves (EHLO name, User-Agent,
//!   recipient policy)
//!
//! Both have builders and deserialize through serde. Durations use humantime
//! strings and secrets are never serialized.

use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::auth::{AuthMethod, Credentials};
use crate::errors::{SmtpError, SmtpResult};

/// Default submission port (STARTTLS).
pub const DEFAULT_SUBMISSION_PORT: u16 = 587;

/// Default implicit TLS port.
pub const DEFAULT_SMTPS_PORT: u16 = 465;

/// Default plaintext port.
pub const DEFAULT_PLAIN_PORT: u16 = 25;

/// Default EHLO client name.
pub const DEFAULT_CLIENT_ID: &str = "localhost";

/// Default `User-Agent` header value.
pub const DEFAULT_USER_AGENT: &str = concat!("very-simple-smtps/", env!("CARGO_PKG_VERSION"));

/// Default bound on the best-effort QUIT and close after a failure.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// How the connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// TLS handshake before the greeting (port 465).
    ImplicitTls,
    /// Plaintext connect, then a mandatory STARTTLS upgrade.
    #[default]
    StartTls,
    /// No TLS at all. Only meant for local test fixtures.
    None,
}

impl SecurityMode {
    /// Returns the conventional port for this mode.
    pub fn default_port(&self) -> u16 {
        match self {
            SecurityMode::ImplicitTls => DEFAULT_SMTPS_PORT,
            SecurityMode::StartTls => DEFAULT_SUBMISSION_PORT,
            SecurityMode::None => DEFAULT_PLAIN_PORT,
        }
    }
}

impl std::fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityMode::ImplicitTls => write!(f, "implicit-tls"),
            SecurityMode::StartTls => write!(f, "starttls"),
            SecurityMode::None => write!(f, "none"),
        }
    }
}

/// Minimum TLS version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    /// TLS 1.2 (default).
    #[default]
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

/// TLS configuration.
///
/// Certificate validation is always performed against the webpki roots plus
/// any extra CA configured here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Minimum TLS version.
    #[serde(default)]
    pub min_version: TlsVersion,
    /// Path to an extra PEM CA certificate.
    pub ca_cert_path: Option<PathBuf>,
    /// Extra DER CA certificate.
    #[serde(skip)]
    pub ca_cert_der: Option<Vec<u8>>,
    /// Server Name Indication override.
    pub sni_override: Option<String>,
}

impl TlsConfig {
    /// Creates a new TLS config builder.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }
}

/// Builder for TLS configuration.
#[derive(Debug, Default)]
pub struct TlsConfigBuilder {
    config: TlsConfig,
}

impl TlsConfigBuilder {
    /// Sets the minimum TLS version.
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.config.min_version = version;
        self
    }

    /// Trusts the PEM certificate(s) at `path` in addition to the webpki roots.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_cert_path = Some(path.into());
        self
    }

    /// Trusts a DER certificate in addition to the webpki roots.
    pub fn ca_cert_der(mut self, der: impl Into<Vec<u8>>) -> Self {
        self.config.ca_cert_der = Some(der.into());
        self
    }

    /// Sets the SNI override.
    pub fn sni_override(mut self, sni: impl Into<String>) -> Self {
        self.config.sni_override = Some(sni.into());
        self
    }

    /// Builds the TLS configuration.
    pub fn build(self) -> TlsConfig {
        self.config
    }
}

/// Where and how to connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTarget {
    /// Server hostname or IP address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    #[serde(default)]
    pub security: SecurityMode,
    /// TLS configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Credentials (serialization skipped for security).
    #[serde(skip)]
    pub credentials: Option<Credentials>,
    /// Preferred authentication method.
    pub auth_method: Option<AuthMethod>,
}

impl ServerTarget {
    /// Creates a target without credentials.
    pub fn new(host: impl Into<String>, port: u16, security: SecurityMode) -> Self {
        Self {
            host: host.into(),
            port,
            security,
            tls: TlsConfig::default(),
            credentials: None,
            auth_method: None,
        }
    }

    /// Creates a new target builder.
    pub fn builder() -> ServerTargetBuilder {
        ServerTargetBuilder::default()
    }

    /// Checks the fields that must be sane before any connect attempt.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.host.trim().is_empty() {
            return Err(SmtpError::invalid_input("Host is required"));
        }

        if self.host.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(SmtpError::invalid_input("Host contains whitespace"));
        }

        if self.port == 0 {
            return Err(SmtpError::invalid_input("Port must be non-zero"));
        }

        Ok(())
    }

    /// Returns the `host:port` socket address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the name presented for SNI and certificate checks.
    pub fn server_name(&self) -> &str {
        self.tls.sni_override.as_deref().unwrap_or(&self.host)
    }
}

/// Builder for [`ServerTarget`].
#[derive(Debug, Default)]
pub struct ServerTargetBuilder {
    host: Option<String>,
    port: Option<u16>,
    security: SecurityMode,
    tls: TlsConfig,
    credentials: Option<Credentials>,
    auth_method: Option<AuthMethod>,
}

impl ServerTargetBuilder {
    /// Sets the server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the server port. Defaults to the conventional port of the mode.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the security mode.
    pub fn security(mut self, mode: SecurityMode) -> Self {
        self.security = mode;
        self
    }

    /// Sets the TLS configuration.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = config;
        self
    }

    /// Sets username and password credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::plain(username, password));
        self
    }

    /// Sets an XOAUTH2 access token.
    pub fn oauth2_token(mut self, username: impl Into<String>, token: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::xoauth2(username, token));
        self
    }

    /// Sets prebuilt credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the preferred authentication method.
    pub fn auth_method(mut self, method: AuthMethod) -> Self {
        self.auth_method = Some(method);
        self
    }

    /// Builds the target.
    pub fn build(self) -> SmtpResult<ServerTarget> {
        let target = ServerTarget {
            host: self.host.ok_or_else(|| SmtpError::invalid_input("Host is required"))?,
            port: self.port.unwrap_or_else(|| self.security.default_port()),
            security: self.security,
            tls: self.tls,
            credentials: self.credentials,
            auth_method: self.auth_method,
        };

        target.validate()?;
        Ok(target)
    }
}

/// What to do when the server refuses some recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientPolicy {
    /// Deliver to the accepted recipients and report the rest.
    #[default]
    AcceptPartial,
    /// Abort before DATA if any recipient is refused.
    RequireAll,
}

/// Composer behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Client identifier for EHLO/HELO.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// `User-Agent` header value. Empty disables the header.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Partial recipient policy.
    #[serde(default)]
    pub recipient_policy: RecipientPolicy,
    /// Permit PLAIN, LOGIN and XOAUTH2 over an unencrypted connection.
    #[serde(default)]
    pub allow_insecure_auth: bool,
    /// Bound on the best-effort QUIT and close.
    #[serde(default = "default_close_grace", with = "humantime_serde")]
    pub close_grace: Duration,
}

fn default_client_id() -> String { DEFAULT_CLIENT_ID.to_string() }
fn default_user_agent() -> String { DEFAULT_USER_AGENT.to_string() }
fn default_close_grace() -> Duration { DEFAULT_CLOSE_GRACE }

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            user_agent: default_user_agent(),
            recipient_policy: RecipientPolicy::default(),
            allow_insecure_auth: false,
            close_grace: default_close_grace(),
        }
    }
}

impl SessionConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.client_id.is_empty()
            || self.client_id.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(SmtpError::invalid_input(
                "client_id must be a non-empty token without whitespace",
            ));
        }

        if self.user_agent.contains(['\r', '\n']) {
            return Err(SmtpError::invalid_input("user_agent cannot contain CR or LF"));
        }

        Ok(())
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    client_id: Option<String>,
    user_agent: Option<String>,
    recipient_policy: RecipientPolicy,
    allow_insecure_auth: bool,
    close_grace: Option<Duration>,
}

impl SessionConfigBuilder {
    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Sets the `User-Agent` header value.
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Sets the recipient policy.
    pub fn recipient_policy(mut self, policy: RecipientPolicy) -> Self {
        self.recipient_policy = policy;
        self
    }

    /// Allows PLAIN, LOGIN and XOAUTH2 without TLS (test fixtures only).
    pub fn allow_insecure_auth(mut self, allow: bool) -> Self {
        self.allow_insecure_auth = allow;
        self
    }

    /// Sets the close grace period.
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = Some(grace);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> SmtpResult<SessionConfig> {
        let config = SessionConfig {
            client_id: self.client_id.unwrap_or_else(default_client_id),
            user_agent: self.user_agent.unwrap_or_else(default_user_agent),
            recipient_policy: self.recipient_policy,
            allow_insecure_auth: self.allow_insecure_auth,
            close_grace: self.close_grace.unwrap_or(DEFAULT_CLOSE_GRACE),
        };

        config.validate()?;
        Ok(config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
