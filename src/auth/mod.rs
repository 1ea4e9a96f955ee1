//! Authentication mechanisms for SMTP.
//!
//! Supports:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely used)
//! - CRAM-MD5 (RFC 2195)
//! - XOAUTH2 (Google/Microsoft)

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{Redactor, SmtpError, SmtpResult};

/// Authentication methods supported by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication (obsolete).
    Login,
    /// CRAM-MD5 challenge-response.
    CramMd5,
    /// Google/Microsoft XOAUTH2.
    XOAuth2,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
            AuthMethod::XOAuth2 => "XOAUTH2",
        }
    }

    /// Returns the priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::XOAuth2 => 4,
            AuthMethod::CramMd5 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses from SMTP capability string.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "CRAM-MD5" => Some(AuthMethod::CramMd5),
            "XOAUTH2" => Some(AuthMethod::XOAuth2),
            _ => None,
        }
    }

    /// Returns true if this method sends the secret in recoverable form.
    ///
    /// An XOAUTH2 bearer token is replayable as sent, so it is gated like
    /// a password.
    pub fn requires_tls(&self) -> bool {
        !matches!(self, AuthMethod::CramMd5)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mechanism_name())
    }
}

/// Credential types for authentication.
#[derive(Clone)]
pub enum Credentials {
    /// Plain username and password.
    Plain {
        /// Username.
        username: String,
        /// Password (protected).
        password: SecretString,
    },
    /// OAuth2 token (XOAUTH2 format).
    XOAuth2 {
        /// Username/email.
        username: String,
        /// Access token (protected).
        access_token: SecretString,
    },
}

impl Credentials {
    /// Creates plain credentials.
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Plain {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// Creates XOAUTH2 credentials.
    pub fn xoauth2(username: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self::XOAuth2 {
            username: username.into(),
            access_token: SecretString::new(access_token.into()),
        }
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        match self {
            Credentials::Plain { username, .. } => username,
            Credentials::XOAuth2 { username, .. } => username,
        }
    }

    fn secret(&self) -> &SecretString {
        match self {
            Credentials::Plain { password, .. } => password,
            Credentials::XOAuth2 { access_token, .. } => access_token,
        }
    }

    /// Returns the compatible authentication methods.
    pub fn compatible_methods(&self) -> Vec<AuthMethod> {
        match self {
            Credentials::Plain { .. } => vec![
                AuthMethod::Plain,
                AuthMethod::Login,
                AuthMethod::CramMd5,
            ],
            Credentials::XOAuth2 { .. } => vec![AuthMethod::XOAuth2],
        }
    }

    /// Builds a redactor for the secret and every wire token derived from it.
    ///
    /// The raw secret, its base64 form, and each initial response are
    /// registered so a server echoing any of them is scrubbed too.
    pub fn redactor(&self) -> Redactor {
        let mut redactor = Redactor::new();
        let secret = self.secret().expose_secret();
        if secret.is_empty() {
            return redactor;
        }
        redactor.add(secret.as_str());
        redactor.add(BASE64.encode(secret));
        match self {
            Credentials::Plain { username, password } => {
                redactor.add(Authenticator::plain_initial_response(username, password));
                redactor.add(Authenticator::login_password(password));
            }
            Credentials::XOAuth2 { username, access_token } => {
                redactor.add(Authenticator::xoauth2_initial_response(username, access_token));
            }
        }
        redactor
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Plain { username, .. } => f
                .debug_struct("Plain")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Credentials::XOAuth2 { username, .. } => f
                .debug_struct("XOAuth2")
                .field("username", username)
                .field("access_token", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Authentication mechanism encoders and mechanism selection.
pub struct Authenticator;

impl Authenticator {
    /// Generates the initial response for PLAIN authentication.
    pub fn plain_initial_response(username: &str, password: &SecretString) -> String {
        // Format: \0username\0password
        let response = format!("\0{}\0{}", username, password.expose_secret());
        BASE64.encode(response)
    }

    /// Generates LOGIN username response.
    pub fn login_username(username: &str) -> String {
        BASE64.encode(username)
    }

    /// Generates LOGIN password response.
    pub fn login_password(password: &SecretString) -> String {
        BASE64.encode(password.expose_secret())
    }

    /// Generates the CRAM-MD5 response to a base64 server challenge.
    pub fn cram_md5_response(
        challenge: &str,
        username: &str,
        password: &SecretString,
    ) -> SmtpResult<String> {
        let challenge_bytes = BASE64
            .decode(challenge.trim())
            .map_err(|e| SmtpError::authentication(format!("Invalid CRAM-MD5 challenge: {}", e)))?;

        type HmacMd5 = Hmac<Md5>;
        let mut mac = HmacMd5::new_from_slice(password.expose_secret().as_bytes())
            .map_err(|e| SmtpError::authentication(format!("HMAC error: {}", e)))?;
        mac.update(&challenge_bytes);
        let digest = mac.finalize().into_bytes();

        // Format: username space hex-digest
        let hex_digest: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(BASE64.encode(format!("{} {}", username, hex_digest)))
    }

    /// Generates XOAUTH2 initial response.
    pub fn xoauth2_initial_response(username: &str, access_token: &SecretString) -> String {
        // Format: user=username\x01auth=Bearer token\x01\x01
        let response = format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            username,
            access_token.expose_secret()
        );
        BASE64.encode(response)
    }

    /// Selects the mechanism to use.
    ///
    /// `preferred` wins when it is advertised and usable. Otherwise the
    /// highest-priority usable mechanism is chosen. PLAIN, LOGIN and XOAUTH2
    /// are usable only over TLS unless `allow_insecure` is set.
    pub fn select_best_method(
        available: &[AuthMethod],
        credentials: &Credentials,
        tls_enabled: bool,
        allow_insecure: bool,
        preferred: Option<AuthMethod>,
    ) -> SmtpResult<AuthMethod> {
        let compatible = credentials.compatible_methods();

        let mut candidates: Vec<_> = available
            .iter()
            .filter(|m| compatible.contains(m))
            .filter(|m| !m.requires_tls() || tls_enabled || allow_insecure)
            .copied()
            .collect();

        if let Some(method) = preferred.filter(|p| candidates.contains(p)) {
            return Ok(method);
        }

        candidates.sort_by(|a, b| b.priority().cmp(&a.priority()));

        candidates.first().copied().ok_or_else(|| {
            SmtpError::authentication(format!(
                "No compatible authentication method (server offers: {})",
                if available.is_empty() {
                    "none".to_string()
                } else {
                    available
                        .iter()
                        .map(AuthMethod::mechanism_name)
                        .collect::<Vec<_>>()
                        .join(" ")
                }
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_method_from_capability() {
        assert_eq!(AuthMethod::from_capability("PLAIN"), Some(AuthMethod::Plain));
        assert_eq!(AuthMethod::from_capability("login"), Some(AuthMethod::Login));
        assert_eq!(AuthMethod::from_capability("CRAM-MD5"), Some(AuthMethod::CramMd5));
        assert_eq!(AuthMethod::from_capability("XOAUTH2"), Some(AuthMethod::XOAuth2));
        assert_eq!(AuthMethod::from_capability("OAUTHBEARER"), None);
    }

    #[test]
    fn test_plain_initial_response() {
        let password = SecretString::new("password".to_string());
        let response = Authenticator::plain_initial_response("user", &password);
        let decoded = BASE64.decode(&response).unwrap();
        assert_eq!(decoded, b"\0user\0password");
    }

    #[test]
    fn test_cram_md5_response() {
        // RFC 2195 worked example.
        let challenge = BASE64.encode("<1896.697170952@postoffice.reston.mci.net>");
        let password = SecretString::new("tanstaaftanstaaf".to_string());
        let response = Authenticator::cram_md5_response(&challenge, "tim", &password).unwrap();
        let decoded = String::from_utf8(BASE64.decode(response).unwrap()).unwrap();
        assert_eq!(decoded, "tim b913a602c7eda7a495b4e6e7334d3890");

        assert!(Authenticator::cram_md5_response("!!not base64", "tim", &password).is_err());
    }

    #[test]
    fn test_xoauth2_initial_response() {
        let token = SecretString::new("test_token".to_string());
        let response = Authenticator::xoauth2_initial_response("user@example.com", &token);
        let decoded = String::from_utf8(BASE64.decode(&response).unwrap()).unwrap();
        assert_eq!(decoded, "user=user@example.com\x01auth=Bearer test_token\x01\x01");
    }

    #[test]
    fn test_select_best_method() {
        let available = vec![AuthMethod::Plain, AuthMethod::Login, AuthMethod::CramMd5];
        let creds = Credentials::plain("user", "pass");

        let method = Authenticator::select_best_method(&available, &creds, true, false, None).unwrap();
        assert_eq!(method, AuthMethod::CramMd5);

        let method = Authenticator::select_best_method(
            &available, &creds, true, false, Some(AuthMethod::Plain),
        )
        .unwrap();
        assert_eq!(method, AuthMethod::Plain);

        // Unadvertised preference falls back to priority order.
        let method = Authenticator::select_best_method(
            &[AuthMethod::Plain, AuthMethod::Login], &creds, true, false, Some(AuthMethod::CramMd5),
        )
        .unwrap();
        assert_eq!(method, AuthMethod::Plain);
    }

    #[test]
    fn test_plaintext_mechanisms_need_tls() {
        let creds = Credentials::plain("user", "pass");
        let available = [AuthMethod::Plain, AuthMethod::Login];

        let err = Authenticator::select_best_method(&available, &creds, false, false, None)
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::SmtpErrorKind::Auth);

        let method = Authenticator::select_best_method(&available, &creds, false, true, None).unwrap();
        assert_eq!(method, AuthMethod::Plain);
    }

    #[test]
    fn test_bearer_token_needs_tls() {
        let creds = Credentials::xoauth2("user@example.com", "token");
        let available = [AuthMethod::XOAuth2];

        assert!(AuthMethod::XOAuth2.requires_tls());
        assert!(!AuthMethod::CramMd5.requires_tls());

        let err = Authenticator::select_best_method(&available, &creds, false, false, None)
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::SmtpErrorKind::Auth);

        let method = Authenticator::select_best_method(&available, &creds, true, false, None).unwrap();
        assert_eq!(method, AuthMethod::XOAuth2);
        let method = Authenticator::select_best_method(&available, &creds, false, true, None).unwrap();
        assert_eq!(method, AuthMethod::XOAuth2);
    }

    #[test]
    fn test_oauth_credentials_need_xoauth2() {
        let creds = Credentials::xoauth2("user@example.com", "token");
        let result = Authenticator::select_best_method(
            &[AuthMethod::Plain, AuthMethod::CramMd5], &creds, true, false, None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_credentials_debug() {
        let creds = Credentials::plain("user", "secret_password");
        let debug_str = format!("{:?}", creds);
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("secret_password"));
    }

    #[test]
    fn test_credentials_redactor() {
        let creds = Credentials::plain("user", "hunter2");
        let redactor = creds.redactor();
        let plain = Authenticator::plain_initial_response(
            "user",
            &SecretString::new("hunter2".to_string()),
        );

        let text = format!("535 bad: hunter2 {} {}", BASE64.encode("hunter2"), plain);
        let scrubbed = redactor.scrub(&text);
        assert!(!scrubbed.contains("hunter2"));
        assert!(!scrubbed.contains(&BASE64.encode("hunter2")));
        assert!(!scrubbed.contains(&plain));
        assert!(scrubbed.starts_with("535 bad: "));
    }
}
