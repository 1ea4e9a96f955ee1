//! Error types for SMTP sessions.
//!
//! Every failure a session can produce is an [`SmtpError`] tagged with one
//! [`SmtpErrorKind`]. Server replies are kept verbatim (code, enhanced code,
//! text) so diagnostics stay useful, while [`Redactor`] scrubs anything that
//! was derived from credentials.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::types::RejectedRecipient;

/// Result type for SMTP operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Categories of session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    /// Caller-side data is malformed; detected before any network I/O.
    InvalidInput,
    /// Connect, TLS handshake or socket failure.
    Transport,
    /// Malformed, unexpected or negative server reply.
    Protocol,
    /// Credentials were rejected or no usable mechanism exists.
    Auth,
    /// The server refused every recipient.
    AllRecipientsRejected,
    /// Some recipients were refused and the policy requires all of them.
    RecipientsRejected,
    /// The end-to-end deadline expired.
    Timeout,
    /// The caller cancelled the session.
    Cancelled,
}

impl SmtpErrorKind {
    /// Returns true if a later attempt may succeed without changing the input.
    pub fn is_transient(&self) -> bool {
        matches!(self, SmtpErrorKind::Transport | SmtpErrorKind::Timeout)
    }

    /// Returns the severity level of this error kind.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SmtpErrorKind::Auth => ErrorSeverity::Critical,
            SmtpErrorKind::InvalidInput
            | SmtpErrorKind::Protocol
            | SmtpErrorKind::AllRecipientsRejected
            | SmtpErrorKind::RecipientsRejected => ErrorSeverity::Error,
            SmtpErrorKind::Transport | SmtpErrorKind::Timeout => ErrorSeverity::Warning,
            SmtpErrorKind::Cancelled => ErrorSeverity::Info,
        }
    }
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpErrorKind::InvalidInput => write!(f, "Invalid input"),
            SmtpErrorKind::Transport => write!(f, "Transport error"),
            SmtpErrorKind::Protocol => write!(f, "Protocol error"),
            SmtpErrorKind::Auth => write!(f, "Authentication failed"),
            SmtpErrorKind::AllRecipientsRejected => write!(f, "All recipients rejected"),
            SmtpErrorKind::RecipientsRejected => write!(f, "Recipients rejected"),
            SmtpErrorKind::Timeout => write!(f, "Session timed out"),
            SmtpErrorKind::Cancelled => write!(f, "Session cancelled"),
        }
    }
}

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational - expected scenario.
    Info,
    /// Warning - temporary issue, may recover.
    Warning,
    /// Error - operation failed.
    Error,
    /// Critical - requires immediate attention.
    Critical,
}

/// Enhanced SMTP status code (RFC 2034).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Creates a new enhanced status code.
    pub fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self { class, subject, detail }
    }

    /// Parses an enhanced status code from a string (e.g., "5.1.1").
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class: u8 = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !(2..=5).contains(&class) {
            return None;
        }
        Some(Self { class, subject, detail })
    }

    /// Returns true if this is a success status.
    pub fn is_success(&self) -> bool {
        self.class == 2
    }

    /// Returns true if this is a temporary failure.
    pub fn is_temporary(&self) -> bool {
        self.class == 4
    }

    /// Returns true if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// SMTP error with detailed information.
#[derive(Error, Debug)]
pub struct SmtpError {
    /// Error kind.
    kind: SmtpErrorKind,
    /// Human-readable diagnostic.
    message: String,
    /// SMTP status code if available.
    smtp_code: Option<u16>,
    /// Enhanced status code if available.
    enhanced_code: Option<EnhancedStatusCode>,
    /// Recipients the server refused before the session ended.
    rejected: Vec<RejectedRecipient>,
    /// Underlying cause.
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a new SMTP error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            rejected: Vec::new(),
            cause: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Attaches the recipients refused during the session.
    pub fn with_rejected(mut self, rejected: Vec<RejectedRecipient>) -> Self {
        self.rejected = rejected;
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the diagnostic message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Recipients refused before the failure, if any.
    pub fn partial(&self) -> &[RejectedRecipient] {
        &self.rejected
    }

    /// Returns true if retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        if let Some(code) = self.smtp_code {
            return (400..500).contains(&code);
        }
        self.kind.is_transient()
    }

    /// Returns the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        self.kind.severity()
    }

    /// Returns the full diagnostic text, including server codes.
    pub fn diagnostic(&self) -> String {
        self.to_string()
    }

    /// Scrubs every sensitive token from the diagnostic and recipient texts.
    ///
    /// The cause is dropped because its text cannot be rewritten.
    pub fn redact(mut self, redactor: &Redactor) -> Self {
        if redactor.is_empty() {
            return self;
        }
        self.message = redactor.scrub(&self.message);
        for rejected in &mut self.rejected {
            rejected.message = redactor.scrub(&rejected.message);
        }
        if self.cause.as_ref().map_or(false, |c| redactor.matches(&c.to_string())) {
            self.cause = None;
        }
        self
    }

    // Convenience constructors

    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidInput, message)
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Transport, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Protocol, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Auth, message)
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Timeout, message)
    }

    /// Creates a cancellation error.
    pub fn cancelled() -> Self {
        Self::new(SmtpErrorKind::Cancelled, "Session cancelled by caller")
    }

    /// Maps an I/O error raised while talking to `address`.
    pub fn from_io(error: io::Error, context: &str) -> Self {
        let kind = match error.kind() {
            io::ErrorKind::TimedOut => SmtpErrorKind::Timeout,
            _ => SmtpErrorKind::Transport,
        };
        Self::new(kind, format!("{}: {}", context, error)).with_cause(error)
    }

    /// Creates an error from a negative SMTP reply.
    pub fn from_smtp_response(kind: SmtpErrorKind, code: u16, message: impl Into<String>) -> Self {
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}

/// Replaces known secret-derived tokens with `[REDACTED]`.
#[derive(Clone, Default)]
pub struct Redactor {
    tokens: Vec<String>,
}

impl Redactor {
    /// Marker written in place of a secret.
    pub const MARKER: &'static str = "[REDACTED]";

    /// Creates an empty redactor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sensitive token. Empty tokens are ignored.
    pub fn add(&mut self, token: impl Into<String>) {
        let token = token.into();
        if !token.is_empty() && !self.tokens.contains(&token) {
            self.tokens.push(token);
            // Longest first so a token containing another is replaced whole.
            self.tokens.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }

    /// Returns true if no tokens are registered.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Returns true if `text` contains any registered token.
    pub fn matches(&self, text: &str) -> bool {
        self.tokens.iter().any(|t| text.contains(t.as_str()))
    }

    /// Returns `text` with every registered token replaced.
    pub fn scrub(&self, text: &str) -> String {
        self.tokens
            .iter()
            .fold(text.to_string(), |acc, token| acc.replace(token.as_str(), Self::MARKER))
    }
}

impl fmt::Debug for Redactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redactor")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_transient() {
        assert!(SmtpErrorKind::Transport.is_transient());
        assert!(SmtpErrorKind::Timeout.is_transient());
        assert!(!SmtpErrorKind::Auth.is_transient());
        assert!(!SmtpErrorKind::InvalidInput.is_transient());
    }

    #[test]
    fn test_enhanced_status_code_parse() {
        let code = EnhancedStatusCode::parse("5.1.1").unwrap();
        assert_eq!(code.class, 5);
        assert_eq!(code.subject, 1);
        assert_eq!(code.detail, 1);
        assert!(code.is_permanent());
        assert!(!code.is_temporary());

        assert!(EnhancedStatusCode::parse("smtp.example.com").is_none());
        assert!(EnhancedStatusCode::parse("1.2.3").is_none());
        assert!(EnhancedStatusCode::parse("2.0.0.1").is_none());
    }

    #[test]
    fn test_smtp_code_drives_transience() {
        let err = SmtpError::from_smtp_response(SmtpErrorKind::Protocol, 451, "Try again later");
        assert!(err.is_transient());

        let err = SmtpError::from_smtp_response(SmtpErrorKind::Protocol, 554, "Rejected");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_display_includes_codes() {
        let err = SmtpError::from_smtp_response(SmtpErrorKind::Protocol, 550, "Mailbox unavailable")
            .with_enhanced_code(EnhancedStatusCode::new(5, 1, 1));
        assert_eq!(
            err.to_string(),
            "Protocol error: Mailbox unavailable (SMTP 550) [5.1.1]"
        );
    }

    #[test]
    fn test_io_timeout_maps_to_timeout() {
        let err = SmtpError::from_io(io::Error::new(io::ErrorKind::TimedOut, "slow"), "read");
        assert_eq!(err.kind(), SmtpErrorKind::Timeout);

        let err = SmtpError::from_io(io::Error::new(io::ErrorKind::ConnectionReset, "rst"), "read");
        assert_eq!(err.kind(), SmtpErrorKind::Transport);
    }

    #[test]
    fn test_redactor_scrubs_message() {
        let mut redactor = Redactor::new();
        redactor.add("s3cret");
        redactor.add("czNjcmV0");

        let err = SmtpError::authentication("server said s3cret and czNjcmV0")
            .with_smtp_code(535);
        let err = err.redact(&redactor);

        assert!(!err.message().contains("s3cret"));
        assert!(!err.message().contains("czNjcmV0"));
        assert_eq!(err.smtp_code(), Some(535));
        assert!(!format!("{:?}", redactor).contains("s3cret"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(SmtpErrorKind::Auth.severity(), ErrorSeverity::Critical);
        assert_eq!(SmtpErrorKind::Timeout.severity(), ErrorSeverity::Warning);
        assert_eq!(SmtpErrorKind::Protocol.severity(), ErrorSeverity::Error);
    }
}
