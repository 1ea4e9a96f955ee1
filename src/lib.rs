//! # very-simple-smtps
//!
//! Sends one message per SMTP session:
//! - RFC 5321 command sequencing with EHLO/HELO fallback
//! - Implicit TLS and STARTTLS with certificate validation (rustls)
//! - PLAIN, LOGIN, CRAM-MD5 and XOAUTH2 authentication
//! - RFC 5322 envelope formatting with dot-stuffing and optional attachments
//! - Per-recipient outcomes with a configurable partial-failure policy
//! - One end-to-end deadline plus cooperative cancellation
//!
//! Secrets never appear in logs or error text.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use very_simple_smtps::{Message, SecurityMode, ServerTarget, SessionComposer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let target = ServerTarget::builder()
//!         .host("smtp.example.com")
//!         .security(SecurityMode::StartTls)
//!         .credentials("user@example.com", "password")
//!         .build()?;
//!
//!     let message = Message::builder()
//!         .from("sender@example.com")
//!         .to("recipient@example.com")
//!         .subject("Hello from Rust!")
//!         .text("This is a test email.")
//!         .build();
//!
//!     let composer = SessionComposer::new();
//!     let report = composer
//!         .send(&target, &message, Duration::from_secs(30))
//!         .await
//!         .into_result()?;
//!     println!("Message sent with ID: {}", report.message_id);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::time::Duration;

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod transport;

// Authentication
pub mod auth;

// Message formatting
pub mod envelope;

// Observability
pub mod observability;

// Session
pub mod session;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{AuthMethod, Credentials};
pub use config::{
    RecipientPolicy, SecurityMode, ServerTarget, ServerTargetBuilder, SessionConfig,
    SessionConfigBuilder, TlsConfig, TlsVersion,
};
pub use envelope::{DateSource, Envelope, EnvelopeComposer, FixedDate, SystemDate};
pub use errors::{EnhancedStatusCode, SmtpError, SmtpErrorKind, SmtpResult};
pub use observability::{MetricsSnapshot, SessionMetrics};
pub use protocol::{EsmtpCapabilities, SessionState, SmtpCommand, SmtpResponse};
pub use session::{SessionComposer, SessionComposerBuilder};
pub use tokio_util::sync::CancellationToken;
pub use transport::{SmtpConnection, SmtpConnector, TcpConnector};
pub use types::{
    Address, Attachment, Message, MessageBuilder, RejectedRecipient, SentReport, SessionResult,
};

/// Sends `message` to `target` with a default [`SessionComposer`].
pub async fn send(target: &ServerTarget, message: &Message, timeout: Duration) -> SessionResult {
    SessionComposer::new().send(target, message, timeout).await
}
