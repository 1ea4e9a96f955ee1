//! Core types for SMTP sessions.
//!
//! This module provides:
//! - [`Address`] with a conservative mailbox syntax check
//! - [`Message`] and its builder
//! - [`Attachment`]
//! - [`SessionResult`], [`SentReport`] and [`RejectedRecipient`]

use std::fmt;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{SmtpError, SmtpResult};

/// Maximum mailbox length (RFC 5321 path limit minus brackets).
pub const MAX_ADDRESS_LEN: usize = 254;

/// Maximum local part length.
pub const MAX_LOCAL_PART_LEN: usize = 64;

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Mailbox (e.g., "john@example.com").
    pub email: String,
}

impl Address {
    /// Creates a new address with just a mailbox.
    pub fn new(email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self { name: None, email })
    }

    /// Creates a new address with display name and mailbox.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        let name = name.into();
        if name.chars().any(|c| c.is_control()) {
            return Err(SmtpError::invalid_input(
                "Display name cannot contain control characters",
            ));
        }
        Ok(Self {
            name: if name.is_empty() { None } else { Some(name) },
            email,
        })
    }

    /// Parses an address from a string (e.g., "John Doe <john@example.com>").
    pub fn parse(s: &str) -> SmtpResult<Self> {
        let s = s.trim();

        if let Some(start) = s.rfind('<') {
            let end = s
                .rfind('>')
                .filter(|end| *end > start && *end == s.len() - 1)
                .ok_or_else(|| SmtpError::invalid_input(format!("Unterminated address: {}", s)))?;
            let name = s[..start].trim().trim_matches('"');
            let email = s[start + 1..end].trim();
            return Self::with_name(name, email);
        }

        Self::new(s)
    }

    /// Validates a mailbox.
    ///
    /// Checks only what is needed to keep the SMTP command line and headers
    /// well formed: an `@` splitting a 1-64 byte local part from a non-empty
    /// domain, at most 254 bytes, and no whitespace, control characters or
    /// angle brackets.
    pub fn validate_email(email: &str) -> SmtpResult<()> {
        if email.is_empty() {
            return Err(SmtpError::invalid_input("Email address cannot be empty"));
        }

        if email.len() > MAX_ADDRESS_LEN {
            return Err(SmtpError::invalid_input(format!(
                "Email address too long (max {} bytes)",
                MAX_ADDRESS_LEN
            )));
        }

        if email
            .chars()
            .any(|c| c.is_control() || c.is_whitespace() || c == '<' || c == '>')
        {
            return Err(SmtpError::invalid_input(format!(
                "Email address contains forbidden characters: {:?}",
                email
            )));
        }

        let (local, domain) = email
            .rsplit_once('@')
            .ok_or_else(|| SmtpError::invalid_input(format!("Missing @ in address: {}", email)))?;

        if local.is_empty() || local.len() > MAX_LOCAL_PART_LEN {
            return Err(SmtpError::invalid_input(format!(
                "Local part must be 1-{} bytes: {}",
                MAX_LOCAL_PART_LEN, email
            )));
        }

        if domain.is_empty() {
            return Err(SmtpError::invalid_input(format!("Domain cannot be empty: {}", email)));
        }

        Ok(())
    }

    /// Returns the mailbox part only.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the display name if present.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Formats the address for MAIL FROM/RCPT TO commands.
    pub fn to_smtp(&self) -> String {
        format!("<{}>", self.email)
    }

    /// Formats the address for message headers.
    pub fn to_header(&self) -> String {
        match &self.name {
            Some(name) => {
                if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') {
                    let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
                    format!("\"{}\" <{}>", escaped, self.email)
                } else {
                    format!("{} <{}>", name, self.email)
                }
            }
            None => self.email.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_header())
    }
}

impl TryFrom<&str> for Address {
    type Error = SmtpError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = SmtpError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

/// File attachment.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Filename.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Binary content.
    pub data: Vec<u8>,
}

impl Attachment {
    /// Creates a new attachment.
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        }
    }

    /// Creates an attachment with the content type guessed from the filename.
    pub fn from_file(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let filename = filename.into();
        let content_type = mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .to_string();
        Self::new(filename, content_type, data)
    }

    /// Creates an `application/octet-stream` attachment.
    pub fn binary(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(filename, mime::APPLICATION_OCTET_STREAM.as_ref(), data)
    }
}

/// An outgoing message.
///
/// Fields hold raw caller input. Nothing is validated until the message is
/// handed to a session, so a malformed message fails as `InvalidInput`
/// without touching the network.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Sender mailbox.
    pub from: String,
    /// `To` recipients.
    pub to: Vec<String>,
    /// `Cc` recipients.
    pub cc: Vec<String>,
    /// Blind recipients (no header).
    pub bcc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Body bytes, sent as-is apart from line-ending normalization.
    pub body: Vec<u8>,
    /// Extra headers in order.
    pub headers: Vec<(String, String)>,
    /// Attachments.
    pub attachments: Vec<Attachment>,
    /// Caller-supplied Message-ID.
    pub message_id: Option<String>,
}

impl Message {
    /// Creates a new message builder.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Returns the number of recipients across To, Cc and Bcc.
    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }

    /// Returns true if there are attachments.
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// Builder for [`Message`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    /// Sets the sender.
    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.message.from = address.into();
        self
    }

    /// Adds a `To` recipient.
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.message.to.push(address.into());
        self
    }

    /// Adds several `To` recipients.
    pub fn to_many<I, A>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.message.to.extend(addresses.into_iter().map(Into::into));
        self
    }

    /// Adds a `Cc` recipient.
    pub fn cc(mut self, address: impl Into<String>) -> Self {
        self.message.cc.push(address.into());
        self
    }

    /// Adds a blind recipient.
    pub fn bcc(mut self, address: impl Into<String>) -> Self {
        self.message.bcc.push(address.into());
        self
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.message.subject = subject.into();
        self
    }

    /// Sets a text body.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.message.body = text.into().into_bytes();
        self
    }

    /// Sets a raw body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.message.body = body.into();
        self
    }

    /// Appends an extra header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.headers.push((name.into(), value.into()));
        self
    }

    /// Adds an attachment.
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.message.attachments.push(attachment);
        self
    }

    /// Sets the Message-ID.
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message.message_id = Some(id.into());
        self
    }

    /// Returns the message.
    pub fn build(self) -> Message {
        self.message
    }
}

/// A recipient that was rejected by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecipient {
    /// The rejected mailbox.
    pub address: String,
    /// SMTP status code.
    pub code: u16,
    /// Reply text from the server.
    pub message: String,
}

impl fmt::Display for RejectedRecipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>: {} {}", self.address, self.code, self.message)
    }
}

/// Report of a delivered message.
#[derive(Debug, Clone)]
pub struct SentReport {
    /// Message-ID written in the envelope.
    pub message_id: String,
    /// Recipients accepted by the server.
    pub accepted: Vec<String>,
    /// Recipients refused by the server.
    pub partial: Vec<RejectedRecipient>,
    /// Final reply text after the DATA terminator.
    pub response: String,
    /// Session duration.
    pub duration: Duration,
}

impl SentReport {
    /// Returns true if every recipient was accepted.
    pub fn is_complete_success(&self) -> bool {
        self.partial.is_empty()
    }
}

/// Outcome of one session.
#[derive(Debug)]
pub enum SessionResult {
    /// The server accepted the message.
    Sent(SentReport),
    /// The session failed.
    Failed(SmtpError),
}

impl SessionResult {
    /// Returns true if the message was accepted.
    pub fn is_sent(&self) -> bool {
        matches!(self, SessionResult::Sent(_))
    }

    /// Returns the report if sent.
    pub fn report(&self) -> Option<&SentReport> {
        match self {
            SessionResult::Sent(report) => Some(report),
            SessionResult::Failed(_) => None,
        }
    }

    /// Returns the error if failed.
    pub fn error(&self) -> Option<&SmtpError> {
        match self {
            SessionResult::Sent(_) => None,
            SessionResult::Failed(err) => Some(err),
        }
    }

    /// Converts into a standard `Result`.
    pub fn into_result(self) -> SmtpResult<SentReport> {
        match self {
            SessionResult::Sent(report) => Ok(report),
            SessionResult::Failed(err) => Err(err),
        }
    }
}

impl From<SmtpResult<SentReport>> for SessionResult {
    fn from(result: SmtpResult<SentReport>) -> Self {
        match result {
            Ok(report) => SessionResult::Sent(report),
            Err(err) => SessionResult::Failed(err),
        }
    }
}
