//! SMTP protocol implementation.
//!
//! RFC 5321 commands and replies, ESMTP capability parsing and the session
//! state machine.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{EnhancedStatusCode, SmtpError, SmtpErrorKind, SmtpResult};

/// SMTP commands.
#[derive(Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// Continuation line of an AUTH exchange.
    AuthResponse(String),
    /// MAIL FROM command.
    MailFrom {
        /// Sender path, including angle brackets.
        address: String,
        /// SIZE parameter (optional).
        size: Option<usize>,
        /// 8BITMIME parameter.
        body_8bit: bool,
    },
    /// RCPT TO command.
    RcptTo {
        /// Recipient path, including angle brackets.
        address: String,
    },
    /// DATA command.
    Data,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => {
                if let Some(response) = initial_response {
                    format!("AUTH {} {}", mechanism, response)
                } else {
                    format!("AUTH {}", mechanism)
                }
            }
            SmtpCommand::AuthResponse(response) => response.clone(),
            SmtpCommand::MailFrom {
                address,
                size,
                body_8bit,
            } => {
                let mut cmd = format!("MAIL FROM:{}", address);
                if let Some(s) = size {
                    cmd.push_str(&format!(" SIZE={}", s));
                }
                if *body_8bit {
                    cmd.push_str(" BODY=8BITMIME");
                }
                cmd
            }
            SmtpCommand::RcptTo { address } => format!("RCPT TO:{}", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Returns the command verb.
    pub fn verb(&self) -> &'static str {
        match self {
            SmtpCommand::Ehlo(_) => "EHLO",
            SmtpCommand::Helo(_) => "HELO",
            SmtpCommand::StartTls => "STARTTLS",
            SmtpCommand::Auth { .. } | SmtpCommand::AuthResponse(_) => "AUTH",
            SmtpCommand::MailFrom { .. } => "MAIL",
            SmtpCommand::RcptTo { .. } => "RCPT",
            SmtpCommand::Data => "DATA",
            SmtpCommand::Quit => "QUIT",
        }
    }
}

/// Display hides authentication payloads so commands can be logged.
impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(_),
            } => write!(f, "AUTH {} [REDACTED]", mechanism),
            SmtpCommand::AuthResponse(_) => write!(f, "[REDACTED]"),
            other => write!(f, "{}", other.to_smtp_string()),
        }
    }
}

impl fmt::Debug for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SmtpCommand({})", self)
    }
}

/// SMTP response from server.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code (optional).
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Response message lines.
    pub message: Vec<String>,
    /// Whether this is a multiline response.
    pub is_multiline: bool,
}

impl SmtpResponse {
    /// Returns true if `line` ends a reply.
    ///
    /// A reply line is `NNN-text` when more lines follow and `NNN text` or
    /// bare `NNN` on the last line.
    pub fn is_final_line(line: &str) -> bool {
        line.as_bytes().get(3) != Some(&b'-')
    }

    /// Parses a response from raw lines (without CRLF).
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        if lines.is_empty() {
            return Err(SmtpError::protocol("Empty response"));
        }

        let mut messages = Vec::with_capacity(lines.len());
        let mut code = 0u16;
        let mut enhanced_code = None;
        let last = lines.len() - 1;

        for (i, line) in lines.iter().enumerate() {
            let parsed_code = Self::parse_code(line)?;

            if i == 0 {
                code = parsed_code;
            } else if parsed_code != code {
                return Err(SmtpError::protocol(format!(
                    "Inconsistent status codes in multiline response: {} then {}",
                    code, parsed_code
                )));
            }

            match line.as_bytes().get(3) {
                None | Some(b' ') if i == last => {}
                Some(b'-') if i != last => {}
                _ => {
                    return Err(SmtpError::protocol(format!(
                        "Malformed reply continuation: {:?}",
                        line
                    )))
                }
            }

            let text = line.get(4..).unwrap_or("");
            let text = if i == 0 {
                match Self::parse_enhanced_code(text) {
                    Some((esc, rest)) => {
                        enhanced_code = Some(esc);
                        rest.trim().to_string()
                    }
                    None => text.to_string(),
                }
            } else {
                text.to_string()
            };

            messages.push(text);
        }

        Ok(Self {
            code,
            enhanced_code,
            message: messages,
            is_multiline: lines.len() > 1,
        })
    }

    fn parse_code(line: &str) -> SmtpResult<u16> {
        let digits = line
            .get(..3)
            .filter(|d| d.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| SmtpError::protocol(format!("Malformed reply: {:?}", line)))?;
        let code: u16 = digits
            .parse()
            .map_err(|_| SmtpError::protocol(format!("Invalid status code: {:?}", line)))?;
        if !(200..600).contains(&code) {
            return Err(SmtpError::protocol(format!("Status code out of range: {}", code)));
        }
        Ok(code)
    }

    /// Parses enhanced status code from message start.
    fn parse_enhanced_code(msg: &str) -> Option<(EnhancedStatusCode, &str)> {
        // Format: X.Y.Z rest
        let (first, rest) = msg.split_once(' ').unwrap_or((msg, ""));
        let code = EnhancedStatusCode::parse(first)?;
        Some((code, rest))
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true if this is a positive intermediate response (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Returns true if this is a temporary failure (4xx).
    pub fn is_temporary_failure(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// Returns true if this is a permanent failure (5xx).
    pub fn is_permanent_failure(&self) -> bool {
        (500..600).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Converts to an error of `kind`, naming the command that got this reply.
    pub fn to_error(&self, kind: SmtpErrorKind, context: &str) -> SmtpError {
        let mut err = SmtpError::from_smtp_response(
            kind,
            self.code,
            format!("{} rejected: {} {}", context, self.code, self.full_message()),
        );
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP server capabilities.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Maximum message size.
    pub size: Option<usize>,
    /// Supported authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// 8BITMIME supported.
    pub eight_bit_mime: bool,
    /// Raw capability strings.
    pub raw: Vec<String>,
}

impl EsmtpCapabilities {
    /// Parses capabilities from EHLO response. The first line is the greeting.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            caps.raw.push(line.clone());

            let (capability, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            match capability {
                "SIZE" => {
                    caps.size = params.trim().parse().ok().filter(|s| *s > 0);
                }
                "AUTH" => {
                    for mech in params.split_whitespace() {
                        if let Some(method) = AuthMethod::from_capability(mech) {
                            caps.auth_mechanisms.insert(method);
                        }
                    }
                }
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                _ => {}
            }
        }

        caps
    }

    /// Returns the advertised mechanisms, highest priority first.
    pub fn auth_methods(&self) -> Vec<AuthMethod> {
        let mut methods: Vec<_> = self.auth_mechanisms.iter().copied().collect();
        methods.sort_by(|a, b| b.priority().cmp(&a.priority()));
        methods
    }

    /// Checks if a specific capability is supported.
    pub fn has_capability(&self, name: &str) -> bool {
        let upper = name.to_uppercase();
        self.raw
            .iter()
            .any(|c| c.split_whitespace().next() == Some(upper.as_str()))
    }
}

/// Session state.
///
/// `Idle -> Connected -> Greeted -> (Authenticated) -> SenderAccepted ->
/// RecipientsEvaluated -> DataAccepted -> Closed`. Any state except `Closed`
/// may move to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing done yet.
    Idle,
    /// Transport established.
    Connected,
    /// EHLO/HELO accepted (after STARTTLS when requested).
    Greeted,
    /// AUTH accepted.
    Authenticated,
    /// MAIL FROM accepted.
    SenderAccepted,
    /// Every RCPT TO answered and at least one accepted.
    RecipientsEvaluated,
    /// Message body accepted.
    DataAccepted,
    /// Connection closed.
    Closed,
}

impl SessionState {
    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connected)
                | (Connected, Greeted)
                | (Greeted, Authenticated)
                | (Greeted | Authenticated, SenderAccepted)
                | (SenderAccepted, RecipientsEvaluated)
                | (RecipientsEvaluated, DataAccepted)
        ) || (*self != Closed && next == Closed)
    }

    /// Moves to `next`, failing on an illegal transition.
    pub fn advance(&mut self, next: SessionState) -> SmtpResult<()> {
        if !self.can_transition_to(next) {
            return Err(SmtpError::protocol(format!(
                "Illegal session transition {:?} -> {:?}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }
}

/// Response codes for common SMTP operations.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Message exceeds the advertised size limit (RFC 1870).
    pub const SIZE_EXCEEDED: u16 = 552;
}
