//! RFC 5322 envelope construction.
//!
//! Provides:
//! - Caller input validation (mailboxes, header names, header injection)
//! - Header formatting with RFC 2047 encoding and folding
//! - A single-level `multipart/mixed` layout when attachments are present
//! - CRLF normalization, dot-stuffing and the DATA terminator

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, FixedOffset, Local};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DEFAULT_USER_AGENT;
use crate::errors::{SmtpError, SmtpResult};
use crate::types::{Address, Attachment, Message};

/// Line length at which headers are folded.
const FOLD_AT: usize = 78;

/// Base64 line length for attachments.
const BASE64_LINE_LEN: usize = 76;

/// Raw bytes per RFC 2047 encoded word (keeps each word under 75 chars).
const ENCODED_WORD_CHUNK: usize = 45;

/// Source of the `Date` header.
pub trait DateSource: Send + Sync + fmt::Debug {
    /// Returns the current date.
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Wall clock in the local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDate;

impl DateSource for SystemDate {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().into()
    }
}

/// A date that never changes. Useful for reproducible envelopes.
#[derive(Debug, Clone, Copy)]
pub struct FixedDate(pub DateTime<FixedOffset>);

impl DateSource for FixedDate {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}

/// MIME transfer encoding of a text part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    /// 7-bit ASCII.
    SevenBit,
    /// 8-bit data.
    EightBit,
    /// Base64 encoding.
    Base64,
}

impl TransferEncoding {
    /// Returns the header value.
    pub fn header_value(&self) -> &'static str {
        match self {
            TransferEncoding::SevenBit => "7bit",
            TransferEncoding::EightBit => "8bit",
            TransferEncoding::Base64 => "base64",
        }
    }

    fn for_text(data: &[u8]) -> Self {
        if data.is_ascii() {
            TransferEncoding::SevenBit
        } else {
            TransferEncoding::EightBit
        }
    }
}

/// A validated, fully formatted message ready for DATA.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Message-ID without angle brackets.
    pub message_id: String,
    /// Reverse path.
    pub sender: Address,
    /// Unique forward paths (To, Cc, Bcc in order).
    pub recipients: Vec<Address>,
    content: Vec<u8>,
}

impl Envelope {
    /// Returns the CRLF-normalized message text (headers, blank line, body).
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Returns the size in bytes, as announced with `SIZE=`.
    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Returns true if the content contains bytes outside 7-bit ASCII.
    pub fn is_eight_bit(&self) -> bool {
        !self.content.is_ascii()
    }

    /// Returns the dot-stuffed DATA payload ending in `CRLF.CRLF`.
    pub fn data_payload(&self) -> Vec<u8> {
        prepare_data_payload(&self.content)
    }
}

/// Builds envelopes from [`Message`]s.
#[derive(Debug, Clone)]
pub struct EnvelopeComposer {
    date_source: Arc<dyn DateSource>,
    user_agent: String,
}

impl Default for EnvelopeComposer {
    fn default() -> Self {
        Self::new(Arc::new(SystemDate), DEFAULT_USER_AGENT)
    }
}

impl EnvelopeComposer {
    /// Creates a composer.
    pub fn new(date_source: Arc<dyn DateSource>, user_agent: impl Into<String>) -> Self {
        Self {
            date_source,
            user_agent: user_agent.into(),
        }
    }

    /// Validates `message` and formats its envelope.
    ///
    /// Every check happens here, so a failure means nothing was sent.
    pub fn compose(&self, message: &Message) -> SmtpResult<Envelope> {
        if message.from.trim().is_empty() {
            return Err(SmtpError::invalid_input("Sender is required"));
        }
        let sender = Address::parse(&message.from)?;

        if message.recipient_count() == 0 {
            return Err(SmtpError::invalid_input("At least one recipient is required"));
        }
        let to = parse_addresses(&message.to)?;
        let cc = parse_addresses(&message.cc)?;
        let bcc = parse_addresses(&message.bcc)?;

        let mut recipients: Vec<Address> = Vec::with_capacity(message.recipient_count());
        for address in to.iter().chain(&cc).chain(&bcc) {
            if !recipients
                .iter()
                .any(|r| r.email.eq_ignore_ascii_case(&address.email))
            {
                recipients.push(address.clone());
            }
        }

        check_header_value("Subject", &message.subject)?;
        for (name, value) in &message.headers {
            check_header_name(name)?;
            check_header_value(name, value)?;
            if GENERATED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name)) {
                return Err(SmtpError::invalid_input(format!(
                    "Header {} is generated from the message fields",
                    name
                )));
            }
        }

        let caller_content_type = message
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("Content-Type"));
        if caller_content_type && message.has_attachments() {
            return Err(SmtpError::invalid_input(
                "A Content-Type header cannot be combined with attachments",
            ));
        }

        let date = self.date_source.now();
        let message_id = match &message.message_id {
            Some(id) => normalize_message_id(id)?,
            None => generate_message_id(&sender, &date),
        };

        let mut out = Vec::with_capacity(message.body.len() + 512);

        write_header(&mut out, "From", &format_address(&sender));
        if !to.is_empty() {
            write_header(&mut out, "To", &format_address_list(&to));
        }
        if !cc.is_empty() {
            write_header(&mut out, "Cc", &format_address_list(&cc));
        }
        write_header(&mut out, "Subject", &encode_header(&message.subject));
        write_header(&mut out, "Date", &format_date(&date));
        write_header(&mut out, "Message-ID", &format!("<{}>", message_id));
        if !self.user_agent.is_empty() {
            write_header(&mut out, "User-Agent", &self.user_agent);
        }
        for (name, value) in &message.headers {
            write_header(&mut out, name, &encode_header(value));
        }

        let body = normalize_line_endings(&message.body);

        if message.has_attachments() {
            let boundary = generate_boundary();
            write_header(&mut out, "MIME-Version", "1.0");
            write_header(
                &mut out,
                "Content-Type",
                &format!("multipart/mixed; boundary=\"{}\"", boundary),
            );
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(b"This is a multi-part message in MIME format.\r\n");

            out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            write_header(&mut out, "Content-Type", "text/plain; charset=utf-8; format=flowed");
            write_header(
                &mut out,
                "Content-Transfer-Encoding",
                TransferEncoding::for_text(&body).header_value(),
            );
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&body);
            if !body.is_empty() && !body.ends_with(b"\r\n") {
                out.extend_from_slice(b"\r\n");
            }

            for attachment in &message.attachments {
                out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
                write_attachment(&mut out, attachment)?;
            }

            out.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        } else {
            if !caller_content_type && !body.is_ascii() {
                write_header(&mut out, "MIME-Version", "1.0");
                write_header(&mut out, "Content-Type", "text/plain; charset=utf-8");
                write_header(
                    &mut out,
                    "Content-Transfer-Encoding",
                    TransferEncoding::EightBit.header_value(),
                );
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&body);
        }

        Ok(Envelope {
            message_id,
            sender,
            recipients,
            content: out,
        })
    }
}

/// Single-instance headers (RFC 5322 section 3.6) written by the composer.
const GENERATED_HEADERS: [&str; 7] = ["From", "To", "Cc", "Bcc", "Subject", "Date", "Message-ID"];

fn parse_addresses(raw: &[String]) -> SmtpResult<Vec<Address>> {
    raw.iter().map(|a| Address::parse(a)).collect()
}

/// Header names must be printable ASCII without `:` (RFC 5322 section 2.2).
fn check_header_name(name: &str) -> SmtpResult<()> {
    if name.is_empty() || !name.bytes().all(|b| (33..=126).contains(&b) && b != b':') {
        return Err(SmtpError::invalid_input(format!("Invalid header name: {:?}", name)));
    }
    Ok(())
}

fn check_header_value(name: &str, value: &str) -> SmtpResult<()> {
    if value.contains(['\r', '\n']) {
        return Err(SmtpError::invalid_input(format!(
            "Header {} contains a line break",
            name
        )));
    }
    Ok(())
}

fn normalize_message_id(id: &str) -> SmtpResult<String> {
    let id = id.trim();
    let id = id
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(id);
    if id.is_empty()
        || id
            .chars()
            .any(|c| c.is_control() || c.is_whitespace() || c == '<' || c == '>')
    {
        return Err(SmtpError::invalid_input(format!("Invalid Message-ID: {:?}", id)));
    }
    Ok(id.to_string())
}

fn generate_message_id(sender: &Address, date: &DateTime<FixedOffset>) -> String {
    let domain = sender
        .email
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .unwrap_or("localhost");
    format!("{}.{}@{}", Uuid::new_v4().simple(), date.timestamp(), domain)
}

fn generate_boundary() -> String {
    format!("----=_Part_{}", Uuid::new_v4().simple())
}

/// Formats a date for the `Date` header.
pub fn format_date(date: &DateTime<FixedOffset>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S %z").to_string()
}

fn format_address(address: &Address) -> String {
    match address.name() {
        Some(name) if !name.is_ascii() => format!("{} <{}>", encode_header(name), address.email),
        _ => address.to_header(),
    }
}

fn format_address_list(addresses: &[Address]) -> String {
    addresses
        .iter()
        .map(format_address)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Encodes a header value using RFC 2047 when it is not plain ASCII.
///
/// Long values are split into several encoded words on character
/// boundaries so the result can be folded.
pub fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }

    let mut words = Vec::new();
    let mut start = 0;
    let mut end = 0;
    for (idx, ch) in value.char_indices() {
        let next = idx + ch.len_utf8();
        if next - start > ENCODED_WORD_CHUNK && end > start {
            words.push(&value[start..end]);
            start = end;
        }
        end = next;
    }
    words.push(&value[start..end]);

    words
        .iter()
        .map(|w| format!("=?UTF-8?B?{}?=", BASE64.encode(w.as_bytes())))
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &str) {
    let header = format!("{}: {}", name, value);
    out.extend_from_slice(fold_header(&header).as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Folds a header line on spaces once it passes 78 characters.
fn fold_header(header: &str) -> String {
    if header.len() <= FOLD_AT {
        return header.to_string();
    }

    let mut result = String::with_capacity(header.len() + 16);
    let mut current_line = String::new();

    for word in header.split(' ') {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= FOLD_AT - 2 || word.is_empty() {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            result.push_str(&current_line);
            result.push_str("\r\n ");
            current_line = word.to_string();
        }
    }

    result.push_str(&current_line);
    result
}

fn write_attachment(out: &mut Vec<u8>, attachment: &Attachment) -> SmtpResult<()> {
    if attachment.filename.chars().any(|c| c.is_control()) {
        return Err(SmtpError::invalid_input(format!(
            "Invalid attachment filename: {:?}",
            attachment.filename
        )));
    }
    let content_type = attachment
        .content_type
        .parse::<mime::Mime>()
        .map_err(|e| {
            SmtpError::invalid_input(format!(
                "Invalid attachment content type {:?}: {}",
                attachment.content_type, e
            ))
        })?;

    let filename = encode_header(&attachment.filename)
        .replace('\\', "\\\\")
        .replace('"', "\\\"");

    write_header(
        out,
        "Content-Type",
        &format!("{}; name=\"{}\"", content_type, filename),
    );
    write_header(
        out,
        "Content-Transfer-Encoding",
        TransferEncoding::Base64.header_value(),
    );
    write_header(
        out,
        "Content-Disposition",
        &format!("attachment; filename=\"{}\"", filename),
    );
    out.extend_from_slice(b"\r\n");

    let encoded = BASE64.encode(&attachment.data);
    for chunk in encoded.as_bytes().chunks(BASE64_LINE_LEN) {
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }

    Ok(())
}

/// Rewrites bare LF and bare CR to CRLF.
pub fn normalize_line_endings(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 32 + 2);
    let mut bytes = input.iter().copied().peekable();

    while let Some(byte) = bytes.next() {
        match byte {
            b'\r' => {
                bytes.next_if_eq(&b'\n');
                out.extend_from_slice(b"\r\n");
            }
            b'\n' => out.extend_from_slice(b"\r\n"),
            other => out.push(other),
        }
    }

    out
}

/// Builds the DATA payload: CRLF-normalized, dot-stuffed, ending in `CRLF.CRLF`.
pub fn prepare_data_payload(content: &[u8]) -> Vec<u8> {
    let normalized = normalize_line_endings(content);
    let mut out = Vec::with_capacity(normalized.len() + normalized.len() / 64 + 5);
    let mut at_line_start = true;

    for &byte in &normalized {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }

    if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::errors::SmtpErrorKind;

    fn fixed_composer() -> EnvelopeComposer {
        let date = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 5, 14, 7, 9)
            .unwrap();
        EnvelopeComposer::new(Arc::new(FixedDate(date)), "test-agent/1.0")
    }

    fn simple_message() -> Message {
        Message::builder()
            .from("sender@example.com")
            .to("rcpt@example.org")
            .subject("Hello")
            .text("Line one\nLine two")
            .message_id("fixed-id@example.com")
            .build()
    }

    fn text(envelope: &Envelope) -> String {
        String::from_utf8(envelope.content().to_vec()).unwrap()
    }

    #[test]
    fn test_header_order_and_body() {
        let envelope = fixed_composer()
            .compose(&Message {
                cc: vec!["cc@example.org".to_string()],
                headers: vec![("X-Tag".to_string(), "a".to_string())],
                ..simple_message()
            })
            .unwrap();

        assert_eq!(
            text(&envelope),
            "From: sender@example.com\r\n\
             To: rcpt@example.org\r\n\
             Cc: cc@example.org\r\n\
             Subject: Hello\r\n\
             Date: Tue, 05 Mar 2024 14:07:09 +0200\r\n\
             Message-ID: <fixed-id@example.com>\r\n\
             User-Agent: test-agent/1.0\r\n\
             X-Tag: a\r\n\
             \r\n\
             Line one\r\nLine two"
        );
        assert_eq!(envelope.message_id, "fixed-id@example.com");
        assert_eq!(envelope.recipients.len(), 2);
        assert!(!envelope.is_eight_bit());
    }

    #[test]
    fn test_recipients_are_deduplicated() {
        let envelope = fixed_composer()
            .compose(&Message {
                to: vec!["a@example.org".to_string(), "A@Example.org".to_string()],
                bcc: vec!["a@example.org".to_string(), "hidden@example.org".to_string()],
                ..simple_message()
            })
            .unwrap();

        let mailboxes: Vec<_> = envelope.recipients.iter().map(|a| a.email.as_str()).collect();
        assert_eq!(mailboxes, vec!["a@example.org", "hidden@example.org"]);
        assert!(!text(&envelope).contains("hidden@example.org"));
    }

    #[test]
    fn test_rejects_invalid_input() {
        let composer = fixed_composer();
        let cases = vec![
            Message { to: vec![], ..simple_message() },
            Message { from: String::new(), ..simple_message() },
            Message { from: "not-an-address".to_string(), ..simple_message() },
            Message { to: vec!["bad@".to_string()], ..simple_message() },
            Message { subject: "Hi\r\nBcc: victim@example.com".to_string(), ..simple_message() },
            Message {
                headers: vec![("X-Ok".to_string(), "v\nInjected: yes".to_string())],
                ..simple_message()
            },
            Message {
                headers: vec![("Bad Name".to_string(), "v".to_string())],
                ..simple_message()
            },
            Message {
                headers: vec![("Bad:Name".to_string(), "v".to_string())],
                ..simple_message()
            },
            Message { message_id: Some("has space@x".to_string()), ..simple_message() },
        ];

        for message in cases {
            let err = composer.compose(&message).unwrap_err();
            assert_eq!(err.kind(), SmtpErrorKind::InvalidInput, "{:?}", message);
        }
    }

    #[test]
    fn test_generated_message_id_uses_sender_domain() {
        let envelope = fixed_composer()
            .compose(&Message { message_id: None, ..simple_message() })
            .unwrap();
        assert!(envelope.message_id.ends_with("@example.com"));
        assert!(text(&envelope).contains(&format!("Message-ID: <{}>\r\n", envelope.message_id)));
    }

    #[test]
    fn test_non_ascii_subject_and_body() {
        let envelope = fixed_composer()
            .compose(&Message {
                subject: "Grüße".to_string(),
                body: "Schöne Grüße".as_bytes().to_vec(),
                ..simple_message()
            })
            .unwrap();
        let content = text(&envelope);

        assert!(content.contains(&format!("Subject: =?UTF-8?B?{}?=\r\n", BASE64.encode("Grüße"))));
        assert!(content.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(content.contains("Content-Transfer-Encoding: 8bit\r\n"));
        assert!(envelope.is_eight_bit());
    }

    #[test]
    fn test_long_header_is_folded() {
        let subject = "word ".repeat(30);
        let envelope = fixed_composer()
            .compose(&Message { subject: subject.trim().to_string(), ..simple_message() })
            .unwrap();
        for line in text(&envelope).split("\r\n") {
            assert!(line.len() <= FOLD_AT, "{:?}", line);
        }
    }

    #[test]
    fn test_long_encoded_subject_splits_into_words() {
        let encoded = encode_header(&"é".repeat(60));
        assert!(encoded.split(' ').count() > 1);
        for word in encoded.split(' ') {
            assert!(word.len() <= 75);
        }
    }

    #[test]
    fn test_attachments_use_multipart_mixed() {
        let message = Message {
            attachments: vec![Attachment::binary("data.bin", vec![0u8; 100])],
            ..simple_message()
        };
        let content = text(&fixed_composer().compose(&message).unwrap());

        assert!(content.contains("MIME-Version: 1.0\r\n"));
        assert!(content.contains("Content-Type: multipart/mixed;\r\n boundary=\"----=_Part_"));
        assert!(content.contains("Content-Type: text/plain; charset=utf-8; format=flowed\r\n"));
        assert!(content.contains(
            "Content-Type: application/octet-stream; name=\"data.bin\"\r\n\
             Content-Transfer-Encoding: base64\r\n\
             Content-Disposition: attachment; filename=\"data.bin\"\r\n"
        ));
        let base64_lines: Vec<_> = content.lines().filter(|l| l.starts_with("AAAA")).collect();
        assert_eq!(base64_lines.len(), 2);
        assert_eq!(base64_lines[0].trim_end().len(), BASE64_LINE_LEN);
        assert!(content.trim_end().ends_with("--"));
    }

    #[test]
    fn test_generated_headers_cannot_be_duplicated() {
        for name in ["Subject", "date", "Message-ID", "FROM", "Bcc"] {
            let message = Message {
                headers: vec![(name.to_string(), "value".to_string())],
                ..simple_message()
            };
            let err = fixed_composer().compose(&message).unwrap_err();
            assert_eq!(err.kind(), SmtpErrorKind::InvalidInput, "{}", name);
        }

        let message = Message {
            headers: vec![("X-Mailer".to_string(), "batch".to_string())],
            ..simple_message()
        };
        let content = text(&fixed_composer().compose(&message).unwrap());
        assert_eq!(content.matches("\r\nSubject: ").count(), 1);
        assert!(content.contains("X-Mailer: batch\r\n"));
    }

    #[test]
    fn test_attachments_reject_content_type_header() {
        let message = Message {
            headers: vec![("Content-Type".to_string(), "text/html".to_string())],
            attachments: vec![Attachment::binary("a", vec![1])],
            ..simple_message()
        };
        assert!(fixed_composer().compose(&message).is_err());
    }

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize_line_endings(b"a\nb\rc\r\nd"), b"a\r\nb\r\nc\r\nd");
        assert_eq!(normalize_line_endings(b"\r\r\n\n"), b"\r\n\r\n\r\n");
        assert_eq!(normalize_line_endings(b""), b"");
    }

    #[test]
    fn test_dot_stuffing() {
        let payload = prepare_data_payload(b"Hello\r\n.World\r\n..Test\r\n.");
        assert_eq!(payload, b"Hello\r\n..World\r\n...Test\r\n..\r\n.\r\n");

        let payload = prepare_data_payload(b".first line\nlast");
        assert_eq!(payload, b"..first line\r\nlast\r\n.\r\n");

        assert_eq!(prepare_data_payload(b""), b".\r\n");
    }

    #[test]
    fn test_format_date() {
        let date = FixedOffset::west_opt(5 * 3600)
            .unwrap()
            .with_ymd_and_hms(2023, 12, 31, 23, 59, 0)
            .unwrap();
        assert_eq!(format_date(&date), "Sun, 31 Dec 2023 23:59:00 -0500");
    }
}
