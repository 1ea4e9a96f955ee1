//! In-process SMTP server for integration tests.
//!
//! Serves exactly one connection, records every command line and stores
//! each DATA payload with dot-stuffing removed.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How the fixture secures the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureSecurity {
    Plain,
    StartTls,
    ImplicitTls,
}

/// Server behavior knobs.
#[derive(Debug, Clone)]
pub struct FixtureOptions {
    pub security: FixtureSecurity,
    /// Advertise `AUTH PLAIN LOGIN` and answer AUTH with this code.
    pub auth_reply: Option<u16>,
    /// Echo the AUTH payload back in a failure reply.
    pub echo_auth: bool,
    /// Recipients answered with 550.
    pub reject_rcpt: Vec<String>,
    /// Answer EHLO with 502.
    pub ehlo_unsupported: bool,
    /// Stop answering after EHLO.
    pub hang_on_ehlo: bool,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            security: FixtureSecurity::Plain,
            auth_reply: None,
            echo_auth: false,
            reject_rcpt: Vec::new(),
            ehlo_unsupported: false,
            hang_on_ehlo: false,
        }
    }
}

/// What the fixture observed.
#[derive(Debug, Clone, Default)]
pub struct ServerTranscript {
    /// Command lines as received.
    pub commands: Vec<String>,
    /// Raw DATA bytes including the terminator.
    pub raw_data: Vec<u8>,
    /// DATA payloads with dot-stuffing removed.
    pub messages: Vec<String>,
    /// True once TLS was negotiated.
    pub tls: bool,
    /// True once the client went away.
    pub closed: bool,
}

impl ServerTranscript {
    pub fn verbs(&self) -> Vec<String> {
        self.commands
            .iter()
            .map(|c| {
                c.split([' ', ':'])
                    .next()
                    .unwrap_or_default()
                    .to_ascii_uppercase()
            })
            .collect()
    }
}

/// Self-signed certificate for `localhost`.
#[derive(Debug, Clone)]
pub struct TestCert {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub pem: String,
}

impl TestCert {
    pub fn generate() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("generate certificate");
        Self {
            cert_der: cert.serialize_der().expect("serialize certificate"),
            key_der: cert.serialize_private_key_der(),
            pem: cert.serialize_pem().expect("serialize PEM"),
        }
    }
}

/// A running fixture.
pub struct Fixture {
    pub port: u16,
    transcript: Arc<Mutex<ServerTranscript>>,
    handle: JoinHandle<()>,
}

impl Fixture {
    /// Starts a plaintext fixture.
    pub async fn start(options: FixtureOptions) -> Self {
        Self::start_with_cert(options, None).await
    }

    /// Starts a fixture, using `cert` for the TLS modes.
    pub async fn start_with_cert(options: FixtureOptions, cert: Option<&TestCert>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let transcript = Arc::new(Mutex::new(ServerTranscript::default()));

        let acceptor = cert.map(tls_acceptor);
        let shared = Arc::clone(&transcript);
        let handle = tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                let _ = serve(socket, &options, acceptor, &shared).await;
            }
            shared.lock().unwrap().closed = true;
        });

        Self {
            port,
            transcript,
            handle,
        }
    }

    /// Waits for the connection to end and returns the transcript.
    pub async fn finish(self) -> ServerTranscript {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), self.handle).await;
        self.transcript.lock().unwrap().clone()
    }
}

#[cfg(feature = "rustls-tls")]
type Acceptor = tokio_rustls::TlsAcceptor;
#[cfg(not(feature = "rustls-tls"))]
type Acceptor = ();

#[cfg(feature = "rustls-tls")]
fn tls_acceptor(cert: &TestCert) -> Acceptor {
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(cert.cert_der.clone())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_der.clone())),
        )
        .expect("server config");
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}

#[cfg(not(feature = "rustls-tls"))]
fn tls_acceptor(_cert: &TestCert) -> Acceptor {}

async fn serve(
    socket: TcpStream,
    options: &FixtureOptions,
    acceptor: Option<Acceptor>,
    transcript: &Arc<Mutex<ServerTranscript>>,
) -> std::io::Result<()> {
    match (options.security, acceptor) {
        #[cfg(feature = "rustls-tls")]
        (FixtureSecurity::ImplicitTls, Some(acceptor)) => {
            let stream = acceptor.accept(socket).await?;
            transcript.lock().unwrap().tls = true;
            session(BufReader::new(stream), options, transcript, false, true).await?;
        }
        #[cfg(feature = "rustls-tls")]
        (FixtureSecurity::StartTls, Some(acceptor)) => {
            let reader = session(BufReader::new(socket), options, transcript, true, true).await?;
            if let Some(reader) = reader {
                let stream = acceptor.accept(reader.into_inner()).await?;
                transcript.lock().unwrap().tls = true;
                session(BufReader::new(stream), options, transcript, false, false).await?;
            }
        }
        _ => {
            session(BufReader::new(socket), options, transcript, false, true).await?;
        }
    }
    Ok(())
}

/// Runs the command loop. Returns the reader when the client asked for
/// STARTTLS so the caller can wrap it.
async fn session<S>(
    mut stream: BufReader<S>,
    options: &FixtureOptions,
    transcript: &Arc<Mutex<ServerTranscript>>,
    offer_starttls: bool,
    greet: bool,
) -> std::io::Result<Option<BufReader<S>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if greet {
        reply(&mut stream, "220 fixture.local ESMTP ready").await?;
    }

    loop {
        let Some(line) = read_line(&mut stream).await? else {
            return Ok(None);
        };
        transcript.lock().unwrap().commands.push(line.clone());

        let upper = line.to_ascii_uppercase();
        let verb = upper.split([' ', ':']).next().unwrap_or_default().to_string();

        match verb.as_str() {
            "EHLO" if options.ehlo_unsupported => {
                reply(&mut stream, "502 5.5.2 Command not recognized").await?;
            }
            "EHLO" => {
                if options.hang_on_ehlo {
                    while read_line(&mut stream).await?.is_some() {}
                    return Ok(None);
                }
                let mut lines = vec![
                    "250-fixture.local".to_string(),
                    "250-8BITMIME".to_string(),
                    "250-SIZE 1048576".to_string(),
                ];
                if offer_starttls {
                    lines.push("250-STARTTLS".to_string());
                }
                if options.auth_reply.is_some() {
                    lines.push("250-AUTH PLAIN LOGIN".to_string());
                }
                lines.push("250 ENHANCEDSTATUSCODES".to_string());
                reply(&mut stream, &lines.join("\r\n")).await?;
            }
            "HELO" => reply(&mut stream, "250 fixture.local").await?,
            "STARTTLS" if offer_starttls => {
                reply(&mut stream, "220 2.0.0 Ready to start TLS").await?;
                return Ok(Some(stream));
            }
            "AUTH" => {
                let code = options.auth_reply.unwrap_or(502);
                let payload = line.splitn(3, ' ').nth(2).unwrap_or_default().to_string();
                match code {
                    235 => reply(&mut stream, "235 2.7.0 Authentication successful").await?,
                    _ if options.echo_auth => {
                        let text = format!("{} 5.7.8 Authentication failed for {}", code, payload);
                        reply(&mut stream, &text).await?;
                    }
                    _ => {
                        let text = format!("{} 5.7.8 Authentication credentials invalid", code);
                        reply(&mut stream, &text).await?;
                    }
                }
            }
            "MAIL" => reply(&mut stream, "250 2.1.0 OK").await?,
            "RCPT" => {
                let address = line
                    .split_once('<')
                    .and_then(|(_, rest)| rest.split_once('>'))
                    .map(|(addr, _)| addr.to_string())
                    .unwrap_or_default();
                if options.reject_rcpt.contains(&address) {
                    reply(&mut stream, "550 5.1.1 User unknown").await?;
                } else {
                    reply(&mut stream, "250 2.1.5 OK").await?;
                }
            }
            "DATA" => {
                reply(&mut stream, "354 End data with <CR><LF>.<CR><LF>").await?;
                let (raw, message) = read_data(&mut stream).await?;
                {
                    let mut transcript = transcript.lock().unwrap();
                    transcript.raw_data = raw;
                    transcript.messages.push(message);
                }
                reply(&mut stream, "250 2.0.0 Ok: queued as FIXTURE1").await?;
            }
            "QUIT" => {
                reply(&mut stream, "221 2.0.0 Bye").await?;
                return Ok(None);
            }
            _ => reply(&mut stream, "500 5.5.1 Unrecognized command").await?,
        }
    }
}

async fn reply<S>(stream: &mut BufReader<S>, text: &str) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let writer = stream.get_mut();
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut BufReader<S>) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    if stream.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Reads DATA lines up to the lone-dot terminator.
async fn read_data<S: AsyncRead + Unpin>(
    stream: &mut BufReader<S>,
) -> std::io::Result<(Vec<u8>, String)> {
    let mut raw = Vec::new();
    let mut message = Vec::new();

    loop {
        let mut line = Vec::new();
        if stream.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        raw.extend_from_slice(&line);
        if line == b".\r\n" {
            break;
        }
        let unstuffed = if line.starts_with(b"..") { &line[1..] } else { &line[..] };
        message.extend_from_slice(unstuffed);
    }

    Ok((raw, String::from_utf8_lossy(&message).into_owned()))
}
