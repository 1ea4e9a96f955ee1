//! Transport layer for SMTP connections.
//!
//! [`SmtpConnector`] opens a line-oriented connection to a [`ServerTarget`]
//! and [`SmtpConnection`] exchanges CRLF-terminated lines over it. The
//! default implementation is plain TCP with rustls for implicit TLS and
//! STARTTLS upgrades. Certificates are always validated.
//!
//! Connections apply no timeouts of their own. The session bounds every
//! call with its end-to-end deadline.

use async_trait::async_trait;
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::{SecurityMode, ServerTarget};
#[cfg(feature = "rustls-tls")]
use crate::config::{TlsConfig, TlsVersion};
use crate::errors::{SmtpError, SmtpResult};
use crate::protocol::{SmtpCommand, SmtpResponse};

/// Longest reply line accepted, including CRLF (RFC 5321 allows 512).
pub const MAX_LINE_LEN: usize = 4096;

/// Most lines accepted in one multiline reply.
pub const MAX_REPLY_LINES: usize = 256;

/// Opens connections to SMTP servers.
#[async_trait]
pub trait SmtpConnector: Send + Sync + fmt::Debug {
    /// Connection type produced by this connector.
    type Connection: SmtpConnection;

    /// Opens a connection. For implicit TLS the handshake is complete when
    /// this returns.
    async fn connect(&self, target: &ServerTarget) -> SmtpResult<Self::Connection>;
}

/// A line-oriented connection to an SMTP server.
#[async_trait]
pub trait SmtpConnection: Send + fmt::Debug {
    /// Writes `line` followed by CRLF.
    async fn write_line(&mut self, line: &str) -> SmtpResult<()>;

    /// Writes bytes verbatim.
    async fn write_raw(&mut self, data: &[u8]) -> SmtpResult<()>;

    /// Reads one line, without its line terminator.
    async fn read_line(&mut self) -> SmtpResult<String>;

    /// Performs a TLS handshake on the current connection.
    async fn upgrade_tls(&mut self, target: &ServerTarget) -> SmtpResult<()>;

    /// Returns true if TLS is active.
    fn is_tls(&self) -> bool;

    /// Closes the connection.
    async fn close(&mut self) -> SmtpResult<()>;

    /// Writes a command line.
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<()> {
        tracing::debug!(command = %command, "Sending SMTP command");
        self.write_line(&command.to_smtp_string()).await
    }

    /// Reads a complete, possibly multiline, reply.
    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            let line = self.read_line().await?;
            let last = SmtpResponse::is_final_line(&line);
            lines.push(line);

            if last {
                break;
            }
            if lines.len() >= MAX_REPLY_LINES {
                return Err(SmtpError::protocol(format!(
                    "Reply exceeds {} lines",
                    MAX_REPLY_LINES
                )));
            }
        }

        let response = SmtpResponse::parse(&lines)?;
        tracing::debug!(code = response.code, lines = response.message.len(), "Received SMTP response");
        Ok(response)
    }
}

/// Connector for real servers over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl SmtpConnector for TcpConnector {
    type Connection = TcpConnection;

    async fn connect(&self, target: &ServerTarget) -> SmtpResult<TcpConnection> {
        let address = target.address();

        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| SmtpError::from_io(e, &format!("Connect to {} failed", address)))?;
        stream.set_nodelay(true).ok();

        let mut connection = TcpConnection {
            stream: Some(TransportStream::Plain(BufReader::new(stream))),
            peer: address,
        };

        if target.security == SecurityMode::ImplicitTls {
            connection.upgrade_tls(target).await?;
        }

        Ok(connection)
    }
}

/// TCP connection with optional TLS.
pub struct TcpConnection {
    /// `None` once closed or after a failed upgrade.
    stream: Option<TransportStream>,
    peer: String,
}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Tls(Box<BufReader<tokio_rustls::client::TlsStream<TcpStream>>>),
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.peer)
            .field("tls_enabled", &self.is_tls())
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl TcpConnection {
    fn stream(&mut self) -> SmtpResult<&mut TransportStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| SmtpError::transport("Connection is closed"))
    }

    /// Reads up to LF from a buffered reader, bounded by [`MAX_LINE_LEN`].
    async fn read_line_inner<R: AsyncBufRead + Unpin>(reader: &mut R) -> SmtpResult<String> {
        let mut buf = Vec::with_capacity(128);
        let read = (&mut *reader)
            .take(MAX_LINE_LEN as u64)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| SmtpError::from_io(e, "Read failed"))?;

        if read == 0 {
            return Err(SmtpError::transport("Connection closed by server"));
        }
        if !buf.ends_with(b"\n") {
            if buf.len() >= MAX_LINE_LEN {
                return Err(SmtpError::protocol(format!(
                    "Reply line exceeds {} bytes",
                    MAX_LINE_LEN
                )));
            }
            return Err(SmtpError::transport("Connection closed mid-line"));
        }

        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }

        String::from_utf8(buf)
            .map_err(|_| SmtpError::protocol("Reply is not valid UTF-8"))
    }

    /// Writes data to the stream.
    async fn write_inner<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> SmtpResult<()> {
        writer
            .write_all(data)
            .await
            .map_err(|e| SmtpError::from_io(e, "Write failed"))?;
        writer
            .flush()
            .await
            .map_err(|e| SmtpError::from_io(e, "Flush failed"))?;
        Ok(())
    }

    async fn write_bytes(&mut self, data: &[u8]) -> SmtpResult<()> {
        match self.stream()? {
            TransportStream::Plain(stream) => Self::write_inner(stream.get_mut(), data).await,
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => Self::write_inner(stream.get_mut(), data).await,
        }
    }
}

#[async_trait]
impl SmtpConnection for TcpConnection {
    async fn write_line(&mut self, line: &str) -> SmtpResult<()> {
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.write_bytes(&data).await
    }

    async fn write_raw(&mut self, data: &[u8]) -> SmtpResult<()> {
        self.write_bytes(data).await
    }

    async fn read_line(&mut self) -> SmtpResult<String> {
        match self.stream()? {
            TransportStream::Plain(stream) => Self::read_line_inner(stream).await,
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => Self::read_line_inner(stream.as_mut()).await,
        }
    }

    async fn upgrade_tls(&mut self, target: &ServerTarget) -> SmtpResult<()> {
        #[cfg(feature = "rustls-tls")]
        {
            use rustls::pki_types::ServerName;

            let connector = tls_connector(&target.tls)?;
            let name = target.server_name().to_string();
            let server_name = ServerName::try_from(name.clone())
                .map_err(|_| SmtpError::transport(format!("Invalid server name: {}", name)))?;

            let reader = match self.stream.take() {
                Some(TransportStream::Plain(reader)) => reader,
                Some(tls @ TransportStream::Tls(_)) => {
                    self.stream = Some(tls);
                    return Err(SmtpError::transport("TLS is already active"));
                }
                None => return Err(SmtpError::transport("Connection is closed")),
            };

            // Bytes buffered before the handshake would be trusted as if
            // they came over TLS.
            if !reader.buffer().is_empty() {
                return Err(SmtpError::transport(
                    "Server sent data before the TLS handshake",
                ));
            }

            let tls_stream = connector
                .connect(server_name, reader.into_inner())
                .await
                .map_err(|e| {
                    SmtpError::from_io(e, &format!("TLS handshake with {} failed", name))
                })?;

            tracing::debug!(server_name = %name, "TLS established");
            self.stream = Some(TransportStream::Tls(Box::new(BufReader::new(tls_stream))));
            Ok(())
        }

        #[cfg(not(feature = "rustls-tls"))]
        {
            let _ = target;
            Err(SmtpError::transport("TLS support is not compiled in"))
        }
    }

    fn is_tls(&self) -> bool {
        match &self.stream {
            #[cfg(feature = "rustls-tls")]
            Some(TransportStream::Tls(_)) => true,
            _ => false,
        }
    }

    async fn close(&mut self) -> SmtpResult<()> {
        let result = match self.stream.take() {
            Some(TransportStream::Plain(mut stream)) => stream.get_mut().shutdown().await,
            #[cfg(feature = "rustls-tls")]
            Some(TransportStream::Tls(mut stream)) => stream.get_mut().shutdown().await,
            None => Ok(()),
        };
        result.map_err(|e| SmtpError::from_io(e, "Close failed"))
    }
}

/// Builds a rustls connector trusting the webpki roots plus any extra CA.
#[cfg(feature = "rustls-tls")]
fn tls_connector(config: &TlsConfig) -> SmtpResult<tokio_rustls::TlsConnector> {
    use rustls::pki_types::CertificateDer;
    use std::sync::Arc;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &config.ca_cert_path {
        let pem = std::fs::read(path).map_err(|e| {
            SmtpError::transport(format!("Cannot read CA file {}: {}", path.display(), e))
        })?;
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| {
                SmtpError::transport(format!("Invalid PEM in {}: {}", path.display(), e))
            })?;
            root_store
                .add(cert)
                .map_err(|e| SmtpError::transport(format!("Invalid CA certificate: {}", e)))?;
            added += 1;
        }
        if added == 0 {
            return Err(SmtpError::transport(format!(
                "No certificates found in {}",
                path.display()
            )));
        }
    }

    if let Some(der) = &config.ca_cert_der {
        root_store
            .add(CertificateDer::from(der.clone()))
            .map_err(|e| SmtpError::transport(format!("Invalid CA certificate: {}", e)))?;
    }

    let versions: &[&'static rustls::SupportedProtocolVersion] = match config.min_version {
        TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
        TlsVersion::Tls13 => &[&rustls::version::TLS13],
    };

    let client_config = rustls::ClientConfig::builder_with_protocol_versions(versions)
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(tokio_rustls::TlsConnector::from(Arc::new(client_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SmtpErrorKind;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_read_line_strips_crlf() {
        let mut reader = BufReader::new(&b"250-first\r\n250 last\n"[..]);
        assert_eq!(TcpConnection::read_line_inner(&mut reader).await.unwrap(), "250-first");
        assert_eq!(TcpConnection::read_line_inner(&mut reader).await.unwrap(), "250 last");

        let err = TcpConnection::read_line_inner(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_read_line_is_bounded() {
        let long = vec![b'a'; MAX_LINE_LEN + 10];
        let mut reader = BufReader::new(long.as_slice());
        let err = TcpConnection::read_line_inner(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = ServerTarget::new("127.0.0.1", port, SecurityMode::None);
        let err = TcpConnector.connect(&target).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_plain_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            write.write_all(b"220-hello\r\n220 ready\r\n").await.unwrap();
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            write.write_all(b"221 bye\r\n").await.unwrap();
            line
        });

        let target = ServerTarget::new("127.0.0.1", port, SecurityMode::None);
        let mut conn = TcpConnector.connect(&target).await.unwrap();
        assert!(!conn.is_tls());

        let greeting = conn.read_response().await.unwrap();
        assert_eq!(greeting.code, 220);
        assert_eq!(greeting.message, vec!["hello", "ready"]);

        conn.send_command(&SmtpCommand::Quit).await.unwrap();
        assert_eq!(conn.read_response().await.unwrap().code, 221);
        conn.close().await.unwrap();
        assert!(conn.write_line("NOOP").await.is_err());

        assert_eq!(server.await.unwrap(), "QUIT");
    }
}
