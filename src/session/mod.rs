//! SMTP session orchestration.
//!
//! [`SessionComposer`] validates a [`Message`], formats its envelope and
//! drives one SMTP session against a [`ServerTarget`]: greeting, EHLO,
//! optional STARTTLS and AUTH, MAIL FROM, RCPT TO, DATA and QUIT. One
//! absolute deadline bounds the whole exchange and a [`CancellationToken`]
//! can abort it at any await point.
//!
//! Sessions are independent. A composer holds configuration and metrics
//! only, so clones can run sessions concurrently.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::auth::{AuthMethod, Authenticator, Credentials};
use crate::config::{RecipientPolicy, SecurityMode, ServerTarget, SessionConfig};
use crate::envelope::{DateSource, Envelope, EnvelopeComposer};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::observability::{SessionContext, SessionMetrics, Timer};
use crate::protocol::{codes, EsmtpCapabilities, SessionState, SmtpCommand, SmtpResponse};
use crate::transport::{SmtpConnection, SmtpConnector, TcpConnector};
use crate::types::{Message, RejectedRecipient, SentReport, SessionResult};

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Drives SMTP sessions.
///
/// The connector is generic so tests can script the server side. The
/// default is [`TcpConnector`].
pub struct SessionComposer<C: SmtpConnector = TcpConnector> {
    connector: Arc<C>,
    config: Arc<SessionConfig>,
    envelopes: EnvelopeComposer,
    metrics: Arc<SessionMetrics>,
}

impl<C: SmtpConnector> Clone for SessionComposer<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            config: Arc::clone(&self.config),
            envelopes: self.envelopes.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<C: SmtpConnector> std::fmt::Debug for SessionComposer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionComposer")
            .field("connector", &self.connector)
            .field("config", &self.config)
            .finish()
    }
}

impl Default for SessionComposer<TcpConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionComposer<TcpConnector> {
    /// Creates a composer with the TCP connector and default configuration.
    pub fn new() -> Self {
        Self::from_parts(TcpConnector, SessionConfig::default(), None)
    }

    /// Creates a builder.
    pub fn builder() -> SessionComposerBuilder<TcpConnector> {
        SessionComposerBuilder::new()
    }
}

impl<C: SmtpConnector> SessionComposer<C> {
    /// Creates a composer with a custom connector and default configuration.
    pub fn with_connector(connector: C) -> Self {
        Self::from_parts(connector, SessionConfig::default(), None)
    }

    fn from_parts(
        connector: C,
        config: SessionConfig,
        date_source: Option<Arc<dyn DateSource>>,
    ) -> Self {
        let envelopes = match date_source {
            Some(source) => EnvelopeComposer::new(source, config.user_agent.clone()),
            None => EnvelopeComposer::new(
                Arc::new(crate::envelope::SystemDate),
                config.user_agent.clone(),
            ),
        };

        Self {
            connector: Arc::new(connector),
            config: Arc::new(config),
            envelopes,
            metrics: Arc::new(SessionMetrics::new()),
        }
    }

    /// Returns the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the metrics shared by this composer and its clones.
    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// Sends `message` to `target`, bounded by `timeout` end to end.
    pub async fn send(
        &self,
        target: &ServerTarget,
        message: &Message,
        timeout: Duration,
    ) -> SessionResult {
        self.send_with_cancellation(target, message, timeout, CancellationToken::new())
            .await
    }

    /// Like [`send`](Self::send), but aborts with `Cancelled` once `token`
    /// is cancelled.
    pub async fn send_with_cancellation(
        &self,
        target: &ServerTarget,
        message: &Message,
        timeout: Duration,
        token: CancellationToken,
    ) -> SessionResult {
        let timer = Timer::start("smtp_session");
        self.metrics.record_session_start();

        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
        let redactor = target
            .credentials
            .as_ref()
            .map(Credentials::redactor)
            .unwrap_or_default();

        let outcome = self
            .run(target, message, timeout, deadline, &token)
            .await
            .map_err(|e| e.redact(&redactor));

        let outcome = match outcome {
            Ok((mut report, bytes)) => {
                report.duration = timer.stop();
                self.metrics.record_sent(bytes);
                tracing::info!(
                    message_id = %report.message_id,
                    accepted = report.accepted.len(),
                    rejected = report.partial.len(),
                    duration_ms = report.duration.as_millis() as u64,
                    "Message accepted"
                );
                Ok(report)
            }
            Err(err) => {
                self.metrics.record_failure(err.kind());
                tracing::warn!(
                    kind = %err.kind(),
                    code = ?err.smtp_code(),
                    transient = err.is_transient(),
                    error = %err,
                    "SMTP session failed"
                );
                Err(err)
            }
        };

        SessionResult::from(outcome)
    }

    /// Validates inputs, then connects and runs the exchange.
    async fn run(
        &self,
        target: &ServerTarget,
        message: &Message,
        timeout: Duration,
        deadline: Instant,
        token: &CancellationToken,
    ) -> SmtpResult<(SentReport, usize)> {
        target.validate()?;
        let envelope = self.envelopes.compose(message)?;

        if token.is_cancelled() {
            return Err(SmtpError::cancelled());
        }

        let context = SessionContext::new(target, envelope.recipients.len());
        self.converse(target, &envelope, timeout, deadline, token)
            .instrument(context.span())
            .await
    }

    async fn converse(
        &self,
        target: &ServerTarget,
        envelope: &Envelope,
        timeout: Duration,
        deadline: Instant,
        token: &CancellationToken,
    ) -> SmtpResult<(SentReport, usize)> {
        let mut state = SessionState::Idle;

        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SmtpError::cancelled()),
            res = timeout_at(deadline, self.connector.connect(target)) => match res {
                Ok(res) => res,
                Err(_) => Err(SmtpError::timeout(format!(
                    "Connect to {} did not complete within {:?}",
                    target.address(),
                    timeout
                ))),
            },
        };
        self.metrics.record_connection_attempt(connected.is_ok());
        let mut conn = connected?;
        state.advance(SessionState::Connected)?;
        tracing::debug!(tls = conn.is_tls(), "Connected");

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(Interrupt::Cancelled),
            res = timeout_at(deadline, self.exchange(&mut conn, &mut state, target, envelope)) => {
                res.map_err(|_| Interrupt::Deadline)
            }
        };
        let outcome = match outcome {
            Ok(result) => result,
            Err(Interrupt::Cancelled) => Err(SmtpError::cancelled()),
            Err(Interrupt::Deadline) => Err(SmtpError::timeout(format!(
                "Session did not complete within {:?} (state {:?})",
                timeout, state
            ))),
        };

        self.finish(&mut conn, &mut state, outcome.as_ref().err(), deadline)
            .await;

        outcome.map(|report| (report, envelope.size()))
    }

    /// Runs the command sequence on an open connection.
    async fn exchange(
        &self,
        conn: &mut C::Connection,
        state: &mut SessionState,
        target: &ServerTarget,
        envelope: &Envelope,
    ) -> SmtpResult<SentReport> {
        let greeting = conn.read_response().await?;
        if greeting.code != codes::SERVICE_READY {
            return Err(greeting.to_error(SmtpErrorKind::Protocol, "Greeting"));
        }

        let mut capabilities = self.greet(conn).await?;

        if target.security == SecurityMode::StartTls && !conn.is_tls() {
            if !capabilities.starttls {
                return Err(SmtpError::transport(format!(
                    "STARTTLS required but not advertised by {}",
                    target.host
                )));
            }
            let reply = round_trip(conn, &SmtpCommand::StartTls).await?;
            if reply.code != codes::SERVICE_READY {
                return Err(reply.to_error(SmtpErrorKind::Transport, "STARTTLS"));
            }
            conn.upgrade_tls(target).await?;
            self.metrics.record_tls_upgrade();
            tracing::debug!("TLS upgrade complete");

            capabilities = self.greet(conn).await?;
        }
        state.advance(SessionState::Greeted)?;

        if let Some(credentials) = &target.credentials {
            let result = self
                .authenticate(conn, &capabilities, target, credentials)
                .await;
            self.metrics.record_auth_attempt(result.is_ok());
            result?;
            state.advance(SessionState::Authenticated)?;
        }

        if let Some(limit) = capabilities.size.filter(|limit| envelope.size() > *limit) {
            return Err(SmtpError::new(
                SmtpErrorKind::Protocol,
                format!(
                    "Message of {} bytes exceeds the server limit of {} bytes",
                    envelope.size(),
                    limit
                ),
            )
            .with_smtp_code(codes::SIZE_EXCEEDED));
        }

        let mail = SmtpCommand::MailFrom {
            address: envelope.sender.to_smtp(),
            size: capabilities
                .has_capability("SIZE")
                .then(|| envelope.size()),
            body_8bit: capabilities.eight_bit_mime && envelope.is_eight_bit(),
        };
        let reply = round_trip(conn, &mail).await?;
        if !reply.is_success() {
            return Err(reply.to_error(SmtpErrorKind::Protocol, "MAIL FROM"));
        }
        state.advance(SessionState::SenderAccepted)?;

        let (accepted, rejected) = self.add_recipients(conn, envelope).await?;
        if accepted.is_empty() {
            let mut err = SmtpError::new(
                SmtpErrorKind::AllRecipientsRejected,
                format!("All {} recipients were rejected", rejected.len()),
            );
            if let Some(last) = rejected.last() {
                err = err.with_smtp_code(last.code);
            }
            return Err(err.with_rejected(rejected));
        }
        if self.config.recipient_policy == RecipientPolicy::RequireAll && !rejected.is_empty() {
            let mut err = SmtpError::new(
                SmtpErrorKind::RecipientsRejected,
                format!(
                    "{} of {} recipients were rejected",
                    rejected.len(),
                    envelope.recipients.len()
                ),
            );
            if let Some(last) = rejected.last() {
                err = err.with_smtp_code(last.code);
            }
            return Err(err.with_rejected(rejected));
        }
        state.advance(SessionState::RecipientsEvaluated)?;

        let reply = round_trip(conn, &SmtpCommand::Data).await?;
        if reply.code != codes::START_MAIL_INPUT {
            return Err(reply.to_error(SmtpErrorKind::Protocol, "DATA"));
        }

        conn.write_raw(&envelope.data_payload()).await?;
        let reply = conn.read_response().await?;
        if !reply.is_success() {
            return Err(reply.to_error(SmtpErrorKind::Protocol, "Message content"));
        }
        state.advance(SessionState::DataAccepted)?;

        Ok(SentReport {
            message_id: envelope.message_id.clone(),
            accepted,
            partial: rejected,
            response: reply.to_string(),
            duration: Duration::ZERO,
        })
    }

    /// Sends EHLO, falling back to HELO when EHLO is refused permanently.
    async fn greet(&self, conn: &mut C::Connection) -> SmtpResult<EsmtpCapabilities> {
        let client_id = self.config.client_id.clone();

        let reply = round_trip(conn, &SmtpCommand::Ehlo(client_id.clone())).await?;
        if reply.is_success() {
            return Ok(EsmtpCapabilities::from_ehlo_response(&reply));
        }
        if !reply.is_permanent_failure() {
            return Err(reply.to_error(SmtpErrorKind::Protocol, "EHLO"));
        }

        tracing::debug!(code = reply.code, "EHLO refused, falling back to HELO");
        let reply = round_trip(conn, &SmtpCommand::Helo(client_id)).await?;
        if !reply.is_success() {
            return Err(reply.to_error(SmtpErrorKind::Protocol, "HELO"));
        }
        Ok(EsmtpCapabilities::default())
    }

    /// Issues one RCPT TO per recipient and splits the outcomes.
    async fn add_recipients(
        &self,
        conn: &mut C::Connection,
        envelope: &Envelope,
    ) -> SmtpResult<(Vec<String>, Vec<RejectedRecipient>)> {
        let mut accepted = Vec::with_capacity(envelope.recipients.len());
        let mut rejected = Vec::new();

        for recipient in &envelope.recipients {
            let command = SmtpCommand::RcptTo {
                address: recipient.to_smtp(),
            };
            let reply = round_trip(conn, &command).await?;

            if reply.is_success() {
                accepted.push(recipient.email.clone());
                self.metrics.record_recipient(true);
            } else if reply.is_temporary_failure() || reply.is_permanent_failure() {
                tracing::debug!(recipient = %recipient.email, code = reply.code, "Recipient rejected");
                rejected.push(RejectedRecipient {
                    address: recipient.email.clone(),
                    code: reply.code,
                    message: reply.full_message(),
                });
                self.metrics.record_recipient(false);
            } else {
                return Err(reply.to_error(SmtpErrorKind::Protocol, "RCPT TO"));
            }
        }

        Ok((accepted, rejected))
    }

    /// Picks a mechanism and runs its exchange.
    async fn authenticate(
        &self,
        conn: &mut C::Connection,
        capabilities: &EsmtpCapabilities,
        target: &ServerTarget,
        credentials: &Credentials,
    ) -> SmtpResult<()> {
        let method = Authenticator::select_best_method(
            &capabilities.auth_methods(),
            credentials,
            conn.is_tls(),
            self.config.allow_insecure_auth,
            target.auth_method,
        )?;
        tracing::debug!(mechanism = %method, username = credentials.username(), "Authenticating");

        let reply = match (method, credentials) {
            (AuthMethod::Plain, Credentials::Plain { username, password }) => {
                let command = SmtpCommand::Auth {
                    mechanism: method.mechanism_name().to_string(),
                    initial_response: Some(Authenticator::plain_initial_response(
                        username, password,
                    )),
                };
                round_trip(conn, &command).await?
            }
            (AuthMethod::Login, Credentials::Plain { username, password }) => {
                expect_challenge(round_trip(conn, &auth_start(method)).await?, method)?;
                let reply = round_trip(
                    conn,
                    &SmtpCommand::AuthResponse(Authenticator::login_username(username)),
                )
                .await?;
                expect_challenge(reply, method)?;
                round_trip(
                    conn,
                    &SmtpCommand::AuthResponse(Authenticator::login_password(password)),
                )
                .await?
            }
            (AuthMethod::CramMd5, Credentials::Plain { username, password }) => {
                let challenge =
                    expect_challenge(round_trip(conn, &auth_start(method)).await?, method)?;
                let response = Authenticator::cram_md5_response(&challenge, username, password)?;
                round_trip(conn, &SmtpCommand::AuthResponse(response)).await?
            }
            (AuthMethod::XOAuth2, Credentials::XOAuth2 { username, access_token }) => {
                let command = SmtpCommand::Auth {
                    mechanism: method.mechanism_name().to_string(),
                    initial_response: Some(Authenticator::xoauth2_initial_response(
                        username,
                        access_token,
                    )),
                };
                let reply = round_trip(conn, &command).await?;
                if reply.code == codes::AUTH_CONTINUE {
                    // The server sent an error description; an empty line ends the exchange.
                    round_trip(conn, &SmtpCommand::AuthResponse(String::new())).await?
                } else {
                    reply
                }
            }
            (method, credentials) => {
                return Err(SmtpError::authentication(format!(
                    "{} cannot be used with {} credentials",
                    method,
                    credentials_kind(credentials)
                )));
            }
        };

        if reply.code != codes::AUTH_SUCCESS {
            return Err(reply.to_error(SmtpErrorKind::Auth, &format!("AUTH {}", method)));
        }
        tracing::debug!(mechanism = %method, "Authenticated");
        Ok(())
    }

    /// Sends QUIT when the connection is still usable, then closes it.
    ///
    /// Neither step can change the session outcome.
    async fn finish(
        &self,
        conn: &mut C::Connection,
        state: &mut SessionState,
        failure: Option<&SmtpError>,
        deadline: Instant,
    ) {
        let grace = self.config.close_grace;
        let usable = failure.map_or(true, |e| {
            !matches!(
                e.kind(),
                SmtpErrorKind::Transport | SmtpErrorKind::Timeout | SmtpErrorKind::Cancelled
            )
        });

        if usable {
            let quit_deadline = deadline.min(Instant::now() + grace);
            match timeout_at(quit_deadline, round_trip(conn, &SmtpCommand::Quit)).await {
                Ok(Ok(reply)) => tracing::debug!(code = reply.code, "QUIT acknowledged"),
                Ok(Err(err)) => tracing::debug!(error = %err.kind(), "QUIT failed"),
                Err(_) => tracing::debug!("QUIT timed out"),
            }
        }

        match tokio::time::timeout(grace, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(error = %err.kind(), "Close failed"),
            Err(_) => tracing::debug!("Close timed out"),
        }

        if *state != SessionState::Closed {
            *state = SessionState::Closed;
        }
    }
}

/// Why the exchange stopped before producing a result.
enum Interrupt {
    Cancelled,
    Deadline,
}

async fn round_trip<T: SmtpConnection + ?Sized>(
    conn: &mut T,
    command: &SmtpCommand,
) -> SmtpResult<SmtpResponse> {
    conn.send_command(command).await?;
    conn.read_response().await
}

fn auth_start(method: AuthMethod) -> SmtpCommand {
    SmtpCommand::Auth {
        mechanism: method.mechanism_name().to_string(),
        initial_response: None,
    }
}

/// Checks for a 334 continuation and returns its challenge text.
fn expect_challenge(reply: SmtpResponse, method: AuthMethod) -> SmtpResult<String> {
    if reply.code != codes::AUTH_CONTINUE {
        return Err(reply.to_error(SmtpErrorKind::Auth, &format!("AUTH {}", method)));
    }
    Ok(reply.first_message().to_string())
}

fn credentials_kind(credentials: &Credentials) -> &'static str {
    match credentials {
        Credentials::Plain { .. } => "password",
        Credentials::XOAuth2 { .. } => "OAuth2",
    }
}

/// Builder for [`SessionComposer`].
#[derive(Debug)]
pub struct SessionComposerBuilder<C: SmtpConnector = TcpConnector> {
    connector: C,
    config: SessionConfig,
    date_source: Option<Arc<dyn DateSource>>,
}

impl Default for SessionComposerBuilder<TcpConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionComposerBuilder<TcpConnector> {
    /// Creates a builder using the TCP connector.
    pub fn new() -> Self {
        Self {
            connector: TcpConnector,
            config: SessionConfig::default(),
            date_source: None,
        }
    }
}

impl<C: SmtpConnector> SessionComposerBuilder<C> {
    /// Replaces the connector.
    pub fn connector<D: SmtpConnector>(self, connector: D) -> SessionComposerBuilder<D> {
        SessionComposerBuilder {
            connector,
            config: self.config,
            date_source: self.date_source,
        }
    }

    /// Sets the session configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock used for `Date` headers.
    pub fn date_source(mut self, source: Arc<dyn DateSource>) -> Self {
        self.date_source = Some(source);
        self
    }

    /// Builds the composer.
    pub fn build(self) -> SmtpResult<SessionComposer<C>> {
        self.config.validate()?;
        Ok(SessionComposer::from_parts(
            self.connector,
            self.config,
            self.date_source,
        ))
    }
}
