//! Observability for SMTP sessions.
//!
//! Provides atomic session metrics, a per-session tracing context and a
//! small timer.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::ServerTarget;
use crate::errors::SmtpErrorKind;

/// Session metrics collector. Shared by clones of a composer.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    /// Sessions started (including ones rejected before I/O).
    pub sessions_started: AtomicU64,
    /// Messages accepted by the server.
    pub messages_sent: AtomicU64,
    /// Sessions that ended in failure.
    pub sessions_failed: AtomicU64,
    /// Total connection attempts.
    pub connection_attempts: AtomicU64,
    /// Failed connections.
    pub connections_failed: AtomicU64,
    /// STARTTLS upgrades.
    pub tls_upgrades: AtomicU64,
    /// Total authentication attempts.
    pub auth_attempts: AtomicU64,
    /// Failed authentications.
    pub auth_failed: AtomicU64,
    /// Recipients accepted by RCPT TO.
    pub recipients_accepted: AtomicU64,
    /// Recipients refused by RCPT TO.
    pub recipients_rejected: AtomicU64,
    /// DATA payload bytes written.
    pub bytes_sent: AtomicU64,
    /// Sessions that hit the deadline.
    pub timeouts: AtomicU64,
    /// Sessions cancelled by the caller.
    pub cancellations: AtomicU64,
}

impl SessionMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of a session.
    pub fn record_session_start(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a delivered message.
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records a failed session.
    pub fn record_failure(&self, kind: SmtpErrorKind) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        match kind {
            SmtpErrorKind::Timeout => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            SmtpErrorKind::Cancelled => {
                self.cancellations.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Records a connection attempt.
    pub fn record_connection_attempt(&self, success: bool) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.connections_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a STARTTLS upgrade.
    pub fn record_tls_upgrade(&self) {
        self.tls_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an authentication attempt.
    pub fn record_auth_attempt(&self, success: bool) {
        self.auth_attempts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.auth_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records the RCPT TO outcome of one recipient.
    pub fn record_recipient(&self, accepted: bool) {
        if accepted {
            self.recipients_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.recipients_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            tls_upgrades: self.tls_upgrades.load(Ordering::Relaxed),
            auth_attempts: self.auth_attempts.load(Ordering::Relaxed),
            auth_failed: self.auth_failed.load(Ordering::Relaxed),
            recipients_accepted: self.recipients_accepted.load(Ordering::Relaxed),
            recipients_rejected: self.recipients_rejected.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Sessions started.
    pub sessions_started: u64,
    /// Messages accepted by the server.
    pub messages_sent: u64,
    /// Failed sessions.
    pub sessions_failed: u64,
    /// Total connection attempts.
    pub connection_attempts: u64,
    /// Failed connections.
    pub connections_failed: u64,
    /// STARTTLS upgrades.
    pub tls_upgrades: u64,
    /// Total authentication attempts.
    pub auth_attempts: u64,
    /// Failed authentications.
    pub auth_failed: u64,
    /// Recipients accepted.
    pub recipients_accepted: u64,
    /// Recipients refused.
    pub recipients_rejected: u64,
    /// DATA payload bytes written.
    pub bytes_sent: u64,
    /// Deadline expiries.
    pub timeouts: u64,
    /// Caller cancellations.
    pub cancellations: u64,
}

impl MetricsSnapshot {
    /// Returns the session success rate.
    pub fn success_rate(&self) -> f64 {
        let total = self.messages_sent + self.sessions_failed;
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }

    /// Formats the snapshot as JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Timer for measuring session duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::debug!(
            timer = self.name,
            duration_ms = elapsed.as_millis() as u64,
            "Timer stopped"
        );
        elapsed
    }
}

/// Identifies one session in logs.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Unique session ID.
    pub session_id: String,
    /// SMTP host.
    pub host: String,
    /// SMTP port.
    pub port: u16,
    /// Security mode name.
    pub security: String,
    /// Recipient count.
    pub recipient_count: usize,
}

impl SessionContext {
    /// Creates a context for a session against `target`.
    pub fn new(target: &ServerTarget, recipient_count: usize) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            host: target.host.clone(),
            port: target.port,
            security: target.security.to_string(),
            recipient_count,
        }
    }

    /// Returns the tracing span covering the session.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "smtp_session",
            session_id = %self.session_id,
            host = %self.host,
            port = self.port,
            security = %self.security,
            recipients = self.recipient_count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityMode;

    #[test]
    fn test_metrics() {
        let metrics = SessionMetrics::new();

        metrics.record_sent(100);
        metrics.record_sent(50);
        metrics.record_failure(SmtpErrorKind::Timeout);
        metrics.record_failure(SmtpErrorKind::Protocol);
        metrics.record_recipient(true);
        metrics.record_recipient(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 150);
        assert_eq!(snapshot.sessions_failed, 2);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.recipients_rejected, 1);
        assert!((snapshot.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_json() {
        let metrics = SessionMetrics::new();
        metrics.record_connection_attempt(false);
        let json = metrics.snapshot().to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["connections_failed"], 1);
        assert_eq!(value["connection_attempts"], 1);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start("test");
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.stop() >= Duration::from_millis(10));
    }

    #[test]
    fn test_session_context() {
        let target = ServerTarget::new("mx.example.com", 587, SecurityMode::StartTls);
        let ctx = SessionContext::new(&target, 3);
        assert_eq!(ctx.security, "starttls");
        assert_eq!(ctx.recipient_count, 3);
        assert_eq!(ctx.session_id.len(), 36);
    }
}
