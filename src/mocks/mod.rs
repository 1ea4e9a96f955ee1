//! Mock implementations for testing.
//!
//! [`ScriptedConnector`] plays back a fixed list of server lines and records
//! everything the session writes, so protocol sequencing can be checked
//! without a socket.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{SecurityMode, ServerTarget};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::transport::{SmtpConnection, SmtpConnector};

/// One scripted server action, consumed by `read_line`.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Return this line.
    Line(String),
    /// Never answer.
    Hang,
    /// Fail the read with this error kind.
    Fail(SmtpErrorKind),
}

/// Everything the client did on a scripted connection.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    /// Lines written with `write_line`.
    pub lines: Vec<String>,
    /// Bytes written with `write_raw`.
    pub data: Vec<u8>,
    /// Number of TLS upgrades.
    pub tls_upgrades: usize,
    /// True once `close` was called.
    pub closed: bool,
}

impl Transcript {
    /// Returns the command verbs in order (first word of each line).
    pub fn verbs(&self) -> Vec<String> {
        self.lines
            .iter()
            .map(|l| {
                l.split([' ', ':'])
                    .next()
                    .unwrap_or_default()
                    .to_ascii_uppercase()
            })
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connector that hands out [`ScriptedConnection`]s.
///
/// Clones share state, so a test can keep one handle for assertions.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Vec<ScriptStep>>>,
    connect_error: Arc<Mutex<Option<SmtpErrorKind>>>,
    connect_calls: Arc<AtomicUsize>,
    transcript: Arc<Mutex<Transcript>>,
}

impl ScriptedConnector {
    /// Creates a connector with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script for a plain session without AUTH that accepts everything.
    pub fn accepting(recipients: usize) -> Self {
        let mut connector = Self::new()
            .reply("220 mock.example.com ESMTP ready")
            .reply("250-mock.example.com\r\n250-8BITMIME\r\n250 SIZE 10485760")
            .reply("250 2.1.0 Sender OK");
        for _ in 0..recipients {
            connector = connector.reply("250 2.1.5 Recipient OK");
        }
        connector
            .reply("354 Start mail input")
            .reply("250 2.0.0 Queued as MOCK1")
            .reply("221 Bye")
    }

    /// Appends a reply. CRLF-separated lines are queued individually.
    pub fn reply(self, reply: &str) -> Self {
        {
            let mut script = lock(&self.script);
            for line in reply.split("\r\n") {
                script.push(ScriptStep::Line(line.to_string()));
            }
        }
        self
    }

    /// Appends a read that never completes.
    pub fn hang(self) -> Self {
        lock(&self.script).push(ScriptStep::Hang);
        self
    }

    /// Appends a failing read.
    pub fn fail(self, kind: SmtpErrorKind) -> Self {
        lock(&self.script).push(ScriptStep::Fail(kind));
        self
    }

    /// Makes `connect` itself fail.
    pub fn refuse(self, kind: SmtpErrorKind) -> Self {
        *lock(&self.connect_error) = Some(kind);
        self
    }

    /// Returns how many times `connect` was called.
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Returns a copy of the transcript.
    pub fn transcript(&self) -> Transcript {
        lock(&self.transcript).clone()
    }
}

#[async_trait]
impl SmtpConnector for ScriptedConnector {
    type Connection = ScriptedConnection;

    async fn connect(&self, target: &ServerTarget) -> SmtpResult<ScriptedConnection> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(kind) = *lock(&self.connect_error) {
            return Err(SmtpError::new(kind, format!("Scripted connect failure to {}", target.address())));
        }

        *lock(&self.transcript) = Transcript::default();
        Ok(ScriptedConnection {
            script: lock(&self.script).iter().cloned().collect(),
            transcript: Arc::clone(&self.transcript),
            tls: target.security == SecurityMode::ImplicitTls,
        })
    }
}

/// Connection replaying a script.
#[derive(Debug)]
pub struct ScriptedConnection {
    script: VecDeque<ScriptStep>,
    transcript: Arc<Mutex<Transcript>>,
    tls: bool,
}

impl ScriptedConnection {
    fn ensure_open(&self) -> SmtpResult<()> {
        if lock(&self.transcript).closed {
            return Err(SmtpError::transport("Connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl SmtpConnection for ScriptedConnection {
    async fn write_line(&mut self, line: &str) -> SmtpResult<()> {
        self.ensure_open()?;
        lock(&self.transcript).lines.push(line.to_string());
        Ok(())
    }

    async fn write_raw(&mut self, data: &[u8]) -> SmtpResult<()> {
        self.ensure_open()?;
        lock(&self.transcript).data.extend_from_slice(data);
        Ok(())
    }

    async fn read_line(&mut self) -> SmtpResult<String> {
        self.ensure_open()?;
        match self.script.pop_front() {
            Some(ScriptStep::Line(line)) => Ok(line),
            Some(ScriptStep::Hang) => std::future::pending().await,
            Some(ScriptStep::Fail(kind)) => Err(SmtpError::new(kind, "Scripted read failure")),
            None => Err(SmtpError::transport("Connection closed by server")),
        }
    }

    async fn upgrade_tls(&mut self, _target: &ServerTarget) -> SmtpResult<()> {
        self.ensure_open()?;
        if self.tls {
            return Err(SmtpError::transport("TLS is already active"));
        }
        self.tls = true;
        lock(&self.transcript).tls_upgrades += 1;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls
    }

    async fn close(&mut self) -> SmtpResult<()> {
        lock(&self.transcript).closed = true;
        Ok(())
    }
}
