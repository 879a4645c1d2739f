//! Test-only launchers, fixtures and record builders.
//!
//! [`InProcessLauncher`] runs a worker [`Session`] on the calling thread but
//! still pushes every request and reply through JSON, so records cross by
//! value exactly as they do with a real worker. [`ScriptedLauncher`] wraps it
//! to misbehave on demand.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use snip_lang::{CompiledArtifact, FrontEnd, Limits, Record, Row, SnippetCompiler};
use tempfile::TempDir;

use crate::io::protocol::{Reply, Request};
use crate::io::transport::{Launcher, Reclaimed, Transport, TransportError};
use crate::worker::Session;

/// Compile `source`, panicking on diagnostics.
pub fn compile(source: &str) -> CompiledArtifact {
    match SnippetCompiler::default().compile(source) {
        Ok(compilation) => compilation.artifact,
        Err(diagnostics) => panic!("snippet failed to compile: {diagnostics:?}"),
    }
}

/// Fixed time stamp so records compare equal across runs.
pub fn fixed_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
}

/// A record with rows `{foo:1, bar:2}` and `{foo:3, bar:4}`.
pub fn sample_record() -> Record {
    record(&[&[("foo", 1), ("bar", 2)], &[("foo", 3), ("bar", 4)]])
}

/// Build a record of integer fields.
pub fn record(rows: &[&[(&str, i64)]]) -> Record {
    let rows = rows
        .iter()
        .map(|fields| {
            fields
                .iter()
                .fold(Row::new(), |row, (name, value)| row.with(name, *value))
        })
        .collect();
    Record::new(fixed_time(), rows)
}

/// Launch counters shared by every transport a launcher produced.
#[derive(Debug, Default)]
pub struct Gauge {
    launched: AtomicU64,
    live: AtomicU64,
    max_live: AtomicU64,
    requests: AtomicU64,
}

impl Gauge {
    pub fn launched(&self) -> u64 {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    /// Most transports ever alive at once.
    pub fn max_live(&self) -> u64 {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    fn opened(&self) {
        self.launched.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
    }

    fn closed(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
pub struct InProcessLauncher {
    gauge: Arc<Gauge>,
    limits: Limits,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn gauge(&self) -> Arc<Gauge> {
        Arc::clone(&self.gauge)
    }

    pub fn requests_seen(&self) -> u64 {
        self.gauge.requests()
    }
}

impl Launcher for InProcessLauncher {
    type Transport = InProcessTransport;

    fn launch(&self) -> Result<InProcessTransport> {
        self.gauge.opened();
        Ok(InProcessTransport {
            session: Some(Session::new(self.limits)),
            gauge: Arc::clone(&self.gauge),
        })
    }
}

#[derive(Debug)]
pub struct InProcessTransport {
    session: Option<Session>,
    gauge: Arc<Gauge>,
}

impl Transport for InProcessTransport {
    fn call(&mut self, request: &Request, _timeout: Duration) -> Result<Reply, TransportError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| TransportError::Disconnected("session ended".into()))?;
        self.gauge.requests.fetch_add(1, Ordering::SeqCst);
        let request: Request = serde_json::from_slice(&serde_json::to_vec(request)?)?;
        let reply = session.handle(request);
        Ok(serde_json::from_slice(&serde_json::to_vec(&reply)?)?)
    }

    fn terminate(&mut self, _grace: Duration) -> Result<Reclaimed> {
        if self.session.take().is_some() {
            self.gauge.closed();
        }
        Ok(Reclaimed {
            forced: false,
            exit: "in-process".to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Script {
    /// `Invoke` never answers.
    Hang,
    /// The worker dies on `Invoke`.
    Crash,
    /// `launch` itself fails.
    FailLaunch,
    /// The first N teardowns fail.
    Stubborn(u32),
}

/// A launcher whose workers misbehave in one scripted way.
#[derive(Debug, Clone)]
pub struct ScriptedLauncher {
    script: Script,
    inner: InProcessLauncher,
    teardown_failures: Arc<AtomicU32>,
}

impl ScriptedLauncher {
    fn scripted(script: Script) -> Self {
        let failures = match script {
            Script::Stubborn(n) => n,
            _ => 0,
        };
        Self {
            script,
            inner: InProcessLauncher::new(),
            teardown_failures: Arc::new(AtomicU32::new(failures)),
        }
    }

    pub fn hang() -> Self {
        Self::scripted(Script::Hang)
    }

    pub fn crash() -> Self {
        Self::scripted(Script::Crash)
    }

    pub fn failing_launch() -> Self {
        Self::scripted(Script::FailLaunch)
    }

    pub fn stubborn(failures: u32) -> Self {
        Self::scripted(Script::Stubborn(failures))
    }

    pub fn gauge(&self) -> Arc<Gauge> {
        self.inner.gauge()
    }
}

impl Launcher for ScriptedLauncher {
    type Transport = ScriptedTransport;

    fn launch(&self) -> Result<ScriptedTransport> {
        if let Script::FailLaunch = self.script {
            return Err(anyhow!("scripted launch failure"));
        }
        Ok(ScriptedTransport {
            script: self.script,
            inner: self.inner.launch()?,
            dead: false,
            teardown_failures: Arc::clone(&self.teardown_failures),
        })
    }
}

#[derive(Debug)]
pub struct ScriptedTransport {
    script: Script,
    inner: InProcessTransport,
    dead: bool,
    teardown_failures: Arc<AtomicU32>,
}

impl Transport for ScriptedTransport {
    fn call(&mut self, request: &Request, timeout: Duration) -> Result<Reply, TransportError> {
        if self.dead {
            return Err(TransportError::Disconnected("scripted crash".into()));
        }
        match (self.script, request) {
            (Script::Hang, Request::Invoke { .. }) => {
                std::thread::sleep(timeout);
                Err(TransportError::TimedOut(timeout))
            }
            (Script::Crash, Request::Invoke { .. }) => {
                self.dead = true;
                Err(TransportError::Disconnected("scripted crash".into()))
            }
            _ => self.inner.call(request, timeout),
        }
    }

    fn terminate(&mut self, grace: Duration) -> Result<Reclaimed> {
        let refused = self
            .teardown_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(anyhow!("scripted teardown failure"));
        }
        let mut reclaimed = self.inner.terminate(grace)?;
        reclaimed.forced = matches!(self.script, Script::Hang);
        Ok(reclaimed)
    }
}

/// A temporary directory holding a snippet and optional records file.
pub struct SnippetFixture {
    dir: TempDir,
}

impl SnippetFixture {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `name` inside the fixture directory.
    pub fn write(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}
