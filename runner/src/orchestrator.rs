//! Drives compile → load → invoke → retrieve → teardown.
//!
//! Compilation runs on the caller's thread without holding anything. The rest
//! of a cycle runs under one mutex, so concurrent `run` calls queue and at
//! most one isolated context exists at a time.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use snip_lang::{Compilation, CompiledArtifact, Diagnostic, Fault, FaultKind, FrontEnd, Record};
use tracing::{debug, info, instrument, warn};

use crate::core::store::ArtifactStore;
use crate::core::types::{BoundaryStats, Outcome, SourceUnit, SourceVersions};
use crate::io::boundary::{
    BoundaryError, BoundaryManager, ContextHandle, FailedTeardown, LoadOutcome, Teardown,
};
use crate::io::config::RunnerConfig;
use crate::io::invoke::{InvocationResult, invoke};
use crate::io::marshal::{receive, send};
use crate::io::transport::Launcher;

pub struct Orchestrator<F, L: Launcher> {
    front_end: F,
    versions: SourceVersions,
    invoke_timeout: Duration,
    cycle: Mutex<Cycle<L>>,
}

/// Everything that must only be touched by one cycle at a time.
struct Cycle<L: Launcher> {
    boundary: BoundaryManager<L>,
    store: ArtifactStore,
    /// Set from `create` until `destroy` succeeds.
    current: Option<ContextHandle<L::Transport>>,
}

impl<F: FrontEnd, L: Launcher> Orchestrator<F, L> {
    pub fn new(front_end: F, launcher: L, config: &RunnerConfig) -> Self {
        Self {
            front_end,
            versions: SourceVersions::new(),
            invoke_timeout: config.invoke_timeout(),
            cycle: Mutex::new(Cycle {
                boundary: BoundaryManager::new(launcher, config.boundary_timeouts()),
                store: ArtifactStore::new(),
                current: None,
            }),
        }
    }

    pub fn versions(&self) -> &SourceVersions {
        &self.versions
    }

    pub fn stats(&self) -> BoundaryStats {
        self.lock().boundary.stats()
    }

    /// Mint a new source version for `text` and run it.
    pub fn run_text(&self, text: &str, record: &Record) -> Result<Outcome> {
        let source = self.versions.mint(text);
        self.run(&source, record)
    }

    /// Run one full cycle of `source` against a copy of `record`.
    ///
    /// Failures caused by the snippet are `Ok(Outcome)`; `Err` means the
    /// machinery itself broke (worker missing, channel lost outside user code).
    #[instrument(skip_all, fields(version = source.version))]
    pub fn run(&self, source: &SourceUnit, record: &Record) -> Result<Outcome> {
        let artifact = match self.compile(source) {
            Ok(artifact) => artifact,
            Err(diagnostics) => return Ok(Outcome::CompileFailed(diagnostics)),
        };
        self.lock()
            .execute(source.version, artifact, record, self.invoke_timeout)
    }

    /// Compile once, then give every record its own fresh context.
    #[instrument(skip_all, fields(version = source.version, records = records.len()))]
    pub fn run_batch(&self, source: &SourceUnit, records: &[Record]) -> Result<Vec<Outcome>> {
        let artifact = match self.compile(source) {
            Ok(artifact) => artifact,
            Err(diagnostics) => return Ok(vec![Outcome::CompileFailed(diagnostics)]),
        };
        let mut outcomes = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let outcome = self
                .lock()
                .execute(source.version, artifact.clone(), record, self.invoke_timeout)
                .with_context(|| format!("record {index}"))?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn compile(&self, source: &SourceUnit) -> Result<CompiledArtifact, Vec<Diagnostic>> {
        info!(bytes = source.text.len(), "compiling");
        match self.front_end.compile(&source.text) {
            Ok(Compilation { artifact, warnings }) => {
                for warning in &warnings {
                    warn!(%warning, "compiler warning");
                }
                Ok(artifact)
            }
            Err(diagnostics) => {
                let errors = diagnostics.iter().filter(|d| d.is_error()).count();
                warn!(errors, "compile failed");
                Err(diagnostics)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Cycle<L>> {
        // A panic mid-cycle leaves `current` set; the next cycle reclaims it.
        self.cycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<L: Launcher> Cycle<L> {
    fn execute(
        &mut self,
        version: u64,
        artifact: CompiledArtifact,
        record: &Record,
        invoke_timeout: Duration,
    ) -> Result<Outcome> {
        let id = self.store.store(version, artifact);
        debug!(artifact = id.short(), "artifact stored");

        if self.current.is_some() {
            warn!("reclaiming context left by an earlier cycle");
            self.finish(Teardown::Forced)
                .context("tear down previous context")?;
        }

        let handle = match self.boundary.create() {
            Ok(handle) => handle,
            Err(err @ BoundaryError::Busy(_)) => {
                debug_assert!(false, "{err}");
                return Err(err.into());
            }
            Err(err) => return Err(anyhow::Error::new(err).context("create isolated context")),
        };
        let handle = self.current.insert(handle);
        let stored = self
            .store
            .current()
            .ok_or_else(|| anyhow!("artifact store is empty"))?;

        let driven = drive(
            &mut self.boundary,
            handle,
            &stored.artifact,
            record,
            invoke_timeout,
        );
        let teardown = match &driven {
            Ok((_, teardown)) => *teardown,
            Err(_) => Teardown::Forced,
        };
        let finished = self.finish(teardown);

        let (outcome, _) = driven.context("execution cycle failed")?;
        finished?;
        info!(outcome = outcome.label(), "cycle finished");
        Ok(outcome)
    }

    /// Destroy the current handle, if any. On failure it stays current.
    fn finish(&mut self, teardown: Teardown) -> Result<()> {
        let Some(handle) = self.current.take() else {
            return Ok(());
        };
        match self.boundary.destroy(handle, teardown) {
            Ok(_) => Ok(()),
            Err(FailedTeardown { handle, error }) => {
                self.current = Some(handle);
                Err(error.into())
            }
        }
    }
}

/// Steps 3 to 6 of a cycle. Returns the outcome and how to tear down.
fn drive<L: Launcher>(
    boundary: &mut BoundaryManager<L>,
    handle: &mut ContextHandle<L::Transport>,
    artifact: &CompiledArtifact,
    record: &Record,
    invoke_timeout: Duration,
) -> Result<(Outcome, Teardown), BoundaryError> {
    let module = match boundary.load(handle, artifact)? {
        LoadOutcome::Loaded(module) => module,
        LoadOutcome::Fault(message) => {
            return Ok((Outcome::LoadFailed(message), Teardown::Graceful));
        }
    };

    let context = match send(handle, record)? {
        Ok(context) => context,
        Err(fault) => {
            warn!(%fault, "record refused");
            return Ok((marshal_fault(fault.0, Vec::new()), Teardown::Graceful));
        }
    };

    match invoke(handle, module, context, invoke_timeout)? {
        InvocationResult::Returned { context, logs } => match receive(handle, context)? {
            Ok(record) => Ok((Outcome::Success { record, logs }, Teardown::Graceful)),
            Err(fault) => {
                warn!(%fault, "result refused");
                Ok((marshal_fault(fault.0, logs), Teardown::Graceful))
            }
        },
        InvocationResult::Fault { fault, logs } => match fault.kind {
            FaultKind::Timeout => Ok((Outcome::Timeout(invoke_timeout), Teardown::Forced)),
            FaultKind::Crashed => Ok((Outcome::RuntimeFault { fault, logs }, Teardown::Forced)),
            _ => Ok((Outcome::RuntimeFault { fault, logs }, Teardown::Graceful)),
        },
    }
}

fn marshal_fault(message: String, logs: Vec<String>) -> Outcome {
    Outcome::RuntimeFault {
        fault: Fault::new(FaultKind::Marshal, message),
        logs,
    }
}
