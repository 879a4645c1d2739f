//! Creation, loading and teardown of isolated contexts.
//!
//! [`BoundaryManager`] owns the only live [`ContextHandle`] slot: `create`
//! refuses to run while a previous handle has not finished `destroy`. Handles
//! move through [`ContextState`] and every operation checks the state first.

use std::time::Duration;

use snip_lang::CompiledArtifact;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::lifecycle::{Action, ContextState};
use crate::core::types::{BoundaryStats, HandleId, ModuleId};
use crate::io::protocol::{Reply, Request};
use crate::io::transport::{Launcher, Reclaimed, Transport, TransportError};

#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("an isolated context is already live ({0})")]
    Busy(HandleId),
    #[error("context {id} is {state}; cannot {action}")]
    WrongState {
        id: HandleId,
        state: ContextState,
        action: Action,
    },
    #[error("module was loaded into {module_handle}, not {handle}")]
    StaleHandle {
        handle: HandleId,
        module_handle: HandleId,
    },
    #[error("failed to start isolated context")]
    Launch(#[source] anyhow::Error),
    #[error("failed to tear down {0}")]
    Teardown(HandleId, #[source] anyhow::Error),
    #[error("worker answered `{request}` with `{reply}`")]
    Protocol {
        request: &'static str,
        reply: String,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// How hard `destroy` tries to be polite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Ask the worker to exit and wait out the grace period before killing.
    Graceful,
    /// Kill immediately; used when the worker is stuck in user code.
    Forced,
}

/// Time bounds applied by the manager and the marshaling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryTimeouts {
    /// Bound on load, send and receive round trips.
    pub step: Duration,
    pub teardown_grace: Duration,
}

impl Default for BoundaryTimeouts {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(5),
            teardown_grace: Duration::from_millis(500),
        }
    }
}

/// One isolated context.
pub struct ContextHandle<T> {
    id: HandleId,
    state: ContextState,
    step_timeout: Duration,
    transport: T,
}

impl<T: Transport> ContextHandle<T> {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub(crate) fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    pub(crate) fn check(&self, action: Action) -> Result<(), BoundaryError> {
        if self.state.permits(action) {
            Ok(())
        } else {
            Err(BoundaryError::WrongState {
                id: self.id,
                state: self.state,
                action,
            })
        }
    }

    pub(crate) fn advance(&mut self, action: Action) {
        self.state = self.state.after(action);
    }

    pub(crate) fn exchange(
        &mut self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Reply, TransportError> {
        self.transport.call(request, timeout)
    }
}

impl<T> std::fmt::Debug for ContextHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// An artifact resident in a specific context. Consumed by `invoke`.
#[derive(Debug, PartialEq, Eq)]
pub struct LoadedModule {
    pub(crate) handle: HandleId,
    pub(crate) module: ModuleId,
}

impl LoadedModule {
    pub fn handle(&self) -> HandleId {
        self.handle
    }
}

#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(LoadedModule),
    /// The artifact was rejected; the context is still alive and unloaded.
    Fault(String),
}

/// `destroy` failed; the handle is still live and must be destroyed again.
pub struct FailedTeardown<T> {
    pub handle: ContextHandle<T>,
    pub error: BoundaryError,
}

impl<T> std::fmt::Debug for FailedTeardown<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailedTeardown")
            .field("handle", &self.handle)
            .field("error", &self.error)
            .finish()
    }
}

pub struct BoundaryManager<L: Launcher> {
    launcher: L,
    timeouts: BoundaryTimeouts,
    live: Option<HandleId>,
    next_id: u64,
    stats: BoundaryStats,
}

impl<L: Launcher> BoundaryManager<L> {
    pub fn new(launcher: L, timeouts: BoundaryTimeouts) -> Self {
        Self {
            launcher,
            timeouts,
            live: None,
            next_id: 1,
            stats: BoundaryStats::default(),
        }
    }

    pub fn stats(&self) -> BoundaryStats {
        self.stats
    }

    pub fn live(&self) -> Option<HandleId> {
        self.live
    }

    pub fn timeouts(&self) -> BoundaryTimeouts {
        self.timeouts
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    #[instrument(skip_all)]
    pub fn create(&mut self) -> Result<ContextHandle<L::Transport>, BoundaryError> {
        if let Some(live) = self.live {
            return Err(BoundaryError::Busy(live));
        }
        let transport = self.launcher.launch().map_err(BoundaryError::Launch)?;
        let id = HandleId(self.next_id);
        self.next_id += 1;
        self.live = Some(id);
        self.stats.created += 1;
        self.stats.live += 1;
        self.stats.max_live = self.stats.max_live.max(self.stats.live);
        debug!(%id, "context created");
        Ok(ContextHandle {
            id,
            state: ContextState::Created,
            step_timeout: self.timeouts.step,
            transport,
        })
    }

    #[instrument(skip_all, fields(id = %handle.id))]
    pub fn load(
        &mut self,
        handle: &mut ContextHandle<L::Transport>,
        artifact: &CompiledArtifact,
    ) -> Result<LoadOutcome, BoundaryError> {
        handle.check(Action::Load)?;
        let request = Request::Load {
            artifact: artifact.clone(),
        };
        match handle.exchange(&request, self.timeouts.step)? {
            Reply::Loaded { module } => {
                handle.advance(Action::Load);
                info!(module = module.0, "loaded");
                Ok(LoadOutcome::Loaded(LoadedModule {
                    handle: handle.id,
                    module,
                }))
            }
            Reply::LoadFault { message } => {
                warn!(%message, "load fault");
                Ok(LoadOutcome::Fault(message))
            }
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Tear the context down and wait until its resources are reclaimed.
    ///
    /// On success the live slot is free again. On failure the handle is handed
    /// back still live, so the caller can retry before creating another.
    #[instrument(skip_all, fields(id = %handle.id, ?teardown))]
    pub fn destroy(
        &mut self,
        mut handle: ContextHandle<L::Transport>,
        teardown: Teardown,
    ) -> Result<Reclaimed, FailedTeardown<L::Transport>> {
        let grace = match teardown {
            Teardown::Graceful => self.timeouts.teardown_grace,
            Teardown::Forced => Duration::ZERO,
        };
        match handle.transport.terminate(grace) {
            Ok(reclaimed) => {
                handle.advance(Action::Destroy);
                if self.live == Some(handle.id) {
                    self.live = None;
                }
                self.stats.destroyed += 1;
                self.stats.live = self.stats.live.saturating_sub(1);
                if reclaimed.forced {
                    self.stats.forced_kills += 1;
                }
                info!(forced = reclaimed.forced, exit = %reclaimed.exit, "destroyed");
                Ok(reclaimed)
            }
            Err(err) => {
                let error = BoundaryError::Teardown(handle.id, err);
                Err(FailedTeardown { handle, error })
            }
        }
    }
}

pub(crate) fn unexpected(request: &Request, reply: &Reply) -> BoundaryError {
    let reply = match reply {
        Reply::Error { message } => format!("error: {message}"),
        other => other.name().to_string(),
    };
    BoundaryError::Protocol {
        request: request.name(),
        reply,
    }
}
