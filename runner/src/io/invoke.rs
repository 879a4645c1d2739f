//! Calls the entry point of a loaded module, once.

use std::time::Duration;

use snip_lang::{Fault, FaultKind};
use tracing::{info, instrument, warn};

use crate::core::lifecycle::Action;
use crate::core::types::BoundaryRef;
use crate::io::boundary::{BoundaryError, ContextHandle, LoadedModule, unexpected};
use crate::io::protocol::{Reply, Request};
use crate::io::transport::{Transport, TransportError};

/// Target for snippet `log(...)` lines.
pub const SNIPPET_LOG_TARGET: &str = "snip::snippet";

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    /// The entry point returned; the record behind `context` may have changed.
    Returned {
        context: BoundaryRef,
        logs: Vec<String>,
    },
    Fault {
        fault: Fault,
        logs: Vec<String>,
    },
}

/// Invoke `module` against the record behind `context`.
///
/// User faults, hangs past `timeout` and a worker dying mid-call all come back
/// as [`InvocationResult::Fault`]. `Err` is reserved for misuse of the
/// boundary. The module is consumed: there is no retry.
#[instrument(skip_all, fields(id = %handle.id(), context = context.0, timeout_ms = timeout.as_millis() as u64))]
pub fn invoke<T: Transport>(
    handle: &mut ContextHandle<T>,
    module: LoadedModule,
    context: BoundaryRef,
    timeout: Duration,
) -> Result<InvocationResult, BoundaryError> {
    if module.handle != handle.id() {
        return Err(BoundaryError::StaleHandle {
            handle: handle.id(),
            module_handle: module.handle,
        });
    }
    handle.check(Action::Invoke)?;
    handle.advance(Action::Invoke);

    info!("invoking");
    let request = Request::Invoke {
        module: module.module,
        context,
    };
    let result = match handle.exchange(&request, timeout) {
        Ok(Reply::Returned { context, logs }) => InvocationResult::Returned { context, logs },
        Ok(Reply::Fault { fault, logs }) => InvocationResult::Fault { fault, logs },
        Ok(other) => return Err(unexpected(&request, &other)),
        Err(TransportError::TimedOut(after)) => InvocationResult::Fault {
            fault: Fault::new(
                FaultKind::Timeout,
                format!("entry point did not return within {after:?}"),
            ),
            logs: Vec::new(),
        },
        Err(TransportError::Disconnected(detail)) => InvocationResult::Fault {
            fault: Fault::new(
                FaultKind::Crashed,
                format!("worker exited during invocation: {detail}"),
            ),
            logs: Vec::new(),
        },
        Err(err) => return Err(err.into()),
    };

    let logs = match &result {
        InvocationResult::Returned { logs, .. } => logs,
        InvocationResult::Fault { fault, logs } => {
            warn!(kind = %fault.kind, line = ?fault.line, message = %fault.message, "invocation fault");
            logs
        }
    };
    for line in logs {
        info!(target: SNIPPET_LOG_TARGET, "{line}");
    }
    Ok(result)
}
