//! Copies records into and out of a context.
//!
//! Records cross as serialized JSON, so the worker always holds its own copy
//! and the host only ever holds a [`BoundaryRef`].

use snip_lang::{FaultKind, Record};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::lifecycle::Action;
use crate::core::types::BoundaryRef;
use crate::io::boundary::{BoundaryError, ContextHandle, unexpected};
use crate::io::protocol::{Reply, Request};
use crate::io::transport::Transport;

/// A record field that cannot be copied structurally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("marshal fault: {0}")]
pub struct MarshalFault(pub String);

/// Inner `Err` is a fault in the value; outer `Err` a fault in the boundary.
pub type Marshaled<T> = Result<T, MarshalFault>;

#[instrument(skip_all, fields(id = %handle.id(), rows = record.rows.len()))]
pub fn send<T: Transport>(
    handle: &mut ContextHandle<T>,
    record: &Record,
) -> Result<Marshaled<BoundaryRef>, BoundaryError> {
    handle.check(Action::Send)?;
    if let Some(bad) = record.find_untransferable() {
        return Ok(Err(MarshalFault(bad.to_string())));
    }
    let request = Request::Send {
        record: record.clone(),
    };
    let timeout = handle.step_timeout();
    match handle.exchange(&request, timeout)? {
        Reply::Sent { context } => {
            handle.advance(Action::Send);
            debug!(context = context.0, "record sent");
            Ok(Ok(context))
        }
        Reply::Fault { fault, .. } if fault.kind == FaultKind::Marshal => {
            Ok(Err(MarshalFault(fault.message)))
        }
        other => Err(unexpected(&request, &other)),
    }
}

#[instrument(skip_all, fields(id = %handle.id(), context = context.0))]
pub fn receive<T: Transport>(
    handle: &mut ContextHandle<T>,
    context: BoundaryRef,
) -> Result<Marshaled<Record>, BoundaryError> {
    handle.check(Action::Receive)?;
    let request = Request::Receive { context };
    let timeout = handle.step_timeout();
    match handle.exchange(&request, timeout)? {
        Reply::Record { record } => {
            handle.advance(Action::Receive);
            debug!(rows = record.rows.len(), "record received");
            Ok(Ok(record))
        }
        Reply::Fault { fault, .. } if fault.kind == FaultKind::Marshal => {
            Ok(Err(MarshalFault(fault.message)))
        }
        other => Err(unexpected(&request, &other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::boundary::{BoundaryManager, BoundaryTimeouts, LoadOutcome, Teardown};
    use crate::test_support::{InProcessLauncher, InProcessTransport, compile, sample_record};
    use snip_lang::{HostHandle, Value};

    fn loaded(
        boundary: &mut BoundaryManager<InProcessLauncher>,
    ) -> ContextHandle<InProcessTransport> {
        let mut handle = boundary.create().expect("create");
        let outcome = boundary
            .load(&mut handle, &compile("rows[0].foo = 4;"))
            .expect("load");
        assert!(matches!(outcome, LoadOutcome::Loaded(_)));
        handle
    }

    #[test]
    fn send_before_load_is_rejected() {
        let mut boundary = BoundaryManager::new(InProcessLauncher::new(), BoundaryTimeouts::default());
        let mut handle = boundary.create().expect("create");
        let err = send(&mut handle, &sample_record()).unwrap_err();
        assert!(matches!(err, BoundaryError::WrongState { action: Action::Send, .. }));
        boundary
            .destroy(handle, Teardown::Graceful)
            .map_err(|f| f.error)
            .expect("destroy");
    }

    #[test]
    fn host_handles_are_refused_before_crossing() {
        let mut boundary = BoundaryManager::new(InProcessLauncher::new(), BoundaryTimeouts::default());
        let mut handle = loaded(&mut boundary);
        let mut record = sample_record();
        record.rows[1].set("conn", Value::Handle(HostHandle(9)));

        let fault = send(&mut handle, &record)
            .expect("boundary ok")
            .expect_err("marshal fault");
        assert!(fault.0.contains("rows[1].conn"), "{fault}");
        assert_eq!(boundary.launcher().requests_seen(), 1, "only the load crossed");
        boundary
            .destroy(handle, Teardown::Graceful)
            .map_err(|f| f.error)
            .expect("destroy");
    }

    #[test]
    fn non_finite_floats_are_refused() {
        let mut boundary = BoundaryManager::new(InProcessLauncher::new(), BoundaryTimeouts::default());
        let mut handle = loaded(&mut boundary);
        let mut record = sample_record();
        record.rows[0].set("ratio", Value::Float(f64::NAN));

        let fault = send(&mut handle, &record)
            .expect("boundary ok")
            .expect_err("marshal fault");
        assert!(fault.0.contains("rows[0].ratio"), "{fault}");
        boundary
            .destroy(handle, Teardown::Graceful)
            .map_err(|f| f.error)
            .expect("destroy");
    }

    #[test]
    fn receive_requires_invocation() {
        let mut boundary = BoundaryManager::new(InProcessLauncher::new(), BoundaryTimeouts::default());
        let mut handle = loaded(&mut boundary);
        let context = send(&mut handle, &sample_record())
            .expect("boundary ok")
            .expect("sent");
        let err = receive(&mut handle, context).unwrap_err();
        assert!(matches!(err, BoundaryError::WrongState { action: Action::Receive, .. }));
        boundary
            .destroy(handle, Teardown::Graceful)
            .map_err(|f| f.error)
            .expect("destroy");
    }
}
