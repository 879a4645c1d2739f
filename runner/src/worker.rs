//! The side of the boundary that runs inside `snip-worker`.
//!
//! A [`Session`] answers one request at a time. It owns the only copies of the
//! records it was sent and the one program it may load; all of it goes away
//! with the process.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use snip_lang::{Fault, FaultKind, Limits, LoadedProgram, Record, Vm};
use tracing::{debug, instrument, warn};

use crate::core::types::{BoundaryRef, ModuleId};
use crate::io::protocol::{Reply, Request, read_message, write_message};

/// The id a session hands out for its single module.
const MODULE: ModuleId = ModuleId(1);

#[derive(Debug)]
pub struct Session {
    limits: Limits,
    program: Option<LoadedProgram>,
    invoked: bool,
    slots: BTreeMap<BoundaryRef, Record>,
    next_ref: u32,
}

impl Session {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            program: None,
            invoked: false,
            slots: BTreeMap::new(),
            next_ref: 1,
        }
    }

    pub fn handle(&mut self, request: Request) -> Reply {
        match request {
            Request::Load { artifact } => {
                if self.program.is_some() {
                    return error("an artifact is already loaded");
                }
                match LoadedProgram::load(&artifact) {
                    Ok(program) => {
                        debug!(ops = program.entry.code.len(), "program loaded");
                        self.program = Some(program);
                        Reply::Loaded { module: MODULE }
                    }
                    Err(err) => Reply::LoadFault {
                        message: err.to_string(),
                    },
                }
            }
            Request::Send { record } => {
                if let Some(bad) = record.find_untransferable() {
                    return marshal_fault(bad.to_string());
                }
                let context = BoundaryRef(self.next_ref);
                self.next_ref += 1;
                self.slots.insert(context, record);
                Reply::Sent { context }
            }
            Request::Invoke { module, context } => self.invoke(module, context),
            Request::Receive { context } => match self.slots.remove(&context) {
                Some(record) => match record.find_untransferable() {
                    Some(bad) => marshal_fault(bad.to_string()),
                    None => Reply::Record { record },
                },
                None => error(format!("unknown context {}", context.0)),
            },
            Request::Shutdown => Reply::Bye,
        }
    }

    fn invoke(&mut self, module: ModuleId, context: BoundaryRef) -> Reply {
        let Some(program) = self.program.as_ref() else {
            return error("nothing is loaded");
        };
        if module != MODULE {
            return error(format!("unknown module {}", module.0));
        }
        if self.invoked {
            return error("module was already invoked");
        }
        let Some(record) = self.slots.get_mut(&context) else {
            return error(format!("unknown context {}", context.0));
        };
        self.invoked = true;

        let mut vm = Vm::new(program, self.limits);
        let result = vm.run(record);
        let logs = vm.into_logs();
        match result {
            Ok(()) => Reply::Returned { context, logs },
            Err(fault) => {
                debug!(%fault, "snippet faulted");
                Reply::Fault { fault, logs }
            }
        }
    }
}

fn error(message: impl Into<String>) -> Reply {
    Reply::Error {
        message: message.into(),
    }
}

fn marshal_fault(message: String) -> Reply {
    Reply::Fault {
        fault: Fault::new(FaultKind::Marshal, message),
        logs: Vec::new(),
    }
}

/// Answer requests from `input` until `Shutdown` or end of stream.
#[instrument(skip_all)]
pub fn serve<R: BufRead, W: Write>(mut input: R, mut output: W, limits: Limits) -> Result<()> {
    let mut session = Session::new(limits);
    while let Some(request) = read_message::<_, Request>(&mut input).context("read request")? {
        let shutdown = matches!(request, Request::Shutdown);
        let reply = session.handle(request);
        if let Reply::Error { message } = &reply {
            warn!(%message, "rejected request");
        }
        write_message(&mut output, &reply).context("write reply")?;
        if shutdown {
            debug!("shutdown requested");
            return Ok(());
        }
    }
    debug!("request channel closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{compile, sample_record};
    use snip_lang::Value;

    fn loaded(source: &str) -> Session {
        let mut session = Session::new(Limits::default());
        let reply = session.handle(Request::Load {
            artifact: compile(source),
        });
        assert_eq!(reply, Reply::Loaded { module: MODULE });
        session
    }

    fn sent(session: &mut Session) -> BoundaryRef {
        match session.handle(Request::Send {
            record: sample_record(),
        }) {
            Reply::Sent { context } => context,
            other => panic!("expected sent, got {other:?}"),
        }
    }

    #[test]
    fn full_cycle_returns_mutated_record() {
        let mut session = loaded("rows[0].foo = 4;");
        let context = sent(&mut session);

        let reply = session.handle(Request::Invoke {
            module: MODULE,
            context,
        });
        assert_eq!(
            reply,
            Reply::Returned {
                context,
                logs: Vec::new()
            }
        );
        let Reply::Record { record } = session.handle(Request::Receive { context }) else {
            panic!("expected record");
        };
        assert_eq!(record.rows[0].get("foo"), Some(&Value::Int(4)));
        assert_eq!(record.rows[0].get("bar"), Some(&Value::Int(2)));
    }

    #[test]
    fn receive_releases_the_slot() {
        let mut session = loaded("return;");
        let context = sent(&mut session);
        session.handle(Request::Invoke {
            module: MODULE,
            context,
        });
        assert!(matches!(
            session.handle(Request::Receive { context }),
            Reply::Record { .. }
        ));
        assert!(matches!(
            session.handle(Request::Receive { context }),
            Reply::Error { .. }
        ));
    }

    #[test]
    fn second_load_and_second_invoke_are_refused() {
        let mut session = loaded("return;");
        assert!(matches!(
            session.handle(Request::Load {
                artifact: compile("return;")
            }),
            Reply::Error { .. }
        ));
        let context = sent(&mut session);
        let invoke = Request::Invoke {
            module: MODULE,
            context,
        };
        assert!(matches!(session.handle(invoke.clone()), Reply::Returned { .. }));
        assert!(matches!(session.handle(invoke), Reply::Error { .. }));
    }

    #[test]
    fn invoke_without_load_is_an_error() {
        let mut session = Session::new(Limits::default());
        let reply = session.handle(Request::Invoke {
            module: MODULE,
            context: BoundaryRef(1),
        });
        assert!(matches!(reply, Reply::Error { ref message } if message.contains("nothing")));
    }

    #[test]
    fn nan_written_by_snippet_is_a_marshal_fault_on_receive() {
        let mut session = loaded("rows[0].foo = 0.0 / 0.0;");
        let context = sent(&mut session);
        session.handle(Request::Invoke {
            module: MODULE,
            context,
        });
        let reply = session.handle(Request::Receive { context });
        assert!(matches!(
            reply,
            Reply::Fault { ref fault, .. } if fault.kind == FaultKind::Marshal
        ));
    }

    #[test]
    fn serve_stops_at_shutdown() {
        let mut input = Vec::new();
        write_message(
            &mut input,
            &Request::Load {
                artifact: compile("return;"),
            },
        )
        .expect("write");
        write_message(&mut input, &Request::Shutdown).expect("write");
        write_message(&mut input, &Request::Shutdown).expect("write");

        let mut output = Vec::new();
        serve(input.as_slice(), &mut output, Limits::default()).expect("serve");

        let mut replies = std::io::Cursor::new(output);
        let first: Option<Reply> = read_message(&mut replies).expect("read");
        assert_eq!(first, Some(Reply::Loaded { module: MODULE }));
        let second: Option<Reply> = read_message(&mut replies).expect("read");
        assert_eq!(second, Some(Reply::Bye));
        let rest: Option<Reply> = read_message(&mut replies).expect("read");
        assert_eq!(rest, None, "nothing is answered after shutdown");
    }
}
