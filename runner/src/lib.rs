//! Recompile-and-run engine for record snippets.
//!
//! Every run compiles the snippet, starts a fresh `snip-worker` process, loads
//! the artifact into it, copies the record in, invokes the entry point, copies
//! the record back out and reaps the process before anything else may start.
//! The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure logic (source versions, artifact identity, the context
//!   state machine). No I/O.
//! - **[`io`]**: The boundary itself and everything that touches processes,
//!   pipes or files. The [`io::transport`] traits are the seam tests replace.
//!
//! [`orchestrator`] drives a full cycle; [`worker`] is the other end of the
//! pipe; [`commands`] and [`watch`] implement the CLI.

pub mod commands;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod watch;
pub mod worker;

pub use crate::core::types::{Outcome, SourceUnit, SourceVersions};
pub use crate::orchestrator::Orchestrator;
