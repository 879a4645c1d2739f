//! The snippet language: compiler front end and in-boundary interpreter.
//!
//! Source text goes through [`lexer`] and [`parser`] into an [`ast`], which
//! [`compiler`] lowers to a flat bytecode [`program`]. The compiled form is
//! shipped as a [`CompiledArtifact`]; the [`vm`] executes it against a
//! [`Record`] on the far side of the isolation boundary.
//!
//! The crate is split so the host only needs [`FrontEnd`] and the data model,
//! while the worker only needs [`program`] decoding and the [`vm`].

pub mod ast;
pub mod compiler;
pub mod diagnostic;
pub mod lexer;
pub mod parser;
pub mod program;
pub mod record;
pub mod vm;

pub use compiler::{Compilation, FrontEnd, SnippetCompiler};
pub use diagnostic::{Diagnostic, Severity, Span, has_errors};
pub use program::{CompiledArtifact, ENTRY_POINT, FORMAT_VERSION, LoadError, LoadedProgram};
pub use record::{HostHandle, Record, Row, Untransferable, Value};
pub use vm::{Fault, FaultKind, Limits, Vm};
