//! Deterministic, pure logic shared by the runner.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values (source versions, artifact identity, the context lifecycle) and are
//! tested without spawning workers.

pub mod lifecycle;
pub mod store;
pub mod types;
