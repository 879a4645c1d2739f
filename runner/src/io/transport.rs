//! Channel to whatever hosts an isolated context.
//!
//! [`Launcher`] and [`Transport`] decouple the boundary manager from the
//! worker process. The production pair is [`crate::io::process`]; tests use
//! the launchers in `test_support`.

use std::time::Duration;

use anyhow::Result;
use thiserror::Error;

use crate::io::protocol::{Reply, Request};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no reply within {0:?}")]
    TimedOut(Duration),
    #[error("worker disconnected ({0})")]
    Disconnected(String),
    #[error("worker channel i/o failed")]
    Io(#[from] std::io::Error),
    #[error("malformed worker message")]
    Codec(#[from] serde_json::Error),
}

/// What teardown reclaimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclaimed {
    /// The worker had to be killed.
    pub forced: bool,
    /// Exit status as reported by the OS, or a description for fakes.
    pub exit: String,
}

pub trait Transport {
    /// Send one request and wait up to `timeout` for its reply.
    fn call(&mut self, request: &Request, timeout: Duration) -> Result<Reply, TransportError>;

    /// Stop the worker, waiting at most `grace` before killing it.
    ///
    /// Must not return until every resource the worker held is released.
    fn terminate(&mut self, grace: Duration) -> Result<Reclaimed>;
}

pub trait Launcher {
    type Transport: Transport;

    fn launch(&self) -> Result<Self::Transport>;
}
