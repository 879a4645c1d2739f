//! Side-effecting parts of the runner: the worker channel, the boundary
//! built on it, configuration and record files.

pub mod boundary;
pub mod config;
pub mod invoke;
pub mod marshal;
pub mod process;
pub mod protocol;
pub mod records;
pub mod transport;
