//! Values that flow through one execution cycle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snip_lang::{Diagnostic, Fault, Record};

/// Snippet text plus the version it was minted with.
///
/// Immutable once built; every edit produces a new unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub version: u64,
    pub text: String,
}

impl SourceUnit {
    pub fn new(version: u64, text: impl Into<String>) -> Self {
        Self {
            version,
            text: text.into(),
        }
    }
}

/// Monotonic version counter for [`SourceUnit`]s.
#[derive(Debug, Default)]
pub struct SourceVersions {
    last: AtomicU64,
}

impl SourceVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `text` in a unit whose version is greater than every earlier one.
    pub fn mint(&self, text: impl Into<String>) -> SourceUnit {
        let version = self.last.fetch_add(1, Ordering::Relaxed) + 1;
        SourceUnit::new(version, text)
    }

    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}

/// Identity of one isolated context, unique for the lifetime of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Names a record that lives inside the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundaryRef(pub u32);

/// Names the module a worker loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(pub u32);

/// What one `run` produced. User-caused failures always end up here.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { record: Record, logs: Vec<String> },
    CompileFailed(Vec<Diagnostic>),
    LoadFailed(String),
    RuntimeFault { fault: Fault, logs: Vec<String> },
    Timeout(Duration),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Short label used in logs and CLI summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::CompileFailed(_) => "compile_failed",
            Outcome::LoadFailed(_) => "load_failed",
            Outcome::RuntimeFault { .. } => "runtime_fault",
            Outcome::Timeout(_) => "timeout",
        }
    }

    pub fn logs(&self) -> &[String] {
        match self {
            Outcome::Success { logs, .. } | Outcome::RuntimeFault { logs, .. } => logs,
            _ => &[],
        }
    }
}

/// Counters kept by the boundary manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BoundaryStats {
    pub created: u64,
    pub destroyed: u64,
    /// Handles created but not yet destroyed.
    pub live: u64,
    /// Highest value `live` ever reached.
    pub max_live: u64,
    /// Teardowns that had to kill the worker.
    pub forced_kills: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_strictly_increasing() {
        let versions = SourceVersions::new();
        let a = versions.mint("return;");
        let b = versions.mint("return;");
        assert!(b.version > a.version);
        assert_eq!(versions.last(), b.version);
    }

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(Outcome::LoadFailed("x".into()).label(), "load_failed");
        assert_eq!(Outcome::Timeout(Duration::from_millis(5)).label(), "timeout");
        assert!(Outcome::CompileFailed(Vec::new()).logs().is_empty());
    }

    #[test]
    fn handle_id_displays_with_prefix() {
        assert_eq!(HandleId(7).to_string(), "ctx-7");
    }
}
