//! Stable exit codes for `snip` commands.

use crate::core::types::Outcome;

/// Every record ran to completion.
pub const OK: i32 = 0;
/// Invalid input, config or infrastructure failure.
pub const INVALID: i32 = 1;
/// The snippet did not compile.
pub const COMPILE_FAILED: i32 = 2;
/// The artifact was rejected by the worker.
pub const LOAD_FAILED: i32 = 3;
/// The snippet faulted, crashed its worker, or produced an uncopyable value.
pub const RUNTIME_FAULT: i32 = 4;
/// The snippet did not return in time.
pub const TIMEOUT: i32 = 5;

pub fn for_outcome(outcome: &Outcome) -> i32 {
    match outcome {
        Outcome::Success { .. } => OK,
        Outcome::CompileFailed(_) => COMPILE_FAILED,
        Outcome::LoadFailed(_) => LOAD_FAILED,
        Outcome::RuntimeFault { .. } => RUNTIME_FAULT,
        Outcome::Timeout(_) => TIMEOUT,
    }
}

/// Code of the first unsuccessful outcome, or [`OK`].
pub fn for_outcomes(outcomes: &[Outcome]) -> i32 {
    outcomes
        .iter()
        .map(for_outcome)
        .find(|code| *code != OK)
        .unwrap_or(OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_failure_wins() {
        let outcomes = [
            Outcome::Success {
                record: crate::test_support::sample_record(),
                logs: Vec::new(),
            },
            Outcome::Timeout(Duration::from_secs(1)),
            Outcome::LoadFailed("bad".into()),
        ];
        assert_eq!(for_outcomes(&outcomes), TIMEOUT);
        assert_eq!(for_outcomes(&outcomes[..1]), OK);
        assert_eq!(for_outcomes(&[]), OK);
    }
}
