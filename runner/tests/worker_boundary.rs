//! End-to-end cycles against the real `snip-worker` binary.
//!
//! Each test drives the orchestrator with a [`WorkerLauncher`] so every run
//! spawns, talks to and reaps an actual child process.

use std::time::{Duration, Instant};

use snip_lang::{FaultKind, Limits, SnippetCompiler, Value};
use snip_runner::Outcome;
use snip_runner::io::config::RunnerConfig;
use snip_runner::io::process::WorkerLauncher;
use snip_runner::orchestrator::Orchestrator;
use snip_runner::test_support::{record, sample_record};

fn orchestrator(invoke_timeout_ms: u64) -> Orchestrator<SnippetCompiler, WorkerLauncher> {
    let config = RunnerConfig {
        invoke_timeout_ms,
        teardown_grace_ms: 200,
        ..RunnerConfig::default()
    };
    let launcher = WorkerLauncher::new(env!("CARGO_BIN_EXE_snip-worker"), Limits::default());
    Orchestrator::new(SnippetCompiler::default(), launcher, &config)
}

#[test]
fn field_update_round_trips_through_a_worker() {
    let orchestrator = orchestrator(5_000);
    let input = record(&[&[("foo", 1), ("bar", 2)]]);

    let outcome = orchestrator
        .run_text("rows[0].foo = 4;\nlog(\"set foo\");", &input)
        .expect("run");

    let (record, logs) = match outcome {
        Outcome::Success { record, logs } => (record, logs),
        other => panic!("expected success, got {other:?}"),
    };
    assert_eq!(record.rows[0].get("foo"), Some(&Value::Int(4)));
    assert_eq!(record.rows[0].get("bar"), Some(&Value::Int(2)));
    assert_eq!(record.rows[0].len(), 2);
    assert_eq!(record.time, input.time);
    assert_eq!(logs, vec!["set foo".to_string()]);

    let stats = orchestrator.stats();
    assert_eq!((stats.created, stats.destroyed, stats.live), (1, 1, 0));
    assert_eq!(stats.forced_kills, 0);
}

#[test]
fn returned_record_is_a_copy() {
    let orchestrator = orchestrator(5_000);
    let input = sample_record();

    let Outcome::Success { mut record, .. } = orchestrator
        .run_text("for r in rows { r.bar = \"changed\"; }", &input)
        .expect("run")
    else {
        panic!("expected success");
    };
    assert_eq!(input, sample_record());

    record.rows[0].set("foo", Value::Int(100));
    assert_eq!(input.rows[0].get("foo"), Some(&Value::Int(1)));
}

#[test]
fn never_returning_snippet_times_out_and_next_run_succeeds() {
    let orchestrator = orchestrator(300);

    let started = Instant::now();
    let outcome = orchestrator
        .run_text("let n = 0;\nwhile true { n = n + 1; }", &sample_record())
        .expect("run");
    let elapsed = started.elapsed();

    assert_eq!(outcome, Outcome::Timeout(Duration::from_millis(300)));
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    let stats = orchestrator.stats();
    assert_eq!(stats.forced_kills, 1);
    assert_eq!(stats.live, 0);

    let outcome = orchestrator
        .run_text("rows[0].foo = 4;", &sample_record())
        .expect("run");
    assert!(outcome.is_success(), "{outcome:?}");
}

#[test]
fn raising_snippet_is_contained() {
    let orchestrator = orchestrator(5_000);

    let outcome = orchestrator
        .run_text("log(\"about to fail\");\nfail(\"always\");", &sample_record())
        .expect("run");
    let (fault, logs) = match outcome {
        Outcome::RuntimeFault { fault, logs } => (fault, logs),
        other => panic!("expected fault, got {other:?}"),
    };
    assert_eq!(fault.kind, FaultKind::UserError);
    assert_eq!(fault.message, "always");
    assert_eq!(fault.line, Some(2));
    assert_eq!(logs, vec!["about to fail".to_string()]);

    let outcome = orchestrator
        .run_text("rows[1].foo = rows[1].foo + 1;", &sample_record())
        .expect("run");
    let record = match outcome {
        Outcome::Success { record, .. } => record,
        other => panic!("expected success, got {other:?}"),
    };
    assert_eq!(record.rows[1].get("foo"), Some(&Value::Int(4)));
}

#[test]
fn missing_field_reports_line() {
    let orchestrator = orchestrator(5_000);
    let outcome = orchestrator
        .run_text("let a = 1;\nlog(a);\nlog(rows[0].nope);", &sample_record())
        .expect("run");
    assert!(matches!(
        outcome,
        Outcome::RuntimeFault { ref fault, .. }
            if fault.kind == FaultKind::MissingField && fault.line == Some(3)
    ));
}

#[test]
fn syntax_error_never_spawns_a_worker() {
    let orchestrator = orchestrator(5_000);
    let outcome = orchestrator
        .run_text("rows[0].foo = (1 + ;", &sample_record())
        .expect("run");
    assert!(matches!(outcome, Outcome::CompileFailed(_)));
    assert_eq!(orchestrator.stats().created, 0);
}

#[test]
fn batch_runs_each_record_in_its_own_worker() {
    let orchestrator = orchestrator(5_000);
    let source = orchestrator.versions().mint("rows[0].foo = rows[0].foo * 2;");
    let records = vec![
        record(&[&[("foo", 1), ("bar", 2)]]),
        record(&[&[("foo", 3), ("bar", 4)]]),
    ];

    let outcomes = orchestrator.run_batch(&source, &records).expect("batch");
    let doubled: Vec<Option<Value>> = outcomes
        .iter()
        .map(|outcome| match outcome {
            Outcome::Success { record, .. } => record.rows[0].get("foo").cloned(),
            _ => None,
        })
        .collect();
    assert_eq!(doubled, vec![Some(Value::Int(2)), Some(Value::Int(6))]);

    let stats = orchestrator.stats();
    assert_eq!((stats.created, stats.destroyed, stats.max_live), (2, 2, 1));
}

#[test]
fn concurrent_callers_queue_behind_one_worker() {
    let orchestrator = orchestrator(5_000);
    std::thread::scope(|scope| {
        for n in 0..4 {
            let orchestrator = &orchestrator;
            scope.spawn(move || {
                let outcome = orchestrator
                    .run_text(&format!("rows[0].foo = {n};"), &sample_record())
                    .expect("run");
                assert!(outcome.is_success(), "{outcome:?}");
            });
        }
    });
    let stats = orchestrator.stats();
    assert_eq!(stats.max_live, 1);
    assert_eq!((stats.created, stats.destroyed), (4, 4));
}
