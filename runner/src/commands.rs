//! Implementations of the `snip` subcommands.
//!
//! Each command returns the process exit code (see [`crate::exit_codes`]) and
//! writes its product output to the given writer; diagnostics about the run
//! itself go through `tracing`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use snip_lang::{FrontEnd, Record, SnippetCompiler, has_errors};
use tracing::{debug, instrument};

use crate::core::types::{Outcome, SourceUnit};
use crate::exit_codes;
use crate::io::config::{RunnerConfig, load_config, write_config};
use crate::io::process::WorkerLauncher;
use crate::io::records::{load_records, sample_records};
use crate::io::transport::Launcher;
use crate::orchestrator::Orchestrator;
use crate::watch::watch;

/// Inputs shared by `run` and `watch`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config: PathBuf,
    pub source: PathBuf,
    pub records: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub worker: Option<PathBuf>,
}

/// Config file values with command-line overrides applied.
pub fn effective_config(opts: &RunOptions) -> Result<RunnerConfig> {
    let mut cfg = load_config(&opts.config)?;
    if let Some(timeout_ms) = opts.timeout_ms {
        cfg.invoke_timeout_ms = timeout_ms;
    }
    if let Some(worker) = &opts.worker {
        cfg.worker_path = Some(worker.clone());
    }
    cfg.validate()?;
    Ok(cfg)
}

fn worker_launcher(cfg: &RunnerConfig) -> Result<WorkerLauncher> {
    let program = match &cfg.worker_path {
        Some(path) => path.clone(),
        None => WorkerLauncher::default_program()?,
    };
    if !program.exists() {
        bail!(
            "worker binary not found at {} (set worker_path in the config or pass --worker)",
            program.display()
        );
    }
    Ok(WorkerLauncher::new(program, cfg.worker_limits()))
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read snippet {}", path.display()))
}

fn input_records(opts: &RunOptions) -> Result<Vec<Record>> {
    match &opts.records {
        Some(path) => load_records(path),
        None => Ok(sample_records()),
    }
}

#[instrument(skip_all, fields(source = %opts.source.display()))]
pub fn cmd_run(opts: &RunOptions, out: &mut impl Write) -> Result<i32> {
    let cfg = effective_config(opts)?;
    let text = read_source(&opts.source)?;
    let records = input_records(opts)?;
    let orchestrator = Orchestrator::new(SnippetCompiler::default(), worker_launcher(&cfg)?, &cfg);
    run_records(&orchestrator, &opts.source, &text, &records, out)
}

/// Run `text` over every record and print the results.
pub fn run_records<F: FrontEnd, L: Launcher>(
    orchestrator: &Orchestrator<F, L>,
    path: &Path,
    text: &str,
    records: &[Record],
    out: &mut impl Write,
) -> Result<i32> {
    let source = orchestrator.versions().mint(text);
    let outcomes = orchestrator.run_batch(&source, records)?;
    report(path, &source, &outcomes, out)?;
    Ok(exit_codes::for_outcomes(&outcomes))
}

#[derive(Serialize)]
struct Summary<'a> {
    version: u64,
    record: usize,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    logs: &'a [String],
}

/// One JSON line per outcome; compile diagnostics as `path: diagnostic` lines.
fn report(
    path: &Path,
    source: &SourceUnit,
    outcomes: &[Outcome],
    out: &mut impl Write,
) -> Result<()> {
    for (index, outcome) in outcomes.iter().enumerate() {
        let error = match outcome {
            Outcome::Success { .. } => None,
            Outcome::CompileFailed(diagnostics) => {
                for diagnostic in diagnostics {
                    writeln!(out, "{}: {}", path.display(), diagnostic)?;
                }
                Some(format!("{} diagnostic(s)", diagnostics.len()))
            }
            Outcome::LoadFailed(message) => Some(message.clone()),
            Outcome::RuntimeFault { fault, .. } => Some(fault.to_string()),
            Outcome::Timeout(after) => Some(format!("no return within {after:?}")),
        };
        let result = match outcome {
            Outcome::Success { record, .. } => Some(record),
            _ => None,
        };
        let summary = Summary {
            version: source.version,
            record: index,
            outcome: outcome.label(),
            result,
            error,
            logs: outcome.logs(),
        };
        let line = serde_json::to_string(&summary).context("serialize outcome")?;
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    Ok(())
}

/// Compile only and print every diagnostic.
pub fn cmd_check(source: &Path, out: &mut impl Write) -> Result<i32> {
    let text = read_source(source)?;
    let diagnostics = match SnippetCompiler::default().compile(&text) {
        Ok(compilation) => compilation.warnings,
        Err(diagnostics) => diagnostics,
    };
    for diagnostic in &diagnostics {
        writeln!(out, "{}: {}", source.display(), diagnostic)?;
    }
    debug!(count = diagnostics.len(), "checked");
    if has_errors(&diagnostics) {
        Ok(exit_codes::COMPILE_FAILED)
    } else {
        Ok(exit_codes::OK)
    }
}

/// Rerun on every edit. Only returns on error.
pub fn cmd_watch(opts: &RunOptions, out: &mut impl Write) -> Result<i32> {
    let cfg = effective_config(opts)?;
    let records = input_records(opts)?;
    let orchestrator = Orchestrator::new(SnippetCompiler::default(), worker_launcher(&cfg)?, &cfg);
    watch(&orchestrator, &opts.source, &records, |source, outcomes| {
        report(&opts.source, source, outcomes, out)
    })?;
    Ok(exit_codes::OK)
}

/// Write the default config unless one exists.
pub fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &RunnerConfig::default())?;
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{InProcessLauncher, SnippetFixture, sample_record};

    fn lines(buf: &[u8]) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(buf)
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    #[test]
    fn run_records_prints_one_line_per_record() {
        let orchestrator = Orchestrator::new(
            SnippetCompiler::default(),
            InProcessLauncher::new(),
            &RunnerConfig::default(),
        );
        let mut out = Vec::new();
        let code = run_records(
            &orchestrator,
            Path::new("fix.snip"),
            "rows[0].foo = 4; log(\"ok\");",
            &[sample_record(), sample_record()],
            &mut out,
        )
        .expect("run");

        assert_eq!(code, exit_codes::OK);
        let lines = lines(&out);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["outcome"], "success");
        assert_eq!(lines[1]["record"], 1);
        assert_eq!(lines[0]["result"]["rows"][0]["foo"], 4);
        assert_eq!(lines[0]["logs"][0], "ok");
    }

    #[test]
    fn run_records_maps_fault_to_exit_code() {
        let orchestrator = Orchestrator::new(
            SnippetCompiler::default(),
            InProcessLauncher::new(),
            &RunnerConfig::default(),
        );
        let mut out = Vec::new();
        let code = run_records(
            &orchestrator,
            Path::new("fix.snip"),
            "fail(\"bad row\");",
            &[sample_record()],
            &mut out,
        )
        .expect("run");
        assert_eq!(code, exit_codes::RUNTIME_FAULT);
        let lines = lines(&out);
        assert_eq!(lines[0]["outcome"], "runtime_fault");
        assert!(lines[0]["error"].as_str().is_some_and(|e| e.contains("bad row")));
    }

    #[test]
    fn compile_errors_print_with_path() {
        let orchestrator = Orchestrator::new(
            SnippetCompiler::default(),
            InProcessLauncher::new(),
            &RunnerConfig::default(),
        );
        let mut out = Vec::new();
        let code = run_records(
            &orchestrator,
            Path::new("fix.snip"),
            "rows[0].foo = ;",
            &[sample_record()],
            &mut out,
        )
        .expect("run");
        assert_eq!(code, exit_codes::COMPILE_FAILED);
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("fix.snip: error at 1:"), "{text}");
    }

    #[test]
    fn check_reports_warnings_without_failing() {
        let fixture = SnippetFixture::new().expect("fixture");
        let path = fixture.write("fix.snip", "let unused = 1;").expect("write");
        let mut out = Vec::new();
        let code = cmd_check(&path, &mut out).expect("check");
        assert_eq!(code, exit_codes::OK);
        assert!(String::from_utf8_lossy(&out).contains("unused variable `unused`"));
    }

    #[test]
    fn check_fails_on_errors() {
        let fixture = SnippetFixture::new().expect("fixture");
        let path = fixture.write("fix.snip", "nope = 1;").expect("write");
        let mut out = Vec::new();
        assert_eq!(
            cmd_check(&path, &mut out).expect("check"),
            exit_codes::COMPILE_FAILED
        );
    }

    #[test]
    fn init_config_refuses_to_overwrite() {
        let fixture = SnippetFixture::new().expect("fixture");
        let path = fixture.path().join("snip.toml");
        assert_eq!(cmd_init_config(&path, false).expect("init"), exit_codes::OK);
        assert!(cmd_init_config(&path, false).is_err());
        assert_eq!(cmd_init_config(&path, true).expect("force"), exit_codes::OK);
    }

    #[test]
    fn overrides_beat_the_config_file() {
        let fixture = SnippetFixture::new().expect("fixture");
        let config = fixture
            .write("snip.toml", "invoke_timeout_ms = 900\n")
            .expect("write");
        let opts = RunOptions {
            config,
            source: PathBuf::from("fix.snip"),
            records: None,
            timeout_ms: Some(25),
            worker: Some(PathBuf::from("/bin/true")),
        };
        let cfg = effective_config(&opts).expect("config");
        assert_eq!(cfg.invoke_timeout_ms, 25);
        assert_eq!(cfg.worker_path, Some(PathBuf::from("/bin/true")));
    }

    #[test]
    fn missing_worker_is_reported() {
        let fixture = SnippetFixture::new().expect("fixture");
        let cfg = RunnerConfig {
            worker_path: Some(fixture.path().join("absent-worker")),
            ..RunnerConfig::default()
        };
        let err = worker_launcher(&cfg).unwrap_err();
        assert!(err.to_string().contains("worker binary not found"));
    }
}
