//! `snip`: recompile and run record snippets in isolated workers.
//!
//! Each run compiles the snippet afresh and executes it in a short-lived
//! `snip-worker` process, so nothing from one run survives into the next.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use snip_runner::commands::{RunOptions, cmd_check, cmd_init_config, cmd_run, cmd_watch};
use snip_runner::exit_codes;
use snip_runner::io::config::CONFIG_FILE;
use snip_runner::logging;

#[derive(Parser)]
#[command(
    name = "snip",
    version,
    about = "Recompile and run record snippets in isolated workers"
)]
struct Cli {
    /// Config file; missing means defaults.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a snippet over each record and print the results.
    Run(RunArgs),
    /// Compile a snippet and print its diagnostics.
    Check {
        /// Snippet file.
        #[arg(long)]
        source: PathBuf,
    },
    /// Rerun a snippet every time its file changes.
    Watch(RunArgs),
    /// Write the default config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Snippet file.
    #[arg(long)]
    source: PathBuf,

    /// JSON file with one record or an array of records. Defaults to two samples.
    #[arg(long)]
    records: Option<PathBuf>,

    /// Override `invoke_timeout_ms`.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Override `worker_path`.
    #[arg(long)]
    worker: Option<PathBuf>,
}

impl RunArgs {
    fn into_options(self, config: PathBuf) -> RunOptions {
        RunOptions {
            config,
            source: self.source,
            records: self.records,
            timeout_ms: self.timeout_ms,
            worker: self.worker,
        }
    }
}

fn main() {
    logging::init("warn,snip::snippet=info");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut stdout = std::io::stdout().lock();
    match cli.command {
        Command::Run(args) => cmd_run(&args.into_options(cli.config), &mut stdout),
        Command::Check { source } => cmd_check(&source, &mut stdout),
        Command::Watch(args) => cmd_watch(&args.into_options(cli.config), &mut stdout),
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "snip",
            "run",
            "--source",
            "fix.snip",
            "--timeout-ms",
            "250",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.source, PathBuf::from("fix.snip"));
        assert_eq!(args.timeout_ms, Some(250));
        assert!(args.records.is_none());
        assert_eq!(cli.config, PathBuf::from(CONFIG_FILE));
    }

    #[test]
    fn parse_init_config_force() {
        let cli = Cli::parse_from(["snip", "init-config", "--force"]);
        assert!(matches!(cli.command, Command::InitConfig { force: true }));
    }

    #[test]
    fn global_config_flag_after_subcommand() {
        let cli = Cli::parse_from(["snip", "check", "--source", "a.snip", "--config", "x.toml"]);
        assert_eq!(cli.config, PathBuf::from("x.toml"));
    }
}
