//! `snip-worker`: hosts one isolated context.
//!
//! Reads requests from stdin and answers on stdout until told to shut down or
//! the host closes the pipe. Started and reaped by `snip`; not meant to be run
//! by hand.

use anyhow::Result;
use clap::Parser;
use snip_lang::Limits;
use snip_runner::{logging, worker};

#[derive(Parser)]
#[command(name = "snip-worker", version, about = "Isolated snippet worker")]
struct Cli {
    #[arg(long, default_value_t = Limits::default().max_string_len)]
    max_string_len: usize,

    #[arg(long, default_value_t = Limits::default().max_row_fields)]
    max_row_fields: usize,

    #[arg(long, default_value_t = Limits::default().max_log_lines)]
    max_log_lines: usize,

    #[arg(long, default_value_t = Limits::default().max_stack_depth)]
    max_stack_depth: usize,
}

fn main() {
    logging::init("warn");
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let limits = Limits {
        max_string_len: cli.max_string_len,
        max_row_fields: cli.max_row_fields,
        max_log_lines: cli.max_log_lines,
        max_stack_depth: cli.max_stack_depth,
    };
    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();
    worker::serve(stdin, stdout, limits)
}
