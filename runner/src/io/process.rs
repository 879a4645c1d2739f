//! The production boundary: one `snip-worker` child process per context.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use snip_lang::Limits;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::protocol::{Reply, Request, read_message, write_message};
use crate::io::transport::{Launcher, Reclaimed, Transport, TransportError};

/// File name of the worker binary.
pub const WORKER_BIN: &str = "snip-worker";

/// Spawns worker processes.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    limits: Limits,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<PathBuf>, limits: Limits) -> Self {
        Self {
            program: program.into(),
            limits,
        }
    }

    /// `snip-worker` in the directory of the running executable.
    pub fn default_program() -> Result<PathBuf> {
        let exe = std::env::current_exe().context("locate current executable")?;
        let dir = exe
            .parent()
            .ok_or_else(|| anyhow!("executable {} has no parent", exe.display()))?;
        Ok(dir.join(format!("{WORKER_BIN}{}", std::env::consts::EXE_SUFFIX)))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--max-string-len")
            .arg(self.limits.max_string_len.to_string())
            .arg("--max-row-fields")
            .arg(self.limits.max_row_fields.to_string())
            .arg("--max-log-lines")
            .arg(self.limits.max_log_lines.to_string())
            .arg("--max-stack-depth")
            .arg(self.limits.max_stack_depth.to_string());
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Launcher for WorkerLauncher {
    type Transport = WorkerProcess;

    #[instrument(skip_all, fields(program = %self.program.display()))]
    fn launch(&self) -> Result<WorkerProcess> {
        debug!("spawning worker");
        let mut child = match self.command().spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn worker");
                return Err(e).with_context(|| format!("spawn {}", self.program.display()));
            }
        };
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (tx, replies) = mpsc::channel();
        let stdout_reader = thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                match read_message::<_, Reply>(&mut reader) {
                    Ok(Some(reply)) => {
                        if tx.send(Ok(reply)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let err = match err.downcast::<serde_json::Error>() {
                            Ok(codec) => TransportError::Codec(codec),
                            Err(io) => TransportError::Io(io),
                        };
                        let _ = tx.send(Err(err));
                        break;
                    }
                }
            }
        });
        let stderr_reader = thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => debug!(target: "snip::worker", pid, "{line}"),
                    Err(_) => break,
                }
            }
        });

        debug!(pid, "worker started");
        Ok(WorkerProcess {
            child,
            pid,
            stdin: Some(stdin),
            replies,
            readers: vec![stdout_reader, stderr_reader],
            reaped: false,
        })
    }
}

/// A running worker and the threads draining its output.
pub struct WorkerProcess {
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    replies: Receiver<Result<Reply, TransportError>>,
    readers: Vec<JoinHandle<()>>,
    reaped: bool,
}

impl WorkerProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn exit_detail(&mut self) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => status.to_string(),
            Ok(None) => "stdout closed".to_string(),
            Err(err) => format!("status unavailable: {err}"),
        }
    }

    fn join_readers(&mut self) {
        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                warn!(pid = self.pid, "worker reader thread panicked");
            }
        }
    }
}

impl Transport for WorkerProcess {
    fn call(&mut self, request: &Request, timeout: Duration) -> Result<Reply, TransportError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(TransportError::Disconnected("request channel closed".into()));
        };
        if let Err(err) = write_message(stdin, request) {
            if err.kind() == std::io::ErrorKind::BrokenPipe {
                let detail = self.exit_detail();
                return Err(TransportError::Disconnected(detail));
            }
            return Err(TransportError::Io(err));
        }
        match self.replies.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => Err(TransportError::TimedOut(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                // The reader only hangs up at end of stream; give the exit a moment to land.
                let _ = self.child.wait_timeout(Duration::from_millis(50));
                Err(TransportError::Disconnected(self.exit_detail()))
            }
        }
    }

    #[instrument(skip_all, fields(pid = self.pid, grace_ms = grace.as_millis() as u64))]
    fn terminate(&mut self, grace: Duration) -> Result<Reclaimed> {
        if let Some(mut stdin) = self.stdin.take() {
            // A worker stuck in user code never reads this; the kill below covers it.
            if let Err(err) = write_message(&mut stdin, &Request::Shutdown) {
                debug!(err = %err, "shutdown request not delivered");
            }
        }

        let mut forced = false;
        let status = match self.child.wait_timeout(grace).context("wait for worker")? {
            Some(status) => status,
            None => {
                warn!("worker still running after grace period, killing");
                forced = true;
                if let Err(err) = self.child.kill() {
                    debug!(err = %err, "kill failed; worker may have just exited");
                }
                self.child.wait().context("wait for worker after kill")?
            }
        };
        self.reaped = true;
        self.join_readers();

        debug!(exit_code = ?status.code(), forced, "worker reaped");
        Ok(Reclaimed {
            forced,
            exit: status.to_string(),
        })
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        warn!(pid = self.pid, "worker dropped without teardown, killing");
        self.stdin.take();
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.join_readers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_worker_binary_fails_to_launch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let launcher = WorkerLauncher::new(temp.path().join("no-such-worker"), Limits::default());
        let err = launcher.launch().err().expect("launch should fail");
        assert!(format!("{err:#}").contains("no-such-worker"));
    }

    #[test]
    fn default_program_sits_next_to_current_exe() {
        let program = WorkerLauncher::default_program().expect("program path");
        let exe = std::env::current_exe().expect("current exe");
        assert_eq!(program.parent(), exe.parent());
        assert!(
            program
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(WORKER_BIN))
        );
    }
}
