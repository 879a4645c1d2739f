//! Rerun a snippet whenever its file changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use snip_lang::{FrontEnd, Record};
use tracing::{debug, info, warn};

use crate::core::types::{Outcome, SourceUnit};
use crate::io::transport::Launcher;
use crate::orchestrator::Orchestrator;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Events arriving closer together than this are handled as one edit.
const SETTLE: Duration = Duration::from_millis(150);

/// Run `path` once, then again after every edit, until the watcher stops.
///
/// Each edit becomes a new [`SourceUnit`] version. Saves that leave the text
/// unchanged are skipped. `report` sees every batch of outcomes; returning an
/// error from it ends the watch.
pub fn watch<F, L>(
    orchestrator: &Orchestrator<F, L>,
    path: &Path,
    records: &[Record],
    mut report: impl FnMut(&SourceUnit, &[Outcome]) -> Result<()>,
) -> Result<()>
where
    F: FrontEnd,
    L: Launcher,
{
    let target = path
        .canonicalize()
        .with_context(|| format!("resolve {}", path.display()))?;
    // Editors often replace the file instead of writing it, so watch its directory.
    let dir = target
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (tx, rx) = mpsc::channel::<NotifyEvent>();
    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(err) => warn!(error = %err, "watch error"),
        },
        notify::Config::default().with_poll_interval(POLL_INTERVAL),
    )
    .context("create file watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch {}", dir.display()))?;
    info!(path = %target.display(), "watching snippet");

    let mut last_text = None;
    rerun(orchestrator, &target, records, &mut last_text, &mut report)?;

    while let Ok(event) = rx.recv() {
        let mut relevant = touches(&event, &target);
        loop {
            match rx.recv_timeout(SETTLE) {
                Ok(event) => relevant |= touches(&event, &target),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
        if relevant {
            rerun(orchestrator, &target, records, &mut last_text, &mut report)?;
        }
    }
    Ok(())
}

fn rerun<F: FrontEnd, L: Launcher>(
    orchestrator: &Orchestrator<F, L>,
    path: &Path,
    records: &[Record],
    last_text: &mut Option<String>,
    report: &mut impl FnMut(&SourceUnit, &[Outcome]) -> Result<()>,
) -> Result<()> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            // Mid-save the file can briefly vanish; the next event retries.
            warn!(error = %err, path = %path.display(), "snippet unreadable");
            return Ok(());
        }
    };
    if last_text.as_deref() == Some(text.as_str()) {
        debug!("snippet unchanged");
        return Ok(());
    }
    let source = orchestrator.versions().mint(text.as_str());
    *last_text = Some(text);
    let outcomes = orchestrator.run_batch(&source, records)?;
    report(&source, &outcomes)
}

/// Whether `event` created or modified `target`, which must be canonical.
fn touches(event: &NotifyEvent, target: &Path) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|path| path == target || path.canonicalize().is_ok_and(|path| path == target))
}
