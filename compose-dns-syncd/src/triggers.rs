use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use crate::config::Config;
use crate::labels::fingerprint::fingerprint_source;
use crate::sync_manager::{SyncHandle, Trigger};

/// Process-wide context handed to every trigger loop
#[derive(Clone)]
pub struct RunContext {
    pub config: Arc<Config>,
    pub cancel: CancellationToken,
}

/// Periodic trigger. The first tick fires one full interval after start,
/// the startup cycle having already run.
pub async fn run_timer(ctx: RunContext, sync: SyncHandle) {
    let period = Duration::from_secs(ctx.config.triggers.poll_interval_secs);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!("Timed mode: syncing every {}s", period.as_secs());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sync.trigger(Trigger::Timer);
            }
            _ = ctx.cancel.cancelled() => {
                tracing::info!("Timer trigger shutting down");
                break;
            }
        }
    }
}

/// Watches the label source's directory and triggers a cycle once a burst
/// of events touching the file has settled and its content actually changed.
pub async fn run_watcher(ctx: RunContext, sync: SyncHandle) {
    let path: PathBuf = ctx.config.source.compose_file.clone();
    let quiet = Duration::from_millis(ctx.config.triggers.watch_debounce_ms);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watcher = match watch_source(&path, tx) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::error!("Failed to watch {}: {}", path.display(), e);
            return;
        }
    };

    let mut filter = ContentFilter::new(fingerprint(&path).await.unwrap_or_default());

    tracing::info!("Watch mode: watching {}", path.display());

    loop {
        tokio::select! {
            event = rx.recv() => {
                if event.is_none() {
                    tracing::warn!("File watcher for {} stopped", path.display());
                    break;
                }
                if !settle(&mut rx, quiet, &ctx.cancel).await {
                    break;
                }
                let changed = match fingerprint(&path).await {
                    Ok(current) => filter.observe(current),
                    Err(e) => {
                        tracing::error!("Fingerprint task failed: {}", e);
                        true
                    }
                };
                if changed {
                    tracing::info!("Label source {} changed", path.display());
                    sync.trigger(Trigger::SourceChanged);
                } else {
                    tracing::debug!("Events on {} left its content unchanged", path.display());
                }
            }
            _ = ctx.cancel.cancelled() => break,
        }
    }

    tracing::info!("Watch trigger shutting down");
}

/// Start a non-recursive watch on the directory holding `path`, forwarding
/// every event that touches the file itself.
fn watch_source(path: &Path, tx: mpsc::UnboundedSender<()>) -> notify::Result<RecommendedWatcher> {
    let file_name = path
        .file_name()
        .map(OsString::from)
        .ok_or_else(|| notify::Error::generic("label source path has no file name"))?;
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if touches_source(&event, &file_name) => {
            let _ = tx.send(());
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("File watcher error: {}", e),
    })?;

    // Watch the directory: a rename over the file would orphan a watch on the file itself
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

fn touches_source(event: &Event, file_name: &OsStr) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|p| p.file_name() == Some(file_name))
}

/// Wait until no event has arrived for `quiet`.
/// Returns false when watching should stop instead.
async fn settle(rx: &mut mpsc::UnboundedReceiver<()>, quiet: Duration, cancel: &CancellationToken) -> bool {
    loop {
        tokio::select! {
            event = rx.recv() => {
                if event.is_none() {
                    return false;
                }
            }
            _ = tokio::time::sleep(quiet) => return true,
            _ = cancel.cancelled() => return false,
        }
    }
}

async fn fingerprint(path: &Path) -> Result<String, JoinError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || fingerprint_source(&path)).await
}

/// Remembers the fingerprint last acted on, so events that leave the
/// content as it was (touch, chmod, a save without edits) do not trigger.
#[derive(Debug)]
pub struct ContentFilter {
    last: String,
}

impl ContentFilter {
    pub fn new(initial: String) -> Self {
        Self { last: initial }
    }

    /// Returns true when `current` differs from the last fingerprint acted on
    pub fn observe(&mut self, current: String) -> bool {
        if current == self.last {
            return false;
        }
        self.last = current;
        true
    }
}
