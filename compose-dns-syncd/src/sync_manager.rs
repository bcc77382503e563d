use std::path::PathBuf;
use std::thread;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use anyhow::Result;
use shared::types::PriorState;
use crate::config::RetentionPolicy;
use crate::labels::LabelSource;
use crate::output::{ApplyReport, OutputDocument};
use crate::reconcile::{reconcile, EditSet};
use crate::state_store::StateStore;

/// Why a cycle was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Timer,
    SourceChanged,
}

/// Commands sent to the sync thread
pub enum SyncCommand {
    RunCycle(Trigger, Option<oneshot::Sender<CycleOutcome>>),
    Shutdown(oneshot::Sender<()>),
}

/// Result of a single extract -> reconcile -> apply cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The label source could not be read; nothing was touched
    SourceUnavailable,
    /// Nothing changed and nothing was pending from an earlier failed write
    Unchanged,
    Applied {
        state_saved: bool,
        output_written: bool,
        report: ApplyReport,
    },
}

/// Owns everything a cycle reads and writes. Only ever driven from one thread.
pub struct SyncWorker {
    source: Box<dyn LabelSource>,
    store: StateStore,
    output_path: PathBuf,
    retention: RetentionPolicy,
    state: PriorState,
    /// State advanced in memory but not yet persisted
    state_dirty: bool,
    /// Edits not yet written because the output document could not be saved
    pending_edits: EditSet,
}

impl SyncWorker {
    pub fn new(
        source: Box<dyn LabelSource>,
        store: StateStore,
        output_path: impl Into<PathBuf>,
        retention: RetentionPolicy,
    ) -> Self {
        let state = store.load();
        tracing::info!("Loaded {} tracked entities from {}", state.len(), store.path().display());
        Self {
            source,
            store,
            output_path: output_path.into(),
            retention,
            state,
            state_dirty: false,
            pending_edits: EditSet::default(),
        }
    }

    pub fn run_cycle(&mut self, trigger: Trigger) -> CycleOutcome {
        tracing::debug!("Running sync cycle ({:?})", trigger);

        let snapshot = match self.source.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Skipping cycle: {}", e);
                return CycleOutcome::SourceUnavailable;
            }
        };

        let result = reconcile(&snapshot, &self.state, self.retention, Utc::now());
        if result.changed {
            tracing::info!(
                "Detected changes: {} updated, {} purged",
                result.updated.len(),
                result.purged.len()
            );
            self.state = result.state;
            self.state_dirty = true;
        }

        let edits = std::mem::take(&mut self.pending_edits).then(result.edits);
        if !self.state_dirty && edits.is_empty() {
            return CycleOutcome::Unchanged;
        }

        let state_saved = self.persist_state();
        let (output_written, report) = self.write_output(edits);

        CycleOutcome::Applied {
            state_saved,
            output_written,
            report,
        }
    }

    fn persist_state(&mut self) -> bool {
        if !self.state_dirty {
            return false;
        }
        match self.store.save(&self.state) {
            Ok(()) => {
                self.state_dirty = false;
                true
            }
            Err(e) => {
                tracing::warn!("Failed to save state, will retry next cycle: {}", e);
                false
            }
        }
    }

    fn write_output(&mut self, edits: EditSet) -> (bool, ApplyReport) {
        if edits.is_empty() {
            return (false, ApplyReport::default());
        }

        let mut document = match OutputDocument::load(&self.output_path) {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!("Failed to read output document, will retry next cycle: {}", e);
                self.pending_edits = edits;
                return (false, ApplyReport::default());
            }
        };

        let report = document.apply(&edits);
        for conflict in &report.conflicts {
            tracing::warn!(
                "Conflict: not writing '{}', '{}' already claims that name",
                conflict.rejected,
                conflict.existing
            );
        }
        for pair in &report.skipped {
            tracing::warn!("No host IP for '{}', not writing it", pair.dns_name());
        }

        if !report.modified() {
            return (false, report);
        }

        match document.save(&self.output_path) {
            Ok(()) => {
                tracing::info!(
                    "Wrote {}: {} added, {} removed",
                    self.output_path.display(),
                    report.added.len(),
                    report.removed.len()
                );
                (true, report)
            }
            Err(e) => {
                tracing::warn!("Failed to write output document, will retry next cycle: {}", e);
                self.pending_edits = edits;
                (false, report)
            }
        }
    }
}

/// Handle to the sync thread. The command channel holds a single queued
/// request, so triggers arriving while one is already queued coalesce into it.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    /// Spawn the sync thread; cycles run there one at a time
    pub fn spawn(mut worker: SyncWorker) -> Self {
        let (tx, mut rx) = mpsc::channel::<SyncCommand>(1);

        thread::spawn(move || {
            let mut shutdown_reply = None;
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    SyncCommand::RunCycle(trigger, reply) => {
                        let outcome = worker.run_cycle(trigger);
                        if let Some(reply) = reply {
                            let _ = reply.send(outcome);
                        }
                    }
                    SyncCommand::Shutdown(reply) => {
                        tracing::info!("Sync thread shutting down");
                        shutdown_reply = Some(reply);
                        break;
                    }
                }
            }
            // Close the channel before acknowledging so later triggers see it closed
            drop(rx);
            if let Some(reply) = shutdown_reply {
                let _ = reply.send(());
            }
        });

        Self { tx }
    }

    /// Request a cycle without waiting for it. Returns false when the request
    /// was folded into one already queued.
    pub fn trigger(&self, trigger: Trigger) -> bool {
        match self.tx.try_send(SyncCommand::RunCycle(trigger, None)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Cycle already queued, coalescing {:?} trigger", trigger);
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("Sync thread is gone, dropping {:?} trigger", trigger);
                false
            }
        }
    }

    /// Run a cycle and wait for its outcome
    pub async fn run_cycle(&self, trigger: Trigger) -> Result<CycleOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SyncCommand::RunCycle(trigger, Some(reply))).await?;
        Ok(rx.await?)
    }

    /// Stop the sync thread once any queued cycle has finished
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SyncCommand::Shutdown(reply)).await?;
        rx.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use shared::types::{EntityKey, EntityRecord, LabelSnapshot, Pair};
    use crate::error::SourceError;

    /// Label source whose snapshot the test can swap between cycles
    #[derive(Clone, Default)]
    struct FakeSource {
        snapshot: Arc<Mutex<Option<LabelSnapshot>>>,
    }

    impl FakeSource {
        fn set(&self, entries: &[(&str, &str, &[&str])]) {
            let snapshot = entries
                .iter()
                .map(|(key, ip, names)| {
                    (
                        EntityKey::from(*key),
                        EntityRecord {
                            host_ip: ip.to_string(),
                            dns_names: names.iter().map(|s| s.to_string()).collect(),
                        },
                    )
                })
                .collect();
            *self.snapshot.lock().unwrap() = Some(snapshot);
        }

        fn fail(&self) {
            *self.snapshot.lock().unwrap() = None;
        }
    }

    impl LabelSource for FakeSource {
        fn snapshot(&self) -> Result<LabelSnapshot, SourceError> {
            self.snapshot.lock().unwrap().clone().ok_or_else(|| SourceError::Read {
                path: PathBuf::from("docker-compose.yml"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            })
        }
    }

    fn worker(dir: &Path, source: &FakeSource) -> SyncWorker {
        SyncWorker::new(
            Box::new(source.clone()),
            StateStore::new(dir.join("state.json")),
            dir.join("custom.list"),
            RetentionPolicy::Retain,
        )
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn test_round_trip_single_entity() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::default();
        source.set(&[("web", "10.0.0.5", &["app.local"])]);

        let mut worker = worker(dir.path(), &source);
        let outcome = worker.run_cycle(Trigger::Startup);

        assert!(matches!(outcome, CycleOutcome::Applied { state_saved: true, output_written: true, .. }));
        assert_eq!(read(&dir.path().join("custom.list")), "10.0.0.5 app.local\n");
    }

    #[test]
    fn test_second_identical_cycle_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::default();
        source.set(&[("web", "10.0.0.5", &["app.local"])]);

        let mut worker = worker(dir.path(), &source);
        worker.run_cycle(Trigger::Startup);
        let output = read(&dir.path().join("custom.list"));

        // Remove both files: an unchanged cycle must not recreate them
        std::fs::remove_file(dir.path().join("custom.list")).unwrap();
        std::fs::remove_file(dir.path().join("state.json")).unwrap();

        assert_eq!(worker.run_cycle(Trigger::Timer), CycleOutcome::Unchanged);
        assert!(!dir.path().join("custom.list").exists());
        assert!(!dir.path().join("state.json").exists());
        assert_eq!(output, "10.0.0.5 app.local\n");
    }

    #[test]
    fn test_idempotent_output() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::default();
        source.set(&[("web", "10.0.0.5", &["app.local", "www.local"])]);

        let mut worker = worker(dir.path(), &source);
        worker.run_cycle(Trigger::Startup);
        let once = read(&dir.path().join("custom.list"));
        worker.run_cycle(Trigger::Timer);

        assert_eq!(read(&dir.path().join("custom.list")), once);
    }

    #[test]
    fn test_update_replaces_not_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::default();
        source.set(&[("web", "10.0.0.5", &["app.local"])]);

        let mut worker = worker(dir.path(), &source);
        worker.run_cycle(Trigger::Startup);
        source.set(&[("web", "10.0.0.6", &["app.local"])]);
        worker.run_cycle(Trigger::SourceChanged);

        let output = read(&dir.path().join("custom.list"));
        assert!(output.contains("10.0.0.6 app.local"));
        assert!(!output.contains("10.0.0.5 app.local"));
    }

    #[test]
    fn test_conflict_keeps_first_pair() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::default();
        source.set(&[
            ("alpha", "10.0.0.5", &["shared.local"]),
            ("beta", "10.0.0.6", &["shared.local"]),
        ]);

        let mut worker = worker(dir.path(), &source);
        let outcome = worker.run_cycle(Trigger::Startup);

        let CycleOutcome::Applied { report, .. } = outcome else {
            panic!("expected an applied cycle");
        };
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].rejected, Pair::new("10.0.0.6", "shared.local"));
        assert_eq!(read(&dir.path().join("custom.list")), "10.0.0.5 shared.local\n");
    }

    #[test]
    fn test_rejected_claimant_takes_over_after_retirement() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::default();
        source.set(&[
            ("alpha", "10.0.0.5", &["shared.local"]),
            ("beta", "10.0.0.6", &["shared.local"]),
        ]);

        let mut worker = worker(dir.path(), &source);
        worker.run_cycle(Trigger::Startup);
        source.set(&[
            ("alpha", "10.0.0.5", &[]),
            ("beta", "10.0.0.6", &["shared.local"]),
        ]);
        worker.run_cycle(Trigger::SourceChanged);

        assert_eq!(read(&dir.path().join("custom.list")), "10.0.0.6 shared.local\n");
    }

    #[test]
    fn test_source_failure_leaves_everything_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::default();
        source.set(&[("web", "10.0.0.5", &["app.local"])]);

        let mut worker = worker(dir.path(), &source);
        worker.run_cycle(Trigger::Startup);
        let state = worker.state.clone();

        source.fail();
        assert_eq!(worker.run_cycle(Trigger::Timer), CycleOutcome::SourceUnavailable);
        assert_eq!(worker.state, state);
        assert_eq!(read(&dir.path().join("custom.list")), "10.0.0.5 app.local\n");
    }

    #[test]
    fn test_corrupt_state_treats_entities_as_new() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("state.json"), "not json at all").unwrap();
        let source = FakeSource::default();
        source.set(&[("web", "10.0.0.5", &["app.local"])]);

        let mut worker = worker(dir.path(), &source);
        assert!(worker.state.is_empty());
        worker.run_cycle(Trigger::Startup);

        assert_eq!(read(&dir.path().join("custom.list")), "10.0.0.5 app.local\n");
        let reloaded = StateStore::new(dir.path().join("state.json")).load();
        assert_eq!(reloaded, worker.state);
    }

    #[test]
    fn test_manual_lines_survive_cycles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("custom.list"), "192.168.1.1 manual.local\n").unwrap();
        let source = FakeSource::default();

        let mut worker = worker(dir.path(), &source);
        for ip in ["10.0.0.5", "10.0.0.6", "10.0.0.7"] {
            source.set(&[("web", ip, &["app.local"])]);
            worker.run_cycle(Trigger::Timer);
        }

        assert_eq!(
            read(&dir.path().join("custom.list")),
            "10.0.0.7 app.local\n192.168.1.1 manual.local\n"
        );
    }

    #[test]
    fn test_failed_output_write_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("blocked");
        // A directory at the output path makes the write fail
        std::fs::create_dir(&blocked).unwrap();

        let source = FakeSource::default();
        source.set(&[("web", "10.0.0.5", &["app.local"])]);
        let mut worker = SyncWorker::new(
            Box::new(source.clone()),
            StateStore::new(dir.path().join("state.json")),
            &blocked,
            RetentionPolicy::Retain,
        );

        let outcome = worker.run_cycle(Trigger::Startup);
        assert!(matches!(outcome, CycleOutcome::Applied { state_saved: true, output_written: false, .. }));
        assert_eq!(worker.state[&EntityKey::from("web")].current_pairs.len(), 1);

        std::fs::remove_dir(&blocked).unwrap();
        let outcome = worker.run_cycle(Trigger::Timer);
        assert!(matches!(outcome, CycleOutcome::Applied { output_written: true, .. }));
        assert_eq!(read(&blocked), "10.0.0.5 app.local\n");
    }

    #[test]
    fn test_failed_state_write_is_retried_without_new_changes() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        // A directory at the state path makes the save fail
        std::fs::create_dir(&state_path).unwrap();

        let source = FakeSource::default();
        source.set(&[("web", "10.0.0.5", &["app.local"])]);
        let mut worker = worker(dir.path(), &source);

        let outcome = worker.run_cycle(Trigger::Startup);
        assert!(matches!(outcome, CycleOutcome::Applied { state_saved: false, output_written: true, .. }));
        assert_eq!(
            worker.state[&EntityKey::from("web")].current_pairs,
            std::collections::BTreeSet::from([Pair::new("10.0.0.5", "app.local")])
        );
        assert_eq!(read(&dir.path().join("custom.list")), "10.0.0.5 app.local\n");

        std::fs::remove_dir(&state_path).unwrap();
        let outcome = worker.run_cycle(Trigger::Timer);
        assert!(matches!(outcome, CycleOutcome::Applied { state_saved: true, output_written: false, .. }));

        let persisted: PriorState = serde_json::from_str(&read(&state_path)).unwrap();
        assert_eq!(persisted, worker.state);
        assert_eq!(worker.run_cycle(Trigger::Timer), CycleOutcome::Unchanged);
    }

    #[test]
    fn test_malformed_host_ip_is_replaced_once_fixed() {
        use crate::labels::compose::ComposeSource;
        use crate::labels::extract::ExtractOptions;

        let dir = tempfile::tempdir().unwrap();
        let compose = dir.path().join("docker-compose.yml");
        let output = dir.path().join("custom.list");
        let write_compose = |host_ip: &str| {
            std::fs::write(
                &compose,
                format!("services:\n  web:\n    labels:\n      pihole.hostip: \"{}\"\n      pihole.dns: app.local\n", host_ip),
            )
            .unwrap();
        };

        let mut worker = SyncWorker::new(
            Box::new(ComposeSource::new(&compose, ExtractOptions::default())),
            StateStore::new(dir.path().join("state.json")),
            &output,
            RetentionPolicy::Retain,
        );

        write_compose("10.0.0.5 10.0.0.6");
        worker.run_cycle(Trigger::Startup);
        assert_eq!(read(&output), "");

        write_compose("10.0.0.7");
        let outcome = worker.run_cycle(Trigger::SourceChanged);
        let CycleOutcome::Applied { report, .. } = outcome else {
            panic!("expected an applied cycle");
        };
        assert!(report.conflicts.is_empty());
        assert_eq!(read(&output), "10.0.0.7 app.local\n");
    }

    /// Label source that blocks inside `snapshot` until the test releases it
    struct GatedSource {
        entered: std::sync::mpsc::Sender<()>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
        calls: Arc<AtomicUsize>,
    }

    impl LabelSource for GatedSource {
        fn snapshot(&self) -> Result<LabelSnapshot, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.entered.send(());
            let _ = self.release.lock().unwrap().recv();
            Ok(LabelSnapshot::new())
        }
    }

    #[tokio::test]
    async fn test_triggers_coalesce_while_cycle_runs() {
        let dir = tempfile::tempdir().unwrap();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = GatedSource {
            entered: entered_tx,
            release: Mutex::new(release_rx),
            calls: calls.clone(),
        };

        let handle = SyncHandle::spawn(SyncWorker::new(
            Box::new(source),
            StateStore::new(dir.path().join("state.json")),
            dir.path().join("custom.list"),
            RetentionPolicy::Retain,
        ));

        assert!(handle.trigger(Trigger::Startup));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(handle.trigger(Trigger::Timer), "One trigger queues behind the running cycle");
        assert!(!handle.trigger(Trigger::SourceChanged), "Further triggers coalesce");
        assert!(!handle.trigger(Trigger::Timer));

        release_tx.send(()).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx.send(()).unwrap();

        handle.shutdown().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handle_runs_cycles_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::default();
        source.set(&[("web", "10.0.0.5", &["app.local"])]);

        let handle = SyncHandle::spawn(worker(dir.path(), &source));
        let first = handle.run_cycle(Trigger::Startup).await.unwrap();
        assert!(matches!(first, CycleOutcome::Applied { .. }));

        let second = handle.run_cycle(Trigger::Timer).await.unwrap();
        assert_eq!(second, CycleOutcome::Unchanged);

        handle.shutdown().await.unwrap();
        assert!(!handle.trigger(Trigger::Timer), "Triggers after shutdown are dropped");
    }
}
