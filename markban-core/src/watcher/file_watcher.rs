/// File watcher using notify-debouncer-full.
///
/// Watches the whole workspace recursively. Debounced paths are queued to a
/// single task that feeds them to the [`WatchEngine`] one at a time, so
/// notices for one card are always handled in arrival order.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::engine::{WatchEngine, WatchEvent};
use crate::config::WatcherSettings;
use crate::storage::local::CardStore;

/// How often unclaimed self-write fingerprints are swept.
const FINGERPRINT_SWEEP: Duration = Duration::from_secs(10);

pub struct FileWatcher {
    debouncer: Option<Debouncer<notify::RecommendedWatcher, RecommendedCache>>,
    engine: WatchEngine,
    worker: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl FileWatcher {
    /// Start watching the store's root. Must be called inside a Tokio runtime.
    pub fn start(
        store: Arc<CardStore>,
        settings: WatcherSettings,
    ) -> Result<(Self, broadcast::Receiver<WatchEvent>), notify::Error> {
        let root = store.root().to_path_buf();
        let canonical_root = std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        let debounce = settings.debounce();
        let (engine, event_rx) = WatchEngine::new(store.clone(), settings);

        let (path_tx, mut path_rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        if matches!(event.kind, EventKind::Access(_)) {
                            continue;
                        }
                        // Rename pairs arrive as [from, to]; order is kept.
                        for path in &event.paths {
                            let _ = path_tx.send(path.clone());
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        log::error!("[markban.watcher.error] Watch error: {}", e);
                    }
                }
            }
        })?;
        debouncer.watch(&canonical_root, RecursiveMode::Recursive)?;

        let worker_engine = engine.clone();
        let worker_root = canonical_root.clone();
        let worker = tokio::spawn(async move {
            while let Some(path) = path_rx.recv().await {
                let Some(relative) = relative_to(&path, &worker_root, &root) else {
                    continue;
                };
                worker_engine.process_path(relative).await;
            }
        });

        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(FINGERPRINT_SWEEP);
            loop {
                tick.tick().await;
                store.cleanup_expired_fingerprints();
            }
        });

        log::info!(
            "[markban.watcher.start] Watching {:?} (debounce {:?})",
            canonical_root,
            debounce
        );
        Ok((
            Self {
                debouncer: Some(debouncer),
                engine,
                worker,
                sweeper,
            },
            event_rx,
        ))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.engine.subscribe()
    }

    /// Stop the debouncer and cancel every pending timer.
    pub fn stop(&mut self) {
        if let Some(debouncer) = self.debouncer.take() {
            debouncer.stop();
        }
        self.engine.stop();
        self.worker.abort();
        self.sweeper.abort();
        log::info!("[markban.watcher.stop] Stopped");
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        if self.debouncer.is_some() {
            self.stop();
        }
    }
}

fn relative_to<'a>(path: &'a Path, canonical_root: &Path, root: &Path) -> Option<&'a Path> {
    path.strip_prefix(canonical_root)
        .or_else(|_| path.strip_prefix(root))
        .ok()
}
