/// Turns "this path changed" notices into board events.
///
/// The engine does not trust notification kinds: every path is probed on disk
/// and classified, which makes it indifferent to how a platform reports
/// renames. A card that disappears is held as a pending delete for the move
/// window; if the same slug shows up in another lane meanwhile the pair is
/// reported as one `card:moved`.
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::types::{classify, WatchTarget};
use crate::config::WatcherSettings;
use crate::events::BoardEvent;
use crate::storage::local::CardStore;

/// A board event attributed to a project.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub project: String,
    pub event: BoardEvent,
}

struct PendingDelete {
    lane: String,
    generation: u64,
    timer: JoinHandle<()>,
}

/// (project, slug)
type PendingKey = (String, String);

struct Inner {
    store: Arc<CardStore>,
    settings: WatcherSettings,
    tx: broadcast::Sender<WatchEvent>,
    pending: Mutex<HashMap<PendingKey, PendingDelete>>,
    next_generation: AtomicU64,
    stopped: AtomicBool,
}

#[derive(Clone)]
pub struct WatchEngine {
    inner: Arc<Inner>,
}

impl WatchEngine {
    pub fn new(
        store: Arc<CardStore>,
        settings: WatcherSettings,
    ) -> (Self, broadcast::Receiver<WatchEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let engine = Self {
            inner: Arc::new(Inner {
                store,
                settings,
                tx,
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        };
        (engine, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.tx.subscribe()
    }

    /// Cancel every pending move timer. Later notices are ignored.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let mut pending = self.pending();
        for (_, entry) in pending.drain() {
            entry.timer.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn pending_deletes(&self) -> usize {
        self.pending().len()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<PendingKey, PendingDelete>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn suppress(&self) -> bool {
        self.inner.settings.suppress_self_writes
    }

    fn emit(&self, project: &str, event: BoardEvent) {
        if self.is_stopped() {
            return;
        }
        log::debug!("[markban.watcher.emit] {} {}", project, event.kind());
        if self
            .inner
            .tx
            .send(WatchEvent {
                project: project.to_string(),
                event,
            })
            .is_err()
        {
            log::debug!("[markban.watcher.emit] No receivers");
        }
    }

    /// Handle one changed path, relative to the workspace root.
    pub async fn process_path(&self, relative: &Path) {
        if self.is_stopped() {
            return;
        }
        let Some(target) = classify(relative) else {
            return;
        };
        let absolute = self.inner.store.root().join(relative);
        let content = match tokio::fs::read_to_string(&absolute).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!("[markban.watcher.read] Cannot read {:?}: {}", absolute, e);
                return;
            }
        };

        match target {
            WatchTarget::ProjectConfig { project } => {
                let Some(content) = content else {
                    return;
                };
                if self.suppress() && self.inner.store.is_self_write(relative, &content) {
                    return;
                }
                match self.inner.store.get_project(&project).await {
                    Ok(project_info) => self.emit(
                        &project,
                        BoardEvent::ProjectUpdated {
                            project: project_info,
                        },
                    ),
                    Err(e) => log::warn!("[markban.watcher.project] {}: {}", project, e),
                }
            }
            WatchTarget::LaneOrder { project, lane } => {
                let Some(content) = content else {
                    return;
                };
                if self.suppress() && self.inner.store.is_self_write(relative, &content) {
                    return;
                }
                match serde_json::from_str::<Vec<String>>(&content) {
                    Ok(order) => self.emit(&project, BoardEvent::LaneReordered { lane, order }),
                    Err(e) => log::warn!(
                        "[markban.watcher.order] Ignoring malformed {:?}: {}",
                        relative,
                        e
                    ),
                }
            }
            WatchTarget::Card {
                project,
                lane,
                slug,
            } => match content {
                None => {
                    if self.suppress() && self.inner.store.is_self_removal(relative) {
                        return;
                    }
                    self.schedule_delete(project, lane, slug);
                }
                Some(content) => {
                    let pending = self.pending().remove(&(project.clone(), slug.clone()));
                    if let Some(p) = &pending {
                        p.timer.abort();
                    }
                    if self.suppress() && self.inner.store.is_self_write(relative, &content) {
                        return;
                    }
                    self.card_appeared(&project, &lane, &slug, pending.map(|p| p.lane))
                        .await;
                }
            },
        }
    }

    async fn card_appeared(
        &self,
        project: &str,
        lane: &str,
        slug: &str,
        from_lane: Option<String>,
    ) {
        let summary = self.inner.store.read_card_summary(project, lane, slug).await;
        match from_lane {
            Some(from) if from != lane => {
                log::info!(
                    "[markban.watcher.move] {}/{} {} -> {}",
                    project,
                    slug,
                    from,
                    lane
                );
                self.emit(
                    project,
                    BoardEvent::CardMoved {
                        slug: slug.to_string(),
                        from_lane: from,
                        to_lane: lane.to_string(),
                        position: None,
                        card: summary.ok(),
                    },
                );
            }
            _ => match summary {
                Ok(card) => self.emit(project, BoardEvent::CardUpdated { card }),
                Err(e) => log::warn!(
                    "[markban.watcher.card] Skipping {}/{}/{}: {}",
                    project,
                    lane,
                    slug,
                    e
                ),
            },
        }
    }

    fn schedule_delete(&self, project: String, lane: String, slug: String) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let engine = self.clone();
        let window = self.inner.settings.move_window();
        let key = (project, slug);
        let timer_key = key.clone();
        let timer_lane = lane.clone();
        // Held across the spawn so the timer always finds its own entry.
        let mut pending = self.pending();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            engine.resolve_delete(timer_key, timer_lane, generation).await;
        });
        if let Some(previous) = pending.insert(
            key,
            PendingDelete {
                lane,
                generation,
                timer,
            },
        ) {
            previous.timer.abort();
        }
    }

    /// Move window elapsed: the card was moved, re-created in place or
    /// really deleted. Ask the store which.
    async fn resolve_delete(&self, key: PendingKey, lane: String, generation: u64) {
        {
            let mut pending = self.pending();
            match pending.get(&key) {
                Some(entry) if entry.generation == generation => {
                    pending.remove(&key);
                }
                _ => return,
            }
        }
        let (project, slug) = key;
        match self.inner.store.locate_card(&project, &slug).await {
            Ok(Some(found)) => self.card_appeared(&project, &found, &slug, Some(lane)).await,
            Ok(None) | Err(_) => {
                log::info!("[markban.watcher.delete] {}/{}/{}", project, lane, slug);
                self.emit(&project, BoardEvent::CardDeleted { slug, lane });
            }
        }
    }
}
