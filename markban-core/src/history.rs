/// Per-project activity log.
///
/// Entries are derived from published board events, kept in memory in a
/// bounded ring and persisted to `<project>/_history.json` a short while after
/// the last change. The file is loaded lazily on first use.
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::HistorySettings;
use crate::events::BoardEvent;
use crate::storage::local::TEMP_EXTENSION;
use crate::types::{now_iso, HISTORY_FILE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
}

impl HistoryEntry {
    /// Build an entry for an event. History events themselves are not
    /// recorded.
    pub fn from_event(event: &BoardEvent) -> Option<Self> {
        let (summary, card_slug, lane) = match event {
            BoardEvent::CardCreated { card } => (
                format!("Created \"{}\" in {}", card.frontmatter.title, card.lane),
                Some(card.slug.clone()),
                Some(card.lane.clone()),
            ),
            BoardEvent::CardUpdated { card } => (
                format!("Updated \"{}\"", card.frontmatter.title),
                Some(card.slug.clone()),
                Some(card.lane.clone()),
            ),
            BoardEvent::CardMoved {
                slug,
                from_lane,
                to_lane,
                ..
            } => (
                format!("Moved {} from {} to {}", slug, from_lane, to_lane),
                Some(slug.clone()),
                Some(to_lane.clone()),
            ),
            BoardEvent::CardDeleted { slug, lane } => (
                format!("Deleted {} from {}", slug, lane),
                Some(slug.clone()),
                Some(lane.clone()),
            ),
            BoardEvent::TaskToggled {
                slug,
                index,
                checked,
                card,
            } => (
                format!(
                    "{} task {} on {}",
                    if *checked { "Completed" } else { "Reopened" },
                    index + 1,
                    slug
                ),
                Some(slug.clone()),
                Some(card.lane.clone()),
            ),
            BoardEvent::TaskAdded {
                slug, text, card, ..
            } => (
                format!("Added task \"{}\" to {}", text, slug),
                Some(slug.clone()),
                Some(card.lane.clone()),
            ),
            BoardEvent::LaneReordered { lane, .. } => {
                (format!("Reordered {}", lane), None, Some(lane.clone()))
            }
            BoardEvent::ProjectUpdated { project } => {
                (format!("Updated project \"{}\"", project.config.name), None, None)
            }
            BoardEvent::HistoryEvent { .. } => return None,
        };
        Some(Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_iso(),
            kind: event.kind().to_string(),
            summary,
            card_slug,
            lane,
        })
    }
}

struct Inner {
    root: PathBuf,
    settings: HistorySettings,
    logs: tokio::sync::Mutex<HashMap<String, VecDeque<HistoryEntry>>>,
    flush_timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct HistoryRecorder {
    inner: Arc<Inner>,
}

impl HistoryRecorder {
    pub fn new(root: impl Into<PathBuf>, settings: HistorySettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                settings,
                logs: tokio::sync::Mutex::new(HashMap::new()),
                flush_timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn history_path(&self, project: &str) -> PathBuf {
        self.inner.root.join(project).join(HISTORY_FILE)
    }

    /// Append an entry for `event` and schedule a flush. Returns the entry so
    /// the caller can announce it.
    pub async fn record_event(&self, project: &str, event: &BoardEvent) -> Option<HistoryEntry> {
        let entry = HistoryEntry::from_event(event)?;
        {
            let mut logs = self.inner.logs.lock().await;
            let log = self.loaded(&mut logs, project).await;
            log.push_back(entry.clone());
            while log.len() > self.inner.settings.max_entries {
                log.pop_front();
            }
        }
        self.schedule_flush(project);
        Some(entry)
    }

    /// Most recent entries, newest first.
    pub async fn entries(&self, project: &str, limit: Option<usize>) -> Vec<HistoryEntry> {
        let mut logs = self.inner.logs.lock().await;
        let log = self.loaded(&mut logs, project).await;
        log.iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    async fn loaded<'a>(
        &self,
        logs: &'a mut HashMap<String, VecDeque<HistoryEntry>>,
        project: &str,
    ) -> &'a mut VecDeque<HistoryEntry> {
        if !logs.contains_key(project) {
            let entries = read_history(
                &self.history_path(project),
                self.inner.settings.max_entries,
            )
            .await;
            logs.insert(project.to_string(), entries);
        }
        logs.entry(project.to_string()).or_default()
    }

    fn schedule_flush(&self, project: &str) {
        let mut timers = self
            .inner
            .flush_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timers.remove(project) {
            previous.abort();
        }
        let recorder = self.clone();
        let slug = project.to_string();
        let delay = self.inner.settings.flush_delay();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            recorder
                .inner
                .flush_timers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&slug);
            recorder.flush(&slug).await;
        });
        timers.insert(project.to_string(), handle);
    }

    /// Write one project's log to disk. A project whose directory is gone
    /// is dropped from memory instead. The log lock is held through the
    /// write, so flushes never overlap on the temp file.
    pub async fn flush(&self, project: &str) {
        let mut logs = self.inner.logs.lock().await;
        if !self.inner.root.join(project).is_dir() {
            logs.remove(project);
            return;
        }
        let Some(entries) = logs.get(project) else {
            return;
        };
        let snapshot: Vec<&HistoryEntry> = entries.iter().collect();

        let path = self.history_path(project);
        if let Err(e) = write_history(&path, &snapshot).await {
            log::warn!("[markban.history.flush] Failed to write {:?}: {}", path, e);
        }
    }

    /// Cancel pending timers and flush every loaded project.
    pub async fn shutdown(&self) {
        let timers: Vec<JoinHandle<()>> = self
            .inner
            .flush_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in timers {
            handle.abort();
        }
        let projects: Vec<String> = self.inner.logs.lock().await.keys().cloned().collect();
        for project in projects {
            self.flush(&project).await;
        }
        log::info!("[markban.history] Flushed on shutdown");
    }
}

async fn read_history(path: &Path, max_entries: usize) -> VecDeque<HistoryEntry> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(_) => return VecDeque::new(),
    };
    match serde_json::from_str::<Vec<HistoryEntry>>(&content) {
        Ok(entries) => {
            let skip = entries.len().saturating_sub(max_entries);
            entries.into_iter().skip(skip).collect()
        }
        Err(e) => {
            log::warn!("[markban.history.load] Ignoring malformed {:?}: {}", path, e);
            VecDeque::new()
        }
    }
}

async fn write_history(path: &Path, entries: &[&HistoryEntry]) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(entries).map_err(std::io::Error::other)?;
    let tmp = path.with_extension(TEMP_EXTENSION);
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await
}
