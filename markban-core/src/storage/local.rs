/// Local filesystem card store.
///
/// Manages the workspace tree on disk with:
/// - one markdown file per card, one directory per lane
/// - `_order.json` per lane as the authority for display order
/// - atomic writes (write to .tmp, fsync, rename)
/// - per-card locks so concurrent mutations of one card never interleave
/// - self-write fingerprints so the file watcher can skip our own writes
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{Duration, Utc};

use super::lock::{LockKey, LockRegistry};
use super::order;
use super::{validation, StorageError};
use crate::parser::{self, ParseError, ParsedCard};
use crate::slug::{is_valid_segment, slugify};
use crate::types::*;
use crate::watcher::self_write::SelfWriteTracker;

/// Extension used for in-flight atomic writes. The watcher ignores it.
pub const TEMP_EXTENSION: &str = "markban-tmp";

pub struct CardStore {
    root: PathBuf,
    locks: LockRegistry,
    /// SHA-256 fingerprint tracker for self-write detection
    self_write_tracker: Mutex<SelfWriteTracker>,
}

impl CardStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: LockRegistry::new(),
            self_write_tracker: Mutex::new(SelfWriteTracker::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.root.join(project)
    }

    pub fn lane_dir(&self, project: &str, lane: &str) -> PathBuf {
        self.root.join(project).join(lane)
    }

    fn card_path(&self, project: &str, lane: &str, slug: &str) -> PathBuf {
        self.lane_dir(project, lane).join(card_filename(slug))
    }

    fn order_path(&self, project: &str, lane: &str) -> PathBuf {
        self.lane_dir(project, lane).join(ORDER_FILE)
    }

    pub(crate) fn project_config_path(&self, project: &str) -> PathBuf {
        self.project_dir(project).join(PROJECT_FILE)
    }

    // ── Self-write tracking ─────────────────────────────────────────────

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, SelfWriteTracker> {
        self.self_write_tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `content` at the workspace-relative `path` is one of our own
    /// writes. A match consumes the fingerprint.
    pub fn is_self_write(&self, path: &Path, content: &str) -> bool {
        self.tracker().check_and_consume(path, content)
    }

    /// Whether the disappearance of the workspace-relative `path` was caused
    /// by this store. A match consumes the tombstone.
    pub fn is_self_removal(&self, path: &Path) -> bool {
        self.tracker().check_removal(path)
    }

    /// Drop fingerprints the watcher never claimed.
    pub fn cleanup_expired_fingerprints(&self) {
        self.tracker().cleanup_expired();
    }

    // ── Raw file helpers ────────────────────────────────────────────────

    /// Write `content` atomically and register it as a self-write.
    pub(crate) async fn write_file(
        &self,
        path: &Path,
        content: String,
    ) -> Result<(), StorageError> {
        self.tracker().register(self.relative(path), &content);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || atomic_write(&path, &content))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }

    pub(crate) async fn write_json<T: serde::Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), StorageError> {
        let mut json = serde_json::to_string_pretty(value).map_err(|source| StorageError::Json {
            path: path.display().to_string(),
            source,
        })?;
        json.push('\n');
        self.write_file(path, json).await
    }

    /// Remove a file; one that is already gone is not an error.
    async fn remove_file(&self, path: &Path) -> Result<(), StorageError> {
        self.tracker().register_removal(self.relative(path));
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("[markban.store.remove] Already gone: {:?}", path);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Project config ──────────────────────────────────────────────────

    pub(crate) async fn read_project_config(
        &self,
        project: &str,
    ) -> Result<ProjectConfig, StorageError> {
        if !is_valid_segment(project) {
            return Err(StorageError::ProjectNotFound(project.to_string()));
        }
        let path = self.project_config_path(project);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::ProjectNotFound(project.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|source| StorageError::Json {
            path: path.display().to_string(),
            source,
        })
    }

    pub(crate) async fn write_project_config(
        &self,
        project: &str,
        config: &ProjectConfig,
    ) -> Result<(), StorageError> {
        self.write_json(&self.project_config_path(project), config)
            .await
    }

    /// Configured lanes in config order, then any other lane directory on
    /// disk, alphabetically.
    async fn lanes(
        &self,
        project: &str,
        config: &ProjectConfig,
    ) -> Result<Vec<String>, StorageError> {
        let mut lanes: Vec<String> = config.lanes.keys().cloned().collect();
        let mut extra = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.project_dir(project)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(lanes),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('_') || name.starts_with('.') || lanes.contains(&name) {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                extra.push(name);
            }
        }
        extra.sort();
        lanes.extend(extra);
        Ok(lanes)
    }

    // ── Order files ─────────────────────────────────────────────────────

    /// Resolved display order of a lane (see [`order::resolve_order`]).
    async fn resolved_order(&self, project: &str, lane: &str) -> Result<Vec<String>, StorageError> {
        let files = order::list_card_files(&self.lane_dir(project, lane)).await?;
        let listed = order::read_order_file(&self.order_path(project, lane)).await?;
        Ok(order::resolve_order(&listed, &files))
    }

    /// Read-modify-write of a lane's order file under the lane's order lock.
    async fn update_order<F>(
        &self,
        project: &str,
        lane: &str,
        f: F,
    ) -> Result<Vec<String>, StorageError>
    where
        F: FnOnce(&mut Vec<String>),
    {
        let _guard = self.locks.acquire(LockKey::lane_order(project, lane)).await;
        let mut current = self.resolved_order(project, lane).await?;
        f(&mut current);
        tokio::fs::create_dir_all(self.lane_dir(project, lane)).await?;
        self.write_json(&self.order_path(project, lane), &current).await?;
        Ok(current)
    }

    /// Raw contents of a lane's order file.
    pub async fn read_lane_order(
        &self,
        project: &str,
        lane: &str,
    ) -> Result<Vec<String>, StorageError> {
        self.read_project_config(project).await?;
        ensure_segment(lane, "lane")?;
        Ok(order::read_order_file(&self.order_path(project, lane)).await?)
    }

    // ── Card helpers ────────────────────────────────────────────────────

    /// Lane currently holding `slug`, probing every lane.
    pub async fn locate_card(
        &self,
        project: &str,
        slug: &str,
    ) -> Result<Option<String>, StorageError> {
        let config = self.read_project_config(project).await?;
        self.locate_with(project, slug, &config).await
    }

    async fn locate_with(
        &self,
        project: &str,
        slug: &str,
        config: &ProjectConfig,
    ) -> Result<Option<String>, StorageError> {
        if !is_valid_segment(slug) {
            return Ok(None);
        }
        for lane in self.lanes(project, config).await? {
            if tokio::fs::try_exists(self.card_path(project, &lane, slug)).await? {
                return Ok(Some(lane));
            }
        }
        Ok(None)
    }

    async fn require_lane(
        &self,
        project: &str,
        slug: &str,
        config: &ProjectConfig,
    ) -> Result<String, StorageError> {
        self.locate_with(project, slug, config)
            .await?
            .ok_or_else(|| StorageError::CardNotFound(slug.to_string()))
    }

    async fn read_parsed(&self, path: &Path) -> Result<ParsedCard, StorageError> {
        let raw = tokio::fs::read_to_string(path).await?;
        parser::parse_card(&raw).map_err(|source| StorageError::InvalidFrontmatter {
            path: path.display().to_string(),
            source,
        })
    }

    async fn write_card(
        &self,
        path: &Path,
        frontmatter: &CardFrontmatter,
        body: &str,
    ) -> Result<(), StorageError> {
        let content = parser::serialize_card(frontmatter, body).map_err(|source| {
            StorageError::InvalidFrontmatter {
                path: path.display().to_string(),
                source,
            }
        })?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        self.write_file(path, content).await
    }

    fn build_card(config: &ProjectConfig, lane: &str, slug: &str, parsed: ParsedCard) -> Card {
        Card {
            slug: slug.to_string(),
            filename: card_filename(slug),
            lane: lane.to_string(),
            card_ref: config.card_ref(parsed.frontmatter.card_number),
            frontmatter: parsed.frontmatter,
            body: parsed.body,
            tasks: parsed.tasks,
        }
    }

    /// Summary of the card at a known lane.
    pub async fn read_card_summary(
        &self,
        project: &str,
        lane: &str,
        slug: &str,
    ) -> Result<CardSummary, StorageError> {
        let config = self.read_project_config(project).await?;
        ensure_segment(lane, "lane")?;
        let path = self.card_path(project, lane, slug);
        let parsed = match self.read_parsed(&path).await {
            Err(StorageError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::CardNotFound(slug.to_string()))
            }
            other => other?,
        };
        Ok(Self::build_card(&config, lane, slug, parsed).summary())
    }

    // ── Card operations ─────────────────────────────────────────────────

    /// List card summaries in display order, lane by lane.
    pub async fn list_cards(
        &self,
        project: &str,
        filter: &ListFilter,
    ) -> Result<Vec<CardSummary>, StorageError> {
        let config = self.read_project_config(project).await?;
        let lanes = match &filter.lane {
            Some(lane) => {
                ensure_segment(lane, "lane")?;
                vec![lane.clone()]
            }
            None => self.lanes(project, &config).await?,
        };
        let stale_cutoff = filter
            .stale_days
            .map(|days| Utc::now() - Duration::days(i64::from(days)));

        let mut summaries = Vec::new();
        for lane in lanes {
            for filename in self.resolved_order(project, &lane).await? {
                let slug = slug_from_filename(&filename);
                let path = self.lane_dir(project, &lane).join(&filename);
                let parsed = match self.read_parsed(&path).await {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        log::warn!("[markban.store.list] Skipping {:?}: {}", path, e);
                        continue;
                    }
                };

                if filter.since.is_some() || stale_cutoff.is_some() {
                    let Some(updated) = parse_timestamp(&parsed.frontmatter.updated) else {
                        continue;
                    };
                    if filter.since.is_some_and(|since| updated < since) {
                        continue;
                    }
                    if stale_cutoff.is_some_and(|cutoff| updated >= cutoff) {
                        continue;
                    }
                }

                summaries.push(Self::build_card(&config, &lane, slug, parsed).summary());
            }
        }
        Ok(summaries)
    }

    pub async fn get_card(&self, project: &str, slug: &str) -> Result<Card, StorageError> {
        let config = self.read_project_config(project).await?;
        let lane = self.require_lane(project, slug, &config).await?;
        let parsed = self.read_parsed(&self.card_path(project, &lane, slug)).await?;
        Ok(Self::build_card(&config, &lane, slug, parsed))
    }

    pub async fn create_card(&self, project: &str, input: NewCard) -> Result<Card, StorageError> {
        let title = input.title.trim().to_string();
        if title.is_empty() {
            return Err(validation("title is required"));
        }
        let config = self.read_project_config(project).await?;
        let lane = input.lane.clone().unwrap_or_else(|| config.default_lane());
        ensure_segment(&lane, "lane")?;

        let base = match slugify(&title) {
            s if s.is_empty() => "card".to_string(),
            s => s,
        };

        // Claim a free slug and keep holding its lock while the file is written.
        let mut n = 1;
        let (slug, _guard) = loop {
            let candidate = if n == 1 { base.clone() } else { format!("{base}-{n}") };
            let guard = self.locks.acquire(LockKey::card(project, &candidate)).await;
            if self.locate_with(project, &candidate, &config).await?.is_none() {
                break (candidate, guard);
            }
            n += 1;
        };

        let now = now_iso();
        let mut frontmatter = CardFrontmatter::new(title, &now);
        frontmatter.status = input.status;
        frontmatter.priority = input.priority;
        frontmatter.assignee = input.assignee;
        frontmatter.tags = input.tags.filter(|tags| !tags.is_empty());
        frontmatter.blocked_reason = input.blocked_reason;
        frontmatter.due_date = input.due_date;
        frontmatter.card_number = self.claim_card_number(project).await;

        let mut body = input.content.unwrap_or_default();
        let texts: Vec<&str> = input
            .tasks
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if !texts.is_empty() {
            let ledger = frontmatter.task_meta.get_or_insert_with(Vec::new);
            ledger.resize(parser::parse_tasks(&body).len(), TaskMeta::untracked());
            for text in &texts {
                let (next, index) = parser::append_task(&body, text);
                body = next;
                ledger.insert(index, TaskMeta::added(&now));
            }
        }

        let path = self.card_path(project, &lane, &slug);
        self.write_card(&path, &frontmatter, &body).await?;
        let filename = card_filename(&slug);
        self.update_order(project, &lane, |o| order::insert_at(o, &filename, None))
            .await?;

        log::info!("[markban.store.create] Created {}/{}/{}", project, lane, slug);
        let parsed = ParsedCard {
            tasks: parser::tasks_with_meta(&body, &frontmatter),
            frontmatter,
            body,
        };
        Ok(Self::build_card(&config, &lane, &slug, parsed))
    }

    /// Take the project's next card number and advance the counter.
    /// Failures are logged and yield `None`: numbering is a convenience.
    async fn claim_card_number(&self, project: &str) -> Option<u64> {
        let _guard = self.locks.acquire(LockKey::project_config(project)).await;
        let mut config = match self.read_project_config(project).await {
            Ok(config) => config,
            Err(e) => {
                log::warn!("[markban.store.counter] Cannot read counter for {}: {}", project, e);
                return None;
            }
        };
        let number = config.next_card_number.unwrap_or(1);
        config.next_card_number = Some(number + 1);
        match self.write_project_config(project, &config).await {
            Ok(()) => Some(number),
            Err(e) => {
                log::warn!("[markban.store.counter] Cannot advance counter for {}: {}", project, e);
                None
            }
        }
    }

    pub async fn update_card(
        &self,
        project: &str,
        slug: &str,
        patch: CardPatch,
    ) -> Result<Card, StorageError> {
        let config = self.read_project_config(project).await?;
        let _guard = self.locks.acquire(LockKey::card(project, slug)).await;
        let lane = self.require_lane(project, slug, &config).await?;
        let path = self.card_path(project, &lane, slug);
        let ParsedCard {
            mut frontmatter,
            mut body,
            tasks: old_tasks,
        } = self.read_parsed(&path).await?;

        if let Some(title) = patch.title {
            let title = title.trim();
            if title.is_empty() {
                return Err(validation("title must not be empty"));
            }
            frontmatter.title = title.to_string();
        }
        merge_field(&mut frontmatter.status, patch.status);
        merge_field(&mut frontmatter.priority, patch.priority);
        merge_field(&mut frontmatter.assignee, patch.assignee);
        merge_field(&mut frontmatter.tags, patch.tags);
        merge_field(&mut frontmatter.blocked_reason, patch.blocked_reason);
        merge_field(&mut frontmatter.due_date, patch.due_date);

        let now = timestamp_after(&frontmatter.updated);
        if let Some(content) = patch.content {
            body = parser::preserve_checklist(&body, &content);
            let new_tasks = parser::parse_tasks(&body);
            if frontmatter.task_meta.is_some() || !new_tasks.is_empty() {
                frontmatter.task_meta = Some(rebuild_task_meta(&old_tasks, &new_tasks, &now));
            }
        }
        frontmatter.updated = now;

        self.write_card(&path, &frontmatter, &body).await?;
        log::info!("[markban.store.update] Updated {}/{}/{}", project, lane, slug);

        let parsed = ParsedCard {
            tasks: parser::tasks_with_meta(&body, &frontmatter),
            frontmatter,
            body,
        };
        Ok(Self::build_card(&config, &lane, slug, parsed))
    }

    /// Move a card to `target_lane` (or reposition it within its lane).
    /// Returns the card and the lane it came from.
    pub async fn move_card(
        &self,
        project: &str,
        slug: &str,
        target_lane: &str,
        position: Option<usize>,
    ) -> Result<(Card, String), StorageError> {
        let config = self.read_project_config(project).await?;
        ensure_segment(target_lane, "lane")?;
        let _guard = self.locks.acquire(LockKey::card(project, slug)).await;
        let from = self.require_lane(project, slug, &config).await?;
        let source = self.card_path(project, &from, slug);
        let mut parsed = self.read_parsed(&source).await?;
        parsed.frontmatter.updated = timestamp_after(&parsed.frontmatter.updated);

        let target = self.card_path(project, target_lane, slug);
        self.write_card(&target, &parsed.frontmatter, &parsed.body)
            .await?;

        let filename = card_filename(slug);
        if from != target_lane {
            self.update_order(project, &from, |o| o.retain(|name| name != &filename))
                .await?;
            self.remove_file(&source).await?;
        }
        self.update_order(project, target_lane, |o| {
            order::insert_at(o, &filename, position)
        })
        .await?;

        log::info!(
            "[markban.store.move] Moved {}/{} {} -> {}",
            project,
            slug,
            from,
            target_lane
        );
        Ok((Self::build_card(&config, target_lane, slug, parsed), from))
    }

    /// Move a card into the project's archive lane.
    pub async fn archive_card(
        &self,
        project: &str,
        slug: &str,
    ) -> Result<(Card, String), StorageError> {
        let config = self.read_project_config(project).await?;
        self.move_card(project, slug, &config.archive_lane(), None)
            .await
    }

    /// Permanently delete a card. Returns the lane it was in.
    pub async fn delete_card(&self, project: &str, slug: &str) -> Result<String, StorageError> {
        let config = self.read_project_config(project).await?;
        let _guard = self.locks.acquire(LockKey::card(project, slug)).await;
        let lane = self.require_lane(project, slug, &config).await?;
        self.remove_file(&self.card_path(project, &lane, slug))
            .await?;
        let filename = card_filename(slug);
        self.update_order(project, &lane, |o| o.retain(|name| name != &filename))
            .await?;
        log::info!("[markban.store.delete] Deleted {}/{}/{}", project, lane, slug);
        Ok(lane)
    }

    /// Replace a lane's order. Unlisted cards follow alphabetically.
    pub async fn reorder_cards(
        &self,
        project: &str,
        lane: &str,
        explicit: &[String],
    ) -> Result<Vec<String>, StorageError> {
        self.read_project_config(project).await?;
        ensure_segment(lane, "lane")?;
        for filename in explicit {
            ensure_segment(filename, "filename")?;
        }

        let _guard = self.locks.acquire(LockKey::lane_order(project, lane)).await;
        let files = order::list_card_files(&self.lane_dir(project, lane)).await?;
        let resolved = order::apply_explicit_order(explicit, &files).map_err(|filename| {
            StorageError::CardNotInLane {
                lane: lane.to_string(),
                filename,
            }
        })?;
        tokio::fs::create_dir_all(self.lane_dir(project, lane)).await?;
        self.write_json(&self.order_path(project, lane), &resolved)
            .await?;
        Ok(resolved)
    }

    // ── Task operations ─────────────────────────────────────────────────

    /// Append a checklist item. Returns the card and the new task's index.
    pub async fn add_task(
        &self,
        project: &str,
        slug: &str,
        text: &str,
    ) -> Result<(Card, usize), StorageError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(validation("task text is required"));
        }
        let config = self.read_project_config(project).await?;
        let _guard = self.locks.acquire(LockKey::card(project, slug)).await;
        let lane = self.require_lane(project, slug, &config).await?;
        let path = self.card_path(project, &lane, slug);
        let ParsedCard {
            mut frontmatter,
            body,
            tasks,
        } = self.read_parsed(&path).await?;

        let (body, index) = parser::append_task(&body, text);
        let now = timestamp_after(&frontmatter.updated);
        let ledger = frontmatter.task_meta.get_or_insert_with(Vec::new);
        ledger.resize(tasks.len(), TaskMeta::untracked());
        ledger.insert(index, TaskMeta::added(&now));
        frontmatter.updated = now;

        self.write_card(&path, &frontmatter, &body).await?;
        let parsed = ParsedCard {
            tasks: parser::tasks_with_meta(&body, &frontmatter),
            frontmatter,
            body,
        };
        Ok((Self::build_card(&config, &lane, slug, parsed), index))
    }

    /// Set (or, with `checked = None`, flip) the checkbox of task `index`.
    pub async fn toggle_task(
        &self,
        project: &str,
        slug: &str,
        index: usize,
        checked: Option<bool>,
    ) -> Result<Card, StorageError> {
        let config = self.read_project_config(project).await?;
        let _guard = self.locks.acquire(LockKey::card(project, slug)).await;
        let lane = self.require_lane(project, slug, &config).await?;
        let path = self.card_path(project, &lane, slug);
        let ParsedCard {
            mut frontmatter,
            body,
            tasks,
        } = self.read_parsed(&path).await?;

        let not_found = || StorageError::TaskNotFound {
            card: slug.to_string(),
            index,
            count: tasks.len(),
        };
        let current = tasks.get(index).ok_or_else(not_found)?;
        let checked = checked.unwrap_or(!current.checked);
        if checked == current.checked {
            log::debug!(
                "[markban.store.task] {}/{} task {} already {}",
                project,
                slug,
                index,
                if checked { "checked" } else { "unchecked" }
            );
            let parsed = ParsedCard {
                frontmatter,
                body,
                tasks,
            };
            return Ok(Self::build_card(&config, &lane, slug, parsed));
        }
        let body = parser::set_task_checked(&body, index, checked).map_err(|e| match e {
            ParseError::TaskIndexNotFound { .. } => not_found(),
            other => StorageError::InvalidFrontmatter {
                path: path.display().to_string(),
                source: other,
            },
        })?;

        let now = timestamp_after(&frontmatter.updated);
        let ledger = frontmatter.task_meta.get_or_insert_with(Vec::new);
        if ledger.len() <= index {
            ledger.resize(index + 1, TaskMeta::untracked());
        }
        ledger[index].completed_at = checked.then(|| now.clone());
        frontmatter.updated = now;

        self.write_card(&path, &frontmatter, &body).await?;
        let parsed = ParsedCard {
            tasks: parser::tasks_with_meta(&body, &frontmatter),
            frontmatter,
            body,
        };
        Ok(Self::build_card(&config, &lane, slug, parsed))
    }
}

impl TaskMeta {
    fn untracked() -> Self {
        Self {
            added_at: None,
            completed_at: None,
        }
    }

    fn added(at: &str) -> Self {
        Self {
            added_at: Some(at.to_string()),
            completed_at: None,
        }
    }
}

/// Ledger for a replaced body. An entry survives only where the task at the
/// same position still has the same text; completion follows the checkbox.
fn rebuild_task_meta(old_tasks: &[Task], new_tasks: &[Task], now: &str) -> Vec<TaskMeta> {
    new_tasks
        .iter()
        .map(|task| {
            let kept = old_tasks
                .get(task.index)
                .filter(|old| old.text == task.text);
            let added_at = match kept {
                Some(old) => old.added_at.clone(),
                None => Some(now.to_string()),
            };
            let completed_at = if !task.checked {
                None
            } else {
                kept.and_then(|old| old.completed_at.clone())
                    .or_else(|| Some(now.to_string()))
            };
            TaskMeta {
                added_at,
                completed_at,
            }
        })
        .collect()
}

pub fn card_filename(slug: &str) -> String {
    format!("{}.{}", slug, CARD_EXTENSION)
}

fn slug_from_filename(filename: &str) -> &str {
    filename
        .strip_suffix(CARD_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(filename)
}

fn ensure_segment(value: &str, what: &str) -> Result<(), StorageError> {
    if is_valid_segment(value) {
        Ok(())
    } else {
        Err(validation(format!("invalid {}: {:?}", what, value)))
    }
}

/// Apply one field of a patch: absent keeps, null clears, value replaces.
fn merge_field<T>(field: &mut Option<T>, patch: Option<Option<T>>) {
    if let Some(value) = patch {
        *field = value;
    }
}

/// Atomic write with fsync: write to .tmp, fsync, rename, fsync directory.
/// Refuses to write empty content over a non-empty file (data safety).
fn atomic_write(path: &Path, content: &str) -> Result<(), std::io::Error> {
    if content.trim().is_empty() {
        if let Ok(existing) = fs::read_to_string(path) {
            if !existing.trim().is_empty() {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    "Refusing to overwrite non-empty file with empty content",
                ));
            }
        }
    }

    let tmp_path = path.with_extension(TEMP_EXTENSION);
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;

    if let Some(dir) = path.parent() {
        if let Ok(d) = fs::File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn store_with_project() -> (TempDir, CardStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CardStore::new(dir.path());
        store
            .create_project(NewProject {
                name: "Test Project".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        (dir, store)
    }

    fn new_card(title: &str) -> NewCard {
        NewCard {
            title: title.into(),
            ..Default::default()
        }
    }

    const P: &str = "test-project";

    #[tokio::test]
    async fn test_create_defaults_to_upcoming_lane() {
        let (_dir, store) = store_with_project().await;
        store.create_card(P, new_card("Test Card")).await.unwrap();

        let card = store.get_card(P, "test-card").await.unwrap();
        assert_eq!(card.lane, DEFAULT_LANE);
        assert_eq!(card.slug, "test-card");
        assert!(card.tasks.is_empty());
        assert_eq!(card.frontmatter.created, card.frontmatter.updated);
        assert_eq!(card.frontmatter.card_number, Some(1));
        assert_eq!(card.card_ref.as_deref(), Some("TP-1"));
    }

    #[tokio::test]
    async fn test_custom_lanes_keep_order_and_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = CardStore::new(dir.path());
        let lane = |name: &str| LaneConfig {
            display_name: name.into(),
            color: "#000000".into(),
            collapsed: false,
        };
        let mut lanes = LaneMap::new();
        lanes.insert("todo".into(), lane("Todo"));
        lanes.insert("doing".into(), lane("Doing"));
        lanes.insert("done".into(), lane("Done"));
        store
            .create_project(NewProject {
                name: "Flow".into(),
                lanes: Some(lanes),
                ..Default::default()
            })
            .await
            .unwrap();

        let card = store.create_card("flow", new_card("First")).await.unwrap();
        assert_eq!(card.lane, "todo");
        assert!(!dir.path().join("flow").join(DEFAULT_LANE).exists());

        let raw = std::fs::read_to_string(dir.path().join("flow").join(PROJECT_FILE)).unwrap();
        let todo = raw.find("\"todo\"").unwrap();
        let doing = raw.find("\"doing\"").unwrap();
        let done = raw.find("\"done\"").unwrap();
        assert!(todo < doing && doing < done, "lane order lost: {raw}");

        let project = store.get_project("flow").await.unwrap();
        let keys: Vec<&str> = project.config.lanes.keys().map(String::as_str).collect();
        assert_eq!(keys, ["todo", "doing", "done"]);
    }

    #[tokio::test]
    async fn test_create_requires_title() {
        let (_dir, store) = store_with_project().await;
        let err = store.create_card(P, new_card("   ")).await.unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let dir = tempfile::tempdir().unwrap();
        let store = CardStore::new(dir.path());
        assert!(matches!(
            store.create_card("nope", new_card("x")).await,
            Err(StorageError::ProjectNotFound(_))
        ));
        assert!(matches!(
            store.get_card("nope", "x").await,
            Err(StorageError::ProjectNotFound(_))
        ));
        assert!(matches!(
            store.list_cards("nope", &ListFilter::default()).await,
            Err(StorageError::ProjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_slug_uniqueness_across_lanes() {
        let (_dir, store) = store_with_project().await;
        let mut slugs = Vec::new();
        for i in 0..4 {
            let mut input = new_card("Same Title");
            if i % 2 == 1 {
                input.lane = Some("02-in-progress".into());
            }
            slugs.push(store.create_card(P, input).await.unwrap().slug);
        }
        assert_eq!(
            slugs,
            vec!["same-title", "same-title-2", "same-title-3", "same-title-4"]
        );
        let numbers: Vec<_> = {
            let mut cards = Vec::new();
            for slug in &slugs {
                cards.push(store.get_card(P, slug).await.unwrap().frontmatter.card_number);
            }
            cards
        };
        assert_eq!(numbers, vec![Some(1), Some(2), Some(3), Some(4)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_get_distinct_slugs_and_numbers() {
        let (_dir, store) = store_with_project().await;
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..6 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create_card(P, new_card("Race")).await.unwrap()
            }));
        }
        let mut slugs = Vec::new();
        let mut numbers = Vec::new();
        for h in handles {
            let card = h.await.unwrap();
            slugs.push(card.slug);
            numbers.push(card.frontmatter.card_number.unwrap());
        }
        slugs.sort();
        slugs.dedup();
        numbers.sort();
        numbers.dedup();
        assert_eq!(slugs.len(), 6);
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);

        let listed = store
            .list_cards(P, &ListFilter::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 6);
    }

    #[tokio::test]
    async fn test_tasks_survive_title_only_update() {
        let (_dir, store) = store_with_project().await;
        let card = store.create_card(P, new_card("Card")).await.unwrap();
        store.add_task(P, &card.slug, "Alpha").await.unwrap();
        store.add_task(P, &card.slug, "Beta").await.unwrap();
        store.toggle_task(P, &card.slug, 0, Some(true)).await.unwrap();
        let before = store.get_card(P, &card.slug).await.unwrap();

        store
            .update_card(
                P,
                &card.slug,
                CardPatch {
                    title: Some("Renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let after = store.get_card(P, &card.slug).await.unwrap();
        assert_eq!(after.frontmatter.title, "Renamed");
        assert_eq!(after.tasks.len(), 2);
        assert!(after.tasks[0].checked);
        assert!(!after.tasks[1].checked);
        assert_eq!(after.body, before.body);
        assert!(after.frontmatter.updated > before.frontmatter.updated);
        assert!(after.tasks[0].completed_at.is_some());
        assert!(after.tasks[1].added_at.is_some());
    }

    #[tokio::test]
    async fn test_frontmatter_update_preserves_body_bytes() {
        let (dir, store) = store_with_project().await;
        let card = store
            .create_card(
                P,
                NewCard {
                    title: "Body".into(),
                    content: Some("Intro  \n\n  - [X] odd  spacing\n\ttrailing\t\n".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let updated = store
            .update_card(
                P,
                &card.slug,
                CardPatch {
                    priority: Some(Some(Priority::High)),
                    tags: Some(Some(vec!["a".into()])),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.body, card.body);
        let raw =
            std::fs::read_to_string(dir.path().join(P).join(DEFAULT_LANE).join("body.md"))
                .unwrap();
        assert!(raw.ends_with("Intro  \n\n  - [X] odd  spacing\n\ttrailing\t\n"));
    }

    #[tokio::test]
    async fn test_patch_null_clears_and_absent_keeps() {
        let (_dir, store) = store_with_project().await;
        let card = store
            .create_card(
                P,
                NewCard {
                    title: "Fields".into(),
                    status: Some(CardStatus::Blocked),
                    priority: Some(Priority::Low),
                    blocked_reason: Some("waiting".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let updated = store
            .update_card(
                P,
                &card.slug,
                CardPatch {
                    status: Some(None),
                    blocked_reason: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.frontmatter.status, None);
        assert_eq!(updated.frontmatter.blocked_reason, None);
        assert_eq!(updated.frontmatter.priority, Some(Priority::Low));
        assert_eq!(updated.lane, card.lane);

        let err = store
            .update_card(
                P,
                &card.slug,
                CardPatch {
                    title: Some(" ".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[tokio::test]
    async fn test_body_replacement_keeps_checklist() {
        let (_dir, store) = store_with_project().await;
        let card = store.create_card(P, new_card("Keep")).await.unwrap();
        store.add_task(P, &card.slug, "one").await.unwrap();
        store.add_task(P, &card.slug, "two").await.unwrap();
        store.toggle_task(P, &card.slug, 1, None).await.unwrap();
        let before = store.get_card(P, &card.slug).await.unwrap();

        let after = store
            .update_card(
                P,
                &card.slug,
                CardPatch {
                    content: Some("A completely new description.".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(after.body.starts_with("A completely new description."));
        assert!(after.body.contains("## Tasks"));
        assert!(after.body.contains("- [ ] one"));
        assert!(after.body.contains("- [x] two"));
        let strip = |tasks: &[Task]| {
            tasks
                .iter()
                .map(|t| (t.text.clone(), t.checked))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(&after.tasks), strip(&before.tasks));
    }

    #[tokio::test]
    async fn test_body_replacement_with_own_checklist_resets_ledger() {
        let (_dir, store) = store_with_project().await;
        let card = store.create_card(P, new_card("Swap")).await.unwrap();
        store.add_task(P, &card.slug, "old").await.unwrap();
        store.add_task(P, &card.slug, "kept").await.unwrap();
        store.toggle_task(P, &card.slug, 0, Some(true)).await.unwrap();
        store.toggle_task(P, &card.slug, 1, Some(true)).await.unwrap();
        let before = store.get_card(P, &card.slug).await.unwrap();

        let after = store
            .update_card(
                P,
                &card.slug,
                CardPatch {
                    content: Some("New\n\n## Tasks\n- [ ] fresh\n- [x] kept\n- [x] extra\n".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(after.tasks.len(), 3);

        let fresh = &after.tasks[0];
        assert_eq!(fresh.text, "fresh");
        assert!(!fresh.checked);
        assert!(fresh.completed_at.is_none());
        assert_eq!(fresh.added_at.as_deref(), Some(after.frontmatter.updated.as_str()));

        assert_eq!(after.tasks[1].added_at, before.tasks[1].added_at);
        assert_eq!(after.tasks[1].completed_at, before.tasks[1].completed_at);

        assert!(after.tasks[2].checked);
        assert!(after.tasks[2].completed_at.is_some());
        assert_eq!(after.frontmatter.task_meta.as_ref().map(Vec::len), Some(3));

        let fetched = store.get_card(P, &card.slug).await.unwrap();
        assert_eq!(fetched.tasks, after.tasks);
    }

    #[tokio::test]
    async fn test_add_task_with_checklist_below_section() {
        let (_dir, store) = store_with_project().await;
        let card = store
            .create_card(
                P,
                NewCard {
                    title: "Notes".into(),
                    content: Some("## Tasks\n- [ ] a\n\n## Notes\n- [ ] note\n".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (card, index) = store.add_task(P, &card.slug, "b").await.unwrap();
        assert_eq!(index, 1);
        assert_eq!(card.tasks[index].text, "b");
        assert!(card.tasks[index].added_at.is_some());
        assert!(card.tasks[0].added_at.is_none());
        assert_eq!(card.tasks[2].text, "note");
        assert!(card.tasks[2].added_at.is_none());

        let card = store.toggle_task(P, &card.slug, 2, Some(true)).await.unwrap();
        assert!(card.tasks[2].completed_at.is_some());
        assert!(card.tasks[1].completed_at.is_none());
    }

    #[tokio::test]
    async fn test_toggle_out_of_range() {
        let (_dir, store) = store_with_project().await;
        let card = store.create_card(P, new_card("T")).await.unwrap();
        store.add_task(P, &card.slug, "only").await.unwrap();
        let err = store.toggle_task(P, &card.slug, 1, Some(true)).await.unwrap_err();
        assert!(matches!(err, StorageError::TaskNotFound { index: 1, count: 1, .. }));

        let card = store.toggle_task(P, &card.slug, 0, Some(true)).await.unwrap();
        assert!(card.tasks[0].completed_at.is_some());
        let card = store.toggle_task(P, &card.slug, 0, Some(false)).await.unwrap();
        assert!(card.tasks[0].completed_at.is_none());
    }

    #[tokio::test]
    async fn test_toggle_to_same_state_keeps_timestamps() {
        let (_dir, store) = store_with_project().await;
        let card = store.create_card(P, new_card("Steady")).await.unwrap();
        store.add_task(P, &card.slug, "only").await.unwrap();
        let first = store.toggle_task(P, &card.slug, 0, Some(true)).await.unwrap();

        let again = store.toggle_task(P, &card.slug, 0, Some(true)).await.unwrap();
        assert!(again.tasks[0].checked);
        assert_eq!(again.tasks[0].completed_at, first.tasks[0].completed_at);
        assert_eq!(again.frontmatter.updated, first.frontmatter.updated);
        assert_eq!(again.body, first.body);
    }

    #[tokio::test]
    async fn test_add_task_validation() {
        let (_dir, store) = store_with_project().await;
        let card = store.create_card(P, new_card("T")).await.unwrap();
        assert!(matches!(
            store.add_task(P, &card.slug, "  ").await,
            Err(StorageError::Validation(_))
        ));
        assert!(matches!(
            store.add_task(P, "missing", "x").await,
            Err(StorageError::CardNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_task_no_lost_update() {
        let (_dir, store) = store_with_project().await;
        let store = Arc::new(store);
        let card = store.create_card(P, new_card("Busy")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let slug = card.slug.clone();
            handles.push(tokio::spawn(async move {
                store.add_task(P, &slug, &format!("task {i}")).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let card = store.get_card(P, &card.slug).await.unwrap();
        assert_eq!(card.tasks.len(), 8);
        let mut texts: Vec<_> = card.tasks.iter().map(|t| t.text.clone()).collect();
        texts.sort();
        let mut expected: Vec<_> = (0..8).map(|i| format!("task {i}")).collect();
        expected.sort();
        assert_eq!(texts, expected);
        assert_eq!(card.frontmatter.task_meta.as_ref().map(Vec::len), Some(8));
    }

    #[tokio::test]
    async fn test_toggle_racing_metadata_update() {
        let (_dir, store) = store_with_project().await;
        let store = Arc::new(store);
        let card = store.create_card(P, new_card("Race")).await.unwrap();
        store.add_task(P, &card.slug, "a").await.unwrap();

        let s1 = store.clone();
        let s2 = store.clone();
        let slug1 = card.slug.clone();
        let slug2 = card.slug.clone();
        let (toggled, patched) = tokio::join!(
            async move { s1.toggle_task(P, &slug1, 0, Some(true)).await },
            async move {
                s2.update_card(
                    P,
                    &slug2,
                    CardPatch {
                        priority: Some(Some(Priority::Medium)),
                        ..Default::default()
                    },
                )
                .await
            }
        );
        toggled.unwrap();
        patched.unwrap();

        let card = store.get_card(P, &card.slug).await.unwrap();
        assert!(card.tasks[0].checked);
        assert_eq!(card.frontmatter.priority, Some(Priority::Medium));
    }

    #[tokio::test]
    async fn test_list_follows_order_file() {
        let (dir, store) = store_with_project().await;
        for title in ["a", "b", "c"] {
            store.create_card(P, new_card(title)).await.unwrap();
        }
        let lane_dir = dir.path().join(P).join(DEFAULT_LANE);
        std::fs::write(lane_dir.join("_order.json"), r#"["c.md","ghost.md","a.md"]"#).unwrap();
        // Untracked file dropped in by hand.
        std::fs::write(
            lane_dir.join("aa.md"),
            "---\ntitle: AA\ncreated: 2024-01-01T00:00:00.000Z\nupdated: 2024-01-01T00:00:00.000Z\n---\n\n",
        )
        .unwrap();

        let filter = ListFilter {
            lane: Some(DEFAULT_LANE.into()),
            ..Default::default()
        };
        let listed: Vec<_> = store
            .list_cards(P, &filter)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.filename)
            .collect();
        assert_eq!(listed, vec!["c.md", "a.md", "aa.md", "b.md"]);
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_cards_and_filters() {
        let (dir, store) = store_with_project().await;
        store.create_card(P, new_card("fresh")).await.unwrap();
        let lane_dir = dir.path().join(P).join(DEFAULT_LANE);
        std::fs::write(lane_dir.join("broken.md"), "no frontmatter here").unwrap();
        std::fs::write(
            lane_dir.join("old.md"),
            "---\ntitle: Old\ncreated: 2020-01-01T00:00:00.000Z\nupdated: 2020-01-01T00:00:00.000Z\n---\n\n- [x] done\n- [ ] open\n",
        )
        .unwrap();

        let all = store.list_cards(P, &ListFilter::default()).await.unwrap();
        let mut slugs: Vec<_> = all.iter().map(|c| c.slug.as_str()).collect();
        slugs.sort();
        assert_eq!(slugs, vec!["fresh", "old"]);
        let old = all.iter().find(|c| c.slug == "old").unwrap();
        assert_eq!(old.task_progress, TaskProgress { total: 2, checked: 1 });

        let stale = store
            .list_cards(
                P,
                &ListFilter {
                    stale_days: Some(30),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].slug, "old");

        let recent = store
            .list_cards(
                P,
                &ListFilter {
                    since: Some(Utc::now() - Duration::days(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].slug, "fresh");

        assert!(matches!(
            store.get_card(P, "broken").await,
            Err(StorageError::InvalidFrontmatter { .. })
        ));
    }

    #[tokio::test]
    async fn test_move_between_lanes() {
        let (dir, store) = store_with_project().await;
        let a = store.create_card(P, new_card("a")).await.unwrap();
        store
            .create_card(
                P,
                NewCard {
                    title: "x".into(),
                    lane: Some("02-in-progress".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .create_card(
                P,
                NewCard {
                    title: "y".into(),
                    lane: Some("02-in-progress".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (moved, from) = store
            .move_card(P, &a.slug, "02-in-progress", Some(1))
            .await
            .unwrap();
        assert_eq!(from, DEFAULT_LANE);
        assert_eq!(moved.lane, "02-in-progress");
        assert!(moved.frontmatter.updated > a.frontmatter.updated);

        let fetched = store.get_card(P, "a").await.unwrap();
        assert_eq!(fetched.lane, "02-in-progress");
        assert!(!dir.path().join(P).join(DEFAULT_LANE).join("a.md").exists());

        let upcoming = store
            .list_cards(
                P,
                &ListFilter {
                    lane: Some(DEFAULT_LANE.into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(upcoming.is_empty());

        let root = dir.path().join(P);
        let order: Vec<String> = serde_json::from_str(
            &std::fs::read_to_string(root.join("02-in-progress").join("_order.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(order, vec!["x.md", "a.md", "y.md"]);
        let source_order: Vec<String> = serde_json::from_str(
            &std::fs::read_to_string(root.join(DEFAULT_LANE).join("_order.json")).unwrap(),
        )
        .unwrap();
        assert!(source_order.is_empty());
    }

    #[tokio::test]
    async fn test_move_within_lane_repositions() {
        let (_dir, store) = store_with_project().await;
        for title in ["a", "b", "c"] {
            store.create_card(P, new_card(title)).await.unwrap();
        }
        store.move_card(P, "c", DEFAULT_LANE, Some(0)).await.unwrap();
        let order = store.read_lane_order(P, DEFAULT_LANE).await.unwrap();
        assert_eq!(order, vec!["c.md", "a.md", "b.md"]);

        // Out-of-range position appends.
        store.move_card(P, "c", DEFAULT_LANE, Some(42)).await.unwrap();
        let order = store.read_lane_order(P, DEFAULT_LANE).await.unwrap();
        assert_eq!(order, vec!["a.md", "b.md", "c.md"]);
    }

    #[tokio::test]
    async fn test_move_creates_missing_lane_and_archive() {
        let (dir, store) = store_with_project().await;
        store.create_card(P, new_card("m")).await.unwrap();
        store.move_card(P, "m", "99-someday", None).await.unwrap();
        assert!(dir.path().join(P).join("99-someday").join("m.md").exists());
        assert_eq!(store.get_card(P, "m").await.unwrap().lane, "99-someday");

        let (archived, from) = store.archive_card(P, "m").await.unwrap();
        assert_eq!(from, "99-someday");
        assert_eq!(archived.lane, "04-archive");
    }

    #[tokio::test]
    async fn test_move_rejects_bad_lane() {
        let (_dir, store) = store_with_project().await;
        store.create_card(P, new_card("m")).await.unwrap();
        assert!(matches!(
            store.move_card(P, "m", "../escape", None).await,
            Err(StorageError::Validation(_))
        ));
        assert!(matches!(
            store.move_card(P, "nope", "02-in-progress", None).await,
            Err(StorageError::CardNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_card() {
        let (dir, store) = store_with_project().await;
        store.create_card(P, new_card("a")).await.unwrap();
        store.create_card(P, new_card("b")).await.unwrap();
        let lane = store.delete_card(P, "a").await.unwrap();
        assert_eq!(lane, DEFAULT_LANE);
        assert!(!dir.path().join(P).join(DEFAULT_LANE).join("a.md").exists());
        assert_eq!(store.read_lane_order(P, DEFAULT_LANE).await.unwrap(), vec!["b.md"]);
        assert!(matches!(
            store.delete_card(P, "a").await,
            Err(StorageError::CardNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reorder_scenario() {
        let (_dir, store) = store_with_project().await;
        for title in ["a", "b", "c"] {
            store.create_card(P, new_card(title)).await.unwrap();
        }
        let order = store
            .reorder_cards(P, DEFAULT_LANE, &["c.md".to_string()])
            .await
            .unwrap();
        assert_eq!(order, vec!["c.md", "a.md", "b.md"]);
        assert_eq!(store.read_lane_order(P, DEFAULT_LANE).await.unwrap(), order);
    }

    #[tokio::test]
    async fn test_reorder_rejects_unknown_file() {
        let (_dir, store) = store_with_project().await;
        store.create_card(P, new_card("a")).await.unwrap();
        let err = store
            .reorder_cards(P, DEFAULT_LANE, &["a.md".to_string(), "ghost.md".to_string()])
            .await
            .unwrap_err();
        match err {
            StorageError::CardNotInLane { filename, .. } => assert_eq!(filename, "ghost.md"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            store.reorder_cards(P, DEFAULT_LANE, &["../x.md".to_string()]).await,
            Err(StorageError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_with_initial_tasks() {
        let (_dir, store) = store_with_project().await;
        let card = store
            .create_card(
                P,
                NewCard {
                    title: "Seeded".into(),
                    content: Some("Details".into()),
                    tasks: vec!["one".into(), " ".into(), "two".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(card.tasks.len(), 2);
        assert!(card.tasks.iter().all(|t| t.added_at.is_some()));
        let fetched = store.get_card(P, "seeded").await.unwrap();
        assert_eq!(fetched.tasks, card.tasks);
        assert_eq!(fetched.body, "Details\n\n## Tasks\n\n- [ ] one\n- [ ] two\n");
    }

    #[tokio::test]
    async fn test_counter_failure_still_creates_card() {
        let (dir, store) = store_with_project().await;
        let config_path = dir.path().join(P).join(PROJECT_FILE);
        // A directory where the temp file should go makes the counter write fail.
        std::fs::create_dir(config_path.with_extension(TEMP_EXTENSION)).unwrap();

        let card = store.create_card(P, new_card("No number")).await.unwrap();
        assert_eq!(card.frontmatter.card_number, None);
        assert!(store.get_card(P, "no-number").await.is_ok());
    }

    #[tokio::test]
    async fn test_self_writes_are_recognised() {
        let (dir, store) = store_with_project().await;
        store.create_card(P, new_card("mine")).await.unwrap();
        let rel = Path::new(P).join(DEFAULT_LANE).join("mine.md");
        let content = std::fs::read_to_string(dir.path().join(&rel)).unwrap();
        assert!(store.is_self_write(&rel, &content));
        assert!(!store.is_self_write(&rel, &content));

        store.delete_card(P, "mine").await.unwrap();
        assert!(store.is_self_removal(&rel));
        assert!(!store.is_self_removal(&rel));
    }
}
