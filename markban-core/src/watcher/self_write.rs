/// Self-write tracker using SHA-256 fingerprints.
///
/// Before every atomic write the store registers the SHA-256 of the normalized
/// content under the file's workspace-relative path; before removing a file it
/// registers a tombstone. When the watcher sees a change it asks the tracker:
/// a match consumes the entry and the notification is suppressed (our own
/// write), no match means an external change.
/// TTL (10s) is cleanup only: entries are consumed on match regardless.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::types::ContentFingerprint;

const FINGERPRINT_TTL: Duration = Duration::from_secs(10);

/// Registering sweeps expired entries once the map grows past this.
const SWEEP_THRESHOLD: usize = 256;

struct PendingWrite {
    /// `None` marks a removal.
    fingerprint: Option<ContentFingerprint>,
    registered_at: Instant,
}

#[derive(Default)]
pub struct SelfWriteTracker {
    /// path -> pending writes (several writes can land before the watcher fires)
    pending: HashMap<PathBuf, Vec<PendingWrite>>,
}

impl SelfWriteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the content about to be written to `path`.
    pub fn register(&mut self, path: &Path, content: &str) {
        self.push(path, Some(ContentFingerprint::from_content(content)));
    }

    /// Register that `path` is about to be removed.
    pub fn register_removal(&mut self, path: &Path) {
        self.push(path, None);
    }

    fn push(&mut self, path: &Path, fingerprint: Option<ContentFingerprint>) {
        if self.pending.len() > SWEEP_THRESHOLD {
            self.cleanup_expired();
        }
        self.pending
            .entry(path.to_path_buf())
            .or_default()
            .push(PendingWrite {
                fingerprint,
                registered_at: Instant::now(),
            });
    }

    /// Whether `current_content` at `path` is one of our writes. Consumes the
    /// matching entry.
    pub fn check_and_consume(&mut self, path: &Path, current_content: &str) -> bool {
        let fingerprint = ContentFingerprint::from_content(current_content);
        self.consume(path, |entry| entry.fingerprint.as_ref() == Some(&fingerprint))
    }

    /// Whether the removal of `path` was ours. Consumes the tombstone.
    pub fn check_removal(&mut self, path: &Path) -> bool {
        self.consume(path, |entry| entry.fingerprint.is_none())
    }

    fn consume(&mut self, path: &Path, matches: impl Fn(&PendingWrite) -> bool) -> bool {
        let Some(entries) = self.pending.get_mut(path) else {
            return false;
        };
        let Some(pos) = entries.iter().position(matches) else {
            return false;
        };
        entries.remove(pos);
        if entries.is_empty() {
            self.pending.remove(path);
        }
        true
    }

    /// Remove expired entries (cleanup, not functional).
    pub fn cleanup_expired(&mut self) {
        let now = Instant::now();
        self.pending.retain(|_, entries| {
            entries.retain(|e| now.duration_since(e.registered_at) < FINGERPRINT_TTL);
            !entries.is_empty()
        });
    }

    pub fn has_pending(&self, path: &Path) -> bool {
        self.pending.get(path).is_some_and(|e| !e.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "demo/01-upcoming/card.md";

    #[test]
    fn test_register_and_match() {
        let mut tracker = SelfWriteTracker::new();
        let path = Path::new(PATH);
        let content = "---\ntitle: Card\n---\n\n- [ ] Task 1\n";

        tracker.register(path, content);
        assert!(tracker.has_pending(path));
        assert!(tracker.check_and_consume(path, content));
        assert!(!tracker.has_pending(path));
    }

    #[test]
    fn test_external_edit_is_not_suppressed() {
        let mut tracker = SelfWriteTracker::new();
        let path = Path::new(PATH);

        tracker.register(path, "ours");
        assert!(!tracker.check_and_consume(path, "theirs"));
        assert!(tracker.has_pending(path));
    }

    #[test]
    fn test_several_writes_before_the_watcher_fires() {
        let mut tracker = SelfWriteTracker::new();
        let path = Path::new(PATH);

        tracker.register(path, "v1");
        tracker.register(path, "v2");
        assert!(tracker.check_and_consume(path, "v2"));
        assert!(tracker.check_and_consume(path, "v1"));
        assert!(!tracker.has_pending(path));
    }

    #[test]
    fn test_crlf_content_matches() {
        let mut tracker = SelfWriteTracker::new();
        let path = Path::new(PATH);

        tracker.register(path, "line1\nline2");
        assert!(tracker.check_and_consume(path, "line1\r\nline2"));
    }

    #[test]
    fn test_removal_tombstones() {
        let mut tracker = SelfWriteTracker::new();
        let path = Path::new(PATH);

        assert!(!tracker.check_removal(path));
        tracker.register(path, "content");
        tracker.register_removal(path);
        assert!(tracker.check_removal(path));
        assert!(!tracker.check_removal(path));
        // The content fingerprint is untouched by the removal check.
        assert!(tracker.check_and_consume(path, "content"));
    }

    #[test]
    fn test_cleanup_expired() {
        let mut tracker = SelfWriteTracker::new();
        let path = Path::new(PATH);

        tracker.register(path, "content");
        if let Some(entries) = tracker.pending.get_mut(path) {
            entries[0].registered_at = Instant::now() - Duration::from_secs(15);
        }

        tracker.cleanup_expired();
        assert!(!tracker.has_pending(path));
    }
}
