/// Path classification and fingerprints for the file watcher.
use std::path::{Component, Path};

use crate::storage::local::TEMP_EXTENSION;
use crate::types::{CARD_EXTENSION, ORDER_FILE, PROJECT_FILE};

/// SHA-256 fingerprint of file content, used for self-write detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentFingerprint(pub String);

impl ContentFingerprint {
    /// Compute SHA-256 fingerprint of content with normalized line endings.
    pub fn from_content(content: &str) -> Self {
        use sha2::{Digest, Sha256};
        let normalized = content.replace("\r\n", "\n");
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }
}

/// What a workspace-relative path refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// `<project>/_project.json`
    ProjectConfig { project: String },
    /// `<project>/<lane>/_order.json`
    LaneOrder { project: String, lane: String },
    /// `<project>/<lane>/<slug>.md`
    Card {
        project: String,
        lane: String,
        slug: String,
    },
}

const SCRATCH_SUFFIXES: &[&str] = &[".swp", ".swx", ".swo", ".tmp", ".bak", ".orig"];

/// Editor swap/backup files and in-flight atomic writes.
pub fn is_scratch_name(name: &str) -> bool {
    name.starts_with('.')
        || name.starts_with('~')
        || name.starts_with('#')
        || name.ends_with('~')
        || name == "4913"
        || SCRATCH_SUFFIXES.iter().any(|s| name.ends_with(s))
        || name
            .rsplit_once('.')
            .is_some_and(|(_, ext)| ext == TEMP_EXTENSION)
}

/// Classify a workspace-relative path. Scratch files, other files and deeper
/// nesting yield `None`.
pub fn classify(relative: &Path) -> Option<WatchTarget> {
    let segments: Vec<&str> = relative
        .components()
        .map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;

    let name = *segments.last()?;
    if is_scratch_name(name) || segments.iter().any(|s| s.starts_with('.')) {
        return None;
    }

    match segments.as_slice() {
        [project, file] if *file == PROJECT_FILE => Some(WatchTarget::ProjectConfig {
            project: project.to_string(),
        }),
        [project, lane, file] if *file == ORDER_FILE => Some(WatchTarget::LaneOrder {
            project: project.to_string(),
            lane: lane.to_string(),
        }),
        [project, lane, file] if !lane.starts_with('_') => {
            let slug = file
                .strip_suffix(CARD_EXTENSION)
                .and_then(|s| s.strip_suffix('.'))
                .filter(|s| !s.is_empty())?;
            Some(WatchTarget::Card {
                project: project.to_string(),
                lane: lane.to_string(),
                slug: slug.to_string(),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let fp1 = ContentFingerprint::from_content("hello world");
        let fp2 = ContentFingerprint::from_content("hello world");
        assert_eq!(fp1, fp2);
        assert_ne!(fp1, ContentFingerprint::from_content("hello"));
    }

    #[test]
    fn test_fingerprint_normalized_line_endings() {
        let fp1 = ContentFingerprint::from_content("line1\nline2");
        let fp2 = ContentFingerprint::from_content("line1\r\nline2");
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn test_scratch_names() {
        for name in [
            ".card.md.swp",
            "card.md.swp",
            "card.md~",
            "~lock.md",
            "#card.md#",
            "4913",
            "card.tmp",
            "card.bak",
            "card.orig",
            "card.markban-tmp",
        ] {
            assert!(is_scratch_name(name), "{name} should be scratch");
        }
        assert!(!is_scratch_name("card.md"));
        assert!(!is_scratch_name("_order.json"));
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(Path::new("demo/_project.json")),
            Some(WatchTarget::ProjectConfig {
                project: "demo".into()
            })
        );
        assert_eq!(
            classify(Path::new("demo/01-upcoming/_order.json")),
            Some(WatchTarget::LaneOrder {
                project: "demo".into(),
                lane: "01-upcoming".into()
            })
        );
        assert_eq!(
            classify(Path::new("demo/02-in-progress/fix-bug.md")),
            Some(WatchTarget::Card {
                project: "demo".into(),
                lane: "02-in-progress".into(),
                slug: "fix-bug".into()
            })
        );
    }

    #[test]
    fn test_classify_drops_everything_else() {
        for path in [
            "demo",
            "demo/_history.json",
            "demo/01-upcoming",
            "demo/01-upcoming/notes.txt",
            "demo/01-upcoming/.card.md.swp",
            "demo/01-upcoming/card.markban-tmp",
            "demo/01-upcoming/nested/card.md",
            "demo/.git/card.md",
            "demo/01-upcoming/.md",
            "_project.json",
        ] {
            assert_eq!(classify(Path::new(path)), None, "{path}");
        }
    }
}
