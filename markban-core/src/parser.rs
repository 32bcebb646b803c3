/// Card file codec.
///
/// Handles the card format:
///   --- YAML frontmatter (title, created, updated, ...) ---
///   <blank line>
///   free-form markdown body
///   ## Tasks
///   - [ ] open item
///   - [x] done item
///
/// Everything here is pure string work: no I/O, no clocks.
use std::sync::LazyLock;

use regex::Regex;

use crate::types::{CardFrontmatter, Task, TaskProgress};

/// `- [ ] text` / `- [x] text` with any leading indentation.
static TASK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)-\s+\[([ xX])\]\s+(.*)$").unwrap());

/// Heading that opens a checklist section.
static CHECKLIST_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^#{1,6}\s+(tasks|checklist|todo)\s*:?\s*$").unwrap()
});

/// Any markdown ATX heading.
static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#{1,6}\s").unwrap());

/// Heading written by `append_task` when a body has no checklist section yet.
pub const CHECKLIST_HEADING: &str = "## Tasks";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Card has no frontmatter block")]
    MissingFrontmatter,

    #[error("Invalid frontmatter: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Task index {index} not found ({count} tasks)")]
    TaskIndexNotFound { index: usize, count: usize },
}

/// A card file split into its parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCard {
    pub frontmatter: CardFrontmatter,
    pub body: String,
    pub tasks: Vec<Task>,
}

/// Parse a raw card file.
pub fn parse_card(raw: &str) -> Result<ParsedCard, ParseError> {
    let (yaml, body) = split_frontmatter(raw).ok_or(ParseError::MissingFrontmatter)?;
    let frontmatter: CardFrontmatter = serde_yaml::from_str(yaml)?;
    let tasks = tasks_with_meta(body, &frontmatter);

    Ok(ParsedCard {
        frontmatter,
        body: body.to_string(),
        tasks,
    })
}

/// Serialize frontmatter and body back into a card file.
pub fn serialize_card(frontmatter: &CardFrontmatter, body: &str) -> Result<String, ParseError> {
    let yaml = serde_yaml::to_string(frontmatter)?;
    let mut out = String::with_capacity(yaml.len() + body.len() + 10);
    out.push_str("---\n");
    out.push_str(&yaml);
    if !yaml.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("---\n\n");
    out.push_str(body);
    Ok(out)
}

/// Split `raw` into (yaml, body). The blank line that conventionally follows
/// the closing delimiter is not part of the body.
fn split_frontmatter(raw: &str) -> Option<(&str, &str)> {
    let after_open = raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))?;

    let mut offset = 0;
    for line in after_open.split_inclusive('\n') {
        let bare = line.trim_end_matches('\n').trim_end_matches('\r');
        if bare == "---" {
            let yaml = &after_open[..offset];
            let rest = &after_open[offset + line.len()..];
            let body = rest
                .strip_prefix("\r\n")
                .or_else(|| rest.strip_prefix('\n'))
                .unwrap_or(rest);
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

/// Extract checklist items from a body, in document order.
pub fn parse_tasks(body: &str) -> Vec<Task> {
    body.lines()
        .filter_map(|line| TASK_RE.captures(line))
        .enumerate()
        .map(|(index, caps)| Task {
            index,
            text: caps[3].trim_end().to_string(),
            checked: !caps[2].trim().is_empty(),
            added_at: None,
            completed_at: None,
        })
        .collect()
}

/// Checklist items with their timestamps joined in from the frontmatter's
/// `taskMeta` ledger by position.
pub fn tasks_with_meta(body: &str, frontmatter: &CardFrontmatter) -> Vec<Task> {
    let mut tasks = parse_tasks(body);
    if let Some(meta) = &frontmatter.task_meta {
        for task in &mut tasks {
            if let Some(entry) = meta.get(task.index) {
                task.added_at = entry.added_at.clone();
                task.completed_at = entry.completed_at.clone();
            }
        }
    }
    tasks
}

/// Set the checkbox of the `index`-th checklist line. Only the marker
/// character changes; every other byte of the body is kept.
pub fn set_task_checked(body: &str, index: usize, checked: bool) -> Result<String, ParseError> {
    let mut seen = 0;
    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        let bare = line.trim_end_matches('\n').trim_end_matches('\r');
        if let Some(caps) = TASK_RE.captures(bare) {
            if seen == index {
                let marker = caps.get(2).map(|m| m.start()).unwrap_or_default();
                let is_checked = !caps[2].trim().is_empty();
                if is_checked == checked {
                    return Ok(body.to_string());
                }
                let pos = offset + marker;
                let mut out = String::with_capacity(body.len());
                out.push_str(&body[..pos]);
                out.push(if checked { 'x' } else { ' ' });
                out.push_str(&body[pos + 1..]);
                return Ok(out);
            }
            seen += 1;
        }
        offset += line.len();
    }
    Err(ParseError::TaskIndexNotFound { index, count: seen })
}

/// Append a checklist line at the end of the checklist section, creating the
/// section when the body has none. Returns the new body and the positional
/// index of the inserted task, which is not the last index when checklist
/// lines follow the section.
pub fn append_task(body: &str, text: &str) -> (String, usize) {
    let eol = if body.contains("\r\n") { "\r\n" } else { "\n" };
    let new_line = format!("- [ ] {}", text.trim());

    if body.trim().is_empty() {
        return (format!("{CHECKLIST_HEADING}{eol}{eol}{new_line}{eol}"), 0);
    }

    let Some((start, end)) = checklist_section(body) else {
        let index = parse_tasks(body).len();
        return (
            format!(
                "{}{eol}{eol}{CHECKLIST_HEADING}{eol}{eol}{new_line}{eol}",
                body.trim_end()
            ),
            index,
        );
    };

    // Insert after the last checklist line in the section, or right after the
    // heading when the section is still empty.
    let mut insert_at = None;
    let mut heading_end = None;
    let mut offset = start;
    for line in body[start..end].split_inclusive('\n') {
        let bare = line.trim_end_matches('\n').trim_end_matches('\r');
        if heading_end.is_none() {
            heading_end = Some(offset + line.len());
        } else if TASK_RE.is_match(bare) {
            insert_at = Some(offset + line.len());
        }
        offset += line.len();
    }
    let pos = insert_at.or(heading_end).unwrap_or(end);
    let index = parse_tasks(&body[..pos]).len();

    let mut out = String::with_capacity(body.len() + new_line.len() + 2);
    out.push_str(&body[..pos]);
    if !out.ends_with('\n') {
        out.push_str(eol);
    }
    out.push_str(&new_line);
    out.push_str(eol);
    out.push_str(&body[pos..]);
    (out, index)
}

/// Byte range of the checklist section: from its heading line to the next
/// heading (or the end of the body).
fn checklist_section(body: &str) -> Option<(usize, usize)> {
    let mut start = None;
    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        let bare = line.trim_end_matches('\n').trim_end_matches('\r');
        match start {
            None if CHECKLIST_HEADING_RE.is_match(bare) => start = Some(offset),
            Some(s) if HEADING_RE.is_match(bare) => return Some((s, offset)),
            _ => {}
        }
        offset += line.len();
    }
    start.map(|s| (s, body.len()))
}

/// Whether the body contains a checklist heading.
pub fn has_checklist_section(body: &str) -> bool {
    checklist_section(body).is_some()
}

/// Apply the body-replacement rule: a replacement without a checklist section
/// keeps the checklist section of the body it replaces.
pub fn preserve_checklist(old_body: &str, new_body: &str) -> String {
    if has_checklist_section(new_body) {
        return new_body.to_string();
    }
    let Some((start, end)) = checklist_section(old_body) else {
        return new_body.to_string();
    };
    let section = old_body[start..end].trim_end();
    let eol = if old_body.contains("\r\n") { "\r\n" } else { "\n" };
    if new_body.trim().is_empty() {
        format!("{section}{eol}")
    } else {
        format!("{}{eol}{eol}{section}{eol}", new_body.trim_end())
    }
}

pub fn task_progress(tasks: &[Task]) -> TaskProgress {
    TaskProgress {
        total: tasks.len(),
        checked: tasks.iter().filter(|t| t.checked).count(),
    }
}
