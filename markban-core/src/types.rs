use chrono::{DateTime, Duration, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

/// Lane a new card lands in when the caller does not name one.
pub const DEFAULT_LANE: &str = "01-upcoming";
/// Lane used by `archive_card` when the project config has no archive lane.
pub const DEFAULT_ARCHIVE_LANE: &str = "04-archive";

/// The four canonical lanes: (slug, display name, color).
pub const DEFAULT_LANES: &[(&str, &str, &str)] = &[
    ("01-upcoming", "Upcoming", "#6b7280"),
    ("02-in-progress", "In Progress", "#3b82f6"),
    ("03-complete", "Complete", "#22c55e"),
    ("04-archive", "Archive", "#9ca3af"),
];

pub const PROJECT_FILE: &str = "_project.json";
pub const ORDER_FILE: &str = "_order.json";
pub const HISTORY_FILE: &str = "_history.json";
pub const CARD_EXTENSION: &str = "md";

// ── Timestamps ──────────────────────────────────────────────────────────

/// Current time as an ISO-8601 UTC string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A timestamp strictly later than `previous`.
///
/// Normally this is just `now`; when the clock has not advanced past the
/// previous stamp (same millisecond, or a stamp from the future written by
/// another machine) it returns `previous + 1ms`.
pub fn timestamp_after(previous: &str) -> String {
    let now = Utc::now();
    match parse_timestamp(previous) {
        Some(prev) if prev >= now => (prev + Duration::milliseconds(1))
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        _ => now.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

/// Parse an RFC 3339 / ISO-8601 timestamp into UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ── Card frontmatter ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CardStatus {
    InProgress,
    Blocked,
    Review,
    Testing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Assignee {
    User,
    Agent,
}

/// Timestamps for one checklist item, aligned by position with the body's
/// checklist lines. `addedAt` is null for items written by hand before the
/// ledger existed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMeta {
    #[serde(default)]
    pub added_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

/// Structured metadata block at the top of a card file.
///
/// Keys this type does not know about are kept in `extra` and written back
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardFrontmatter {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CardStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<Assignee>,
    pub created: String,
    pub updated: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_meta: Option<Vec<TaskMeta>>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_yaml::Value>,
}

impl CardFrontmatter {
    pub fn new(title: impl Into<String>, now: &str) -> Self {
        Self {
            title: title.into(),
            status: None,
            priority: None,
            assignee: None,
            created: now.to_string(),
            updated: now.to_string(),
            tags: None,
            card_number: None,
            blocked_reason: None,
            due_date: None,
            task_meta: None,
            extra: IndexMap::new(),
        }
    }
}

// ── Tasks and cards ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub index: usize,
    pub text: String,
    pub checked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total: usize,
    pub checked: usize,
}

/// A full card: metadata, body and the tasks parsed out of the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub slug: String,
    pub filename: String,
    pub lane: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_ref: Option<String>,
    pub frontmatter: CardFrontmatter,
    pub body: String,
    pub tasks: Vec<Task>,
}

/// Lightweight projection used by listings and events. Never carries the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSummary {
    pub slug: String,
    pub filename: String,
    pub lane: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_ref: Option<String>,
    pub frontmatter: CardFrontmatter,
    pub task_progress: TaskProgress,
}

impl Card {
    pub fn summary(&self) -> CardSummary {
        CardSummary {
            slug: self.slug.clone(),
            filename: self.filename.clone(),
            lane: self.lane.clone(),
            card_ref: self.card_ref.clone(),
            frontmatter: self.frontmatter.clone(),
            task_progress: crate::parser::task_progress(&self.tasks),
        }
    }
}

/// Input for `create_card`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCard {
    pub title: String,
    #[serde(default)]
    pub lane: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub status: Option<CardStatus>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub assignee: Option<Assignee>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    /// Checklist items appended to the body on creation.
    #[serde(default)]
    pub tasks: Vec<String>,
}

/// Field-level patch for `update_card`.
///
/// Outer `None`: field absent, left untouched. `Some(None)`: explicit null,
/// field removed. `Some(Some(v))`: field replaced.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub status: Option<Option<CardStatus>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub priority: Option<Option<Priority>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub assignee: Option<Option<Assignee>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub tags: Option<Option<Vec<String>>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub blocked_reason: Option<Option<String>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub due_date: Option<Option<String>>,
    /// Replacement body.
    #[serde(default)]
    pub content: Option<String>,
}

/// Distinguishes a JSON `null` from a missing key when used together with
/// `#[serde(default)]`.
fn explicit_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Filters for `list_cards`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub lane: Option<String>,
    /// Keep cards updated at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Keep only cards whose last update is older than this many days.
    pub stale_days: Option<u32>,
}

// ── Projects ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneConfig {
    pub display_name: String,
    pub color: String,
    #[serde(default)]
    pub collapsed: bool,
}

/// Lane id to lane settings, in the order the project defines them.
pub type LaneMap = IndexMap<String, LaneConfig>;

/// Contents of `_project.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created: String,
    pub updated: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub lanes: LaneMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_card_number: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProjectConfig {
    /// Lane that `archive_card` moves cards into.
    pub fn archive_lane(&self) -> String {
        self.lanes
            .keys()
            .find(|slug| slug.ends_with("archive"))
            .cloned()
            .unwrap_or_else(|| DEFAULT_ARCHIVE_LANE.to_string())
    }

    /// Lane new cards land in when none is given: the canonical first lane
    /// if configured, else the first configured lane.
    pub fn default_lane(&self) -> String {
        if self.lanes.is_empty() || self.lanes.contains_key(DEFAULT_LANE) {
            return DEFAULT_LANE.to_string();
        }
        self.lanes
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| DEFAULT_LANE.to_string())
    }

    /// Human-readable card reference such as `MKB-12`.
    pub fn card_ref(&self, card_number: Option<u64>) -> Option<String> {
        match (&self.prefix, card_number) {
            (Some(prefix), Some(n)) => Some(format!("{}-{}", prefix, n)),
            _ => None,
        }
    }
}

pub fn default_lanes() -> LaneMap {
    DEFAULT_LANES
        .iter()
        .map(|(slug, name, color)| {
            (
                slug.to_string(),
                LaneConfig {
                    display_name: name.to_string(),
                    color: color.to_string(),
                    collapsed: false,
                },
            )
        })
        .collect()
}

/// A project as returned to callers: its slug plus the config contents.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub slug: String,
    #[serde(flatten)]
    pub config: ProjectConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub lanes: Option<LaneMap>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub archived: Option<bool>,
    #[serde(default)]
    pub lanes: Option<LaneMap>,
}
