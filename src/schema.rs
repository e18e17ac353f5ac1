//! Reference-data hierarchy and population job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Language tag such as `fr` or `pt-br` (always stored lowercase).
pub type LanguageCode = String;

/// Normalize a root or node name for case-insensitive comparisons.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

// ============================================================================
// Hierarchy
// ============================================================================

/// One of the four fixed depths of the geographic hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Region,
    SubRegion,
    LocalArea,
    Settlement,
}

impl Level {
    /// The level directly below this one, if any.
    pub fn child(self) -> Option<Level> {
        match self {
            Level::Region => Some(Level::SubRegion),
            Level::SubRegion => Some(Level::LocalArea),
            Level::LocalArea => Some(Level::Settlement),
            Level::Settlement => None,
        }
    }

    /// The level directly above this one, if any.
    pub fn parent(self) -> Option<Level> {
        match self {
            Level::Region => None,
            Level::SubRegion => Some(Level::Region),
            Level::LocalArea => Some(Level::SubRegion),
            Level::Settlement => Some(Level::LocalArea),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Level::Region => "region",
            Level::SubRegion => "sub-region",
            Level::LocalArea => "local area",
            Level::Settlement => "settlement",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            Level::Region => "regions",
            Level::SubRegion => "sub-regions",
            Level::LocalArea => "local areas",
            Level::Settlement => "settlements",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A persisted node of the hierarchy (region, sub-region, local area or settlement).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub id: Uuid,
    pub level: Level,
    pub canonical_name: String,
    /// `None` only for regions.
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl HierarchyNode {
    pub fn new(level: Level, canonical_name: impl Into<String>, parent_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            canonical_name: canonical_name.into().trim().to_string(),
            parent_id,
            is_deleted: false,
            created_at: Utc::now(),
        }
    }
}

/// Localized variant of a node's name. Unique per `(node_id, language)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizedName {
    pub node_id: Uuid,
    pub language: LanguageCode,
    pub name: String,
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Progress counters exposed for status polling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub current_step: String,
    /// Sub-regions ensured so far.
    pub level1_processed: usize,
    pub level1_total: usize,
    /// Local areas ensured so far.
    pub level2_processed: usize,
    /// Settlements ensured so far.
    pub level3_processed: usize,
    pub languages_completed: Vec<LanguageCode>,
    #[serde(default)]
    pub external_calls: usize,
    #[serde(default)]
    pub nodes_created: usize,
    #[serde(default)]
    pub localized_names_created: usize,
}

/// A population job for one root region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub root_name: String,
    pub target_languages: Vec<LanguageCode>,
    pub status: JobStatus,
    pub progress: JobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// One entry per branch that was skipped after a node-level failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_nodes: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(root_name: impl Into<String>, target_languages: Vec<LanguageCode>) -> Self {
        Self {
            id: format!("job_{}", Uuid::new_v4().simple()),
            root_name: root_name.into().trim().to_string(),
            target_languages,
            status: JobStatus::Queued,
            progress: JobProgress {
                current_step: "queued".to_string(),
                ..JobProgress::default()
            },
            error: None,
            failed_nodes: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Registry key: trimmed, lowercased root name.
    pub fn root_key(&self) -> String {
        normalize_name(&self.root_name)
    }
}
