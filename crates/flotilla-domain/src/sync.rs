use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::meta::Metadata;

// ── ResourceSync ─────────────────────────────────────────────────────────────

/// Declarative gitops source: a repository path whose fleet manifests this
/// resource owns and keeps synchronized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSync {
    pub metadata: Metadata,
    pub spec: ResourceSyncSpec,
    #[serde(default)]
    pub status: ResourceSyncStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSyncSpec {
    /// Name of the Repository resource to pull from (same org).
    pub repository: String,
    pub target_revision: String,
    /// Directory within the checkout holding fleet manifests.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSyncStatus {
    pub conditions: Vec<Condition>,
    /// Commit hash last fully synced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_commit: Option<String>,
    /// Spec generation last fully synced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
