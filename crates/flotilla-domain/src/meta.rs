use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrgId(pub String);

impl OrgId {
    pub fn new(s: impl Into<String>) -> Self {
        OrgId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Resource kinds ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Device,
    Fleet,
    TemplateVersion,
    Repository,
    ResourceSync,
    EnrollmentRequest,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Device => write!(f, "Device"),
            ResourceKind::Fleet => write!(f, "Fleet"),
            ResourceKind::TemplateVersion => write!(f, "TemplateVersion"),
            ResourceKind::Repository => write!(f, "Repository"),
            ResourceKind::ResourceSync => write!(f, "ResourceSync"),
            ResourceKind::EnrollmentRequest => write!(f, "EnrollmentRequest"),
        }
    }
}

// ── Owner references ─────────────────────────────────────────────────────────

/// A `"Kind/name"` reference to the resource that owns this one.
/// Deleting the owner cascades to owned resources (owner-unset or delete,
/// depending on the kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl OwnerRef {
    pub fn fleet(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Fleet,
            name: name.into(),
        }
    }

    pub fn resource_sync(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::ResourceSync,
            name: name.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            [kind, name] if !name.is_empty() => {
                let kind = match *kind {
                    "Device" => ResourceKind::Device,
                    "Fleet" => ResourceKind::Fleet,
                    "TemplateVersion" => ResourceKind::TemplateVersion,
                    "Repository" => ResourceKind::Repository,
                    "ResourceSync" => ResourceKind::ResourceSync,
                    "EnrollmentRequest" => ResourceKind::EnrollmentRequest,
                    other => return Err(DomainError::InvalidOwnerRef(other.to_string())),
                };
                Ok(Self {
                    kind,
                    name: name.to_string(),
                })
            }
            _ => Err(DomainError::InvalidOwnerRef(s.to_string())),
        }
    }
}

impl std::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A `(kind, name)` pair identifying the resource an event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

// ── Metadata ─────────────────────────────────────────────────────────────────

/// Common metadata carried by every resource.
///
/// `generation` increments on every spec write, `resource_version` on any
/// write; both are maintained by the store, never by callers. `labels` keeps
/// absent distinct from empty: a device without labels is matched by fewer
/// selectors than a device with an empty label map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub resource_version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Metadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: None,
            annotations: BTreeMap::new(),
            generation: 0,
            resource_version: 0,
            owner: None,
            created_at: None,
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.annotations.insert(key.to_string(), value.into());
    }

    pub fn remove_annotation(&mut self, key: &str) -> bool {
        self.annotations.remove(key).is_some()
    }

    /// True when the annotation is present with the literal value `"true"`.
    pub fn annotation_is_true(&self, key: &str) -> bool {
        self.annotation(key) == Some("true")
    }
}

// ── Reserved annotation keys ─────────────────────────────────────────────────

/// Annotation keys are namespaced `<controller>/<key>`; each key has exactly
/// one writer, readers tolerate absence.
pub mod annotations {
    pub const DEVICE_CONSOLE: &str = "device-controller/console";
    pub const RENDERED_VERSION: &str = "device-controller/renderedVersion";
    pub const RENDERED_TEMPLATE_VERSION: &str = "device-controller/renderedTemplateVersion";
    pub const AWAITING_RECONNECT: &str = "device-controller/awaitingReconnect";
    pub const CONFLICT_PAUSED: &str = "device-controller/conflictPaused";

    pub const TEMPLATE_VERSION: &str = "fleet-controller/templateVersion";
    pub const DEPLOYING_TEMPLATE_VERSION: &str = "fleet-controller/deployingTemplateVersion";
    pub const SELECTED_FOR_ROLLOUT: &str = "fleet-controller/selectedForRollout";
    pub const LAST_ROLLOUT_ERROR: &str = "fleet-controller/lastRolloutError";
    pub const BATCH_NUMBER: &str = "fleet-controller/batchNumber";
    pub const ROLLOUT_APPROVED: &str = "fleet-controller/rolloutApproved";
    pub const ROLLOUT_APPROVAL_METHOD: &str = "fleet-controller/rolloutApprovalMethod";
    pub const LAST_BATCH_COMPLETION_REPORT: &str = "fleet-controller/lastBatchCompletionReport";
    pub const DEVICE_SELECTION_CONFIG_DIGEST: &str = "fleet-controller/deviceSelectionConfigDigest";
}
