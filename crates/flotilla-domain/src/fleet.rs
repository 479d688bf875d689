use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::device::DeviceSpec;
use crate::error::DomainError;
use crate::events::BatchReport;
use crate::meta::Metadata;
use crate::selector::LabelSelector;

// ── Fleet ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fleet {
    pub metadata: Metadata,
    pub spec: FleetSpec,
    #[serde(default)]
    pub status: FleetStatus,
}

impl Fleet {
    pub fn new(name: impl Into<String>, spec: FleetSpec) -> Self {
        Self {
            metadata: Metadata::new(name),
            spec,
            status: FleetStatus::default(),
        }
    }

    /// The current template version token, once the versioner has run.
    pub fn template_version(&self) -> Option<&str> {
        self.metadata.annotation(crate::meta::annotations::TEMPLATE_VERSION)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSpec {
    /// Devices matched by this selector are owned by the fleet. Absent means
    /// the fleet selects no devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default)]
    pub template: FleetTemplate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollout_policy: Option<RolloutPolicy>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetTemplate {
    /// Labels/annotations stamped onto rendered devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,
    pub spec: DeviceSpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

// ── Rollout policy ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutPolicy {
    /// Ordered batch stanzas; devices not captured by any stanza form a
    /// trailing batch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_selection: Vec<BatchStanza>,
    /// Minimum percentage of a batch that must succeed to advance
    /// automatically.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disruption_budget: Option<DisruptionBudget>,
    /// Seconds a dispatched device may take before it counts as timed out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_update_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub approval_method: ApprovalMethod,
}

pub const DEFAULT_SUCCESS_THRESHOLD: u8 = 100;
pub const DEFAULT_UPDATE_TIMEOUT_SECONDS: u64 = 30 * 60;

impl RolloutPolicy {
    pub fn success_threshold(&self) -> u8 {
        self.success_threshold.unwrap_or(DEFAULT_SUCCESS_THRESHOLD)
    }

    pub fn update_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            self.default_update_timeout_seconds
                .unwrap_or(DEFAULT_UPDATE_TIMEOUT_SECONDS) as i64,
        )
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if let Some(threshold) = self.success_threshold {
            if threshold > 100 {
                return Err(DomainError::InvalidRolloutPolicy(format!(
                    "success threshold {}% exceeds 100%",
                    threshold
                )));
            }
        }
        if let Some(budget) = &self.disruption_budget {
            if budget.max_unavailable == 0 {
                return Err(DomainError::InvalidRolloutPolicy(
                    "disruption budget of zero can never dispatch".to_string(),
                ));
            }
        }
        for stanza in &self.device_selection {
            if let Some(selector) = &stanza.selector {
                selector.validate()?;
            }
            if let Some(limit) = &stanza.limit {
                limit.validate()?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStanza {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<BatchLimit>,
}

/// An absolute device count or a percentage (`"50%"`) of the stanza's
/// matching population.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchLimit {
    Count(u32),
    Percent(String),
}

impl BatchLimit {
    pub fn validate(&self) -> Result<(), DomainError> {
        self.parse_percent().map(|_| ())
    }

    fn parse_percent(&self) -> Result<Option<u32>, DomainError> {
        match self {
            BatchLimit::Count(_) => Ok(None),
            BatchLimit::Percent(s) => {
                let digits = s
                    .strip_suffix('%')
                    .ok_or_else(|| DomainError::InvalidBatchLimit(s.clone()))?;
                let percent: u32 = digits
                    .parse()
                    .map_err(|_| DomainError::InvalidBatchLimit(s.clone()))?;
                if percent > 100 {
                    return Err(DomainError::InvalidBatchLimit(s.clone()));
                }
                Ok(Some(percent))
            }
        }
    }

    /// Number of devices this limit admits out of `population`. Percentages
    /// round up so a non-empty selection never yields an empty batch.
    pub fn resolve(&self, population: usize) -> Result<usize, DomainError> {
        match self.parse_percent()? {
            None => match self {
                BatchLimit::Count(n) => Ok((*n as usize).min(population)),
                BatchLimit::Percent(_) => unreachable!("parse_percent classified this limit"),
            },
            Some(percent) => Ok((population * percent as usize).div_ceil(100)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionBudget {
    /// Cap on simultaneously non-terminal devices within the current batch.
    pub max_unavailable: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalMethod {
    #[default]
    Automatic,
    Manual,
}

// ── Fleet status ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FleetStatus {
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices_summary: Option<DevicesSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollout: Option<RolloutStatus>,
}

/// Aggregate of owned devices by derived summary status.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DevicesSummary {
    pub total: usize,
    pub online: usize,
    pub degraded: usize,
    pub error: usize,
    pub rebooting: usize,
    pub unknown: usize,
    pub awaiting_reconnect: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    pub state: RolloutState,
    /// The template version this rollout is deploying.
    pub template_version: String,
    pub current_batch: usize,
    pub batches: Vec<RolloutBatch>,
    /// Digest of the device-selection config plus the frozen population.
    pub selection_digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutState {
    Inactive,
    Active,
    Dispatching,
    InProgress,
    Evaluating,
    Waiting,
    Completed,
    Failed,
}

/// A disjoint subset of the frozen device population, dispatched together.
/// Which members are already marked is derived from their
/// `selectedForRollout` annotations, so dispatch stays idempotent under
/// write conflicts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RolloutBatch {
    pub devices: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<BatchReport>,
}

// ── TemplateVersion ──────────────────────────────────────────────────────────

/// An immutable materialization of a fleet's template at an instant. Never
/// mutated after creation; named by a monotonic `<fleet>-<N>` token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub metadata: Metadata,
    pub spec: TemplateVersionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVersionSpec {
    pub fleet: String,
    /// The fully resolved device template at versioning time.
    pub template: FleetTemplate,
    /// Canonical digest of the template content; equal digests mean equal
    /// templates.
    pub digest: String,
}

impl TemplateVersion {
    /// `"<fleet>-7"` → 7. Used to assign the next monotonic token.
    pub fn sequence(&self) -> Option<u64> {
        let suffix = self
            .metadata
            .name
            .strip_prefix(&self.spec.fleet)?
            .strip_prefix('-')?;
        suffix.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_limit_percent_rounds_up() {
        assert_eq!(BatchLimit::Percent("50%".into()).resolve(5).unwrap(), 3);
        assert_eq!(BatchLimit::Percent("50%".into()).resolve(10).unwrap(), 5);
        assert_eq!(BatchLimit::Percent("1%".into()).resolve(3).unwrap(), 1);
        assert_eq!(BatchLimit::Percent("100%".into()).resolve(7).unwrap(), 7);
        assert_eq!(BatchLimit::Percent("50%".into()).resolve(0).unwrap(), 0);
    }

    #[test]
    fn batch_limit_count_caps_at_population() {
        assert_eq!(BatchLimit::Count(10).resolve(4).unwrap(), 4);
        assert_eq!(BatchLimit::Count(2).resolve(4).unwrap(), 2);
    }

    #[test]
    fn batch_limit_rejects_malformed_percent() {
        assert!(BatchLimit::Percent("50".into()).validate().is_err());
        assert!(BatchLimit::Percent("150%".into()).validate().is_err());
        assert!(BatchLimit::Percent("%".into()).validate().is_err());
    }

    #[test]
    fn batch_limit_deserializes_untagged() {
        let count: BatchLimit = serde_json::from_str("3").unwrap();
        assert_eq!(count, BatchLimit::Count(3));
        let percent: BatchLimit = serde_json::from_str("\"50%\"").unwrap();
        assert_eq!(percent, BatchLimit::Percent("50%".into()));
    }

    #[test]
    fn template_version_sequence_parses_token() {
        let tv = TemplateVersion {
            metadata: Metadata::new("store-fleet-12"),
            spec: TemplateVersionSpec {
                fleet: "store-fleet".into(),
                template: FleetTemplate::default(),
                digest: "abc".into(),
            },
        };
        assert_eq!(tv.sequence(), Some(12));
    }

    #[test]
    fn rollout_policy_rejects_zero_budget() {
        let policy = RolloutPolicy {
            device_selection: vec![],
            success_threshold: None,
            disruption_budget: Some(DisruptionBudget { max_unavailable: 0 }),
            default_update_timeout_seconds: None,
            approval_method: ApprovalMethod::Automatic,
        };
        assert!(policy.validate().is_err());
    }
}
