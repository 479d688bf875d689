use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::meta::ResourceRef;

// ── Event reasons (closed set) ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventReason {
    // Device
    DeviceSpecValid,
    DeviceSpecInvalid,
    DeviceContentUpToDate,
    DeviceContentOutOfDate,
    DeviceContentUpdating,
    DeviceUpdateFailed,
    DeviceDecommissioned,
    DeviceDecommissionFailed,
    DeviceDisconnected,
    DeviceConnected,
    DeviceMultipleOwnersDetected,
    DeviceMultipleOwnersResolved,
    DeviceCpuNormal,
    DeviceCpuWarning,
    DeviceCpuCritical,
    DeviceMemoryNormal,
    DeviceMemoryWarning,
    DeviceMemoryCritical,
    DeviceDiskNormal,
    DeviceDiskWarning,
    DeviceDiskCritical,
    DeviceApplicationHealthy,
    DeviceApplicationDegraded,
    DeviceApplicationError,
    // Fleet
    FleetValid,
    FleetInvalid,
    FleetRolloutCreated,
    FleetRolloutStarted,
    FleetRolloutDeviceSelected,
    FleetRolloutBatchDispatched,
    FleetRolloutBatchCompleted,
    FleetRolloutCompleted,
    FleetRolloutFailed,
    // Repository
    RepositoryAccessible,
    RepositoryInaccessible,
    ReferencedRepositoryUpdated,
    // ResourceSync
    ResourceSyncCommitDetected,
    ResourceSyncAccessible,
    ResourceSyncInaccessible,
    ResourceSyncParsed,
    ResourceSyncParsingFailed,
    ResourceSyncSynced,
    ResourceSyncSyncFailed,
    // Generic
    ResourceCreated,
    ResourceUpdated,
    ResourceDeleted,
    ResourceCreationFailed,
    ResourceUpdateFailed,
    ResourceDeletionFailed,
    InternalTaskFailed,
    EnrollmentRequestApproved,
    EnrollmentRequestApprovalFailed,
}

/// Name fragments that classify a reason as a Warning.
const WARNING_MARKERS: &[&str] = &[
    "Failed",
    "Inaccessible",
    "Invalid",
    "Error",
    "Degraded",
    "Unknown",
    "OutOfDate",
    "Critical",
];

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::DeviceSpecValid => "DeviceSpecValid",
            EventReason::DeviceSpecInvalid => "DeviceSpecInvalid",
            EventReason::DeviceContentUpToDate => "DeviceContentUpToDate",
            EventReason::DeviceContentOutOfDate => "DeviceContentOutOfDate",
            EventReason::DeviceContentUpdating => "DeviceContentUpdating",
            EventReason::DeviceUpdateFailed => "DeviceUpdateFailed",
            EventReason::DeviceDecommissioned => "DeviceDecommissioned",
            EventReason::DeviceDecommissionFailed => "DeviceDecommissionFailed",
            EventReason::DeviceDisconnected => "DeviceDisconnected",
            EventReason::DeviceConnected => "DeviceConnected",
            EventReason::DeviceMultipleOwnersDetected => "DeviceMultipleOwnersDetected",
            EventReason::DeviceMultipleOwnersResolved => "DeviceMultipleOwnersResolved",
            EventReason::DeviceCpuNormal => "DeviceCPUNormal",
            EventReason::DeviceCpuWarning => "DeviceCPUWarning",
            EventReason::DeviceCpuCritical => "DeviceCPUCritical",
            EventReason::DeviceMemoryNormal => "DeviceMemoryNormal",
            EventReason::DeviceMemoryWarning => "DeviceMemoryWarning",
            EventReason::DeviceMemoryCritical => "DeviceMemoryCritical",
            EventReason::DeviceDiskNormal => "DeviceDiskNormal",
            EventReason::DeviceDiskWarning => "DeviceDiskWarning",
            EventReason::DeviceDiskCritical => "DeviceDiskCritical",
            EventReason::DeviceApplicationHealthy => "DeviceApplicationHealthy",
            EventReason::DeviceApplicationDegraded => "DeviceApplicationDegraded",
            EventReason::DeviceApplicationError => "DeviceApplicationError",
            EventReason::FleetValid => "FleetValid",
            EventReason::FleetInvalid => "FleetInvalid",
            EventReason::FleetRolloutCreated => "FleetRolloutCreated",
            EventReason::FleetRolloutStarted => "FleetRolloutStarted",
            EventReason::FleetRolloutDeviceSelected => "FleetRolloutDeviceSelected",
            EventReason::FleetRolloutBatchDispatched => "FleetRolloutBatchDispatched",
            EventReason::FleetRolloutBatchCompleted => "FleetRolloutBatchCompleted",
            EventReason::FleetRolloutCompleted => "FleetRolloutCompleted",
            EventReason::FleetRolloutFailed => "FleetRolloutFailed",
            EventReason::RepositoryAccessible => "RepositoryAccessible",
            EventReason::RepositoryInaccessible => "RepositoryInaccessible",
            EventReason::ReferencedRepositoryUpdated => "ReferencedRepositoryUpdated",
            EventReason::ResourceSyncCommitDetected => "ResourceSyncCommitDetected",
            EventReason::ResourceSyncAccessible => "ResourceSyncAccessible",
            EventReason::ResourceSyncInaccessible => "ResourceSyncInaccessible",
            EventReason::ResourceSyncParsed => "ResourceSyncParsed",
            EventReason::ResourceSyncParsingFailed => "ResourceSyncParsingFailed",
            EventReason::ResourceSyncSynced => "ResourceSyncSynced",
            EventReason::ResourceSyncSyncFailed => "ResourceSyncSyncFailed",
            EventReason::ResourceCreated => "ResourceCreated",
            EventReason::ResourceUpdated => "ResourceUpdated",
            EventReason::ResourceDeleted => "ResourceDeleted",
            EventReason::ResourceCreationFailed => "ResourceCreationFailed",
            EventReason::ResourceUpdateFailed => "ResourceUpdateFailed",
            EventReason::ResourceDeletionFailed => "ResourceDeletionFailed",
            EventReason::InternalTaskFailed => "InternalTaskFailed",
            EventReason::EnrollmentRequestApproved => "EnrollmentRequestApproved",
            EventReason::EnrollmentRequestApprovalFailed => "EnrollmentRequestApprovalFailed",
        }
    }

    /// Severity derives from the reason name, not per-call judgement.
    pub fn event_type(&self) -> EventType {
        let name = self.as_str();
        if WARNING_MARKERS.iter().any(|m| name.contains(m)) {
            EventType::Warning
        } else {
            EventType::Normal
        }
    }
}

impl std::fmt::Display for EventReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

// ── Typed detail payloads ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "detailType", rename_all = "camelCase")]
pub enum EventDetails {
    #[serde(rename_all = "camelCase")]
    RolloutBatchCompleted {
        batch: usize,
        report: BatchReport,
    },
    #[serde(rename_all = "camelCase")]
    RolloutDeviceSelected { template_version: String },
    #[serde(rename_all = "camelCase")]
    MultipleOwners { matching_fleets: Vec<String> },
    #[serde(rename_all = "camelCase")]
    SyncCommit { commit: String },
    #[serde(rename_all = "camelCase")]
    InternalTask { task: String, attempts: u32 },
}

/// Per-batch completion accounting. `successful + failed + timed_out` equals
/// `total` once the batch is fully terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub success_percentage: u32,
}

// ── Event records ────────────────────────────────────────────────────────────

/// An append-only record of a significant state change. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub involved: ResourceRef,
    pub reason: EventReason,
    pub actor: String,
    pub r#type: EventType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<EventDetails>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reasons_are_warnings() {
        for reason in [
            EventReason::DeviceSpecInvalid,
            EventReason::DeviceUpdateFailed,
            EventReason::DeviceContentOutOfDate,
            EventReason::DeviceCpuCritical,
            EventReason::DeviceApplicationError,
            EventReason::DeviceApplicationDegraded,
            EventReason::FleetRolloutFailed,
            EventReason::RepositoryInaccessible,
            EventReason::ResourceSyncParsingFailed,
            EventReason::InternalTaskFailed,
        ] {
            assert_eq!(reason.event_type(), EventType::Warning, "{}", reason);
        }
    }

    #[test]
    fn success_reasons_are_normal() {
        for reason in [
            EventReason::DeviceSpecValid,
            EventReason::DeviceContentUpToDate,
            EventReason::FleetRolloutCompleted,
            EventReason::ResourceSyncSynced,
            EventReason::DeviceCpuNormal,
            EventReason::EnrollmentRequestApproved,
            EventReason::DeviceDisconnected,
        ] {
            assert_eq!(reason.event_type(), EventType::Normal, "{}", reason);
        }
    }

    #[test]
    fn details_round_trip_with_discriminator() {
        let details = EventDetails::RolloutBatchCompleted {
            batch: 2,
            report: BatchReport {
                total: 5,
                successful: 3,
                failed: 2,
                timed_out: 0,
                success_percentage: 60,
            },
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["detailType"], "rolloutBatchCompleted");
        let back: EventDetails = serde_json::from_value(json).unwrap();
        assert_eq!(details, back);
    }
}
