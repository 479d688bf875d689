use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::meta::Metadata;

// ── EnrollmentRequest ────────────────────────────────────────────────────────

/// A device's request to join the org. Approval is monotonic:
/// Pending → Approved | Denied, both terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRequest {
    pub metadata: Metadata,
    pub spec: EnrollmentRequestSpec,
    #[serde(default)]
    pub status: EnrollmentRequestStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRequestSpec {
    /// PEM-encoded certificate signing request from the agent.
    pub csr: String,
    /// Labels the device proposes for itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnrollmentRequestStatus {
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<EnrollmentApproval>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentApproval {
    pub approved: bool,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    /// Labels assigned to the created device; overrides the spec proposal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

impl EnrollmentRequest {
    /// Pending requests carry no approval record yet.
    pub fn is_decided(&self) -> bool {
        self.status.approval.is_some()
    }
}
