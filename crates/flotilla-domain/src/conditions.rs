use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Condition types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    DeviceUpdating,
    DeviceSpecValid,
    DeviceDecommissioning,
    DeviceMultipleOwners,
    FleetValid,
    FleetRolloutInProgress,
    EnrollmentRequestApproved,
    RepositoryAccessible,
    ResourceSyncAccessible,
    ResourceSyncResourceParsed,
    ResourceSyncSynced,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

// ── Well-known condition reasons ─────────────────────────────────────────────

pub mod reasons {
    pub const UPDATING: &str = "Updating";
    pub const REBOOTING: &str = "Rebooting";
    pub const ERROR: &str = "Error";
    pub const UPDATED: &str = "Updated";
    pub const VALID: &str = "Valid";
    pub const INVALID: &str = "Invalid";
    pub const DECOMMISSION_STARTED: &str = "Started";
    pub const DECOMMISSION_COMPLETE: &str = "Complete";
    pub const MULTIPLE_OWNERS: &str = "MultipleOwners";
    pub const ACCESSIBLE: &str = "Accessible";
    pub const INACCESSIBLE: &str = "Inaccessible";
    pub const REPOSITORY_NOT_FOUND: &str = "RepositoryNotFound";
    pub const REPOSITORY_INACCESSIBLE: &str = "RepositoryInaccessible";
    pub const PARSED: &str = "Parsed";
    pub const PARSE_FAILED: &str = "ParseFailed";
    pub const SYNCED: &str = "Synced";
    pub const SYNC_FAILED: &str = "SyncFailed";
    pub const CONFLICT: &str = "Conflict";
    pub const APPROVED: &str = "Approved";
    pub const DENIED: &str = "Denied";
}

// ── Condition ────────────────────────────────────────────────────────────────

/// A named, typed, timestamped assertion about a resource's current state.
/// A resource carries at most one condition per type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(r#type: ConditionType, status: ConditionStatus, reason: &str) -> Self {
        Self {
            r#type,
            status,
            reason: reason.to_string(),
            message: String::new(),
            last_transition_time: None,
            observed_generation: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }
}

// ── Operations ───────────────────────────────────────────────────────────────

/// Insert or update `new` in `conditions`, keyed by type.
///
/// `last_transition_time` moves to `now` only when the status actually
/// changes, unless `new` carries an explicit timestamp. Returns true iff any
/// field changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition, now: DateTime<Utc>) -> bool {
    match conditions.iter().position(|c| c.r#type == new.r#type) {
        None => {
            if new.last_transition_time.is_none() {
                new.last_transition_time = Some(now);
            }
            conditions.push(new);
            true
        }
        Some(index) => {
            let existing = &mut conditions[index];
            let status_changed = existing.status != new.status;
            let changed = status_changed
                || existing.reason != new.reason
                || existing.message != new.message
                || existing.observed_generation != new.observed_generation;

            if status_changed {
                existing.last_transition_time = Some(new.last_transition_time.unwrap_or(now));
            }
            existing.status = new.status;
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
            changed
        }
    }
}

/// Delete all conditions of the given type. Returns true iff any was removed.
pub fn remove_condition(conditions: &mut Vec<Condition>, r#type: ConditionType) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.r#type != r#type);
    conditions.len() != before
}

pub fn find_condition(conditions: &[Condition], r#type: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

/// Missing conditions count as not-True.
pub fn is_condition_true(conditions: &[Condition], r#type: ConditionType) -> bool {
    find_condition(conditions, r#type)
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}

/// Missing conditions count as not-False.
pub fn is_condition_false(conditions: &[Condition], r#type: ConditionType) -> bool {
    find_condition(conditions, r#type)
        .map(|c| c.status == ConditionStatus::False)
        .unwrap_or(false)
}

/// Set a condition from an operation result: `Ok` becomes True with
/// `ok_reason`, `Err` becomes False with `fail_reason` and the error text as
/// the message.
pub fn set_condition_from_result<E: std::fmt::Display>(
    conditions: &mut Vec<Condition>,
    r#type: ConditionType,
    ok_reason: &str,
    fail_reason: &str,
    result: &Result<(), E>,
    now: DateTime<Utc>,
) -> bool {
    let condition = match result {
        Ok(()) => Condition::new(r#type, ConditionStatus::True, ok_reason),
        Err(e) => {
            Condition::new(r#type, ConditionStatus::False, fail_reason).with_message(e.to_string())
        }
    };
    set_condition(conditions, condition, now)
}
