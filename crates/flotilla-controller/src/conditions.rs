use chrono::{DateTime, Utc};
use flotilla_domain::{find_condition, set_condition, Condition};

/// Outcome of a condition write, distinguishing field-level change from an
/// actual status transition. Events pair with transitions only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConditionChange {
    pub changed: bool,
    pub status_changed: bool,
}

pub(crate) fn apply_condition(
    conditions: &mut Vec<Condition>,
    condition: Condition,
    now: DateTime<Utc>,
) -> ConditionChange {
    let previous_status = find_condition(conditions, condition.r#type).map(|c| c.status);
    let next_status = condition.status;
    let changed = set_condition(conditions, condition, now);
    ConditionChange {
        changed,
        status_changed: previous_status != Some(next_status),
    }
}
