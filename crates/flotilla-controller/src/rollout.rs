use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flotilla_domain::{
    annotations, conditions::reasons, find_condition, is_condition_true, ApprovalMethod,
    BatchReport, Condition, ConditionStatus, ConditionType, Device, DeviceSummaryStatus,
    DeviceUpdatedStatus, DevicesSummary, EventDetails, EventReason, Fleet, OrgId, OwnerRef,
    ResourceKind, ResourceRef, RolloutBatch, RolloutPolicy, RolloutState, RolloutStatus,
};
use flotilla_store::{compute_spec_digest, Store};
use tracing::{debug, info, warn};

use crate::conditions::apply_condition;
use crate::emitter::EventEmitter;
use crate::error::ControllerError;
use crate::runner::ReconcileOutcome;

const DISPATCH_POLL: Duration = Duration::from_secs(1);
const PROGRESS_POLL: Duration = Duration::from_secs(5);

/// How a batch member stands with respect to the rollout's template version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberState {
    Success,
    Failed,
    TimedOut,
    InProgress,
}

/// Drives a fleet's rollout through its batch state machine.
///
/// Batches are frozen at rollout start; dispatch marks devices with the
/// `selectedForRollout` annotation (honoring the disruption budget in
/// sub-steps), completion is evaluated per batch against the success
/// threshold, and advancement is automatic or gated on a manual approval
/// annotation. All fleet-level events are emitted only after the fleet write
/// lands, so a lost write conflict never produces phantom events.
pub struct RolloutController {
    store: Arc<dyn Store>,
    emitter: EventEmitter,
    disconnect_timeout: chrono::Duration,
}

type FleetEvent = (EventReason, String, Option<EventDetails>);

impl RolloutController {
    pub fn new(store: Arc<dyn Store>, emitter: EventEmitter) -> Self {
        Self {
            store,
            emitter,
            disconnect_timeout: flotilla_status::default_disconnect_timeout(),
        }
    }

    pub fn with_disconnect_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub async fn reconcile(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let Some(fleet) = self.store.get_fleet(org, name).await? else {
            return Ok(ReconcileOutcome::Complete);
        };
        let original = fleet.clone();
        let mut fleet = fleet;
        let now = Utc::now();

        let owned = self.owned_devices(org, name).await?;
        fleet.status.devices_summary = Some(summarize_devices(&owned));

        let mut events: Vec<FleetEvent> = Vec::new();
        let outcome = match fleet.template_version().map(str::to_string) {
            None => ReconcileOutcome::Complete,
            Some(tv) => match fleet.spec.rollout_policy.clone() {
                None => self.dispatch_unbatched(org, &mut fleet, &owned, &tv).await?,
                Some(policy) => {
                    self.run_state_machine(org, &mut fleet, &owned, &tv, &policy, now, &mut events)
                        .await?
                }
            },
        };

        if fleet != original {
            match self.store.update_fleet(org, fleet).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => return Ok(ReconcileOutcome::Retry(None)),
                Err(e) => return Err(e.into()),
            }
        }

        for (reason, message, details) in events {
            self.emitter
                .emit_with_details(
                    org,
                    ResourceRef::new(ResourceKind::Fleet, name),
                    reason,
                    message,
                    details,
                )
                .await;
        }

        Ok(outcome)
    }

    /// Without a rollout policy every owned device is selected as soon as a
    /// new template version appears; any in-flight batch gating is dropped.
    async fn dispatch_unbatched(
        &self,
        org: &OrgId,
        fleet: &mut Fleet,
        owned: &[Device],
        tv: &str,
    ) -> Result<ReconcileOutcome, ControllerError> {
        if let Some(rollout) = fleet.status.rollout.as_mut() {
            if rollout.state != RolloutState::Inactive {
                info!(fleet = %fleet.metadata.name, "rollout policy removed, deactivating rollout");
                rollout.state = RolloutState::Inactive;
            }
        }
        for device in owned {
            self.mark_device(org, &device.metadata.name, tv).await?;
        }
        Ok(ReconcileOutcome::Complete)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_state_machine(
        &self,
        org: &OrgId,
        fleet: &mut Fleet,
        owned: &[Device],
        tv: &str,
        policy: &RolloutPolicy,
        now: DateTime<Utc>,
        events: &mut Vec<FleetEvent>,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let needs_new_rollout = fleet
            .status
            .rollout
            .as_ref()
            .map(|r| r.template_version != tv)
            .unwrap_or(true);

        if needs_new_rollout {
            let batches = build_batches(policy, owned);
            let frozen: Vec<&str> = batches
                .iter()
                .flat_map(|b| b.devices.iter().map(String::as_str))
                .collect();
            let digest = compute_spec_digest(&(&policy.device_selection, &frozen));

            info!(
                fleet = %fleet.metadata.name,
                template_version = tv,
                batches = batches.len(),
                devices = frozen.len(),
                "starting rollout"
            );

            fleet.status.rollout = Some(RolloutStatus {
                state: RolloutState::Active,
                template_version: tv.to_string(),
                current_batch: 0,
                batches,
                selection_digest: digest.clone(),
            });
            fleet
                .metadata
                .set_annotation(annotations::DEVICE_SELECTION_CONFIG_DIGEST, digest);
            fleet.metadata.set_annotation(
                annotations::ROLLOUT_APPROVAL_METHOD,
                match policy.approval_method {
                    ApprovalMethod::Automatic => "automatic",
                    ApprovalMethod::Manual => "manual",
                },
            );
            fleet
                .metadata
                .set_annotation(annotations::DEPLOYING_TEMPLATE_VERSION, tv);
            fleet.metadata.remove_annotation(annotations::ROLLOUT_APPROVED);
            apply_condition(
                &mut fleet.status.conditions,
                Condition::new(
                    ConditionType::FleetRolloutInProgress,
                    ConditionStatus::True,
                    "RolloutStarted",
                ),
                now,
            );
            events.push((
                EventReason::FleetRolloutStarted,
                format!("rollout of template version {} started", tv),
                None,
            ));
        }

        loop {
            let state = fleet.status.rollout.as_ref().expect("rollout set above").state;
            let batch_index = fleet.status.rollout.as_ref().unwrap().current_batch;
            let batch_count = fleet.status.rollout.as_ref().unwrap().batches.len();

            match state {
                RolloutState::Inactive | RolloutState::Completed | RolloutState::Failed => {
                    return Ok(ReconcileOutcome::Complete);
                }

                RolloutState::Active => {
                    if batch_index >= batch_count {
                        self.finish(fleet, events, tv, now, true, batch_index);
                        return Ok(ReconcileOutcome::Complete);
                    }
                    fleet
                        .metadata
                        .set_annotation(annotations::BATCH_NUMBER, (batch_index + 1).to_string());
                    fleet.status.rollout.as_mut().unwrap().state = RolloutState::Dispatching;
                    events.push((
                        EventReason::FleetRolloutBatchDispatched,
                        format!("dispatching batch {} of {}", batch_index + 1, batch_count),
                        None,
                    ));
                }

                RolloutState::Dispatching => {
                    let batch = fleet.status.rollout.as_ref().unwrap().batches[batch_index].clone();
                    let fully_dispatched = self
                        .dispatch_batch(org, &batch, tv, policy, now)
                        .await?;
                    if fully_dispatched {
                        let rollout = fleet.status.rollout.as_mut().unwrap();
                        if rollout.batches[batch_index].dispatched_at.is_none() {
                            rollout.batches[batch_index].dispatched_at = Some(now);
                        }
                        rollout.state = RolloutState::InProgress;
                    } else {
                        let rollout = fleet.status.rollout.as_mut().unwrap();
                        if rollout.batches[batch_index].dispatched_at.is_none() {
                            rollout.batches[batch_index].dispatched_at = Some(now);
                        }
                        return Ok(ReconcileOutcome::Retry(Some(DISPATCH_POLL)));
                    }
                }

                RolloutState::InProgress => {
                    let batch = fleet.status.rollout.as_ref().unwrap().batches[batch_index].clone();
                    let states = self.classify_batch(org, &batch, tv, policy, now).await?;
                    if states.iter().any(|s| *s == MemberState::InProgress) {
                        return Ok(ReconcileOutcome::Retry(Some(PROGRESS_POLL)));
                    }
                    fleet.status.rollout.as_mut().unwrap().state = RolloutState::Evaluating;
                }

                RolloutState::Evaluating => {
                    let batch = fleet.status.rollout.as_ref().unwrap().batches[batch_index].clone();
                    let states = self.classify_batch(org, &batch, tv, policy, now).await?;
                    let report = make_report(&states);

                    fleet.status.rollout.as_mut().unwrap().batches[batch_index].report =
                        Some(report);
                    if let Ok(serialized) = serde_json::to_string(&report) {
                        fleet
                            .metadata
                            .set_annotation(annotations::LAST_BATCH_COMPLETION_REPORT, serialized);
                    }
                    events.push((
                        EventReason::FleetRolloutBatchCompleted,
                        format!(
                            "batch {} completed: {}/{} successful ({}%)",
                            batch_index + 1,
                            report.successful,
                            report.total,
                            report.success_percentage
                        ),
                        Some(EventDetails::RolloutBatchCompleted {
                            batch: batch_index + 1,
                            report,
                        }),
                    ));

                    let threshold = policy.success_threshold() as u32;
                    if report.success_percentage < threshold {
                        warn!(
                            fleet = %fleet.metadata.name,
                            batch = batch_index + 1,
                            success = report.success_percentage,
                            threshold,
                            "batch below success threshold"
                        );
                        self.finish(fleet, events, tv, now, false, batch_index);
                        return Ok(ReconcileOutcome::Complete);
                    }

                    if batch_index + 1 == batch_count {
                        self.finish(fleet, events, tv, now, true, batch_index);
                        return Ok(ReconcileOutcome::Complete);
                    }

                    match policy.approval_method {
                        ApprovalMethod::Automatic => {
                            let rollout = fleet.status.rollout.as_mut().unwrap();
                            rollout.current_batch += 1;
                            rollout.state = RolloutState::Active;
                        }
                        ApprovalMethod::Manual => {
                            fleet
                                .metadata
                                .set_annotation(annotations::ROLLOUT_APPROVED, "pending");
                            fleet.status.rollout.as_mut().unwrap().state = RolloutState::Waiting;
                            return Ok(ReconcileOutcome::Complete);
                        }
                    }
                }

                RolloutState::Waiting => {
                    match fleet.metadata.annotation(annotations::ROLLOUT_APPROVED) {
                        Some("true") => {
                            fleet.metadata.remove_annotation(annotations::ROLLOUT_APPROVED);
                            let rollout = fleet.status.rollout.as_mut().unwrap();
                            rollout.current_batch += 1;
                            rollout.state = RolloutState::Active;
                        }
                        Some("false") => {
                            fleet.metadata.remove_annotation(annotations::ROLLOUT_APPROVED);
                            self.finish(fleet, events, tv, now, false, batch_index);
                            return Ok(ReconcileOutcome::Complete);
                        }
                        _ => return Ok(ReconcileOutcome::Complete),
                    }
                }
            }
        }
    }

    fn finish(
        &self,
        fleet: &mut Fleet,
        events: &mut Vec<FleetEvent>,
        tv: &str,
        now: DateTime<Utc>,
        succeeded: bool,
        batch_index: usize,
    ) {
        let rollout = fleet.status.rollout.as_mut().expect("rollout set");
        rollout.state = if succeeded {
            RolloutState::Completed
        } else {
            RolloutState::Failed
        };
        apply_condition(
            &mut fleet.status.conditions,
            Condition::new(
                ConditionType::FleetRolloutInProgress,
                ConditionStatus::False,
                if succeeded { "RolloutCompleted" } else { reasons::ERROR },
            ),
            now,
        );
        if succeeded {
            events.push((
                EventReason::FleetRolloutCompleted,
                format!("rollout of template version {} completed", tv),
                None,
            ));
        } else {
            events.push((
                EventReason::FleetRolloutFailed,
                format!(
                    "rollout of template version {} failed at batch {}",
                    tv,
                    batch_index + 1
                ),
                None,
            ));
        }
    }

    async fn owned_devices(&self, org: &OrgId, fleet: &str) -> Result<Vec<Device>, ControllerError> {
        let owner = OwnerRef::fleet(fleet);
        Ok(self
            .store
            .list_devices(org)
            .await?
            .into_iter()
            .filter(|d| d.metadata.owner.as_ref() == Some(&owner))
            .collect())
    }

    /// Mark up to the disruption budget's worth of still-unmarked batch
    /// members. Returns true once every member is marked (or can never be).
    async fn dispatch_batch(
        &self,
        org: &OrgId,
        batch: &RolloutBatch,
        tv: &str,
        policy: &RolloutPolicy,
        now: DateTime<Utc>,
    ) -> Result<bool, ControllerError> {
        let mut undispatched = Vec::new();
        let mut non_terminal = 0usize;

        for name in &batch.devices {
            let Some(device) = self.store.get_device(org, name).await? else {
                continue; // deleted devices can't be dispatched
            };
            if device.metadata.annotation_is_true(annotations::CONFLICT_PAUSED) {
                continue; // paused devices are skipped until unpaused
            }
            if device.metadata.annotation(annotations::SELECTED_FOR_ROLLOUT) == Some(tv) {
                if classify_member(&device, tv, batch.dispatched_at, policy, self.disconnect_timeout, now)
                    == MemberState::InProgress
                {
                    non_terminal += 1;
                }
            } else {
                undispatched.push(name.clone());
            }
        }

        if undispatched.is_empty() {
            return Ok(true);
        }

        let budget = policy
            .disruption_budget
            .as_ref()
            .map(|b| (b.max_unavailable as usize).saturating_sub(non_terminal))
            .unwrap_or(usize::MAX);

        for name in undispatched.iter().take(budget) {
            self.mark_device(org, name, tv).await?;
        }

        Ok(undispatched.len() <= budget)
    }

    /// Set `selectedForRollout` on a device if not already carrying this
    /// template version. Idempotent; a lost write conflict is retried on the
    /// next dispatch cycle.
    async fn mark_device(&self, org: &OrgId, name: &str, tv: &str) -> Result<bool, ControllerError> {
        let Some(mut device) = self.store.get_device(org, name).await? else {
            return Ok(false);
        };
        if device.metadata.annotation_is_true(annotations::CONFLICT_PAUSED) {
            return Ok(false);
        }
        if device.metadata.annotation(annotations::SELECTED_FOR_ROLLOUT) == Some(tv) {
            return Ok(false);
        }

        device
            .metadata
            .set_annotation(annotations::SELECTED_FOR_ROLLOUT, tv);
        match self.store.update_device(org, device).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                debug!(device = name, "lost selection write, retrying next cycle");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        self.emitter
            .emit_with_details(
                org,
                ResourceRef::new(ResourceKind::Device, name),
                EventReason::FleetRolloutDeviceSelected,
                format!("selected for rollout of template version {}", tv),
                Some(EventDetails::RolloutDeviceSelected {
                    template_version: tv.to_string(),
                }),
            )
            .await;
        Ok(true)
    }

    async fn classify_batch(
        &self,
        org: &OrgId,
        batch: &RolloutBatch,
        tv: &str,
        policy: &RolloutPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<MemberState>, ControllerError> {
        let mut states = Vec::with_capacity(batch.devices.len());
        for name in &batch.devices {
            let state = match self.store.get_device(org, name).await? {
                None => MemberState::Failed,
                Some(device) => classify_member(
                    &device,
                    tv,
                    batch.dispatched_at,
                    policy,
                    self.disconnect_timeout,
                    now,
                ),
            };
            states.push(state);
        }
        Ok(states)
    }
}

#[async_trait::async_trait]
impl crate::runner::Reconciler for RolloutController {
    type Key = (OrgId, String);

    fn name(&self) -> &'static str {
        "rollout"
    }

    async fn reconcile(&self, key: &Self::Key) -> Result<ReconcileOutcome, ControllerError> {
        RolloutController::reconcile(self, &key.0, &key.1).await
    }

    async fn on_persistent_failure(
        &self,
        key: &Self::Key,
        attempts: u32,
        error: &ControllerError,
    ) {
        self.emitter
            .emit_with_details(
                &key.0,
                ResourceRef::new(ResourceKind::Fleet, &key.1),
                EventReason::InternalTaskFailed,
                format!("rollout reconcile failing after {} attempts: {}", attempts, error),
                Some(EventDetails::InternalTask {
                    task: "rollout".to_string(),
                    attempts,
                }),
            )
            .await;
    }
}

/// Terminal classification for one batch member.
fn classify_member(
    device: &Device,
    tv: &str,
    dispatched_at: Option<DateTime<Utc>>,
    policy: &RolloutPolicy,
    disconnect_timeout: chrono::Duration,
    now: DateTime<Utc>,
) -> MemberState {
    let rendered_tv = device
        .metadata
        .annotation(annotations::RENDERED_TEMPLATE_VERSION);
    if rendered_tv == Some(tv) && device.status.updated.status == DeviceUpdatedStatus::UpToDate {
        return MemberState::Success;
    }

    if let Some(cond) = find_condition(&device.status.conditions, ConditionType::DeviceUpdating) {
        if cond.status == ConditionStatus::False && cond.reason == reasons::ERROR {
            return MemberState::Failed;
        }
    }
    if device
        .metadata
        .annotation(annotations::LAST_ROLLOUT_ERROR)
        .is_some()
    {
        return MemberState::Failed;
    }

    if let Some(dispatched_at) = dispatched_at {
        if now - dispatched_at > policy.update_timeout() {
            return MemberState::TimedOut;
        }
    }
    let updating = is_condition_true(&device.status.conditions, ConditionType::DeviceUpdating);
    let disconnected = device
        .status
        .last_seen
        .map(|seen| now - seen > disconnect_timeout)
        .unwrap_or(true);
    if updating && disconnected {
        return MemberState::TimedOut;
    }

    MemberState::InProgress
}

fn make_report(states: &[MemberState]) -> BatchReport {
    let total = states.len();
    let successful = states.iter().filter(|s| **s == MemberState::Success).count();
    let failed = states.iter().filter(|s| **s == MemberState::Failed).count();
    let timed_out = states.iter().filter(|s| **s == MemberState::TimedOut).count();
    BatchReport {
        total,
        successful,
        failed,
        timed_out,
        success_percentage: if total == 0 {
            100
        } else {
            (successful * 100 / total) as u32
        },
    }
}

/// Compute the frozen batch assignment from the rollout policy.
///
/// Percentage limits resolve against the stanza's matching population within
/// the whole frozen set, not against what earlier stanzas left over, so two
/// `50%` stanzas split a population in half. Devices no stanza captured form
/// one trailing batch.
fn build_batches(policy: &RolloutPolicy, owned: &[Device]) -> Vec<RolloutBatch> {
    let mut sorted: Vec<&Device> = owned.iter().collect();
    sorted.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

    let mut remaining: Vec<&Device> = sorted.clone();
    let mut batches = Vec::new();

    for stanza in &policy.device_selection {
        let matches = |device: &Device| {
            stanza
                .selector
                .as_ref()
                .map(|s| s.matches(device.metadata.labels.as_ref()))
                .unwrap_or(true)
        };

        let population = sorted.iter().filter(|d| matches(d)).count();
        let take = match &stanza.limit {
            Some(limit) => limit.resolve(population).unwrap_or(population),
            None => population,
        };

        let chosen: Vec<String> = remaining
            .iter()
            .filter(|d| matches(d))
            .take(take)
            .map(|d| d.metadata.name.clone())
            .collect();
        remaining.retain(|d| !chosen.contains(&d.metadata.name));

        if !chosen.is_empty() {
            batches.push(RolloutBatch {
                devices: chosen,
                ..Default::default()
            });
        }
    }

    if !remaining.is_empty() {
        batches.push(RolloutBatch {
            devices: remaining.iter().map(|d| d.metadata.name.clone()).collect(),
            ..Default::default()
        });
    }

    batches
}

fn summarize_devices(owned: &[Device]) -> DevicesSummary {
    let mut summary = DevicesSummary {
        total: owned.len(),
        ..Default::default()
    };
    for device in owned {
        match device.status.summary.status {
            DeviceSummaryStatus::Online => summary.online += 1,
            DeviceSummaryStatus::Degraded => summary.degraded += 1,
            DeviceSummaryStatus::Error => summary.error += 1,
            DeviceSummaryStatus::Rebooting => summary.rebooting += 1,
            DeviceSummaryStatus::Unknown => summary.unknown += 1,
            DeviceSummaryStatus::AwaitingReconnect => summary.awaiting_reconnect += 1,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_domain::{BatchLimit, BatchStanza, LabelSelector};

    fn device(name: &str, labels: &[(&str, &str)]) -> Device {
        let mut device = Device::new(name);
        device.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        device
    }

    fn policy(stanzas: Vec<BatchStanza>) -> RolloutPolicy {
        RolloutPolicy {
            device_selection: stanzas,
            success_threshold: None,
            disruption_budget: None,
            default_update_timeout_seconds: None,
            approval_method: ApprovalMethod::Automatic,
        }
    }

    #[test]
    fn two_half_stanzas_split_the_population() {
        let devices: Vec<Device> = (0..10)
            .map(|i| device(&format!("d{:02}", i), &[]))
            .collect();
        let policy = policy(vec![
            BatchStanza { selector: None, limit: Some(BatchLimit::Percent("50%".into())) },
            BatchStanza { selector: None, limit: Some(BatchLimit::Percent("50%".into())) },
        ]);

        let batches = build_batches(&policy, &devices);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].devices.len(), 5);
        assert_eq!(batches[1].devices.len(), 5);
    }

    #[test]
    fn selector_stanza_takes_matching_devices_first() {
        let mut devices = vec![
            device("a-canary", &[("canary", "true")]),
            device("b-main", &[]),
            device("c-canary", &[("canary", "true")]),
            device("d-main", &[]),
        ];
        devices.rotate_left(1); // input order must not matter

        let policy = policy(vec![BatchStanza {
            selector: Some(LabelSelector::from_labels(
                [("canary".to_string(), "true".to_string())].into(),
            )),
            limit: None,
        }]);

        let batches = build_batches(&policy, &devices);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].devices, vec!["a-canary", "c-canary"]);
        assert_eq!(batches[1].devices, vec!["b-main", "d-main"]);
    }

    #[test]
    fn no_stanzas_yield_a_single_batch() {
        let devices = vec![device("d1", &[]), device("d2", &[])];
        let batches = build_batches(&policy(vec![]), &devices);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].devices.len(), 2);
    }

    #[test]
    fn report_counts_partition_the_batch() {
        let states = vec![
            MemberState::Success,
            MemberState::Success,
            MemberState::Failed,
            MemberState::TimedOut,
            MemberState::Success,
        ];
        let report = make_report(&states);
        assert_eq!(report.total, 5);
        assert_eq!(report.successful + report.failed + report.timed_out, 5);
        assert_eq!(report.success_percentage, 60);
    }
}
