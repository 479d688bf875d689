use std::sync::Arc;

use chrono::Utc;
use flotilla_controller::{
    DeviceReconciler, EventEmitter, FleetVersioner, OwnerResolver, RolloutController,
};
use flotilla_domain::{
    annotations, conditions::reasons, set_condition, ApprovalMethod, BatchLimit, BatchStanza,
    Condition, ConditionStatus, ConditionType, Device, DeviceSpec, DeviceUpdatedStatus,
    DisruptionBudget, EventReason, Fleet, FleetSpec, FleetTemplate, LabelSelector, OrgId, OsSpec,
    ResourceKind, ResourceRef, RolloutPolicy, RolloutState,
};
use flotilla_store::{InMemoryStore, Store};

fn org() -> OrgId {
    OrgId::new("default")
}

struct Harness {
    store: Arc<InMemoryStore>,
    versioner: FleetVersioner,
    resolver: OwnerResolver,
    rollout: RolloutController,
    devices: DeviceReconciler,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let emitter = EventEmitter::new(store.clone(), "service/fleet-controller");
        Self {
            versioner: FleetVersioner::new(store.clone(), emitter.clone()),
            resolver: OwnerResolver::new(store.clone(), emitter.clone()),
            rollout: RolloutController::new(store.clone(), emitter.clone()),
            devices: DeviceReconciler::new(store.clone(), emitter),
            store,
        }
    }

    async fn seed_fleet(&self, name: &str, image: &str, policy: Option<RolloutPolicy>) {
        let spec = FleetSpec {
            selector: Some(LabelSelector::from_labels(
                [("env".to_string(), "prod".to_string())].into(),
            )),
            template: FleetTemplate {
                metadata: None,
                spec: DeviceSpec {
                    os: Some(OsSpec { image: image.into() }),
                    ..Default::default()
                },
            },
            rollout_policy: policy,
        };
        self.store
            .create_fleet(&org(), Fleet::new(name, spec))
            .await
            .unwrap();
    }

    async fn seed_device(&self, name: &str) {
        let mut device = Device::new(name);
        device.metadata.labels =
            Some([("env".to_string(), "prod".to_string())].into());
        device.status.last_seen = Some(Utc::now());
        device.status.config.rendered_version = "0".into();
        self.store.create_device(&org(), device).await.unwrap();
        self.resolver.reconcile_device(&org(), name).await.unwrap();
    }

    /// Agent side of an update: acknowledge the new spec, apply it, report.
    async fn agent_starts_updating(&self, name: &str) {
        let mut device = self.store.get_device(&org(), name).await.unwrap().unwrap();
        set_condition(
            &mut device.status.conditions,
            Condition::new(ConditionType::DeviceUpdating, ConditionStatus::True, reasons::UPDATING)
                .with_message("applying update"),
            Utc::now(),
        );
        device.status.last_seen = Some(Utc::now());
        self.store.update_device(&org(), device).await.unwrap();
    }

    async fn agent_finishes_update(&self, name: &str) {
        let mut device = self.store.get_device(&org(), name).await.unwrap().unwrap();
        let rendered = device
            .metadata
            .annotation(annotations::RENDERED_VERSION)
            .unwrap()
            .to_string();
        set_condition(
            &mut device.status.conditions,
            Condition::new(ConditionType::DeviceUpdating, ConditionStatus::False, reasons::UPDATED),
            Utc::now(),
        );
        device.status.config.rendered_version = rendered;
        device.status.last_seen = Some(Utc::now());
        self.store.update_device(&org(), device).await.unwrap();
    }

    async fn agent_fails_update(&self, name: &str) {
        let mut device = self.store.get_device(&org(), name).await.unwrap().unwrap();
        set_condition(
            &mut device.status.conditions,
            Condition::new(ConditionType::DeviceUpdating, ConditionStatus::False, reasons::ERROR)
                .with_message("image pull failed"),
            Utc::now(),
        );
        device.status.last_seen = Some(Utc::now());
        self.store.update_device(&org(), device).await.unwrap();
    }

    async fn fleet(&self, name: &str) -> Fleet {
        self.store.get_fleet(&org(), name).await.unwrap().unwrap()
    }

    async fn events_for(&self, kind: ResourceKind, name: &str) -> Vec<EventReason> {
        self.store
            .list_events(&org(), Some(&ResourceRef::new(kind, name)), 100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.reason)
            .collect()
    }
}

fn assert_subsequence(haystack: &[EventReason], needle: &[EventReason]) {
    let mut iter = haystack.iter();
    for expected in needle {
        assert!(
            iter.any(|r| r == expected),
            "expected {:?} (in order) within {:?}",
            needle,
            haystack
        );
    }
}

/// Single-batch automatic rollout where every device succeeds.
#[tokio::test]
async fn single_batch_rollout_succeeds_end_to_end() {
    let h = Harness::new();
    h.seed_fleet(
        "store",
        "img:v1",
        Some(RolloutPolicy {
            device_selection: vec![BatchStanza {
                selector: None,
                limit: Some(BatchLimit::Percent("100%".into())),
            }],
            success_threshold: Some(100),
            disruption_budget: None,
            default_update_timeout_seconds: None,
            approval_method: ApprovalMethod::Automatic,
        }),
    )
    .await;
    for name in ["d1", "d2", "d3"] {
        h.seed_device(name).await;
    }

    h.versioner.reconcile(&org(), "store").await.unwrap();
    let fleet = h.fleet("store").await;
    assert_eq!(fleet.template_version(), Some("store-1"));

    // rollout dispatches the single batch
    h.rollout.reconcile(&org(), "store").await.unwrap();
    let fleet = h.fleet("store").await;
    let rollout = fleet.status.rollout.as_ref().unwrap();
    assert_eq!(rollout.state, RolloutState::InProgress);
    assert_eq!(rollout.batches.len(), 1);
    assert_eq!(rollout.batches[0].devices.len(), 3);
    assert_eq!(fleet.metadata.annotation(annotations::BATCH_NUMBER), Some("1"));

    // every device renders, updates, and reports in
    for name in ["d1", "d2", "d3"] {
        h.agent_starts_updating(name).await;
        h.devices.reconcile(&org(), name).await.unwrap();

        let device = h.store.get_device(&org(), name).await.unwrap().unwrap();
        assert_eq!(device.spec.os.as_ref().unwrap().image, "img:v1");
        assert_eq!(device.metadata.annotation(annotations::RENDERED_VERSION), Some("1"));
        assert_eq!(
            device.metadata.annotation(annotations::RENDERED_TEMPLATE_VERSION),
            Some("store-1")
        );
        assert_eq!(
            device.metadata.annotation(annotations::SELECTED_FOR_ROLLOUT),
            Some("store-1")
        );

        h.agent_finishes_update(name).await;
        h.devices.reconcile(&org(), name).await.unwrap();
        let device = h.store.get_device(&org(), name).await.unwrap().unwrap();
        assert_eq!(device.status.updated.status, DeviceUpdatedStatus::UpToDate);
    }

    // batch evaluates at 100% and the rollout completes
    h.rollout.reconcile(&org(), "store").await.unwrap();
    let fleet = h.fleet("store").await;
    let rollout = fleet.status.rollout.as_ref().unwrap();
    assert_eq!(rollout.state, RolloutState::Completed);
    let report = rollout.batches[0].report.unwrap();
    assert_eq!(report.total, 3);
    assert_eq!(report.successful, 3);
    assert_eq!(report.success_percentage, 100);

    let fleet_events = h.events_for(ResourceKind::Fleet, "store").await;
    assert_subsequence(
        &fleet_events,
        &[
            EventReason::FleetRolloutStarted,
            EventReason::FleetRolloutBatchDispatched,
            EventReason::FleetRolloutBatchCompleted,
            EventReason::FleetRolloutCompleted,
        ],
    );
    assert!(!fleet_events.contains(&EventReason::FleetRolloutFailed));

    for name in ["d1", "d2", "d3"] {
        let device_events = h.events_for(ResourceKind::Device, name).await;
        assert_subsequence(
            &device_events,
            &[
                EventReason::FleetRolloutDeviceSelected,
                EventReason::DeviceContentUpdating,
                EventReason::DeviceContentUpToDate,
            ],
        );
        assert!(!device_events.contains(&EventReason::DeviceContentOutOfDate));
    }
}

/// Two-batch manual rollout where batch 1 lands below the threshold.
#[tokio::test]
async fn manual_rollout_fails_below_threshold_without_touching_batch_two() {
    let h = Harness::new();
    h.seed_fleet(
        "store",
        "img:v2",
        Some(RolloutPolicy {
            device_selection: vec![
                BatchStanza {
                    selector: None,
                    limit: Some(BatchLimit::Percent("50%".into())),
                },
                BatchStanza {
                    selector: None,
                    limit: Some(BatchLimit::Percent("50%".into())),
                },
            ],
            success_threshold: Some(80),
            disruption_budget: None,
            default_update_timeout_seconds: None,
            approval_method: ApprovalMethod::Manual,
        }),
    )
    .await;
    let names: Vec<String> = (0..10).map(|i| format!("d{:02}", i)).collect();
    for name in &names {
        h.seed_device(name).await;
    }

    h.versioner.reconcile(&org(), "store").await.unwrap();
    h.rollout.reconcile(&org(), "store").await.unwrap();

    let fleet = h.fleet("store").await;
    let rollout = fleet.status.rollout.as_ref().unwrap();
    assert_eq!(rollout.batches.len(), 2);
    let batch_one: Vec<String> = rollout.batches[0].devices.clone();
    assert_eq!(batch_one.len(), 5);

    // 3 succeed, 2 give up with an error
    for name in &batch_one[..3] {
        h.devices.reconcile(&org(), name).await.unwrap();
        h.agent_finishes_update(name).await;
        h.devices.reconcile(&org(), name).await.unwrap();
    }
    for name in &batch_one[3..] {
        h.devices.reconcile(&org(), name).await.unwrap();
        h.agent_fails_update(name).await;
        h.devices.reconcile(&org(), name).await.unwrap();
    }

    h.rollout.reconcile(&org(), "store").await.unwrap();
    let fleet = h.fleet("store").await;
    let rollout = fleet.status.rollout.as_ref().unwrap();
    assert_eq!(rollout.state, RolloutState::Failed);
    let report = rollout.batches[0].report.unwrap();
    assert_eq!(report.successful, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(report.success_percentage, 60);

    let fleet_events = h.events_for(ResourceKind::Fleet, "store").await;
    assert!(fleet_events.contains(&EventReason::FleetRolloutFailed));

    // batch 2 devices were never selected; batch 1 selections remain
    for name in &rollout.batches[1].devices {
        let device = h.store.get_device(&org(), name).await.unwrap().unwrap();
        assert!(device.metadata.annotation(annotations::SELECTED_FOR_ROLLOUT).is_none());
    }
    for name in &batch_one {
        let device = h.store.get_device(&org(), name).await.unwrap().unwrap();
        assert_eq!(
            device.metadata.annotation(annotations::SELECTED_FOR_ROLLOUT),
            Some("store-1")
        );
    }
}

/// Manual approval gates advancement between passing batches.
#[tokio::test]
async fn manual_approval_advances_to_the_next_batch() {
    let h = Harness::new();
    h.seed_fleet(
        "store",
        "img:v3",
        Some(RolloutPolicy {
            device_selection: vec![
                BatchStanza { selector: None, limit: Some(BatchLimit::Count(1)) },
                BatchStanza { selector: None, limit: None },
            ],
            success_threshold: Some(100),
            disruption_budget: None,
            default_update_timeout_seconds: None,
            approval_method: ApprovalMethod::Manual,
        }),
    )
    .await;
    for name in ["d1", "d2"] {
        h.seed_device(name).await;
    }

    h.versioner.reconcile(&org(), "store").await.unwrap();
    h.rollout.reconcile(&org(), "store").await.unwrap();

    // batch 1 (one device) succeeds
    h.devices.reconcile(&org(), "d1").await.unwrap();
    h.agent_finishes_update("d1").await;
    h.devices.reconcile(&org(), "d1").await.unwrap();

    h.rollout.reconcile(&org(), "store").await.unwrap();
    let fleet = h.fleet("store").await;
    assert_eq!(fleet.status.rollout.as_ref().unwrap().state, RolloutState::Waiting);
    assert_eq!(
        fleet.metadata.annotation(annotations::ROLLOUT_APPROVED),
        Some("pending")
    );
    // batch 2 untouched while waiting
    let d2 = h.store.get_device(&org(), "d2").await.unwrap().unwrap();
    assert!(d2.metadata.annotation(annotations::SELECTED_FOR_ROLLOUT).is_none());

    // operator approves
    let mut fleet = h.fleet("store").await;
    fleet.metadata.set_annotation(annotations::ROLLOUT_APPROVED, "true");
    h.store.update_fleet(&org(), fleet).await.unwrap();

    h.rollout.reconcile(&org(), "store").await.unwrap();
    let d2 = h.store.get_device(&org(), "d2").await.unwrap().unwrap();
    assert_eq!(
        d2.metadata.annotation(annotations::SELECTED_FOR_ROLLOUT),
        Some("store-1")
    );
}

/// The disruption budget caps how many devices a dispatch cycle may disturb.
#[tokio::test]
async fn disruption_budget_dispatches_in_sub_steps() {
    let h = Harness::new();
    h.seed_fleet(
        "store",
        "img:v4",
        Some(RolloutPolicy {
            device_selection: vec![],
            success_threshold: Some(100),
            disruption_budget: Some(DisruptionBudget { max_unavailable: 1 }),
            default_update_timeout_seconds: None,
            approval_method: ApprovalMethod::Automatic,
        }),
    )
    .await;
    for name in ["d1", "d2", "d3"] {
        h.seed_device(name).await;
    }

    h.versioner.reconcile(&org(), "store").await.unwrap();
    h.rollout.reconcile(&org(), "store").await.unwrap();

    let selected = |devices: &[Device]| {
        devices
            .iter()
            .filter(|d| d.metadata.annotation(annotations::SELECTED_FOR_ROLLOUT).is_some())
            .count()
    };
    let devices = h.store.list_devices(&org()).await.unwrap();
    assert_eq!(selected(&devices), 1, "budget of one admits one device per cycle");

    // first device completes, freeing the budget
    let first = devices
        .iter()
        .find(|d| d.metadata.annotation(annotations::SELECTED_FOR_ROLLOUT).is_some())
        .unwrap()
        .metadata
        .name
        .clone();
    h.devices.reconcile(&org(), &first).await.unwrap();
    h.agent_finishes_update(&first).await;
    h.devices.reconcile(&org(), &first).await.unwrap();

    h.rollout.reconcile(&org(), "store").await.unwrap();
    let devices = h.store.list_devices(&org()).await.unwrap();
    assert_eq!(selected(&devices), 2);
}

/// A device whose template cannot render counts as failed at evaluation.
#[tokio::test]
async fn render_failure_counts_as_batch_failure() {
    let h = Harness::new();
    h.seed_fleet(
        "store",
        "img:{{ metadata.labels.channel }}",
        Some(RolloutPolicy {
            device_selection: vec![],
            success_threshold: Some(100),
            disruption_budget: None,
            default_update_timeout_seconds: None,
            approval_method: ApprovalMethod::Automatic,
        }),
    )
    .await;
    // labeled env=prod only; the template needs a 'channel' label
    h.seed_device("d1").await;

    h.versioner.reconcile(&org(), "store").await.unwrap();
    h.rollout.reconcile(&org(), "store").await.unwrap();
    h.devices.reconcile(&org(), "d1").await.unwrap();

    let device = h.store.get_device(&org(), "d1").await.unwrap().unwrap();
    assert!(device.metadata.annotation(annotations::LAST_ROLLOUT_ERROR).is_some());
    assert_eq!(device.spec.os, None);

    h.rollout.reconcile(&org(), "store").await.unwrap();
    let fleet = h.fleet("store").await;
    let rollout = fleet.status.rollout.as_ref().unwrap();
    assert_eq!(rollout.state, RolloutState::Failed);
    let report = rollout.batches[0].report.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.success_percentage, 0);
}

/// Fleets without a rollout policy select every owned device immediately.
#[tokio::test]
async fn policyless_fleet_selects_all_devices() {
    let h = Harness::new();
    h.seed_fleet("store", "img:v5", None).await;
    for name in ["d1", "d2"] {
        h.seed_device(name).await;
    }

    h.versioner.reconcile(&org(), "store").await.unwrap();
    h.rollout.reconcile(&org(), "store").await.unwrap();

    for name in ["d1", "d2"] {
        let device = h.store.get_device(&org(), name).await.unwrap().unwrap();
        assert_eq!(
            device.metadata.annotation(annotations::SELECTED_FOR_ROLLOUT),
            Some("store-1")
        );
    }
}

/// Devices that never finish within the update timeout count as timed out.
#[tokio::test]
async fn stuck_devices_time_out_and_fail_the_batch() {
    let h = Harness::new();
    h.seed_fleet(
        "store",
        "img:v6",
        Some(RolloutPolicy {
            device_selection: vec![],
            success_threshold: Some(100),
            disruption_budget: None,
            default_update_timeout_seconds: Some(0),
            approval_method: ApprovalMethod::Automatic,
        }),
    )
    .await;
    h.seed_device("d1").await;

    h.versioner.reconcile(&org(), "store").await.unwrap();
    h.rollout.reconcile(&org(), "store").await.unwrap();
    // the device never reports anything after selection
    h.rollout.reconcile(&org(), "store").await.unwrap();

    let fleet = h.fleet("store").await;
    let rollout = fleet.status.rollout.as_ref().unwrap();
    assert_eq!(rollout.state, RolloutState::Failed);
    let report = rollout.batches[0].report.unwrap();
    assert_eq!(report.timed_out, 1);
}
