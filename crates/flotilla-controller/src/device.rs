use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flotilla_domain::{
    annotations, conditions::reasons, find_condition, validate_device_spec, Condition,
    ConditionStatus, ConditionType, Device, EventReason, LifecycleState, OrgId, ResourceKind,
    ResourceRef,
};
use flotilla_render::render_device_spec;
use flotilla_status::derive_device_status;
use flotilla_store::Store;
use tracing::{debug, info, warn};

use crate::conditions::apply_condition;
use crate::emitter::EventEmitter;
use crate::error::ControllerError;
use crate::runner::ReconcileOutcome;

const MISSING_TEMPLATE_RETRY: Duration = Duration::from_secs(30);

/// Per-device loop: renders pending spec updates, derives status from agent
/// reports, drives decommissioning, and surfaces every transition as an
/// event. Reads fleet annotations but never writes fleet state.
pub struct DeviceReconciler {
    store: Arc<dyn Store>,
    emitter: EventEmitter,
    disconnect_timeout: chrono::Duration,
    decommission_grace: chrono::Duration,
}

impl DeviceReconciler {
    pub fn new(store: Arc<dyn Store>, emitter: EventEmitter) -> Self {
        Self {
            store,
            emitter,
            disconnect_timeout: flotilla_status::default_disconnect_timeout(),
            decommission_grace: chrono::Duration::minutes(30),
        }
    }

    pub fn with_disconnect_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn with_decommission_grace(mut self, grace: chrono::Duration) -> Self {
        self.decommission_grace = grace;
        self
    }

    pub async fn reconcile(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let Some(device) = self.store.get_device(org, name).await? else {
            return Ok(ReconcileOutcome::Complete);
        };
        let original = device.clone();
        let mut device = device;
        let now = Utc::now();

        let fleet = match &device.metadata.owner {
            Some(owner) if owner.kind == ResourceKind::Fleet => {
                self.store.get_fleet(org, &owner.name).await?
            }
            _ => None,
        };

        let mut events: Vec<(EventReason, String)> = Vec::new();
        let mut outcome = ReconcileOutcome::Complete;

        self.apply_reconnect_window(&mut device);

        if !device.metadata.annotation_is_true(annotations::CONFLICT_PAUSED) {
            if device.is_managed() {
                if let Some(retry) = self.render_managed(org, &mut device, &mut events).await? {
                    outcome = retry;
                }
            } else {
                self.revalidate_unmanaged(&mut device, &mut events);
            }
        }

        if device.spec.decommission.is_some()
            && find_condition(&device.status.conditions, ConditionType::DeviceDecommissioning)
                .is_none()
        {
            apply_condition(
                &mut device.status.conditions,
                Condition::new(
                    ConditionType::DeviceDecommissioning,
                    ConditionStatus::True,
                    reasons::DECOMMISSION_STARTED,
                ),
                now,
            );
        }

        let derivation =
            derive_device_status(&device, fleet.as_ref(), now, self.disconnect_timeout);
        if derivation.changed {
            device.status = derivation.status;
        }
        if derivation.clear_awaiting_reconnect {
            device.metadata.remove_annotation(annotations::AWAITING_RECONNECT);
        }
        for update in &derivation.updates {
            events.push((update.reason, update.message.clone()));
        }

        // decommissioned devices are deleted after the grace period
        if device.status.lifecycle.status == LifecycleState::Decommissioned {
            let decided_at = find_condition(
                &device.status.conditions,
                ConditionType::DeviceDecommissioning,
            )
            .and_then(|c| c.last_transition_time)
            .unwrap_or(now);
            if now - decided_at >= self.decommission_grace {
                info!(device = name, "decommission grace elapsed, deleting device");
                self.store.delete_device(org, name).await?;
                for (reason, message) in events {
                    self.emitter
                        .emit(org, ResourceRef::new(ResourceKind::Device, name), reason, message)
                        .await;
                }
                return Ok(ReconcileOutcome::Complete);
            }
            let remaining = self.decommission_grace - (now - decided_at);
            outcome = ReconcileOutcome::Retry(Some(
                remaining.to_std().unwrap_or(Duration::from_secs(1)),
            ));
        }

        if device != original {
            match self.store.update_device(org, device).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => return Ok(ReconcileOutcome::Retry(None)),
                Err(e) => return Err(e.into()),
            }
        }

        for (reason, message) in events {
            self.emitter
                .emit(org, ResourceRef::new(ResourceKind::Device, name), reason, message)
                .await;
        }

        Ok(outcome)
    }

    /// Restore handling: a device reporting a rendered version beyond what
    /// the service expects took a state transfer we did not mediate. Pause
    /// it rather than fight its spec.
    fn apply_reconnect_window(&self, device: &mut Device) {
        if !device.metadata.annotation_is_true(annotations::AWAITING_RECONNECT) {
            return;
        }
        let reported: u64 = match device.status.config.rendered_version.parse() {
            Ok(v) => v,
            Err(_) => return, // nothing reported yet, keep waiting
        };
        let expected: u64 = device
            .metadata
            .annotation(annotations::RENDERED_VERSION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if reported > expected {
            warn!(
                device = %device.metadata.name,
                reported,
                expected,
                "device reports a future rendered version, pausing"
            );
            device.metadata.set_annotation(annotations::CONFLICT_PAUSED, "true");
            device.metadata.remove_annotation(annotations::AWAITING_RECONNECT);
        }
        // reported == expected is cleared after derivation
    }

    /// Render the fleet template for a device selected for rollout, if its
    /// rendered template version is behind the selection target.
    async fn render_managed(
        &self,
        org: &OrgId,
        device: &mut Device,
        events: &mut Vec<(EventReason, String)>,
    ) -> Result<Option<ReconcileOutcome>, ControllerError> {
        let Some(target) = device
            .metadata
            .annotation(annotations::SELECTED_FOR_ROLLOUT)
            .map(str::to_string)
        else {
            return Ok(None);
        };
        if device.metadata.annotation(annotations::RENDERED_TEMPLATE_VERSION)
            == Some(target.as_str())
        {
            return Ok(None);
        }

        let Some(tv) = self.store.get_template_version(org, &target).await? else {
            debug!(device = %device.metadata.name, template_version = %target, "template version not yet visible");
            return Ok(Some(ReconcileOutcome::Retry(Some(MISSING_TEMPLATE_RETRY))));
        };

        let now = Utc::now();
        match render_device_spec(&tv.spec.template.spec, &device.metadata) {
            Ok(rendered) => {
                let next_version = device
                    .metadata
                    .annotation(annotations::RENDERED_VERSION)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0)
                    + 1;

                device.spec = rendered;
                device
                    .metadata
                    .set_annotation(annotations::RENDERED_VERSION, next_version.to_string());
                device
                    .metadata
                    .set_annotation(annotations::RENDERED_TEMPLATE_VERSION, &target);
                device.metadata.remove_annotation(annotations::LAST_ROLLOUT_ERROR);

                let change = apply_condition(
                    &mut device.status.conditions,
                    Condition::new(
                        ConditionType::DeviceSpecValid,
                        ConditionStatus::True,
                        reasons::VALID,
                    )
                    .with_observed_generation(device.metadata.generation),
                    now,
                );
                if change.status_changed {
                    events.push((
                        EventReason::DeviceSpecValid,
                        format!("rendered template version {} as version {}", target, next_version),
                    ));
                }
                info!(
                    device = %device.metadata.name,
                    template_version = %target,
                    rendered_version = next_version,
                    "rendered device spec"
                );
            }
            Err(e) => {
                // spec stays untouched; the failure is visible on the device
                device
                    .metadata
                    .set_annotation(annotations::LAST_ROLLOUT_ERROR, e.to_string());
                let change = apply_condition(
                    &mut device.status.conditions,
                    Condition::new(
                        ConditionType::DeviceSpecValid,
                        ConditionStatus::False,
                        reasons::INVALID,
                    )
                    .with_message(e.to_string())
                    .with_observed_generation(device.metadata.generation),
                    now,
                );
                if change.status_changed {
                    events.push((EventReason::DeviceSpecInvalid, e.to_string()));
                }
                warn!(device = %device.metadata.name, error = %e, "device spec render failed");
            }
        }
        Ok(None)
    }

    /// Unmanaged devices own their spec; validate it and advance the
    /// rendered version whenever the spec generation moves.
    fn revalidate_unmanaged(&self, device: &mut Device, events: &mut Vec<(EventReason, String)>) {
        let generation = device.metadata.generation;
        let seen = find_condition(&device.status.conditions, ConditionType::DeviceSpecValid)
            .and_then(|c| c.observed_generation);
        if seen == Some(generation) {
            return;
        }

        let now = Utc::now();
        match validate_device_spec(&device.spec) {
            Ok(()) => {
                let next_version = device
                    .metadata
                    .annotation(annotations::RENDERED_VERSION)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0)
                    + 1;
                device
                    .metadata
                    .set_annotation(annotations::RENDERED_VERSION, next_version.to_string());
                let change = apply_condition(
                    &mut device.status.conditions,
                    Condition::new(
                        ConditionType::DeviceSpecValid,
                        ConditionStatus::True,
                        reasons::VALID,
                    )
                    .with_observed_generation(generation),
                    now,
                );
                if change.status_changed {
                    events.push((
                        EventReason::DeviceSpecValid,
                        format!("device spec valid at version {}", next_version),
                    ));
                }
            }
            Err(e) => {
                let change = apply_condition(
                    &mut device.status.conditions,
                    Condition::new(
                        ConditionType::DeviceSpecValid,
                        ConditionStatus::False,
                        reasons::INVALID,
                    )
                    .with_message(e.describe())
                    .with_observed_generation(generation),
                    now,
                );
                if change.status_changed {
                    events.push((EventReason::DeviceSpecInvalid, e.describe()));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl crate::runner::Reconciler for DeviceReconciler {
    type Key = (OrgId, String);

    fn name(&self) -> &'static str {
        "device"
    }

    async fn reconcile(&self, key: &Self::Key) -> Result<ReconcileOutcome, ControllerError> {
        DeviceReconciler::reconcile(self, &key.0, &key.1).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_domain::{
        DeviceSpec, DeviceUpdatedStatus, Fleet, FleetSpec, FleetTemplate, Metadata, OsSpec,
        OwnerRef, TemplateVersion, TemplateVersionSpec,
    };
    use flotilla_store::{compute_spec_digest, InMemoryStore};

    fn org() -> OrgId {
        OrgId::new("default")
    }

    fn reconciler(store: Arc<InMemoryStore>) -> DeviceReconciler {
        let emitter = EventEmitter::new(store.clone(), "service/device-controller");
        DeviceReconciler::new(store, emitter)
    }

    async fn seed_fleet_and_template(store: &InMemoryStore, image: &str) -> String {
        let template = FleetTemplate {
            metadata: None,
            spec: DeviceSpec {
                os: Some(OsSpec { image: image.into() }),
                ..Default::default()
            },
        };
        let mut fleet = Fleet::new("edge", FleetSpec::default());
        fleet
            .metadata
            .set_annotation(annotations::TEMPLATE_VERSION, "edge-1");
        store.create_fleet(&org(), fleet).await.unwrap();

        let mut metadata = Metadata::new("edge-1");
        metadata.owner = Some(OwnerRef::fleet("edge"));
        store
            .create_template_version(
                &org(),
                TemplateVersion {
                    metadata,
                    spec: TemplateVersionSpec {
                        fleet: "edge".into(),
                        digest: compute_spec_digest(&template),
                        template,
                    },
                },
            )
            .await
            .unwrap();
        "edge-1".to_string()
    }

    async fn seed_selected_device(store: &InMemoryStore, tv: &str, labels: &[(&str, &str)]) {
        let mut device = Device::new("d1");
        device.metadata.owner = Some(OwnerRef::fleet("edge"));
        device.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        device
            .metadata
            .set_annotation(annotations::SELECTED_FOR_ROLLOUT, tv);
        device.status.last_seen = Some(Utc::now());
        store.create_device(&org(), device).await.unwrap();
    }

    #[tokio::test]
    async fn renders_selected_device_and_advances_versions() {
        let store = Arc::new(InMemoryStore::new());
        let tv = seed_fleet_and_template(&store, "os:{{ metadata.labels.channel }}").await;
        seed_selected_device(&store, &tv, &[("channel", "stable")]).await;

        reconciler(store.clone()).reconcile(&org(), "d1").await.unwrap();

        let device = store.get_device(&org(), "d1").await.unwrap().unwrap();
        assert_eq!(device.spec.os.unwrap().image, "os:stable");
        assert_eq!(device.metadata.annotation(annotations::RENDERED_VERSION), Some("1"));
        assert_eq!(
            device.metadata.annotation(annotations::RENDERED_TEMPLATE_VERSION),
            Some("edge-1")
        );
        assert!(flotilla_domain::is_condition_true(
            &device.status.conditions,
            ConditionType::DeviceSpecValid
        ));

        let involved = ResourceRef::new(ResourceKind::Device, "d1");
        let events = store.list_events(&org(), Some(&involved), 20).await.unwrap();
        assert!(events.iter().any(|e| e.reason == EventReason::DeviceSpecValid));
    }

    #[tokio::test]
    async fn render_failure_leaves_spec_untouched() {
        // template references a label the device does not carry
        let store = Arc::new(InMemoryStore::new());
        let tv = seed_fleet_and_template(&store, "os:{{ metadata.labels.channel }}").await;
        seed_selected_device(&store, &tv, &[]).await;

        reconciler(store.clone()).reconcile(&org(), "d1").await.unwrap();

        let device = store.get_device(&org(), "d1").await.unwrap().unwrap();
        assert_eq!(device.spec.os, None, "failed render must not write the spec");
        assert!(device
            .metadata
            .annotation(annotations::LAST_ROLLOUT_ERROR)
            .is_some());
        assert!(device
            .metadata
            .annotation(annotations::RENDERED_TEMPLATE_VERSION)
            .is_none());
        let valid =
            find_condition(&device.status.conditions, ConditionType::DeviceSpecValid).unwrap();
        assert_eq!(valid.status, ConditionStatus::False);

        let involved = ResourceRef::new(ResourceKind::Device, "d1");
        let events = store.list_events(&org(), Some(&involved), 20).await.unwrap();
        assert!(events.iter().any(|e| e.reason == EventReason::DeviceSpecInvalid));
    }

    #[tokio::test]
    async fn unmanaged_spec_change_advances_rendered_version() {
        let store = Arc::new(InMemoryStore::new());
        let mut device = Device::new("d1");
        device.status.last_seen = Some(Utc::now());
        device.spec.os = Some(OsSpec { image: "os:v1".into() });
        store.create_device(&org(), device).await.unwrap();

        let reconciler = reconciler(store.clone());
        reconciler.reconcile(&org(), "d1").await.unwrap();
        let device = store.get_device(&org(), "d1").await.unwrap().unwrap();
        assert_eq!(device.metadata.annotation(annotations::RENDERED_VERSION), Some("1"));

        // spec write bumps generation, which advances the rendered version
        let mut changed = device.clone();
        changed.spec.os = Some(OsSpec { image: "os:v2".into() });
        store.update_device(&org(), changed).await.unwrap();
        reconciler.reconcile(&org(), "d1").await.unwrap();

        let device = store.get_device(&org(), "d1").await.unwrap().unwrap();
        assert_eq!(device.metadata.annotation(annotations::RENDERED_VERSION), Some("2"));

        // device reports the new version and becomes up to date
        let mut reporting = device.clone();
        reporting.status.config.rendered_version = "2".into();
        reporting.status.last_seen = Some(Utc::now());
        store.update_device(&org(), reporting).await.unwrap();
        reconciler.reconcile(&org(), "d1").await.unwrap();

        let device = store.get_device(&org(), "d1").await.unwrap().unwrap();
        assert_eq!(device.status.updated.status, DeviceUpdatedStatus::UpToDate);
    }

    #[tokio::test]
    async fn future_rendered_version_pauses_the_device() {
        let store = Arc::new(InMemoryStore::new());
        let mut device = Device::new("d1");
        device.status.last_seen = Some(Utc::now());
        device.metadata.set_annotation(annotations::AWAITING_RECONNECT, "true");
        device.metadata.set_annotation(annotations::RENDERED_VERSION, "3");
        device.status.config.rendered_version = "5".into();
        store.create_device(&org(), device).await.unwrap();

        reconciler(store.clone()).reconcile(&org(), "d1").await.unwrap();

        let device = store.get_device(&org(), "d1").await.unwrap().unwrap();
        assert!(device.metadata.annotation_is_true(annotations::CONFLICT_PAUSED));
        assert!(device
            .metadata
            .annotation(annotations::AWAITING_RECONNECT)
            .is_none());
    }

    #[tokio::test]
    async fn caught_up_device_leaves_the_reconnect_window() {
        let store = Arc::new(InMemoryStore::new());
        let mut device = Device::new("d1");
        device.status.last_seen = Some(Utc::now());
        device.metadata.set_annotation(annotations::AWAITING_RECONNECT, "true");
        device.metadata.set_annotation(annotations::RENDERED_VERSION, "3");
        device.status.config.rendered_version = "3".into();
        store.create_device(&org(), device).await.unwrap();

        reconciler(store.clone()).reconcile(&org(), "d1").await.unwrap();

        let device = store.get_device(&org(), "d1").await.unwrap().unwrap();
        assert!(device
            .metadata
            .annotation(annotations::AWAITING_RECONNECT)
            .is_none());
        assert!(!device.metadata.annotation_is_true(annotations::CONFLICT_PAUSED));
    }

    #[tokio::test]
    async fn decommission_completion_deletes_after_grace() {
        let store = Arc::new(InMemoryStore::new());
        let mut device = Device::new("d1");
        device.status.last_seen = Some(Utc::now());
        device.spec.decommission = Some(flotilla_domain::DecommissionSpec {
            target: flotilla_domain::DecommissionTarget::Unenroll,
        });
        // agent already reported completion
        flotilla_domain::set_condition(
            &mut device.status.conditions,
            Condition::new(
                ConditionType::DeviceDecommissioning,
                ConditionStatus::True,
                reasons::DECOMMISSION_COMPLETE,
            ),
            Utc::now(),
        );
        store.create_device(&org(), device).await.unwrap();

        let reconciler =
            reconciler(store.clone()).with_decommission_grace(chrono::Duration::zero());
        reconciler.reconcile(&org(), "d1").await.unwrap();

        assert!(store.get_device(&org(), "d1").await.unwrap().is_none());
        let involved = ResourceRef::new(ResourceKind::Device, "d1");
        let events = store.list_events(&org(), Some(&involved), 20).await.unwrap();
        assert!(events.iter().any(|e| e.reason == EventReason::DeviceDecommissioned));
    }
}
