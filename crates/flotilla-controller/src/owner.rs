use std::sync::Arc;

use chrono::Utc;
use flotilla_domain::{
    conditions::reasons, find_condition, Condition, ConditionStatus, ConditionType, EventDetails,
    EventReason, Fleet, OrgId, OwnerRef, ResourceKind, ResourceRef,
};
use flotilla_store::Store;
use tracing::{debug, info};

use crate::conditions::apply_condition;
use crate::emitter::EventEmitter;
use crate::error::ControllerError;
use crate::runner::ReconcileOutcome;

/// Assigns devices to the single fleet whose selector matches them.
///
/// With two or more matching fleets the device's current owner is left
/// untouched and the ambiguity is surfaced as a `DeviceMultipleOwners`
/// condition; ownership settles once the ambiguity resolves.
pub struct OwnerResolver {
    store: Arc<dyn Store>,
    emitter: EventEmitter,
}

impl OwnerResolver {
    pub fn new(store: Arc<dyn Store>, emitter: EventEmitter) -> Self {
        Self { store, emitter }
    }

    pub async fn reconcile_device(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let Some(mut device) = self.store.get_device(org, name).await? else {
            return Ok(ReconcileOutcome::Complete);
        };

        let fleets = self.store.list_fleets(org).await?;
        // list order is lexicographic, which fixes the tie-break order too
        let matching: Vec<&Fleet> = fleets
            .iter()
            .filter(|f| {
                f.spec
                    .selector
                    .as_ref()
                    .map(|s| s.matches(device.metadata.labels.as_ref()))
                    .unwrap_or(false)
            })
            .collect();

        let was_conflicted = find_condition(&device.status.conditions, ConditionType::DeviceMultipleOwners)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false);

        let mut changed = false;
        let mut events = Vec::new();

        match matching.as_slice() {
            [] => {
                if matches!(&device.metadata.owner, Some(o) if o.kind == ResourceKind::Fleet) {
                    debug!(device = name, "no fleet matches, unsetting owner");
                    device.metadata.owner = None;
                    changed = true;
                }
                if was_conflicted {
                    let change = apply_condition(
                        &mut device.status.conditions,
                        Condition::new(
                            ConditionType::DeviceMultipleOwners,
                            ConditionStatus::False,
                            "NoMatch",
                        ),
                        Utc::now(),
                    );
                    changed |= change.changed;
                    events.push((
                        EventReason::DeviceMultipleOwnersResolved,
                        "no fleet matches the device any longer".to_string(),
                        None,
                    ));
                }
            }
            [fleet] => {
                let owner = OwnerRef::fleet(&fleet.metadata.name);
                if device.metadata.owner.as_ref() != Some(&owner) {
                    info!(device = name, fleet = %fleet.metadata.name, "assigning owner");
                    device.metadata.owner = Some(owner);
                    changed = true;
                }
                if was_conflicted {
                    let change = apply_condition(
                        &mut device.status.conditions,
                        Condition::new(
                            ConditionType::DeviceMultipleOwners,
                            ConditionStatus::False,
                            "SingleMatch",
                        ),
                        Utc::now(),
                    );
                    changed |= change.changed;
                    events.push((
                        EventReason::DeviceMultipleOwnersResolved,
                        format!("single matching fleet: {}", fleet.metadata.name),
                        None,
                    ));
                }
            }
            _ => {
                let names: Vec<String> =
                    matching.iter().map(|f| f.metadata.name.clone()).collect();
                let change = apply_condition(
                    &mut device.status.conditions,
                    Condition::new(
                        ConditionType::DeviceMultipleOwners,
                        ConditionStatus::True,
                        reasons::MULTIPLE_OWNERS,
                    )
                    .with_message(format!("matching fleets: {}", names.join(", "))),
                    Utc::now(),
                );
                changed |= change.changed;
                if change.status_changed {
                    events.push((
                        EventReason::DeviceMultipleOwnersDetected,
                        format!("device matches multiple fleets: {}", names.join(", ")),
                        Some(EventDetails::MultipleOwners {
                            matching_fleets: names,
                        }),
                    ));
                }
            }
        }

        if changed {
            match self.store.update_device(org, device).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => return Ok(ReconcileOutcome::Retry(None)),
                Err(e) => return Err(e.into()),
            }
        }

        for (reason, message, details) in events {
            self.emitter
                .emit_with_details(
                    org,
                    ResourceRef::new(ResourceKind::Device, name),
                    reason,
                    message,
                    details,
                )
                .await;
        }

        Ok(ReconcileOutcome::Complete)
    }

    /// Re-evaluate every device after a fleet's selector changed or the
    /// fleet appeared.
    pub async fn reconcile_fleet(
        &self,
        org: &OrgId,
        _name: &str,
    ) -> Result<ReconcileOutcome, ControllerError> {
        for device in self.store.list_devices(org).await? {
            self.reconcile_device(org, &device.metadata.name).await?;
        }
        Ok(ReconcileOutcome::Complete)
    }

    /// Fleet deletion cascade: unset owners pointing at the deleted fleet,
    /// then rerun selection for them and for any device whose assignment was
    /// blocked by a conflict.
    pub async fn fleet_deleted(
        &self,
        org: &OrgId,
        fleet_name: &str,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let deleted = OwnerRef::fleet(fleet_name);
        for device in self.store.list_devices(org).await? {
            let owned_by_deleted = device.metadata.owner.as_ref() == Some(&deleted);
            let conflicted = find_condition(
                &device.status.conditions,
                ConditionType::DeviceMultipleOwners,
            )
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false);

            if owned_by_deleted {
                let mut unowned = device.clone();
                unowned.metadata.owner = None;
                match self.store.update_device(org, unowned).await {
                    Ok(_) => {}
                    Err(e) if e.is_conflict() => return Ok(ReconcileOutcome::Retry(None)),
                    Err(e) => return Err(e.into()),
                }
            }
            if owned_by_deleted || conflicted {
                self.reconcile_device(org, &device.metadata.name).await?;
            }
        }
        Ok(ReconcileOutcome::Complete)
    }
}

#[async_trait::async_trait]
impl crate::runner::Reconciler for OwnerResolver {
    type Key = (OrgId, String);

    fn name(&self) -> &'static str {
        "owner"
    }

    async fn reconcile(&self, key: &Self::Key) -> Result<ReconcileOutcome, ControllerError> {
        OwnerResolver::reconcile_device(self, &key.0, &key.1).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_domain::{Device, FleetSpec, LabelSelector};
    use flotilla_store::InMemoryStore;

    fn org() -> OrgId {
        OrgId::new("default")
    }

    fn resolver(store: Arc<InMemoryStore>) -> OwnerResolver {
        let emitter = EventEmitter::new(store.clone(), "service/device-controller");
        OwnerResolver::new(store, emitter)
    }

    fn selector_fleet(name: &str, labels: &[(&str, &str)]) -> Fleet {
        Fleet::new(
            name,
            FleetSpec {
                selector: Some(LabelSelector::from_labels(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                )),
                ..Default::default()
            },
        )
    }

    fn labeled_device(name: &str, labels: &[(&str, &str)]) -> Device {
        let mut device = Device::new(name);
        device.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        device
    }

    #[tokio::test]
    async fn single_match_assigns_owner() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = resolver(store.clone());
        store
            .create_fleet(&org(), selector_fleet("prod", &[("env", "prod")]))
            .await
            .unwrap();
        store
            .create_device(&org(), labeled_device("d1", &[("env", "prod")]))
            .await
            .unwrap();

        resolver.reconcile_device(&org(), "d1").await.unwrap();
        let device = store.get_device(&org(), "d1").await.unwrap().unwrap();
        assert_eq!(device.metadata.owner, Some(OwnerRef::fleet("prod")));
    }

    #[tokio::test]
    async fn no_match_unsets_fleet_owner() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = resolver(store.clone());
        let mut device = labeled_device("d1", &[("env", "dev")]);
        device.metadata.owner = Some(OwnerRef::fleet("gone"));
        store.create_device(&org(), device).await.unwrap();

        resolver.reconcile_device(&org(), "d1").await.unwrap();
        let device = store.get_device(&org(), "d1").await.unwrap().unwrap();
        assert_eq!(device.metadata.owner, None);
    }

    #[tokio::test]
    async fn conflict_keeps_previous_owner_and_raises_condition() {
        // the multi-owner scenario: two fleets match, prior owner survives
        let store = Arc::new(InMemoryStore::new());
        let resolver = resolver(store.clone());
        store
            .create_fleet(&org(), selector_fleet("fleet-one", &[("env", "prod")]))
            .await
            .unwrap();
        store
            .create_fleet(&org(), selector_fleet("fleet-two", &[("region", "eu")]))
            .await
            .unwrap();
        let mut device = labeled_device("d1", &[("env", "prod"), ("region", "eu")]);
        device.metadata.owner = Some(OwnerRef::fleet("fleet-one"));
        store.create_device(&org(), device).await.unwrap();

        resolver.reconcile_device(&org(), "d1").await.unwrap();

        let device = store.get_device(&org(), "d1").await.unwrap().unwrap();
        assert_eq!(device.metadata.owner, Some(OwnerRef::fleet("fleet-one")));
        let condition =
            find_condition(&device.status.conditions, ConditionType::DeviceMultipleOwners).unwrap();
        assert_eq!(condition.status, ConditionStatus::True);

        let involved = ResourceRef::new(ResourceKind::Device, "d1");
        let events = store.list_events(&org(), Some(&involved), 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, EventReason::DeviceMultipleOwnersDetected);
        match &events[0].details {
            Some(EventDetails::MultipleOwners { matching_fleets }) => {
                assert_eq!(matching_fleets, &["fleet-one", "fleet-two"]);
            }
            other => panic!("unexpected details {:?}", other),
        }

        // steady-state reconcile emits nothing further
        resolver.reconcile_device(&org(), "d1").await.unwrap();
        assert_eq!(
            store.list_events(&org(), Some(&involved), 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn deleting_a_conflicting_fleet_resolves_to_single_match() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = resolver(store.clone());
        store
            .create_fleet(&org(), selector_fleet("fleet-one", &[("env", "prod")]))
            .await
            .unwrap();
        store
            .create_fleet(&org(), selector_fleet("fleet-two", &[("region", "eu")]))
            .await
            .unwrap();
        let mut device = labeled_device("d1", &[("env", "prod"), ("region", "eu")]);
        device.metadata.owner = Some(OwnerRef::fleet("fleet-one"));
        store.create_device(&org(), device).await.unwrap();
        resolver.reconcile_device(&org(), "d1").await.unwrap();

        store.delete_fleet(&org(), "fleet-two").await.unwrap();
        resolver.fleet_deleted(&org(), "fleet-two").await.unwrap();

        let device = store.get_device(&org(), "d1").await.unwrap().unwrap();
        assert_eq!(device.metadata.owner, Some(OwnerRef::fleet("fleet-one")));
        let condition =
            find_condition(&device.status.conditions, ConditionType::DeviceMultipleOwners).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);

        let involved = ResourceRef::new(ResourceKind::Device, "d1");
        let events = store.list_events(&org(), Some(&involved), 10).await.unwrap();
        assert_eq!(events.last().unwrap().reason, EventReason::DeviceMultipleOwnersResolved);
        assert!(events.last().unwrap().message.contains("fleet-one"));
    }

    #[tokio::test]
    async fn fleet_deletion_cascades_owner_unset() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = resolver(store.clone());
        let mut device = labeled_device("d1", &[("env", "prod")]);
        device.metadata.owner = Some(OwnerRef::fleet("prod"));
        store.create_device(&org(), device).await.unwrap();

        resolver.fleet_deleted(&org(), "prod").await.unwrap();
        let device = store.get_device(&org(), "d1").await.unwrap().unwrap();
        assert_eq!(device.metadata.owner, None);
    }
}
