use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flotilla_domain::{
    annotations, conditions::reasons, validate_fleet_spec, Condition, ConditionStatus,
    ConditionType, EventReason, Fleet, Metadata, OrgId, OwnerRef, ResourceKind, ResourceRef,
    TemplateVersion, TemplateVersionSpec,
};
use flotilla_store::{compute_spec_digest, Store, StoreError};
use tracing::{debug, info};

use crate::conditions::apply_condition;
use crate::emitter::EventEmitter;
use crate::error::ControllerError;
use crate::runner::ReconcileOutcome;

const MISSING_REPOSITORY_RETRY: Duration = Duration::from_secs(30);

/// Materializes immutable template versions from mutable fleet specs.
///
/// Validation failures surface as `FleetValid=False` plus a `FleetInvalid`
/// event and are not retried; a missing referenced repository is retried,
/// since it may yet appear. Equal content digests are a no-op, so re-running
/// over an unchanged fleet never mints a new version.
pub struct FleetVersioner {
    store: Arc<dyn Store>,
    emitter: EventEmitter,
}

impl FleetVersioner {
    pub fn new(store: Arc<dyn Store>, emitter: EventEmitter) -> Self {
        Self { store, emitter }
    }

    pub async fn reconcile(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let Some(fleet) = self.store.get_fleet(org, name).await? else {
            return Ok(ReconcileOutcome::Complete);
        };

        if let Err(e) = validate_fleet_spec(&fleet.spec) {
            self.set_validity(org, fleet, ConditionStatus::False, reasons::INVALID, e.describe())
                .await?;
            return Ok(ReconcileOutcome::Complete);
        }

        let mut missing_repository = None;
        for provider in &fleet.spec.template.spec.config {
            if let Some(repository) = provider.repository() {
                if self.store.get_repository(org, repository).await?.is_none() {
                    missing_repository = Some(repository.to_string());
                    break;
                }
            }
        }
        if let Some(repository) = missing_repository {
            let message = format!("referenced repository '{}' not found", repository);
            self.set_validity(
                org,
                fleet,
                ConditionStatus::False,
                reasons::REPOSITORY_NOT_FOUND,
                message,
            )
            .await?;
            return Ok(ReconcileOutcome::Retry(Some(MISSING_REPOSITORY_RETRY)));
        }

        let digest = compute_spec_digest(&fleet.spec.template);

        let current = fleet.template_version().map(str::to_string);
        if let Some(current) = current {
            if let Some(tv) = self.store.get_template_version(org, &current).await? {
                if tv.spec.digest == digest {
                    debug!(fleet = name, template_version = %current, "template unchanged");
                    self.set_validity(
                        org,
                        fleet,
                        ConditionStatus::True,
                        reasons::VALID,
                        String::new(),
                    )
                    .await?;
                    return Ok(ReconcileOutcome::Complete);
                }
            }
        }

        let existing = self.store.list_template_versions(org, name).await?;
        let next = existing.iter().filter_map(TemplateVersion::sequence).max().unwrap_or(0) + 1;
        let tv_name = format!("{}-{}", name, next);

        let mut metadata = Metadata::new(&tv_name);
        metadata.owner = Some(OwnerRef::fleet(name));
        let tv = TemplateVersion {
            metadata,
            spec: TemplateVersionSpec {
                fleet: name.to_string(),
                template: fleet.spec.template.clone(),
                digest,
            },
        };

        match self.store.create_template_version(org, tv).await {
            Ok(_) => {}
            // a concurrent versioner won the name; re-run over fresh state
            Err(StoreError::AlreadyExists { .. }) => return Ok(ReconcileOutcome::Retry(None)),
            Err(e) => return Err(e.into()),
        }

        info!(fleet = name, template_version = %tv_name, "created template version");

        let mut updated = fleet;
        updated
            .metadata
            .set_annotation(annotations::TEMPLATE_VERSION, &tv_name);
        let change = apply_condition(
            &mut updated.status.conditions,
            Condition::new(ConditionType::FleetValid, ConditionStatus::True, reasons::VALID)
                .with_observed_generation(updated.metadata.generation),
            Utc::now(),
        );

        match self.store.update_fleet(org, updated).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Ok(ReconcileOutcome::Retry(None)),
            Err(e) => return Err(e.into()),
        }

        if change.status_changed {
            self.emitter
                .emit(
                    org,
                    ResourceRef::new(ResourceKind::Fleet, name),
                    EventReason::FleetValid,
                    "fleet specification is valid",
                )
                .await;
        }
        self.emitter
            .emit(
                org,
                ResourceRef::new(ResourceKind::Fleet, name),
                EventReason::FleetRolloutCreated,
                format!("template version {} awaits rollout", tv_name),
            )
            .await;

        Ok(ReconcileOutcome::Complete)
    }

    /// Write the `FleetValid` condition, emitting `FleetValid`/`FleetInvalid`
    /// on an actual status transition.
    async fn set_validity(
        &self,
        org: &OrgId,
        mut fleet: Fleet,
        status: ConditionStatus,
        reason: &str,
        message: String,
    ) -> Result<(), ControllerError> {
        let name = fleet.metadata.name.clone();
        let change = apply_condition(
            &mut fleet.status.conditions,
            Condition::new(ConditionType::FleetValid, status, reason)
                .with_message(message.clone())
                .with_observed_generation(fleet.metadata.generation),
            Utc::now(),
        );
        if !change.changed {
            return Ok(());
        }

        match self.store.update_fleet(org, fleet).await {
            Ok(_) => {}
            // losing the race just means re-deriving from fresh state later
            Err(e) if e.is_conflict() => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        if change.status_changed {
            let (event, text) = match status {
                ConditionStatus::True => {
                    (EventReason::FleetValid, "fleet specification is valid".to_string())
                }
                _ => (EventReason::FleetInvalid, message),
            };
            self.emitter
                .emit(org, ResourceRef::new(ResourceKind::Fleet, &name), event, text)
                .await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::runner::Reconciler for FleetVersioner {
    type Key = (OrgId, String);

    fn name(&self) -> &'static str {
        "versioner"
    }

    async fn reconcile(&self, key: &Self::Key) -> Result<ReconcileOutcome, ControllerError> {
        FleetVersioner::reconcile(self, &key.0, &key.1).await
    }
}
