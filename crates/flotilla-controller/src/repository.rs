use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flotilla_domain::{
    conditions::reasons, find_condition, Condition, ConditionStatus, ConditionType, EventReason,
    OrgId, RepositorySpec, ResourceKind, ResourceRef,
};
use flotilla_repo::{HttpRepoClient, RepoFetcher};
use flotilla_store::Store;
use tracing::debug;

use crate::conditions::apply_condition;
use crate::emitter::EventEmitter;
use crate::error::ControllerError;
use crate::runner::ReconcileOutcome;

const INACCESSIBLE_RETRY: Duration = Duration::from_secs(60);

/// Periodically probes repositories and maintains their `Accessible`
/// condition so referencing resources can fail fast on dead remotes.
pub struct RepositoryChecker {
    store: Arc<dyn Store>,
    emitter: EventEmitter,
    fetcher: Arc<dyn RepoFetcher>,
    http: HttpRepoClient,
}

impl RepositoryChecker {
    pub fn new(store: Arc<dyn Store>, emitter: EventEmitter, fetcher: Arc<dyn RepoFetcher>) -> Self {
        Self {
            store,
            emitter,
            fetcher,
            http: HttpRepoClient::new(),
        }
    }

    pub async fn reconcile(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let Some(repository) = self.store.get_repository(org, name).await? else {
            return Ok(ReconcileOutcome::Complete);
        };
        let original = repository.clone();
        let mut repository = repository;

        let probe = match &repository.spec {
            RepositorySpec::Http { .. } => self.http.check(&repository.spec).await,
            _ => self.fetcher.check(&repository.spec).await,
        };
        debug!(repository = name, ok = probe.is_ok(), "probed repository");

        let previous = find_condition(
            &repository.status.conditions,
            ConditionType::RepositoryAccessible,
        )
        .cloned();
        let spec_changed = previous
            .as_ref()
            .map(|c| c.observed_generation != Some(repository.metadata.generation))
            .unwrap_or(false);

        let condition = match &probe {
            Ok(()) => Condition::new(
                ConditionType::RepositoryAccessible,
                ConditionStatus::True,
                reasons::ACCESSIBLE,
            ),
            Err(e) => Condition::new(
                ConditionType::RepositoryAccessible,
                ConditionStatus::False,
                reasons::INACCESSIBLE,
            )
            .with_message(e.to_string()),
        };
        let change = apply_condition(
            &mut repository.status.conditions,
            condition.with_observed_generation(repository.metadata.generation),
            Utc::now(),
        );

        if repository != original {
            match self.store.update_repository(org, repository).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => return Ok(ReconcileOutcome::Retry(None)),
                Err(e) => return Err(e.into()),
            }
        }

        let involved = ResourceRef::new(ResourceKind::Repository, name);
        if change.status_changed {
            match &probe {
                Ok(()) => {
                    self.emitter
                        .emit(org, involved.clone(), EventReason::RepositoryAccessible, "repository is accessible")
                        .await;
                }
                Err(e) => {
                    self.emitter
                        .emit(
                            org,
                            involved.clone(),
                            EventReason::RepositoryInaccessible,
                            e.to_string(),
                        )
                        .await;
                }
            }
        }
        if spec_changed {
            self.emitter
                .emit(
                    org,
                    involved,
                    EventReason::ReferencedRepositoryUpdated,
                    "repository specification changed",
                )
                .await;
        }

        match probe {
            Ok(()) => Ok(ReconcileOutcome::Complete),
            Err(_) => Ok(ReconcileOutcome::Retry(Some(INACCESSIBLE_RETRY))),
        }
    }
}

#[async_trait::async_trait]
impl crate::runner::Reconciler for RepositoryChecker {
    type Key = (OrgId, String);

    fn name(&self) -> &'static str {
        "repository"
    }

    async fn reconcile(&self, key: &Self::Key) -> Result<ReconcileOutcome, ControllerError> {
        RepositoryChecker::reconcile(self, &key.0, &key.1).await
    }
}
