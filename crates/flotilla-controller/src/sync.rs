use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flotilla_domain::{
    conditions::reasons, is_condition_true, Condition, ConditionStatus, ConditionType,
    EventDetails, EventReason, OrgId, OwnerRef, ResourceKind, ResourceRef, ResourceSync,
};
use flotilla_manifest::load_fleets;
use flotilla_repo::RepoFetcher;
use flotilla_store::{Store, StoreError};
use tracing::{info, warn};

use crate::conditions::apply_condition;
use crate::emitter::EventEmitter;
use crate::error::ControllerError;
use crate::runner::ReconcileOutcome;

const ERROR_RETRY: Duration = Duration::from_secs(5);

type SyncEvent = (EventReason, String, Option<EventDetails>);

/// Keeps the fleets under a repository path synchronized with the checked-out
/// manifests, owning what it creates and refusing to touch what it does not.
///
/// A parse failure freezes the owned fleet set: nothing is created, updated,
/// or deleted until the repository is readable again.
pub struct ResourceSyncController {
    store: Arc<dyn Store>,
    emitter: EventEmitter,
    fetcher: Arc<dyn RepoFetcher>,
}

impl ResourceSyncController {
    pub fn new(store: Arc<dyn Store>, emitter: EventEmitter, fetcher: Arc<dyn RepoFetcher>) -> Self {
        Self {
            store,
            emitter,
            fetcher,
        }
    }

    pub async fn reconcile(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let Some(sync) = self.store.get_resource_sync(org, name).await? else {
            return Ok(ReconcileOutcome::Complete);
        };
        let original = sync.clone();
        let mut sync = sync;
        let mut events: Vec<SyncEvent> = Vec::new();

        // 1. resolve the referenced repository
        let repository = match self.store.get_repository(org, &sync.spec.repository).await? {
            Some(repository) => repository,
            None => {
                let message = format!("repository '{}' not found", sync.spec.repository);
                self.set_accessible(
                    &mut sync,
                    &mut events,
                    ConditionStatus::False,
                    reasons::REPOSITORY_NOT_FOUND,
                    message,
                );
                self.finalize(org, original, sync, events).await?;
                return Ok(ReconcileOutcome::Retry(Some(ERROR_RETRY)));
            }
        };

        if let Some(cond) = flotilla_domain::find_condition(
            &repository.status.conditions,
            ConditionType::RepositoryAccessible,
        ) {
            if cond.status == ConditionStatus::False {
                let message = format!(
                    "repository '{}' is inaccessible: {}",
                    sync.spec.repository, cond.message
                );
                self.set_accessible(
                    &mut sync,
                    &mut events,
                    ConditionStatus::False,
                    reasons::REPOSITORY_INACCESSIBLE,
                    message,
                );
                self.finalize(org, original, sync, events).await?;
                return Ok(ReconcileOutcome::Retry(Some(ERROR_RETRY)));
            }
        }

        // 2. fetch the target revision
        let fetched = match self
            .fetcher
            .fetch(&repository.spec, &sync.spec.target_revision)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(sync = name, error = %e, "fetch failed");
                self.set_accessible(
                    &mut sync,
                    &mut events,
                    ConditionStatus::False,
                    reasons::INACCESSIBLE,
                    e.to_string(),
                );
                self.finalize(org, original, sync, events).await?;
                return Ok(ReconcileOutcome::Retry(Some(ERROR_RETRY)));
            }
        };

        // 3. accessible; surface new commits
        self.set_accessible(
            &mut sync,
            &mut events,
            ConditionStatus::True,
            reasons::ACCESSIBLE,
            String::new(),
        );
        let commit_changed = sync.status.observed_commit.as_deref() != Some(&fetched.commit);
        if commit_changed {
            events.push((
                EventReason::ResourceSyncCommitDetected,
                format!("detected commit {}", fetched.commit),
                Some(EventDetails::SyncCommit {
                    commit: fetched.commit.clone(),
                }),
            ));
        }

        // already synced to this commit at this generation: nothing to apply
        if !commit_changed
            && sync.status.observed_generation == Some(sync.metadata.generation)
            && is_condition_true(&sync.status.conditions, ConditionType::ResourceSyncSynced)
        {
            self.finalize(org, original, sync, events).await?;
            return Ok(ReconcileOutcome::Complete);
        }

        // 4. parse manifests under the configured path
        let dir = fetched.checkout.join(sync.spec.path.trim_start_matches('/'));
        let fleets = match load_fleets(&dir) {
            Ok(fleets) => fleets,
            Err(e) => {
                warn!(sync = name, error = %e, "manifest parsing failed, owned fleets untouched");
                let change = apply_condition(
                    &mut sync.status.conditions,
                    Condition::new(
                        ConditionType::ResourceSyncResourceParsed,
                        ConditionStatus::False,
                        reasons::PARSE_FAILED,
                    )
                    .with_message(e.to_string()),
                    Utc::now(),
                );
                if change.status_changed {
                    events.push((
                        EventReason::ResourceSyncParsingFailed,
                        e.to_string(),
                        None,
                    ));
                }
                self.set_synced(&mut sync, &mut events, Err(e.to_string()));
                self.finalize(org, original, sync, events).await?;
                return Ok(ReconcileOutcome::Complete);
            }
        };

        let change = apply_condition(
            &mut sync.status.conditions,
            Condition::new(
                ConditionType::ResourceSyncResourceParsed,
                ConditionStatus::True,
                reasons::PARSED,
            ),
            Utc::now(),
        );
        if change.status_changed {
            events.push((
                EventReason::ResourceSyncParsed,
                format!("parsed {} fleet manifests", fleets.len()),
                None,
            ));
        }

        // 5. reconcile owned fleets against the parsed set
        let owner = OwnerRef::resource_sync(name);
        let existing = self.store.list_fleets(org).await?;
        let mut conflicts: Vec<String> = Vec::new();

        for parsed in &fleets {
            match existing
                .iter()
                .find(|f| f.metadata.name == parsed.metadata.name)
            {
                None => {
                    let mut fleet = parsed.clone();
                    fleet.metadata.owner = Some(owner.clone());
                    match self.store.create_fleet(org, fleet).await {
                        Ok(_) => {
                            info!(sync = name, fleet = %parsed.metadata.name, "created fleet");
                        }
                        Err(StoreError::AlreadyExists { .. }) => {
                            // raced another writer; next tick sorts out ownership
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(current) if current.metadata.owner.as_ref() == Some(&owner) => {
                    if current.spec != parsed.spec
                        || current.metadata.labels != parsed.metadata.labels
                    {
                        let mut updated = current.clone();
                        updated.spec = parsed.spec.clone();
                        updated.metadata.labels = parsed.metadata.labels.clone();
                        match self.store.update_fleet(org, updated).await {
                            Ok(_) => {
                                info!(sync = name, fleet = %parsed.metadata.name, "updated fleet");
                            }
                            Err(e) if e.is_conflict() => {
                                return Ok(ReconcileOutcome::Retry(None))
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                Some(current) => {
                    let other = current
                        .metadata
                        .owner
                        .as_ref()
                        .map(|o| o.to_string())
                        .unwrap_or_else(|| "no owner".to_string());
                    conflicts.push(format!(
                        "fleet '{}' belongs to {}",
                        parsed.metadata.name, other
                    ));
                }
            }
        }

        for fleet in existing.iter().filter(|f| f.metadata.owner.as_ref() == Some(&owner)) {
            if !fleets.iter().any(|p| p.metadata.name == fleet.metadata.name) {
                info!(sync = name, fleet = %fleet.metadata.name, "deleting fleet removed from source");
                self.store.delete_fleet(org, &fleet.metadata.name).await?;
            }
        }

        // 6. full or partial success
        if conflicts.is_empty() {
            self.set_synced(&mut sync, &mut events, Ok(()));
            sync.status.observed_commit = Some(fetched.commit);
            sync.status.observed_generation = Some(sync.metadata.generation);
        } else {
            self.set_synced(&mut sync, &mut events, Err(conflicts.join("; ")));
        }

        self.finalize(org, original, sync, events).await?;
        Ok(ReconcileOutcome::Complete)
    }

    fn set_accessible(
        &self,
        sync: &mut ResourceSync,
        events: &mut Vec<SyncEvent>,
        status: ConditionStatus,
        reason: &str,
        message: String,
    ) {
        let change = apply_condition(
            &mut sync.status.conditions,
            Condition::new(ConditionType::ResourceSyncAccessible, status, reason)
                .with_message(message.clone()),
            Utc::now(),
        );
        if change.status_changed {
            let (event, text) = match status {
                ConditionStatus::True => (
                    EventReason::ResourceSyncAccessible,
                    "repository is accessible".to_string(),
                ),
                _ => (EventReason::ResourceSyncInaccessible, message),
            };
            events.push((event, text, None));
        }
    }

    fn set_synced(
        &self,
        sync: &mut ResourceSync,
        events: &mut Vec<SyncEvent>,
        result: Result<(), String>,
    ) {
        let condition = match &result {
            Ok(()) => Condition::new(
                ConditionType::ResourceSyncSynced,
                ConditionStatus::True,
                reasons::SYNCED,
            ),
            Err(message) => Condition::new(
                ConditionType::ResourceSyncSynced,
                ConditionStatus::False,
                reasons::SYNC_FAILED,
            )
            .with_message(message.clone()),
        };
        let change = apply_condition(&mut sync.status.conditions, condition, Utc::now());
        if change.status_changed {
            match result {
                Ok(()) => events.push((
                    EventReason::ResourceSyncSynced,
                    "fleets synchronized".to_string(),
                    None,
                )),
                Err(message) => events.push((EventReason::ResourceSyncSyncFailed, message, None)),
            }
        }
    }

    /// Persist status changes and flush events; a lost write conflict drops
    /// the events, since the follow-up reconcile will re-derive them.
    async fn finalize(
        &self,
        org: &OrgId,
        original: ResourceSync,
        sync: ResourceSync,
        events: Vec<SyncEvent>,
    ) -> Result<(), ControllerError> {
        let name = sync.metadata.name.clone();
        if sync != original {
            match self.store.update_resource_sync(org, sync).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        for (reason, message, details) in events {
            self.emitter
                .emit_with_details(
                    org,
                    ResourceRef::new(ResourceKind::ResourceSync, &name),
                    reason,
                    message,
                    details,
                )
                .await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::runner::Reconciler for ResourceSyncController {
    type Key = (OrgId, String);

    fn name(&self) -> &'static str {
        "resource-sync"
    }

    async fn reconcile(&self, key: &Self::Key) -> Result<ReconcileOutcome, ControllerError> {
        ResourceSyncController::reconcile(self, &key.0, &key.1).await
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
                ResourceRef::new(ResourceKind::ResourceSync, &key.1),
                flotilla_domain::EventReason::InternalTaskFailed,
                format!("sync reconcile failing after {} attempts: {}", attempts, error),
                Some(EventDetails::InternalTask {
                    task: "resource-sync".to_string(),
                    attempts,
                }),
            )
            .await;
    }
}
