use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use flotilla_domain::{
    Device, EnrollmentRequest, Event, Fleet, OrgId, Repository, ResourceRef, ResourceSync,
    TemplateVersion,
};
use tokio::sync::{broadcast, RwLock};

use crate::error::StoreError;
use crate::store::{ChangeOp, Resource, ResourceChange, Store};

type Key = (String, String);

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<Key, Device>,
    fleets: HashMap<Key, Fleet>,
    template_versions: HashMap<Key, TemplateVersion>,
    repositories: HashMap<Key, Repository>,
    resource_syncs: HashMap<Key, ResourceSync>,
    enrollment_requests: HashMap<Key, EnrollmentRequest>,
    events: Vec<(String, Event)>,
    /// Strictly monotone over every write, all kinds. Losing a CAS race
    /// always means observing a smaller version than the store holds.
    version_counter: i64,
}

/// In-memory implementation of [`Store`].
///
/// All data is lost on process exit. Carries the full versioning semantics
/// (generation, resourceVersion, CAS) the controllers rely on; durable
/// backends plug in behind the same trait.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
    changes: broadcast::Sender<ResourceChange>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            changes,
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify<R: Resource>(&self, org: &OrgId, name: &str, op: ChangeOp) {
        // nobody listening is fine
        let _ = self.changes.send(ResourceChange {
            org: org.clone(),
            kind: R::KIND,
            name: name.to_string(),
            op,
        });
    }
}

fn key(org: &OrgId, name: &str) -> Key {
    (org.0.clone(), name.to_string())
}

fn create_in<R: Resource>(
    map: &mut HashMap<Key, R>,
    org: &OrgId,
    mut resource: R,
    counter: &mut i64,
) -> Result<R, StoreError> {
    let name = resource.metadata().name.clone();
    if name.is_empty() {
        return Err(StoreError::Internal("resource without a name".to_string()));
    }
    let key = key(org, &name);
    if map.contains_key(&key) {
        return Err(StoreError::AlreadyExists {
            kind: R::KIND,
            name,
        });
    }
    *counter += 1;
    let meta = resource.metadata_mut();
    meta.resource_version = *counter;
    meta.generation = 1;
    meta.created_at = Some(Utc::now());
    map.insert(key, resource.clone());
    Ok(resource)
}

fn update_in<R: Resource>(
    map: &mut HashMap<Key, R>,
    org: &OrgId,
    mut resource: R,
    counter: &mut i64,
) -> Result<R, StoreError> {
    let name = resource.metadata().name.clone();
    let key = key(org, &name);
    let existing = map.get(&key).ok_or_else(|| StoreError::NotFound {
        kind: R::KIND,
        name: name.clone(),
    })?;

    if existing.metadata().resource_version != resource.metadata().resource_version {
        return Err(StoreError::Conflict {
            kind: R::KIND,
            name,
        });
    }

    let spec_changed = existing.spec_value() != resource.spec_value();
    let prev_generation = existing.metadata().generation;
    let created_at = existing.metadata().created_at;

    *counter += 1;
    let meta = resource.metadata_mut();
    meta.resource_version = *counter;
    meta.generation = if spec_changed {
        prev_generation + 1
    } else {
        prev_generation
    };
    meta.created_at = created_at;

    map.insert(key, resource.clone());
    Ok(resource)
}

fn list_in<R: Resource>(map: &HashMap<Key, R>, org: &OrgId) -> Vec<R> {
    let mut items: Vec<R> = map
        .iter()
        .filter(|((o, _), _)| o == org.as_str())
        .map(|(_, r)| r.clone())
        .collect();
    items.sort_by(|a, b| a.metadata().name.cmp(&b.metadata().name));
    items
}

#[async_trait]
impl Store for InMemoryStore {
    // ── devices ──────────────────────────────────────────────────────────────

    async fn create_device(&self, org: &OrgId, device: Device) -> Result<Device, StoreError> {
        let mut guard = self.inner.write().await;
        let created = {
            let Inner {
                devices,
                version_counter,
                ..
            } = &mut *guard;
            create_in(devices, org, device, version_counter)?
        };
        drop(guard);
        self.notify::<Device>(org, &created.metadata.name, ChangeOp::Created);
        Ok(created)
    }

    async fn get_device(&self, org: &OrgId, name: &str) -> Result<Option<Device>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.devices.get(&key(org, name)).cloned())
    }

    async fn list_devices(&self, org: &OrgId) -> Result<Vec<Device>, StoreError> {
        let guard = self.inner.read().await;
        Ok(list_in(&guard.devices, org))
    }

    async fn update_device(&self, org: &OrgId, device: Device) -> Result<Device, StoreError> {
        let mut guard = self.inner.write().await;
        let updated = {
            let Inner {
                devices,
                version_counter,
                ..
            } = &mut *guard;
            update_in(devices, org, device, version_counter)?
        };
        drop(guard);
        self.notify::<Device>(org, &updated.metadata.name, ChangeOp::Updated);
        Ok(updated)
    }

    async fn delete_device(&self, org: &OrgId, name: &str) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let removed = guard.devices.remove(&key(org, name)).is_some();
        drop(guard);
        if removed {
            self.notify::<Device>(org, name, ChangeOp::Deleted);
        }
        Ok(removed)
    }

    // ── fleets ───────────────────────────────────────────────────────────────

    async fn create_fleet(&self, org: &OrgId, fleet: Fleet) -> Result<Fleet, StoreError> {
        let mut guard = self.inner.write().await;
        let created = {
            let Inner {
                fleets,
                version_counter,
                ..
            } = &mut *guard;
            create_in(fleets, org, fleet, version_counter)?
        };
        drop(guard);
        self.notify::<Fleet>(org, &created.metadata.name, ChangeOp::Created);
        Ok(created)
    }

    async fn get_fleet(&self, org: &OrgId, name: &str) -> Result<Option<Fleet>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.fleets.get(&key(org, name)).cloned())
    }

    async fn list_fleets(&self, org: &OrgId) -> Result<Vec<Fleet>, StoreError> {
        let guard = self.inner.read().await;
        Ok(list_in(&guard.fleets, org))
    }

    async fn update_fleet(&self, org: &OrgId, fleet: Fleet) -> Result<Fleet, StoreError> {
        let mut guard = self.inner.write().await;
        let updated = {
            let Inner {
                fleets,
                version_counter,
                ..
            } = &mut *guard;
            update_in(fleets, org, fleet, version_counter)?
        };
        drop(guard);
        self.notify::<Fleet>(org, &updated.metadata.name, ChangeOp::Updated);
        Ok(updated)
    }

    async fn delete_fleet(&self, org: &OrgId, name: &str) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let removed = guard.fleets.remove(&key(org, name)).is_some();
        drop(guard);
        if removed {
            self.notify::<Fleet>(org, name, ChangeOp::Deleted);
        }
        Ok(removed)
    }

    // ── template versions ────────────────────────────────────────────────────

    async fn create_template_version(
        &self,
        org: &OrgId,
        tv: TemplateVersion,
    ) -> Result<TemplateVersion, StoreError> {
        let mut guard = self.inner.write().await;
        let created = {
            let Inner {
                template_versions,
                version_counter,
                ..
            } = &mut *guard;
            create_in(template_versions, org, tv, version_counter)?
        };
        drop(guard);
        self.notify::<TemplateVersion>(org, &created.metadata.name, ChangeOp::Created);
        Ok(created)
    }

    async fn get_template_version(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<Option<TemplateVersion>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.template_versions.get(&key(org, name)).cloned())
    }

    async fn list_template_versions(
        &self,
        org: &OrgId,
        fleet: &str,
    ) -> Result<Vec<TemplateVersion>, StoreError> {
        let guard = self.inner.read().await;
        let mut items: Vec<TemplateVersion> = guard
            .template_versions
            .iter()
            .filter(|((o, _), tv)| o == org.as_str() && tv.spec.fleet == fleet)
            .map(|(_, tv)| tv.clone())
            .collect();
        items.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(items)
    }

    // ── repositories ─────────────────────────────────────────────────────────

    async fn create_repository(
        &self,
        org: &OrgId,
        repository: Repository,
    ) -> Result<Repository, StoreError> {
        let mut guard = self.inner.write().await;
        let created = {
            let Inner {
                repositories,
                version_counter,
                ..
            } = &mut *guard;
            create_in(repositories, org, repository, version_counter)?
        };
        drop(guard);
        self.notify::<Repository>(org, &created.metadata.name, ChangeOp::Created);
        Ok(created)
    }

    async fn get_repository(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<Option<Repository>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.repositories.get(&key(org, name)).cloned())
    }

    async fn list_repositories(&self, org: &OrgId) -> Result<Vec<Repository>, StoreError> {
        let guard = self.inner.read().await;
        Ok(list_in(&guard.repositories, org))
    }

    async fn update_repository(
        &self,
        org: &OrgId,
        repository: Repository,
    ) -> Result<Repository, StoreError> {
        let mut guard = self.inner.write().await;
        let updated = {
            let Inner {
                repositories,
                version_counter,
                ..
            } = &mut *guard;
            update_in(repositories, org, repository, version_counter)?
        };
        drop(guard);
        self.notify::<Repository>(org, &updated.metadata.name, ChangeOp::Updated);
        Ok(updated)
    }

    async fn delete_repository(&self, org: &OrgId, name: &str) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let removed = guard.repositories.remove(&key(org, name)).is_some();
        drop(guard);
        if removed {
            self.notify::<Repository>(org, name, ChangeOp::Deleted);
        }
        Ok(removed)
    }

    // ── resource syncs ───────────────────────────────────────────────────────

    async fn create_resource_sync(
        &self,
        org: &OrgId,
        sync: ResourceSync,
    ) -> Result<ResourceSync, StoreError> {
        let mut guard = self.inner.write().await;
        let created = {
            let Inner {
                resource_syncs,
                version_counter,
                ..
            } = &mut *guard;
            create_in(resource_syncs, org, sync, version_counter)?
        };
        drop(guard);
        self.notify::<ResourceSync>(org, &created.metadata.name, ChangeOp::Created);
        Ok(created)
    }

    async fn get_resource_sync(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<Option<ResourceSync>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.resource_syncs.get(&key(org, name)).cloned())
    }

    async fn list_resource_syncs(&self, org: &OrgId) -> Result<Vec<ResourceSync>, StoreError> {
        let guard = self.inner.read().await;
        Ok(list_in(&guard.resource_syncs, org))
    }

    async fn update_resource_sync(
        &self,
        org: &OrgId,
        sync: ResourceSync,
    ) -> Result<ResourceSync, StoreError> {
        let mut guard = self.inner.write().await;
        let updated = {
            let Inner {
                resource_syncs,
                version_counter,
                ..
            } = &mut *guard;
            update_in(resource_syncs, org, sync, version_counter)?
        };
        drop(guard);
        self.notify::<ResourceSync>(org, &updated.metadata.name, ChangeOp::Updated);
        Ok(updated)
    }

    async fn delete_resource_sync(&self, org: &OrgId, name: &str) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let removed = guard.resource_syncs.remove(&key(org, name)).is_some();
        drop(guard);
        if removed {
            self.notify::<ResourceSync>(org, name, ChangeOp::Deleted);
        }
        Ok(removed)
    }

    // ── enrollment requests ──────────────────────────────────────────────────

    async fn create_enrollment_request(
        &self,
        org: &OrgId,
        request: EnrollmentRequest,
    ) -> Result<EnrollmentRequest, StoreError> {
        let mut guard = self.inner.write().await;
        let created = {
            let Inner {
                enrollment_requests,
                version_counter,
                ..
            } = &mut *guard;
            create_in(enrollment_requests, org, request, version_counter)?
        };
        drop(guard);
        self.notify::<EnrollmentRequest>(org, &created.metadata.name, ChangeOp::Created);
        Ok(created)
    }

    async fn get_enrollment_request(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<Option<EnrollmentRequest>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.enrollment_requests.get(&key(org, name)).cloned())
    }

    async fn update_enrollment_request(
        &self,
        org: &OrgId,
        request: EnrollmentRequest,
    ) -> Result<EnrollmentRequest, StoreError> {
        let mut guard = self.inner.write().await;
        let updated = {
            let Inner {
                enrollment_requests,
                version_counter,
                ..
            } = &mut *guard;
            update_in(enrollment_requests, org, request, version_counter)?
        };
        drop(guard);
        self.notify::<EnrollmentRequest>(org, &updated.metadata.name, ChangeOp::Updated);
        Ok(updated)
    }

    // ── events ───────────────────────────────────────────────────────────────

    async fn append_event(&self, org: &OrgId, event: Event) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.events.push((org.0.clone(), event));
        Ok(())
    }

    async fn list_events(
        &self,
        org: &OrgId,
        involved: Option<&ResourceRef>,
        limit: u32,
    ) -> Result<Vec<Event>, StoreError> {
        let guard = self.inner.read().await;
        let filtered: Vec<Event> = guard
            .events
            .iter()
            .filter(|(o, ev)| {
                o == org.as_str() && involved.map_or(true, |r| &ev.involved == r)
            })
            .map(|(_, ev)| ev.clone())
            .collect();
        let start = filtered.len().saturating_sub(limit as usize);
        Ok(filtered[start..].to_vec())
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceChange> {
        self.changes.subscribe()
    }
}
