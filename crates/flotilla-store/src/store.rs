use async_trait::async_trait;
use flotilla_domain::{
    Device, EnrollmentRequest, Event, Fleet, Metadata, OrgId, Repository, ResourceKind,
    ResourceRef, ResourceSync, TemplateVersion,
};
use tokio::sync::broadcast;

use crate::error::StoreError;

// ── Resource seam ────────────────────────────────────────────────────────────

/// Implemented by every stored resource kind so the store can maintain the
/// version counters uniformly. `spec_value` feeds the spec-change check that
/// decides whether `generation` increments.
pub trait Resource: Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;
    fn spec_value(&self) -> serde_json::Value;
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr) => {
        impl Resource for $ty {
            const KIND: ResourceKind = $kind;

            fn metadata(&self) -> &Metadata {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut Metadata {
                &mut self.metadata
            }

            fn spec_value(&self) -> serde_json::Value {
                serde_json::to_value(&self.spec).unwrap_or(serde_json::Value::Null)
            }
        }
    };
}

impl_resource!(Device, ResourceKind::Device);
impl_resource!(Fleet, ResourceKind::Fleet);
impl_resource!(TemplateVersion, ResourceKind::TemplateVersion);
impl_resource!(Repository, ResourceKind::Repository);
impl_resource!(ResourceSync, ResourceKind::ResourceSync);
impl_resource!(EnrollmentRequest, ResourceKind::EnrollmentRequest);

// ── Change notifications ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Created,
    Updated,
    Deleted,
}

/// Broadcast on every successful write so controllers can enqueue reconciles.
/// Carries the key only; receivers re-read current state from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceChange {
    pub org: OrgId,
    pub kind: ResourceKind,
    pub name: String,
    pub op: ChangeOp,
}

// ── Store contract ───────────────────────────────────────────────────────────

/// Versioned resource storage with optimistic concurrency.
///
/// Writes are compare-and-swap on `metadata.resource_version`; a stale caller
/// gets [`StoreError::Conflict`] and must re-read. The store owns the
/// counters: `resource_version` is strictly monotone over all writes,
/// `generation` increments exactly when a write changes the spec.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // devices
    async fn create_device(&self, org: &OrgId, device: Device) -> Result<Device, StoreError>;
    async fn get_device(&self, org: &OrgId, name: &str) -> Result<Option<Device>, StoreError>;
    async fn list_devices(&self, org: &OrgId) -> Result<Vec<Device>, StoreError>;
    async fn update_device(&self, org: &OrgId, device: Device) -> Result<Device, StoreError>;
    async fn delete_device(&self, org: &OrgId, name: &str) -> Result<bool, StoreError>;

    // fleets
    async fn create_fleet(&self, org: &OrgId, fleet: Fleet) -> Result<Fleet, StoreError>;
    async fn get_fleet(&self, org: &OrgId, name: &str) -> Result<Option<Fleet>, StoreError>;
    async fn list_fleets(&self, org: &OrgId) -> Result<Vec<Fleet>, StoreError>;
    async fn update_fleet(&self, org: &OrgId, fleet: Fleet) -> Result<Fleet, StoreError>;
    async fn delete_fleet(&self, org: &OrgId, name: &str) -> Result<bool, StoreError>;

    // template versions (immutable once created)
    async fn create_template_version(
        &self,
        org: &OrgId,
        tv: TemplateVersion,
    ) -> Result<TemplateVersion, StoreError>;
    async fn get_template_version(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<Option<TemplateVersion>, StoreError>;
    async fn list_template_versions(
        &self,
        org: &OrgId,
        fleet: &str,
    ) -> Result<Vec<TemplateVersion>, StoreError>;

    // repositories
    async fn create_repository(
        &self,
        org: &OrgId,
        repository: Repository,
    ) -> Result<Repository, StoreError>;
    async fn get_repository(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<Option<Repository>, StoreError>;
    async fn list_repositories(&self, org: &OrgId) -> Result<Vec<Repository>, StoreError>;
    async fn update_repository(
        &self,
        org: &OrgId,
        repository: Repository,
    ) -> Result<Repository, StoreError>;
    async fn delete_repository(&self, org: &OrgId, name: &str) -> Result<bool, StoreError>;

    // resource syncs
    async fn create_resource_sync(
        &self,
        org: &OrgId,
        sync: ResourceSync,
    ) -> Result<ResourceSync, StoreError>;
    async fn get_resource_sync(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<Option<ResourceSync>, StoreError>;
    async fn list_resource_syncs(&self, org: &OrgId) -> Result<Vec<ResourceSync>, StoreError>;
    async fn update_resource_sync(
        &self,
        org: &OrgId,
        sync: ResourceSync,
    ) -> Result<ResourceSync, StoreError>;
    async fn delete_resource_sync(&self, org: &OrgId, name: &str) -> Result<bool, StoreError>;

    // enrollment requests
    async fn create_enrollment_request(
        &self,
        org: &OrgId,
        request: EnrollmentRequest,
    ) -> Result<EnrollmentRequest, StoreError>;
    async fn get_enrollment_request(
        &self,
        org: &OrgId,
        name: &str,
    ) -> Result<Option<EnrollmentRequest>, StoreError>;
    async fn update_enrollment_request(
        &self,
        org: &OrgId,
        request: EnrollmentRequest,
    ) -> Result<EnrollmentRequest, StoreError>;

    // event log (append-only)
    async fn append_event(&self, org: &OrgId, event: Event) -> Result<(), StoreError>;
    async fn list_events(
        &self,
        org: &OrgId,
        involved: Option<&ResourceRef>,
        limit: u32,
    ) -> Result<Vec<Event>, StoreError>;

    /// Subscribe to write notifications. Slow receivers may observe lag;
    /// controllers must treat changes as hints and re-list on ticks.
    fn subscribe(&self) -> broadcast::Receiver<ResourceChange>;
}
