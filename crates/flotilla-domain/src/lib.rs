pub mod conditions;
pub mod device;
pub mod enrollment;
pub mod error;
pub mod events;
pub mod fleet;
pub mod meta;
pub mod repo;
pub mod selector;
pub mod sync;
pub mod validate;

pub use conditions::{
    find_condition, is_condition_false, is_condition_true, remove_condition, set_condition,
    set_condition_from_result, Condition, ConditionStatus, ConditionType,
};
pub use device::{
    AlertLevel, ApplicationProviderSpec, ApplicationState, ApplicationStatus,
    ApplicationSummary, ApplicationSummaryStatus, ConfigProviderSpec, ConfigStatus,
    DecommissionSpec, DecommissionTarget, Device, DeviceSpec, DeviceStatus, DeviceSummary,
    DeviceSummaryStatus, DeviceUpdatedStatus, FileSpec, LifecycleState, LifecycleStatus,
    MonitoredResource, OsSpec, ResourceMonitorSpec, ResourcesStatus, UpdatePolicy,
    UpdatedSummary,
};
pub use enrollment::{EnrollmentApproval, EnrollmentRequest, EnrollmentRequestSpec, EnrollmentRequestStatus};
pub use error::DomainError;
pub use events::{BatchReport, Event, EventDetails, EventReason, EventType};
pub use fleet::{
    ApprovalMethod, BatchLimit, BatchStanza, DevicesSummary, DisruptionBudget, Fleet,
    FleetSpec, FleetStatus, FleetTemplate, RolloutBatch, RolloutPolicy, RolloutState,
    RolloutStatus, TemplateMetadata, TemplateVersion, TemplateVersionSpec,
};
pub use meta::{annotations, Metadata, OrgId, OwnerRef, ResourceKind, ResourceRef};
pub use repo::{Repository, RepositorySpec, RepositoryStatus};
pub use selector::{LabelSelector, MatchExpression, SelectorOperator};
pub use sync::{ResourceSync, ResourceSyncSpec, ResourceSyncStatus};
pub use validate::{validate_cron, validate_device_spec, validate_fleet_spec, validate_image_ref};
