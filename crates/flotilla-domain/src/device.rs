use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::error::DomainError;
use crate::meta::Metadata;

// ── Device ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: DeviceSpec,
    #[serde(default)]
    pub status: DeviceStatus,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::new(name),
            spec: DeviceSpec::default(),
            status: DeviceStatus::default(),
        }
    }

    /// Managed devices are owned by a fleet and rendered from its template.
    pub fn is_managed(&self) -> bool {
        matches!(
            &self.metadata.owner,
            Some(owner) if owner.kind == crate::meta::ResourceKind::Fleet
        )
    }
}

// ── Desired state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<ConfigProviderSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<ApplicationProviderSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceMonitorSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<UpdatePolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decommission: Option<DecommissionSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsSpec {
    pub image: String,
}

/// Where a device pulls a piece of configuration from. The discriminator is
/// part of the wire format and survives round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConfigProviderSpec {
    #[serde(rename_all = "camelCase")]
    Git {
        name: String,
        repository: String,
        target_revision: String,
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mount_path: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Inline {
        name: String,
        files: Vec<FileSpec>,
    },
    #[serde(rename_all = "camelCase")]
    Http {
        name: String,
        repository: String,
        file_path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        suffix: Option<String>,
    },
}

impl ConfigProviderSpec {
    pub fn name(&self) -> &str {
        match self {
            ConfigProviderSpec::Git { name, .. } => name,
            ConfigProviderSpec::Inline { name, .. } => name,
            ConfigProviderSpec::Http { name, .. } => name,
        }
    }

    /// The repository resource this provider references, if any.
    pub fn repository(&self) -> Option<&str> {
        match self {
            ConfigProviderSpec::Git { repository, .. } => Some(repository),
            ConfigProviderSpec::Http { repository, .. } => Some(repository),
            ConfigProviderSpec::Inline { .. } => None,
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        let invalid = |message: String| DomainError::InvalidConfigProvider {
            provider: self.name().to_string(),
            message,
        };
        match self {
            ConfigProviderSpec::Git {
                repository,
                target_revision,
                path,
                ..
            } => {
                if repository.is_empty() {
                    return Err(invalid("git provider without repository".into()));
                }
                if target_revision.is_empty() {
                    return Err(invalid("git provider without target revision".into()));
                }
                if path.is_empty() {
                    return Err(invalid("git provider without path".into()));
                }
            }
            ConfigProviderSpec::Inline { files, .. } => {
                if files.is_empty() {
                    return Err(invalid("inline provider without files".into()));
                }
                for file in files {
                    if !file.path.starts_with('/') {
                        return Err(invalid(format!(
                            "inline file path '{}' must be absolute",
                            file.path
                        )));
                    }
                }
            }
            ConfigProviderSpec::Http {
                repository,
                file_path,
                ..
            } => {
                if repository.is_empty() {
                    return Err(invalid("http provider without repository".into()));
                }
                if file_path.is_empty() {
                    return Err(invalid("http provider without file path".into()));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    pub path: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ApplicationProviderSpec {
    #[serde(rename_all = "camelCase")]
    Image {
        name: String,
        image: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env_vars: BTreeMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    Inline {
        name: String,
        compose: String,
    },
}

impl ApplicationProviderSpec {
    pub fn name(&self) -> &str {
        match self {
            ApplicationProviderSpec::Image { name, .. } => name,
            ApplicationProviderSpec::Inline { name, .. } => name,
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        let invalid = |message: String| DomainError::InvalidApplication {
            name: self.name().to_string(),
            message,
        };
        if self.name().is_empty() {
            return Err(invalid("application without a name".into()));
        }
        match self {
            ApplicationProviderSpec::Image { image, .. } if image.is_empty() => {
                Err(invalid("image application without an image".into()))
            }
            ApplicationProviderSpec::Inline { compose, .. } if compose.is_empty() => {
                Err(invalid("inline application without compose content".into()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMonitorSpec {
    pub monitor: MonitoredResource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_threshold_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critical_threshold_percent: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoredResource {
    Cpu,
    Memory,
    Disk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicy {
    /// 5-field cron expression constraining when downloads may start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_schedule: Option<String>,
    /// 5-field cron expression constraining when updates may apply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_schedule: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecommissionSpec {
    pub target: DecommissionTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecommissionTarget {
    Unenroll,
    FactoryReset,
}

// ── Observed state ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceStatus {
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    pub summary: DeviceSummary,
    pub updated: UpdatedSummary,
    pub application_summary: ApplicationSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<ApplicationStatus>,
    pub resources: ResourcesStatus,
    pub config: ConfigStatus,
    pub lifecycle: LifecycleStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub status: DeviceSummaryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceSummaryStatus {
    Online,
    Degraded,
    Error,
    Rebooting,
    #[default]
    Unknown,
    AwaitingReconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedSummary {
    pub status: DeviceUpdatedStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceUpdatedStatus {
    UpToDate,
    OutOfDate,
    Updating,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSummary {
    pub status: ApplicationSummaryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ApplicationSummaryStatus {
    Healthy,
    Degraded,
    Error,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    pub name: String,
    pub status: ApplicationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplicationState {
    Preparing,
    Starting,
    Running,
    Error,
}

/// Agent-reported pressure level per monitored resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourcesStatus {
    pub cpu: AlertLevel,
    pub memory: AlertLevel,
    pub disk: AlertLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlertLevel {
    #[default]
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigStatus {
    /// The rendered version the agent last reported having applied.
    pub rendered_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleStatus {
    pub status: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LifecycleState {
    #[default]
    Enrolled,
    Decommissioning,
    Decommissioned,
}
