use chrono::{DateTime, Duration, Utc};
use flotilla_domain::{
    annotations, conditions::reasons, find_condition, is_condition_true, AlertLevel,
    ApplicationState, ApplicationSummaryStatus, ConditionStatus, ConditionType, Device,
    DeviceStatus, DeviceSummaryStatus, DeviceUpdatedStatus, EventReason, Fleet, LifecycleState,
};

pub fn default_disconnect_timeout() -> Duration {
    Duration::minutes(5)
}

/// A status transition the reconciler should surface as an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub reason: EventReason,
    pub message: String,
}

/// Result of one derivation pass.
#[derive(Debug, Clone)]
pub struct Derivation {
    /// The device status with derived fields recomputed; agent-reported
    /// fields pass through untouched.
    pub status: DeviceStatus,
    /// True iff any derived field differs from the previous status.
    pub changed: bool,
    /// Transitions to emit, in decision order.
    pub updates: Vec<StatusUpdate>,
    /// The device reported a rendered version at or beyond the expected one;
    /// the awaiting-reconnect window is over.
    pub clear_awaiting_reconnect: bool,
}

/// Derive a device's summary, updated, application, and lifecycle status from
/// its reported state, its owning fleet, and the clock. Pure: equal inputs
/// produce equal outputs.
pub fn derive_device_status(
    device: &Device,
    fleet: Option<&Fleet>,
    now: DateTime<Utc>,
    disconnect_timeout: Duration,
) -> Derivation {
    let previous = &device.status;
    let mut status = previous.clone();
    let mut updates = Vec::new();

    let awaiting_reconnect = device
        .metadata
        .annotation_is_true(annotations::AWAITING_RECONNECT);
    let disconnected = !awaiting_reconnect && is_disconnected(device, now, disconnect_timeout);
    let updating = is_condition_true(&previous.conditions, ConditionType::DeviceUpdating);

    // summary
    if awaiting_reconnect {
        status.summary.status = DeviceSummaryStatus::AwaitingReconnect;
        status.summary.info = Some("device is awaiting reconnection before resuming".to_string());
    } else if disconnected {
        status.summary.status = DeviceSummaryStatus::Unknown;
        status.summary.info = Some(format!(
            "disconnected (last seen more than {} ago)",
            format_duration(disconnect_timeout)
        ));
    } else if is_rebooting(previous) {
        status.summary.status = DeviceSummaryStatus::Rebooting;
        status.summary.info = Some("device is rebooting into the updated image".to_string());
    } else {
        let (summary, info) = summarize_resources(&previous.resources);
        status.summary.status = summary;
        status.summary.info = Some(info);
    }

    // applications
    if disconnected {
        status.application_summary.status = ApplicationSummaryStatus::Unknown;
        status.application_summary.info = status.summary.info.clone();
    } else {
        let (app_status, info) = summarize_applications(previous);
        status.application_summary.status = app_status;
        status.application_summary.info = Some(info);
    }

    // updated
    if disconnected && updating {
        status.updated.status = DeviceUpdatedStatus::Unknown;
        status.updated.info = status.summary.info.clone();
    } else {
        let (updated, info) = derive_updated(device, fleet, updating);
        status.updated.status = updated;
        status.updated.info = info;
    }

    // lifecycle
    let (lifecycle, info) = derive_lifecycle(previous);
    status.lifecycle.status = lifecycle;
    status.lifecycle.info = info;

    collect_updates(previous, &status, disconnected, &mut updates);

    let changed = status != *previous;
    Derivation {
        status,
        changed,
        updates,
        clear_awaiting_reconnect: awaiting_reconnect && reported_reached_expected(device),
    }
}

fn is_disconnected(device: &Device, now: DateTime<Utc>, timeout: Duration) -> bool {
    match device.status.last_seen {
        Some(last_seen) => now - last_seen > timeout,
        None => true,
    }
}

fn is_rebooting(status: &DeviceStatus) -> bool {
    find_condition(&status.conditions, ConditionType::DeviceUpdating)
        .map(|c| c.status == ConditionStatus::True && c.reason == reasons::REBOOTING)
        .unwrap_or(false)
}

fn summarize_resources(
    resources: &flotilla_domain::ResourcesStatus,
) -> (DeviceSummaryStatus, String) {
    let levels = [
        ("CPU usage", resources.cpu),
        ("Memory usage", resources.memory),
        ("Disk usage", resources.disk),
    ];

    let critical: Vec<&str> = levels
        .iter()
        .filter(|(_, l)| *l == AlertLevel::Critical)
        .map(|(name, _)| *name)
        .collect();
    if !critical.is_empty() {
        return (
            DeviceSummaryStatus::Error,
            critical
                .iter()
                .map(|name| format!("{} is critical", name))
                .collect::<Vec<_>>()
                .join(", "),
        );
    }

    let warning: Vec<&str> = levels
        .iter()
        .filter(|(_, l)| *l == AlertLevel::Warning)
        .map(|(name, _)| *name)
        .collect();
    if !warning.is_empty() {
        return (
            DeviceSummaryStatus::Degraded,
            warning
                .iter()
                .map(|name| format!("{} is above the warning threshold", name))
                .collect::<Vec<_>>()
                .join(", "),
        );
    }

    (
        DeviceSummaryStatus::Online,
        "All system resources healthy".to_string(),
    )
}

fn summarize_applications(status: &DeviceStatus) -> (ApplicationSummaryStatus, String) {
    if status.applications.is_empty() {
        return (
            ApplicationSummaryStatus::Healthy,
            "no applications defined".to_string(),
        );
    }

    let errored: Vec<&str> = status
        .applications
        .iter()
        .filter(|a| a.status == ApplicationState::Error)
        .map(|a| a.name.as_str())
        .collect();
    if !errored.is_empty() {
        return (
            ApplicationSummaryStatus::Error,
            format!("applications in error state: {}", errored.join(", ")),
        );
    }

    let pending: Vec<&str> = status
        .applications
        .iter()
        .filter(|a| matches!(a.status, ApplicationState::Preparing | ApplicationState::Starting))
        .map(|a| a.name.as_str())
        .collect();
    if !pending.is_empty() {
        return (
            ApplicationSummaryStatus::Degraded,
            format!("applications still coming up: {}", pending.join(", ")),
        );
    }

    (
        ApplicationSummaryStatus::Healthy,
        "All application workloads are healthy".to_string(),
    )
}

fn derive_updated(
    device: &Device,
    fleet: Option<&Fleet>,
    updating: bool,
) -> (DeviceUpdatedStatus, Option<String>) {
    if updating {
        let info = find_condition(&device.status.conditions, ConditionType::DeviceUpdating)
            .map(|c| c.message.clone())
            .filter(|m| !m.is_empty());
        return (DeviceUpdatedStatus::Updating, info);
    }

    let rendered_version = device.metadata.annotation(annotations::RENDERED_VERSION);

    if !device.is_managed() {
        return match rendered_version {
            Some(expected) if expected != device.status.config.rendered_version => (
                DeviceUpdatedStatus::OutOfDate,
                Some(format!(
                    "device is running rendered version {}, expected {}",
                    device.status.config.rendered_version, expected
                )),
            ),
            _ => (DeviceUpdatedStatus::UpToDate, None),
        };
    }

    let Some(fleet) = fleet else {
        return (
            DeviceUpdatedStatus::Unknown,
            Some("owning fleet not found".to_string()),
        );
    };

    let fleet_tv = fleet.template_version();
    let device_tv = device
        .metadata
        .annotation(annotations::RENDERED_TEMPLATE_VERSION);
    let config_current =
        rendered_version.map_or(true, |v| v == device.status.config.rendered_version);

    if fleet_tv.is_some() && fleet_tv == device_tv && config_current {
        (DeviceUpdatedStatus::UpToDate, None)
    } else if fleet_tv.is_none() {
        // fleet not versioned yet; nothing to be out of date against
        (DeviceUpdatedStatus::UpToDate, None)
    } else {
        let mut info = format!(
            "device has not applied template version {}",
            fleet_tv.unwrap_or_default()
        );
        if let Some(err) = device.metadata.annotation(annotations::LAST_ROLLOUT_ERROR) {
            info = format!("{}: {}", info, err);
        } else if let Some(cond) =
            find_condition(&device.status.conditions, ConditionType::DeviceUpdating)
        {
            if cond.status == ConditionStatus::False && cond.reason == reasons::ERROR {
                info = format!("{}: {}", info, cond.message);
            }
        }
        (DeviceUpdatedStatus::OutOfDate, Some(info))
    }
}

fn derive_lifecycle(status: &DeviceStatus) -> (LifecycleState, Option<String>) {
    match find_condition(&status.conditions, ConditionType::DeviceDecommissioning) {
        None => (LifecycleState::Enrolled, None),
        Some(cond) => match cond.reason.as_str() {
            reasons::DECOMMISSION_COMPLETE => (LifecycleState::Decommissioned, None),
            reasons::ERROR => (
                LifecycleState::Decommissioned,
                Some(format!("decommissioning failed: {}", cond.message)),
            ),
            _ => (LifecycleState::Decommissioning, None),
        },
    }
}

fn reported_reached_expected(device: &Device) -> bool {
    let reported: u64 = match device.status.config.rendered_version.parse() {
        Ok(v) => v,
        Err(_) => return false,
    };
    let expected: u64 = device
        .metadata
        .annotation(annotations::RENDERED_VERSION)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    reported >= expected
}

/// Emit one update per observed transition, in decision order.
fn collect_updates(
    previous: &DeviceStatus,
    next: &DeviceStatus,
    disconnected: bool,
    updates: &mut Vec<StatusUpdate>,
) {
    let was_disconnected = previous.summary.status == DeviceSummaryStatus::Unknown;
    if disconnected && !was_disconnected {
        updates.push(StatusUpdate {
            reason: EventReason::DeviceDisconnected,
            message: next.summary.info.clone().unwrap_or_default(),
        });
    }
    if !disconnected && was_disconnected && next.summary.status != DeviceSummaryStatus::Unknown {
        updates.push(StatusUpdate {
            reason: EventReason::DeviceConnected,
            message: "device reconnected".to_string(),
        });
    }

    if previous.updated.status != next.updated.status {
        let reason = match next.updated.status {
            DeviceUpdatedStatus::UpToDate => Some(EventReason::DeviceContentUpToDate),
            DeviceUpdatedStatus::OutOfDate => Some(EventReason::DeviceContentOutOfDate),
            DeviceUpdatedStatus::Updating => Some(EventReason::DeviceContentUpdating),
            DeviceUpdatedStatus::Unknown => None,
        };
        if let Some(reason) = reason {
            updates.push(StatusUpdate {
                reason,
                message: next.updated.info.clone().unwrap_or_default(),
            });
        }
    }

    for (prev_level, next_level, normal, warning, critical, label) in [
        (
            previous.resources.cpu,
            next.resources.cpu,
            EventReason::DeviceCpuNormal,
            EventReason::DeviceCpuWarning,
            EventReason::DeviceCpuCritical,
            "CPU",
        ),
        (
            previous.resources.memory,
            next.resources.memory,
            EventReason::DeviceMemoryNormal,
            EventReason::DeviceMemoryWarning,
            EventReason::DeviceMemoryCritical,
            "memory",
        ),
        (
            previous.resources.disk,
            next.resources.disk,
            EventReason::DeviceDiskNormal,
            EventReason::DeviceDiskWarning,
            EventReason::DeviceDiskCritical,
            "disk",
        ),
    ] {
        if prev_level != next_level {
            let reason = match next_level {
                AlertLevel::Normal => normal,
                AlertLevel::Warning => warning,
                AlertLevel::Critical => critical,
            };
            updates.push(StatusUpdate {
                reason,
                message: format!("{} pressure is now {:?}", label, next_level),
            });
        }
    }

    if previous.application_summary.status != next.application_summary.status {
        let reason = match next.application_summary.status {
            ApplicationSummaryStatus::Healthy => Some(EventReason::DeviceApplicationHealthy),
            ApplicationSummaryStatus::Degraded => Some(EventReason::DeviceApplicationDegraded),
            ApplicationSummaryStatus::Error => Some(EventReason::DeviceApplicationError),
            ApplicationSummaryStatus::Unknown => None,
        };
        if let Some(reason) = reason {
            updates.push(StatusUpdate {
                reason,
                message: next.application_summary.info.clone().unwrap_or_default(),
            });
        }
    }

    if previous.lifecycle.status != next.lifecycle.status
        && next.lifecycle.status == LifecycleState::Decommissioned
    {
        let reason = if next.lifecycle.info.is_some() {
            EventReason::DeviceDecommissionFailed
        } else {
            EventReason::DeviceDecommissioned
        };
        updates.push(StatusUpdate {
            reason,
            message: next.lifecycle.info.clone().unwrap_or_default(),
        });
    }
}

/// `5m0s`, `1h10m0s` — matches the agent-facing message format.
pub fn format_duration(d: Duration) -> String {
    let total = d.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else {
        format!("{}m{}s", minutes, seconds)
    }
}
