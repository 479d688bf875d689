use chrono::{DateTime, Duration, Utc};
use flotilla_domain::{
    annotations, conditions::reasons, set_condition, AlertLevel, ApplicationState,
    ApplicationStatus, ApplicationSummaryStatus, Condition, ConditionStatus, ConditionType,
    Device, DeviceSummaryStatus, DeviceUpdatedStatus, EventReason, Fleet, LifecycleState,
    OwnerRef,
};

use crate::derive::{default_disconnect_timeout, derive_device_status, format_duration};

fn now() -> DateTime<Utc> {
    "2026-03-01T12:00:00Z".parse().unwrap()
}

fn connected_device(name: &str) -> Device {
    let mut device = Device::new(name);
    device.status.last_seen = Some(now() - Duration::seconds(30));
    device
}

fn managed(mut device: Device, fleet: &str) -> Device {
    device.metadata.owner = Some(OwnerRef::fleet(fleet));
    device
}

fn fleet_with_template_version(name: &str, tv: &str) -> Fleet {
    let mut fleet = Fleet::new(name, Default::default());
    fleet.metadata.set_annotation(annotations::TEMPLATE_VERSION, tv);
    fleet
}

fn derive(device: &Device, fleet: Option<&Fleet>) -> crate::Derivation {
    derive_device_status(device, fleet, now(), default_disconnect_timeout())
}

#[test]
fn healthy_connected_device_is_online() {
    let device = connected_device("d1");
    let derivation = derive(&device, None);
    assert_eq!(derivation.status.summary.status, DeviceSummaryStatus::Online);
    assert_eq!(
        derivation.status.summary.info.as_deref(),
        Some("All system resources healthy")
    );
    assert_eq!(
        derivation.status.application_summary.status,
        ApplicationSummaryStatus::Healthy
    );
}

#[test]
fn disconnected_device_goes_unknown_with_timeout_message() {
    // last seen 10 minutes ago, was online and updating when it disappeared
    let mut device = Device::new("d1");
    device.status.last_seen = Some(now() - Duration::minutes(10));
    device.status.summary.status = DeviceSummaryStatus::Online;
    set_condition(
        &mut device.status.conditions,
        Condition::new(ConditionType::DeviceUpdating, ConditionStatus::True, reasons::UPDATING),
        now() - Duration::minutes(10),
    );

    let derivation = derive(&device, None);
    assert_eq!(derivation.status.summary.status, DeviceSummaryStatus::Unknown);
    assert_eq!(
        derivation.status.summary.info.as_deref(),
        Some("disconnected (last seen more than 5m0s ago)")
    );
    assert_eq!(
        derivation.status.application_summary.status,
        ApplicationSummaryStatus::Unknown
    );
    assert_eq!(derivation.status.updated.status, DeviceUpdatedStatus::Unknown);

    // single disconnect event on the transition
    let reasons: Vec<EventReason> = derivation.updates.iter().map(|u| u.reason).collect();
    assert_eq!(
        reasons.iter().filter(|r| **r == EventReason::DeviceDisconnected).count(),
        1
    );

    // a second pass over the already-Unknown status emits nothing further
    let mut settled = device.clone();
    settled.status = derivation.status.clone();
    let second = derive(&settled, None);
    assert!(second.updates.iter().all(|u| u.reason != EventReason::DeviceDisconnected));
}

#[test]
fn disconnected_but_not_updating_keeps_updated_status() {
    let mut device = Device::new("d1");
    device.status.last_seen = Some(now() - Duration::minutes(10));
    let derivation = derive(&device, None);
    assert_eq!(derivation.status.summary.status, DeviceSummaryStatus::Unknown);
    // unmanaged, no rendered-version annotation: stays/derives UpToDate
    assert_eq!(derivation.status.updated.status, DeviceUpdatedStatus::UpToDate);
}

#[test]
fn awaiting_reconnect_overrides_disconnection() {
    let mut device = Device::new("d1");
    device.status.last_seen = Some(now() - Duration::hours(2));
    device.metadata.set_annotation(annotations::AWAITING_RECONNECT, "true");

    let derivation = derive(&device, None);
    assert_eq!(
        derivation.status.summary.status,
        DeviceSummaryStatus::AwaitingReconnect
    );
    assert!(!derivation.clear_awaiting_reconnect);
}

#[test]
fn awaiting_reconnect_clears_once_reported_catches_up() {
    let mut device = connected_device("d1");
    device.metadata.set_annotation(annotations::AWAITING_RECONNECT, "true");
    device.metadata.set_annotation(annotations::RENDERED_VERSION, "4");
    device.status.config.rendered_version = "4".into();

    let derivation = derive(&device, None);
    assert!(derivation.clear_awaiting_reconnect);
}

#[test]
fn rebooting_condition_wins_over_resources() {
    let mut device = connected_device("d1");
    device.status.resources.cpu = AlertLevel::Warning;
    set_condition(
        &mut device.status.conditions,
        Condition::new(ConditionType::DeviceUpdating, ConditionStatus::True, reasons::REBOOTING),
        now(),
    );
    let derivation = derive(&device, None);
    assert_eq!(derivation.status.summary.status, DeviceSummaryStatus::Rebooting);
}

#[test]
fn critical_resource_pressure_is_an_error() {
    let mut device = connected_device("d1");
    device.status.resources.disk = AlertLevel::Critical;
    device.status.resources.memory = AlertLevel::Warning;

    let derivation = derive(&device, None);
    assert_eq!(derivation.status.summary.status, DeviceSummaryStatus::Error);
    assert!(derivation.status.summary.info.as_deref().unwrap().contains("Disk usage"));

    let reasons: Vec<EventReason> = derivation.updates.iter().map(|u| u.reason).collect();
    assert!(reasons.contains(&EventReason::DeviceDiskCritical));
    assert!(reasons.contains(&EventReason::DeviceMemoryWarning));
}

#[test]
fn application_errors_dominate_pending() {
    let mut device = connected_device("d1");
    device.status.applications = vec![
        ApplicationStatus {
            name: "telemetry".into(),
            status: ApplicationState::Error,
            info: None,
        },
        ApplicationStatus {
            name: "ingest".into(),
            status: ApplicationState::Starting,
            info: None,
        },
    ];
    let derivation = derive(&device, None);
    assert_eq!(
        derivation.status.application_summary.status,
        ApplicationSummaryStatus::Error
    );
    assert!(derivation
        .status
        .application_summary
        .info
        .as_deref()
        .unwrap()
        .contains("telemetry"));
}

#[test]
fn updating_condition_reports_updating() {
    let mut device = connected_device("d1");
    set_condition(
        &mut device.status.conditions,
        Condition::new(ConditionType::DeviceUpdating, ConditionStatus::True, reasons::UPDATING)
            .with_message("downloading image"),
        now(),
    );
    let derivation = derive(&device, None);
    assert_eq!(derivation.status.updated.status, DeviceUpdatedStatus::Updating);
    assert_eq!(derivation.status.updated.info.as_deref(), Some("downloading image"));

    let reasons: Vec<EventReason> = derivation.updates.iter().map(|u| u.reason).collect();
    assert!(reasons.contains(&EventReason::DeviceContentUpdating));
}

#[test]
fn unmanaged_device_out_of_date_on_version_drift() {
    let mut device = connected_device("d1");
    device.metadata.set_annotation(annotations::RENDERED_VERSION, "3");
    device.status.config.rendered_version = "2".into();
    let derivation = derive(&device, None);
    assert_eq!(derivation.status.updated.status, DeviceUpdatedStatus::OutOfDate);
}

#[test]
fn managed_device_up_to_date_iff_both_versions_match() {
    let fleet = fleet_with_template_version("edge", "edge-3");

    let mut device = managed(connected_device("d1"), "edge");
    device
        .metadata
        .set_annotation(annotations::RENDERED_TEMPLATE_VERSION, "edge-3");
    device.metadata.set_annotation(annotations::RENDERED_VERSION, "5");
    device.status.config.rendered_version = "5".into();
    assert_eq!(
        derive(&device, Some(&fleet)).status.updated.status,
        DeviceUpdatedStatus::UpToDate
    );

    // template version behind
    let mut behind = device.clone();
    behind
        .metadata
        .set_annotation(annotations::RENDERED_TEMPLATE_VERSION, "edge-2");
    assert_eq!(
        derive(&behind, Some(&fleet)).status.updated.status,
        DeviceUpdatedStatus::OutOfDate
    );

    // config not yet applied
    let mut lagging = device.clone();
    lagging.status.config.rendered_version = "4".into();
    assert_eq!(
        derive(&lagging, Some(&fleet)).status.updated.status,
        DeviceUpdatedStatus::OutOfDate
    );
}

#[test]
fn out_of_date_message_includes_rollout_error() {
    let fleet = fleet_with_template_version("edge", "edge-3");
    let mut device = managed(connected_device("d1"), "edge");
    device
        .metadata
        .set_annotation(annotations::RENDERED_TEMPLATE_VERSION, "edge-2");
    device
        .metadata
        .set_annotation(annotations::LAST_ROLLOUT_ERROR, "template render failed");

    let derivation = derive(&device, Some(&fleet));
    assert_eq!(derivation.status.updated.status, DeviceUpdatedStatus::OutOfDate);
    assert!(derivation
        .status
        .updated
        .info
        .as_deref()
        .unwrap()
        .contains("template render failed"));
}

#[test]
fn decommissioning_condition_drives_lifecycle() {
    let mut device = connected_device("d1");
    set_condition(
        &mut device.status.conditions,
        Condition::new(
            ConditionType::DeviceDecommissioning,
            ConditionStatus::True,
            reasons::DECOMMISSION_STARTED,
        ),
        now(),
    );
    assert_eq!(
        derive(&device, None).status.lifecycle.status,
        LifecycleState::Decommissioning
    );

    set_condition(
        &mut device.status.conditions,
        Condition::new(
            ConditionType::DeviceDecommissioning,
            ConditionStatus::True,
            reasons::DECOMMISSION_COMPLETE,
        ),
        now(),
    );
    let derivation = derive(&device, None);
    assert_eq!(derivation.status.lifecycle.status, LifecycleState::Decommissioned);
    assert!(derivation
        .updates
        .iter()
        .any(|u| u.reason == EventReason::DeviceDecommissioned));
}

#[test]
fn derivation_is_deterministic() {
    let mut device = managed(connected_device("d1"), "edge");
    device.status.resources.cpu = AlertLevel::Warning;
    let fleet = fleet_with_template_version("edge", "edge-1");

    let a = derive(&device, Some(&fleet));
    let b = derive(&device, Some(&fleet));
    assert_eq!(a.status, b.status);
    assert_eq!(a.updates, b.updates);
}

#[test]
fn unchanged_status_reports_no_change() {
    let device = connected_device("d1");
    let first = derive(&device, None);
    assert!(first.changed);

    let mut settled = device.clone();
    settled.status = first.status;
    let second = derive(&settled, None);
    assert!(!second.changed);
    assert!(second.updates.is_empty());
}

#[test]
fn duration_formats_like_the_agent() {
    assert_eq!(format_duration(Duration::minutes(5)), "5m0s");
    assert_eq!(format_duration(Duration::seconds(90)), "1m30s");
    assert_eq!(format_duration(Duration::minutes(70)), "1h10m0s");
}
