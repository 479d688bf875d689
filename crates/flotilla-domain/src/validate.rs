use crate::device::DeviceSpec;
use crate::error::DomainError;
use crate::fleet::FleetSpec;

/// Validate a device spec template: image references parseable, config
/// provider contents well-formed, schedules valid.
pub fn validate_device_spec(spec: &DeviceSpec) -> Result<(), DomainError> {
    let mut errors = Vec::new();

    if let Some(os) = &spec.os {
        if let Err(e) = validate_image_ref(&os.image) {
            errors.push(e);
        }
    }
    for provider in &spec.config {
        if let Err(e) = provider.validate() {
            errors.push(e);
        }
    }
    for application in &spec.applications {
        if let Err(e) = application.validate() {
            errors.push(e);
        }
    }
    if let Some(policy) = &spec.update_policy {
        for schedule in [&policy.download_schedule, &policy.update_schedule]
            .into_iter()
            .flatten()
        {
            if let Err(e) = validate_cron(schedule) {
                errors.push(e);
            }
        }
    }

    DomainError::from_errors(errors)
}

/// Validate a full fleet spec: selector, template device spec, rollout policy.
pub fn validate_fleet_spec(spec: &FleetSpec) -> Result<(), DomainError> {
    let mut errors = Vec::new();

    if let Some(selector) = &spec.selector {
        if let Err(e) = selector.validate() {
            errors.push(e);
        }
    }
    if let Err(e) = validate_device_spec(&spec.template.spec) {
        errors.push(e);
    }
    if let Some(policy) = &spec.rollout_policy {
        if let Err(e) = policy.validate() {
            errors.push(e);
        }
    }

    DomainError::from_errors(errors)
}

/// Accepts `registry/repo[:tag][@sha256:digest]` shapes, where template
/// expressions (`{{ … }}`) stand in for any segment and are checked at
/// render time instead.
pub fn validate_image_ref(image: &str) -> Result<(), DomainError> {
    if image.is_empty() {
        return Err(DomainError::InvalidImageRef(image.to_string()));
    }
    if image.contains("{{") {
        return Ok(());
    }
    if image.chars().any(|c| c.is_whitespace()) {
        return Err(DomainError::InvalidImageRef(image.to_string()));
    }
    // at most one tag separator after the last path segment
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    let name_part = last_segment.split('@').next().unwrap_or(last_segment);
    if name_part.matches(':').count() > 1 {
        return Err(DomainError::InvalidImageRef(image.to_string()));
    }
    if image.starts_with(':') || image.ends_with(':') || image.ends_with('/') {
        return Err(DomainError::InvalidImageRef(image.to_string()));
    }
    Ok(())
}

/// Minimal 5-field cron validation: field count and character set per field.
pub fn validate_cron(schedule: &str) -> Result<(), DomainError> {
    let invalid = |message: &str| DomainError::InvalidSchedule {
        schedule: schedule.to_string(),
        message: message.to_string(),
    };

    let fields: Vec<&str> = schedule.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid("expected 5 fields"));
    }
    for field in fields {
        if field.is_empty()
            || !field
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '*' | ',' | '-' | '/'))
        {
            return Err(invalid("field contains invalid characters"));
        }
    }
    Ok(())
}
