use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use flotilla_domain::{
    conditions::reasons, Condition, ConditionStatus, ConditionType, Device, EnrollmentApproval,
    EventReason, OrgId, ResourceKind, ResourceRef,
};
use flotilla_store::{Store, StoreError};
use tracing::info;

use crate::conditions::apply_condition;
use crate::emitter::EventEmitter;
use crate::error::ControllerError;

/// Decides enrollment requests. Approval is monotonic: a decided request
/// never changes its mind, and approving creates the device exactly once.
pub struct EnrollmentService {
    store: Arc<dyn Store>,
    emitter: EventEmitter,
}

impl EnrollmentService {
    pub fn new(store: Arc<dyn Store>, emitter: EventEmitter) -> Self {
        Self { store, emitter }
    }

    pub async fn approve(
        &self,
        org: &OrgId,
        name: &str,
        approved_by: &str,
        labels: Option<BTreeMap<String, String>>,
    ) -> Result<(), ControllerError> {
        let Some(mut request) = self.store.get_enrollment_request(org, name).await? else {
            return Err(StoreError::NotFound {
                kind: ResourceKind::EnrollmentRequest,
                name: name.to_string(),
            }
            .into());
        };

        let involved = ResourceRef::new(ResourceKind::EnrollmentRequest, name);
        if request.is_decided() {
            self.emitter
                .emit(
                    org,
                    involved,
                    EventReason::EnrollmentRequestApprovalFailed,
                    "enrollment request is already decided",
                )
                .await;
            return Err(ControllerError::Internal(format!(
                "enrollment request '{}' is already decided",
                name
            )));
        }

        let labels = labels.or_else(|| request.spec.labels.clone());
        request.status.approval = Some(EnrollmentApproval {
            approved: true,
            approved_by: approved_by.to_string(),
            approved_at: Utc::now(),
            labels: labels.clone(),
        });
        apply_condition(
            &mut request.status.conditions,
            Condition::new(
                ConditionType::EnrollmentRequestApproved,
                ConditionStatus::True,
                reasons::APPROVED,
            ),
            Utc::now(),
        );
        self.store.update_enrollment_request(org, request).await?;

        let mut device = Device::new(name);
        device.metadata.labels = labels;
        match self.store.create_device(org, device).await {
            Ok(_) => {}
            // the device from a previous, interrupted approval attempt
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        info!(request = name, approved_by, "enrollment request approved");
        self.emitter
            .emit(
                org,
                ResourceRef::new(ResourceKind::EnrollmentRequest, name),
                EventReason::EnrollmentRequestApproved,
                format!("approved by {}", approved_by),
            )
            .await;
        Ok(())
    }

    pub async fn deny(
        &self,
        org: &OrgId,
        name: &str,
        denied_by: &str,
    ) -> Result<(), ControllerError> {
        let Some(mut request) = self.store.get_enrollment_request(org, name).await? else {
            return Err(StoreError::NotFound {
                kind: ResourceKind::EnrollmentRequest,
                name: name.to_string(),
            }
            .into());
        };
        if request.is_decided() {
            self.emitter
                .emit(
                    org,
                    ResourceRef::new(ResourceKind::EnrollmentRequest, name),
                    EventReason::EnrollmentRequestApprovalFailed,
                    "enrollment request is already decided",
                )
                .await;
            return Err(ControllerError::Internal(format!(
                "enrollment request '{}' is already decided",
                name
            )));
        }

        request.status.approval = Some(EnrollmentApproval {
            approved: false,
            approved_by: denied_by.to_string(),
            approved_at: Utc::now(),
            labels: None,
        });
        apply_condition(
            &mut request.status.conditions,
            Condition::new(
                ConditionType::EnrollmentRequestApproved,
                ConditionStatus::False,
                reasons::DENIED,
            ),
            Utc::now(),
        );
        self.store.update_enrollment_request(org, request).await?;
        info!(request = name, denied_by, "enrollment request denied");
        Ok(())
    }
}
