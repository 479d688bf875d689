use std::sync::Arc;

use chrono::Utc;
use flotilla_domain::{Event, EventDetails, EventReason, OrgId, ResourceRef};
use flotilla_store::Store;
use tracing::{error, warn};
use uuid::Uuid;

/// Appends typed event records to the store's event log.
///
/// Emission never propagates errors to the reconcile that produced it: a
/// failed append is logged and dropped, an unserializable detail payload
/// demotes the event to one without details. Per involved object, emission
/// order matches the order of the generating reconcile's decisions.
#[derive(Clone)]
pub struct EventEmitter {
    store: Arc<dyn Store>,
    actor: String,
}

impl EventEmitter {
    pub fn new(store: Arc<dyn Store>, actor: impl Into<String>) -> Self {
        Self {
            store,
            actor: actor.into(),
        }
    }

    pub async fn emit(
        &self,
        org: &OrgId,
        involved: ResourceRef,
        reason: EventReason,
        message: impl Into<String>,
    ) {
        self.emit_with_details(org, involved, reason, message, None).await;
    }

    pub async fn emit_with_details(
        &self,
        org: &OrgId,
        involved: ResourceRef,
        reason: EventReason,
        message: impl Into<String>,
        details: Option<EventDetails>,
    ) {
        let details = match details {
            Some(details) => match serde_json::to_value(&details) {
                Ok(_) => Some(details),
                Err(e) => {
                    warn!(%reason, error = %e, "dropping unserializable event details");
                    None
                }
            },
            None => None,
        };

        let event = Event {
            id: Uuid::new_v4(),
            involved,
            reason,
            actor: self.actor.clone(),
            r#type: reason.event_type(),
            message: message.into(),
            details,
            timestamp: Utc::now(),
        };

        if let Err(e) = self.store.append_event(org, event).await {
            error!(%reason, error = %e, "failed to append event");
        }
    }

    /// Emit `ResourceUpdateFailed` for server-side failures only: 4xx-class
    /// client errors carry their explanation in the API response and must
    /// not land in the event log.
    pub async fn emit_update_failed(
        &self,
        org: &OrgId,
        involved: ResourceRef,
        status_code: u16,
        message: impl Into<String>,
    ) {
        if (400..500).contains(&status_code) {
            return;
        }
        self.emit(org, involved, EventReason::ResourceUpdateFailed, message)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_domain::{EventType, ResourceKind};
    use flotilla_store::InMemoryStore;

    fn org() -> OrgId {
        OrgId::new("default")
    }

    fn fleet_ref() -> ResourceRef {
        ResourceRef::new(ResourceKind::Fleet, "edge")
    }

    #[tokio::test]
    async fn emits_with_derived_severity() {
        let store = Arc::new(InMemoryStore::new());
        let emitter = EventEmitter::new(store.clone(), "service/fleet-controller");

        emitter
            .emit(&org(), fleet_ref(), EventReason::FleetRolloutFailed, "batch 2 failed")
            .await;
        emitter
            .emit(&org(), fleet_ref(), EventReason::FleetRolloutCompleted, "done")
            .await;

        let events = store.list_events(&org(), None, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].r#type, EventType::Warning);
        assert_eq!(events[1].r#type, EventType::Normal);
        assert_eq!(events[0].actor, "service/fleet-controller");
    }

    #[tokio::test]
    async fn preserves_per_object_order() {
        let store = Arc::new(InMemoryStore::new());
        let emitter = EventEmitter::new(store.clone(), "service/fleet-controller");

        emitter
            .emit(&org(), fleet_ref(), EventReason::FleetRolloutStarted, "start")
            .await;
        emitter
            .emit(&org(), fleet_ref(), EventReason::FleetRolloutBatchDispatched, "batch 1")
            .await;
        emitter
            .emit(&org(), fleet_ref(), EventReason::FleetRolloutCompleted, "done")
            .await;

        let events = store.list_events(&org(), Some(&fleet_ref()), 10).await.unwrap();
        let reasons: Vec<EventReason> = events.iter().map(|e| e.reason).collect();
        assert_eq!(
            reasons,
            vec![
                EventReason::FleetRolloutStarted,
                EventReason::FleetRolloutBatchDispatched,
                EventReason::FleetRolloutCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn client_errors_do_not_emit_update_failed() {
        let store = Arc::new(InMemoryStore::new());
        let emitter = EventEmitter::new(store.clone(), "service/api");

        emitter
            .emit_update_failed(&org(), fleet_ref(), 409, "conflict")
            .await;
        assert!(store.list_events(&org(), None, 10).await.unwrap().is_empty());

        emitter
            .emit_update_failed(&org(), fleet_ref(), 500, "boom")
            .await;
        let events = store.list_events(&org(), None, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, EventReason::ResourceUpdateFailed);
    }
}
