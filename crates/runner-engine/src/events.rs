//! CloudEvents published on the scheduler's event queue.
//!
//! Every state transition of every job becomes one serialized CloudEvent on
//! a single-consumer queue. Per-job ordering follows the state machine; no
//! ordering is guaranteed across distinct realizations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::job::State;

/// Event type of realization-timeout events.
pub const EVTYPE_REALIZATION_TIMEOUT: &str = "com.equinor.ert.realization.timeout";

/// A CloudEvents 1.0 document as placed on the scheduler event queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEvent {
    /// CloudEvents spec version, always `1.0`.
    pub specversion: String,
    /// Canonical event type string.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event source, `/ert/ensemble/{ens_id}/real/{iens}`.
    pub source: String,
    /// Unique event id.
    pub id: String,
    /// Emission timestamp.
    pub time: DateTime<Utc>,
    /// Content type of `data`; omitted for body-less events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    /// Event body, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CloudEvent {
    fn new(event_type: &str, source: String) -> Self {
        Self {
            specversion: "1.0".to_string(),
            event_type: event_type.to_string(),
            source,
            id: uuid::Uuid::new_v4().to_string(),
            time: Utc::now(),
            datacontenttype: None,
            data: None,
        }
    }

    /// The realization index encoded in the event source, if any.
    pub fn source_iens(&self) -> Option<usize> {
        self.source.rsplit('/').next()?.parse().ok()
    }

    /// The legacy queue-state string in the event body, if any.
    pub fn queue_event_type(&self) -> Option<&str> {
        self.data.as_ref()?.get("queue_event_type")?.as_str()
    }
}

/// Handle jobs use to publish events; a clone per job keeps jobs decoupled
/// from the scheduler that owns them.
#[derive(Debug, Clone)]
pub(crate) struct EventPublisher {
    ens_id: String,
    tx: mpsc::UnboundedSender<String>,
}

impl EventPublisher {
    pub(crate) fn new(ens_id: String, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { ens_id, tx }
    }

    fn source(&self, iens: usize) -> String {
        format!("/ert/ensemble/{}/real/{}", self.ens_id, iens)
    }

    fn publish(&self, event: &CloudEvent) {
        if let Ok(raw) = serde_json::to_string(event) {
            let _ = self.tx.send(raw);
        }
    }

    /// Publish the queue-state event for one job state entry.
    pub(crate) fn queue_state(&self, iens: usize, state: State) {
        let mut event = CloudEvent::new(state.event_type(), self.source(iens));
        event.datacontenttype = Some("application/json".to_string());
        event.data = Some(json!({ "queue_event_type": state.legacy() }));
        self.publish(&event);
    }

    /// Publish a realization-timeout event. Timeout events carry no body.
    pub(crate) fn realization_timeout(&self, iens: usize) {
        let event = CloudEvent::new(EVTYPE_REALIZATION_TIMEOUT, self.source(iens));
        self.publish(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher() -> (EventPublisher, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventPublisher::new("ee-0".to_string(), tx), rx)
    }

    #[test]
    fn queue_state_events_carry_the_legacy_body() {
        let (publisher, mut rx) = publisher();
        publisher.queue_state(3, State::Submitting);

        let event: CloudEvent = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(event.specversion, "1.0");
        assert_eq!(event.event_type, "com.equinor.ert.realization.submitted");
        assert_eq!(event.source, "/ert/ensemble/ee-0/real/3");
        assert_eq!(event.datacontenttype.as_deref(), Some("application/json"));
        assert_eq!(event.queue_event_type(), Some("SUBMITTED"));
        assert_eq!(event.source_iens(), Some(3));
        assert!(!event.id.is_empty());
    }

    #[test]
    fn timeout_events_have_no_body() {
        let (publisher, mut rx) = publisher();
        publisher.realization_timeout(0);

        let raw = rx.try_recv().unwrap();
        let event: CloudEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(event.event_type, EVTYPE_REALIZATION_TIMEOUT);
        assert!(event.data.is_none());
        assert!(!raw.contains("datacontenttype"));
    }

    #[test]
    fn event_ids_are_unique() {
        let (publisher, mut rx) = publisher();
        publisher.queue_state(0, State::Running);
        publisher.queue_state(0, State::Running);

        let first: CloudEvent = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        let second: CloudEvent = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_ne!(first.id, second.id);
    }
}
