//! Fan-out of committed status changes to live subscribers.
//!
//! Delivery is best effort: nothing is persisted, a slow subscriber that
//! falls behind the channel capacity loses the oldest events and sees
//! `RecvError::Lagged`, and publishing never waits on anyone. Subscribers that
//! need the truth re-read the store.

use crate::state_machine::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    /// Owning workshop, so per-workshop listeners can filter.
    pub workshop_id: String,
    pub new_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn workshop(
        workshop_id: impl Into<String>,
        new_status: impl ToString,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let workshop_id = workshop_id.into();
        Self {
            entity_kind: EntityKind::Workshop,
            entity_id: workshop_id.clone(),
            workshop_id,
            new_status: new_status.to_string(),
            detail: None,
            timestamp,
        }
    }

    pub fn attendee(
        attendee_id: impl Into<String>,
        workshop_id: impl Into<String>,
        new_status: impl ToString,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_kind: EntityKind::Attendee,
            entity_id: attendee_id.into(),
            workshop_id: workshop_id.into(),
            new_status: new_status.to_string(),
            detail: None,
            timestamp,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    sender: broadcast::Sender<StatusEvent>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an already-committed change. Returns how many subscribers
    /// received it; zero subscribers is not an error.
    pub fn publish(&self, event: StatusEvent) -> usize {
        trace!(
            entity_id = %event.entity_id,
            status = %event.new_status,
            "publishing status event"
        );
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let broadcaster = StatusBroadcaster::new(4);
        assert_eq!(
            broadcaster.publish(StatusEvent::workshop("w1", "active", Utc::now())),
            0
        );
    }

    #[tokio::test]
    async fn subscribers_see_events_in_publish_order() {
        let broadcaster = StatusBroadcaster::new(16);
        let mut rx = broadcaster.subscribe();

        for status in ["deploying", "active", "deleting"] {
            broadcaster.publish(StatusEvent::attendee("a1", "w1", status, Utc::now()));
        }

        for expected in ["deploying", "active", "deleting"] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.entity_kind, EntityKind::Attendee);
            assert_eq!(event.workshop_id, "w1");
            assert_eq!(event.new_status, expected);
        }
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let broadcaster = StatusBroadcaster::new(2);
        let mut rx = broadcaster.subscribe();

        for i in 0..5 {
            broadcaster.publish(StatusEvent::workshop(format!("w{i}"), "active", Utc::now()));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap().entity_id, "w3");
    }
}
