//! In-process progress bus backed by a `tokio::sync::broadcast` channel.
//!
//! The generation worker publishes a [`ProgressEvent`] for every update it
//! has persisted; live relay connections subscribe to the result they serve.
//! The bus carries notifications only. The result store's progress log stays
//! authoritative, so a subscriber that lags can catch up from the log.

use chrono::{DateTime, Utc};
use quarry_core::progress::ProgressUpdate;
use quarry_core::types::EntityId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// A progress update that has been written to a result's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub result_id: EntityId,

    /// Sequence of this update in the result's progress log.
    pub seq: i64,

    pub update: ProgressUpdate,

    /// When the event was published (UTC).
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(result_id: EntityId, seq: i64, update: ProgressUpdate) -> Self {
        Self {
            result_id,
            seq,
            update,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out bus for [`ProgressEvent`]s.
///
/// # Usage
///
/// ```rust
/// use quarry_core::progress::ProgressUpdate;
/// use quarry_events::bus::{ProgressBus, ProgressEvent};
///
/// let bus = ProgressBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(ProgressEvent::new(uuid::Uuid::nil(), 1, ProgressUpdate::Completed));
/// ```
pub struct ProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Without subscribers the event is dropped; it is already persisted.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of a single result.
    pub fn subscribe_result(&self, result_id: EntityId) -> ResultSubscription {
        ResultSubscription {
            result_id,
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// ResultSubscription
// ---------------------------------------------------------------------------

/// Why a [`ResultSubscription`] could not yield the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The receiver fell behind and `skipped` events were dropped.
    #[error("Subscriber lagged behind by {skipped} events")]
    Lagged { skipped: u64 },

    #[error("Progress bus closed")]
    Closed,
}

/// A bus receiver that only yields events of one result.
pub struct ResultSubscription {
    result_id: EntityId,
    receiver: broadcast::Receiver<ProgressEvent>,
}

impl ResultSubscription {
    pub fn result_id(&self) -> EntityId {
        self.result_id
    }

    /// Wait for the next event of this result.
    ///
    /// Cancel-safe: dropping the future loses no event of this result.
    pub async fn next(&mut self) -> Result<ProgressEvent, SubscriptionError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.result_id == self.result_id => return Ok(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        result_id = %self.result_id,
                        skipped,
                        "Progress subscriber lagged",
                    );
                    return Err(SubscriptionError::Lagged { skipped });
                }
                Err(RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn delta(text: &str) -> ProgressUpdate {
        ProgressUpdate::ContentDelta {
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = ProgressBus::default();
        let mut rx = bus.subscribe();
        let result_id = uuid::Uuid::new_v4();

        bus.publish(ProgressEvent::new(result_id, 3, delta("A")));

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.result_id, result_id);
        assert_eq!(received.seq, 3);
        assert_eq!(received.update, delta("A"));
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = ProgressBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(ProgressEvent::new(uuid::Uuid::nil(), 1, ProgressUpdate::Completed));

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert_eq!(e1.update, ProgressUpdate::Completed);
        assert_eq!(e2.update, ProgressUpdate::Completed);
    }

    #[tokio::test]
    async fn result_subscription_filters_other_results() {
        let bus = ProgressBus::default();
        let mine = uuid::Uuid::new_v4();
        let other = uuid::Uuid::new_v4();
        let mut sub = bus.subscribe_result(mine);

        bus.publish(ProgressEvent::new(other, 1, delta("x")));
        bus.publish(ProgressEvent::new(mine, 1, delta("A")));

        let event = sub.next().await.unwrap();
        assert_eq!(event.result_id, mine);
        assert_eq!(event.update, delta("A"));
    }

    #[tokio::test]
    async fn lagging_subscription_reports_skipped_events() {
        let bus = ProgressBus::new(2);
        let result_id = uuid::Uuid::new_v4();
        let mut sub = bus.subscribe_result(result_id);

        for seq in 1..=4 {
            bus.publish(ProgressEvent::new(result_id, seq, delta("x")));
        }

        assert_matches!(sub.next().await, Err(SubscriptionError::Lagged { skipped: 2 }));
        assert_eq!(sub.next().await.unwrap().seq, 3);
    }

    #[tokio::test]
    async fn dropped_bus_closes_subscription() {
        let bus = ProgressBus::default();
        let mut sub = bus.subscribe_result(uuid::Uuid::nil());
        drop(bus);
        assert_matches!(sub.next().await, Err(SubscriptionError::Closed));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = ProgressBus::default();
        bus.publish(ProgressEvent::new(uuid::Uuid::nil(), 1, ProgressUpdate::Completed));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
