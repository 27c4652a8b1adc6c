//! Per-user billing event fan-out.
//!
//! Each user gets a bounded broadcast channel created lazily on first
//! subscribe or publish. Delivery is at-least-once for connected
//! subscribers; a slow consumer that falls behind the channel capacity
//! observes a lag and resumes from the oldest retained event.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use callbill_core::{BillingEvent, BillingSessionId, StreamSessionId, UserId};

/// Events retained per user channel before slow subscribers lag.
const CHANNEL_CAPACITY: usize = 64;

/// A billing event addressed to the parties of a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// The stream session the event concerns.
    pub stream_session_id: StreamSessionId,
    /// The billing session behind it.
    pub billing_session_id: BillingSessionId,
    /// The paying explorer.
    pub explorer_id: UserId,
    /// The influencer on the call.
    pub influencer_id: UserId,
    /// The transition notification itself.
    #[serde(flatten)]
    pub event: BillingEvent,
    /// When the event was published.
    pub published_at: DateTime<Utc>,
}

/// Fan-out hub keyed by user id.
#[derive(Debug, Default)]
pub struct EventBroadcaster {
    channels: DashMap<UserId, broadcast::Sender<EventEnvelope>>,
}

impl EventBroadcaster {
    /// Create an empty broadcaster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events addressed to `user_id`.
    pub fn subscribe(&self, user_id: UserId) -> broadcast::Receiver<EventEnvelope> {
        self.channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event to both parties of the call.
    ///
    /// Callers persist state before publishing, so subscribers never see
    /// an event for a transition that did not durably happen. Send errors
    /// mean no subscriber is currently connected and are ignored.
    pub fn publish(&self, envelope: &EventEnvelope) {
        tracing::debug!(
            stream_session_id = %envelope.stream_session_id,
            event = envelope.event.kind(),
            "Publishing billing event"
        );

        self.send_to(&envelope.explorer_id, envelope);
        if envelope.influencer_id != envelope.explorer_id {
            self.send_to(&envelope.influencer_id, envelope);
        }
    }

    fn send_to(&self, user_id: &UserId, envelope: &EventEnvelope) {
        if let Some(sender) = self.channels.get(user_id) {
            // Err here just means every receiver for this user is gone.
            let _ = sender.send(envelope.clone());
        }
    }

    /// Drop channels with no remaining subscribers.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(explorer: UserId, influencer: UserId) -> EventEnvelope {
        EventEnvelope {
            stream_session_id: StreamSessionId::generate(),
            billing_session_id: BillingSessionId::generate(),
            explorer_id: explorer,
            influencer_id: influencer,
            event: BillingEvent::PaymentFailed {
                session_id: StreamSessionId::generate(),
                reason: "card_declined".into(),
            },
            published_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn both_parties_receive() {
        let broadcaster = EventBroadcaster::new();
        let explorer = UserId::generate();
        let influencer = UserId::generate();

        let mut rx_explorer = broadcaster.subscribe(explorer);
        let mut rx_influencer = broadcaster.subscribe(influencer);

        broadcaster.publish(&envelope(explorer, influencer));

        assert!(rx_explorer.try_recv().is_ok());
        assert!(rx_influencer.try_recv().is_ok());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.publish(&envelope(UserId::generate(), UserId::generate()));
    }

    #[tokio::test]
    async fn prune_drops_abandoned_channels() {
        let broadcaster = EventBroadcaster::new();
        let user = UserId::generate();
        drop(broadcaster.subscribe(user));

        broadcaster.prune();
        assert!(broadcaster.channels.is_empty());
    }

    #[test]
    fn envelope_serializes_event_inline() {
        let env = envelope(UserId::generate(), UserId::generate());
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "PAYMENT_FAILED");
        assert!(json["published_at"].is_string());
    }
}
