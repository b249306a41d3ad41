use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::FulfillmentError;
use crate::metrics::Metrics;
use crate::store::{DeliveryEventStore, LineItemRepository};

use super::events::{latest_of, DeliveryEvent, DeliveryStatus, DeliveryType, NewDeliveryEvent};

/// Append-only log of shipments and pickups per line item. Events never
/// drive status changes on their own; the transition guards read them.
#[derive(Clone)]
pub struct DeliveryTracker {
    events: Arc<dyn DeliveryEventStore>,
    line_items: Arc<dyn LineItemRepository>,
    metrics: Arc<Metrics>,
}

impl DeliveryTracker {
    pub fn new(
        events: Arc<dyn DeliveryEventStore>,
        line_items: Arc<dyn LineItemRepository>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            events,
            line_items,
            metrics,
        }
    }

    /// Record a delivery event. Only the existence of the line item is
    /// checked, not its status.
    pub async fn append_event(&self, line_item_id: Uuid, new: NewDeliveryEvent) -> Result<DeliveryEvent, FulfillmentError> {
        if self.line_items.get_line_item(line_item_id).await?.is_none() {
            return Err(FulfillmentError::not_found("line item", line_item_id));
        }

        let event = DeliveryEvent::from_new(line_item_id, new, Utc::now());
        self.events.append_event(&event).await?;
        self.metrics.record_delivery_event(event.delivery_type.as_str());

        tracing::info!(
            line_item_id = %line_item_id,
            event_id = %event.id,
            delivery_type = %event.delivery_type,
            tracking = event.tracking_number.as_deref().unwrap_or("-"),
            "🚚 Delivery event recorded"
        );
        Ok(event)
    }

    /// Mark an event completed. Completing an already completed event returns
    /// it unchanged.
    pub async fn complete(&self, event_id: Uuid, completed_at: DateTime<Utc>) -> Result<DeliveryEvent, FulfillmentError> {
        let mut event = self
            .events
            .get_event(event_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found("delivery event", event_id))?;

        if event.is_completed() {
            tracing::debug!(event_id = %event_id, "Delivery event already completed");
            return Ok(event);
        }

        event.completed_at = Some(completed_at);
        event.status = DeliveryStatus::Delivered;
        self.events.update_event(&event).await?;

        tracing::info!(
            line_item_id = %event.line_item_id,
            event_id = %event_id,
            delivery_type = %event.delivery_type,
            "Delivery event completed"
        );
        Ok(event)
    }

    /// All events of a line item, oldest first.
    pub async fn history(&self, line_item_id: Uuid) -> Result<Vec<DeliveryEvent>, FulfillmentError> {
        let mut events = self.events.list_events(line_item_id).await?;
        events.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(events)
    }

    /// Status of the newest event, optionally restricted to one type.
    pub async fn latest_status(
        &self,
        line_item_id: Uuid,
        delivery_type: Option<DeliveryType>,
    ) -> Result<Option<DeliveryStatus>, FulfillmentError> {
        let events = self.history(line_item_id).await?;
        let latest = match delivery_type {
            Some(t) => latest_of(&events, t),
            None => events.last(),
        };
        Ok(latest.map(|e| e.status))
    }

    /// Set the status of the newest event of `delivery_type`. A line item
    /// without such an event is left alone.
    pub async fn mark_latest(
        &self,
        line_item_id: Uuid,
        delivery_type: DeliveryType,
        status: DeliveryStatus,
    ) -> Result<Option<DeliveryEvent>, FulfillmentError> {
        let events = self.history(line_item_id).await?;
        let Some(mut event) = latest_of(&events, delivery_type).cloned() else {
            tracing::debug!(line_item_id = %line_item_id, delivery_type = %delivery_type, "No delivery event to mark");
            return Ok(None);
        };

        if event.status != status {
            event.status = status;
            self.events.update_event(&event).await?;
            tracing::debug!(
                line_item_id = %line_item_id,
                event_id = %event.id,
                status = %status,
                "Delivery status updated"
            );
        }
        Ok(Some(event))
    }

    /// Complete the newest event of `delivery_type`, if there is one.
    pub async fn complete_latest(
        &self,
        line_item_id: Uuid,
        delivery_type: DeliveryType,
    ) -> Result<Option<DeliveryEvent>, FulfillmentError> {
        let events = self.history(line_item_id).await?;
        match latest_of(&events, delivery_type) {
            Some(event) => self.complete(event.id, Utc::now()).await.map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fulfillment::aggregate::tests::sample_draft;
    use crate::domain::fulfillment::LineItemStatus;
    use crate::store::{OrderRepository, Stores};

    async fn tracker_with_item() -> (DeliveryTracker, Uuid) {
        let (stores, _) = Stores::memory();
        let (order, items) = sample_draft().build("241019TEST", None, LineItemStatus::Preparing, Utc::now());
        stores.orders.create_order(&order, &items).await.unwrap();

        let metrics = Arc::new(Metrics::new().unwrap());
        let tracker = DeliveryTracker::new(stores.deliveries.clone(), stores.line_items.clone(), metrics);
        (tracker, items[0].id)
    }

    #[tokio::test]
    async fn test_append_requires_existing_line_item() {
        let (tracker, _) = tracker_with_item().await;
        let err = tracker
            .append_event(Uuid::new_v4(), NewDeliveryEvent::new(DeliveryType::OrderOut))
            .await
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::NotFound { entity: "line item", .. }));
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let (tracker, item_id) = tracker_with_item().await;
        let event = tracker
            .append_event(item_id, NewDeliveryEvent::new(DeliveryType::OrderOut).with_tracking("CJ", "6301"))
            .await
            .unwrap();

        let first_at = Utc::now();
        let first = tracker.complete(event.id, first_at).await.unwrap();
        let second = tracker.complete(event.id, first_at + chrono::Duration::hours(1)).await.unwrap();

        assert_eq!(first.completed_at, Some(first_at));
        assert_eq!(second.completed_at, Some(first_at));
        assert_eq!(second.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_history_is_ordered_and_latest_status_follows_type() {
        let (tracker, item_id) = tracker_with_item().await;
        tracker
            .append_event(item_id, NewDeliveryEvent::new(DeliveryType::OrderOut).with_tracking("CJ", "1"))
            .await
            .unwrap();
        tracker
            .append_event(item_id, NewDeliveryEvent::new(DeliveryType::ReturnIn))
            .await
            .unwrap();

        let history = tracker.history(item_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].created_at <= history[1].created_at);

        assert_eq!(
            tracker.latest_status(item_id, Some(DeliveryType::OrderOut)).await.unwrap(),
            Some(DeliveryStatus::Preparing)
        );
        assert_eq!(
            tracker.latest_status(item_id, None).await.unwrap(),
            Some(DeliveryStatus::Delivering)
        );
        assert_eq!(
            tracker.latest_status(item_id, Some(DeliveryType::ExchangeOut)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_mark_latest_only_touches_newest_of_type() {
        let (tracker, item_id) = tracker_with_item().await;
        assert!(tracker
            .mark_latest(item_id, DeliveryType::OrderOut, DeliveryStatus::Delivering)
            .await
            .unwrap()
            .is_none());

        tracker
            .append_event(item_id, NewDeliveryEvent::new(DeliveryType::OrderOut).with_tracking("CJ", "1"))
            .await
            .unwrap();
        let marked = tracker
            .mark_latest(item_id, DeliveryType::OrderOut, DeliveryStatus::Delivering)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(marked.status, DeliveryStatus::Delivering);
        assert_eq!(
            tracker.latest_status(item_id, Some(DeliveryType::OrderOut)).await.unwrap(),
            Some(DeliveryStatus::Delivering)
        );
    }
}
