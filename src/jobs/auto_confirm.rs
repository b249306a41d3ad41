use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::controller::ConcurrencyController;
use crate::domain::delivery::{latest_of, DeliveryTracker, DeliveryType};
use crate::domain::fulfillment::{Action, ActorRole, LineItemStatus, OrderLineItem, TransitionRequest};
use crate::error::FulfillmentError;
use crate::metrics::Metrics;
use crate::store::LineItemRepository;

pub const AUTO_CONFIRM_REASON: &str = "auto purchase confirm";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub confirmed: usize,
    pub conflicts: usize,
    pub failed: usize,
}

/// Confirms purchases the buyer never confirmed: DELIVERED items whose
/// outbound delivery completed more than `after_days` ago.
#[derive(Clone)]
pub struct AutoConfirmJob {
    line_items: Arc<dyn LineItemRepository>,
    tracker: DeliveryTracker,
    controller: ConcurrencyController,
    metrics: Arc<Metrics>,
    after_days: i64,
}

impl AutoConfirmJob {
    pub fn new(
        line_items: Arc<dyn LineItemRepository>,
        tracker: DeliveryTracker,
        controller: ConcurrencyController,
        metrics: Arc<Metrics>,
        after_days: i64,
    ) -> Self {
        Self {
            line_items,
            tracker,
            controller,
            metrics,
            after_days,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport, FulfillmentError> {
        let cutoff = now - ChronoDuration::days(self.after_days);
        let delivered = self.line_items.list_by_status(LineItemStatus::Delivered).await?;

        let delivered_at = join_all(delivered.iter().map(|item| self.delivered_at(item))).await;

        let mut report = SweepReport {
            scanned: delivered.len(),
            ..SweepReport::default()
        };

        for (item, delivered_at) in delivered.iter().zip(delivered_at) {
            let delivered_at = match delivered_at {
                Ok(at) => at,
                Err(e) => {
                    tracing::warn!(line_item_id = %item.id, error = %e, "Could not load delivery history");
                    report.failed += 1;
                    continue;
                }
            };
            if delivered_at > cutoff {
                continue;
            }

            let request = TransitionRequest::new(Action::ConfirmPurchase, ActorRole::System).with_reason(AUTO_CONFIRM_REASON);
            match self.controller.apply(item.id, item.version, request).await {
                Ok(_) => {
                    report.confirmed += 1;
                    self.metrics.auto_confirmed.inc();
                }
                Err(e) if e.is_conflict() => {
                    // Someone else moved the item since the scan.
                    tracing::debug!(line_item_id = %item.id, "Skipping auto confirm, item changed concurrently");
                    report.conflicts += 1;
                }
                Err(e) => {
                    tracing::warn!(line_item_id = %item.id, error = %e, "Auto confirm failed");
                    report.failed += 1;
                }
            }
        }

        if report.confirmed > 0 || report.failed > 0 {
            tracing::info!(
                scanned = report.scanned,
                confirmed = report.confirmed,
                conflicts = report.conflicts,
                failed = report.failed,
                "Auto purchase confirmation sweep finished"
            );
        }
        Ok(report)
    }

    async fn delivered_at(&self, item: &OrderLineItem) -> Result<DateTime<Utc>, FulfillmentError> {
        let events = self.tracker.history(item.id).await?;
        Ok(latest_of(&events, DeliveryType::OrderOut)
            .and_then(|e| e.completed_at)
            .unwrap_or(item.updated_at))
    }

    pub fn start(self, interval: Duration) -> JoinHandle<()> {
        tracing::info!(interval_secs = interval.as_secs(), after_days = self.after_days, "🔄 Starting auto confirm job");

        tokio::spawn(async move {
            loop {
                if let Err(e) = self.run_once(Utc::now()).await {
                    tracing::error!(error = %e, "Auto confirm sweep failed");
                }
                sleep(interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::delivery::NewDeliveryEvent;
    use crate::domain::fulfillment::aggregate::tests::sample_draft;
    use crate::domain::inventory::InMemoryInventory;
    use crate::domain::payment::{GatewayClient, SimulatedGateway};
    use crate::service::FulfillmentService;
    use crate::store::Stores;
    use crate::utils::{CircuitBreakerConfig, RetryConfig};

    async fn delivered_order() -> (FulfillmentService, AutoConfirmJob, Vec<OrderLineItem>) {
        let (stores, _) = Stores::memory();
        let metrics = Arc::new(Metrics::new().unwrap());
        let gateway = GatewayClient::new(
            Arc::new(SimulatedGateway::new()),
            CircuitBreakerConfig::default(),
            metrics.clone(),
            Duration::from_millis(200),
        );
        let service = FulfillmentService::new(
            stores.clone(),
            Arc::new(InMemoryInventory::new()),
            gateway,
            metrics.clone(),
            RetryConfig::immediate(1),
        );

        let (order, items) = sample_draft().build("241019AUTO", None, LineItemStatus::Delivered, Utc::now());
        stores.orders.create_order(&order, &items).await.unwrap();

        let job = AutoConfirmJob::new(
            stores.line_items.clone(),
            service.tracker().clone(),
            service.controller().clone(),
            metrics,
            7,
        );
        (service, job, items)
    }

    #[tokio::test]
    async fn test_confirms_only_items_delivered_long_ago() {
        let (service, job, items) = delivered_order().await;
        let old = &items[0];

        let event = service
            .tracker()
            .append_event(old.id, NewDeliveryEvent::new(DeliveryType::OrderOut).with_tracking("CJ", "1"))
            .await
            .unwrap();
        service
            .tracker()
            .complete(event.id, Utc::now() - ChronoDuration::days(10))
            .await
            .unwrap();

        let report = job.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.confirmed, 1);

        let confirmed = service.line_item(old.id).await.unwrap();
        assert_eq!(confirmed.status, LineItemStatus::DeliveryConfirmed);
        let history = service.status_history(old.id).await.unwrap();
        assert_eq!(history.last().unwrap().reason.as_deref(), Some(AUTO_CONFIRM_REASON));

        let recent = service.line_item(items[1].id).await.unwrap();
        assert_eq!(recent.status, LineItemStatus::Delivered);
    }

    #[tokio::test]
    async fn test_items_without_delivery_fall_back_to_last_update() {
        let (_service, job, _items) = delivered_order().await;

        let report = job.run_once(Utc::now() + ChronoDuration::days(8)).await.unwrap();
        assert_eq!(report.confirmed, 2);
        assert_eq!(job.run_once(Utc::now() + ChronoDuration::days(8)).await.unwrap().scanned, 0);
    }
}
