use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use order_fulfillment::domain::delivery::{DeliveryType, NewDeliveryEvent};
use order_fulfillment::domain::fulfillment::{
    Action, ActorRole, BuyerInfo, Money, NewLineItem, OrderDraft, ShippingInfo, TransitionRequest,
};
use order_fulfillment::domain::inventory::InMemoryInventory;
use order_fulfillment::domain::payment::{AuthorizationOutcome, GatewayClient, SimulatedGateway};
use order_fulfillment::jobs::{AutoConfirmJob, CompensationWorker};
use order_fulfillment::metrics::{self, Metrics};
use order_fulfillment::store::{ScyllaStore, Stores};
use order_fulfillment::utils::{CircuitBreakerConfig, RetryConfig};
use order_fulfillment::{Config, FulfillmentService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,order_fulfillment=debug")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(?config, "🚀 Starting order fulfillment core");

    // === 1. ScyllaDB session and schema ===
    tracing::info!(node = %config.scylla_node, "Connecting to ScyllaDB...");
    let session: Session = SessionBuilder::new()
        .known_node(&config.scylla_node)
        .build()
        .await?;

    session
        .query_unpaged(
            format!(
                "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
                 {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
                config.keyspace
            ),
            &[],
        )
        .await?;
    session.use_keyspace(&config.keyspace, false).await?;

    let store = Arc::new(ScyllaStore::new(Arc::new(session)));
    store.ensure_schema().await?;
    let stores = Stores::scylla(store);

    // === 2. Prometheus metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        if let Err(e) = system.block_on(metrics::start_metrics_server(metrics_registry, metrics_port)) {
            tracing::error!(error = %e, "Metrics server error");
        }
    });

    // === 3. Service wiring ===
    let gateway = GatewayClient::new(
        Arc::new(SimulatedGateway::new()),
        CircuitBreakerConfig::default(),
        metrics.clone(),
        config.gateway_timeout,
    );
    let inventory = Arc::new(InMemoryInventory::new());
    let service = FulfillmentService::new(
        stores.clone(),
        inventory.clone(),
        gateway,
        metrics.clone(),
        RetryConfig::refunds(),
    );

    // === 4. Demonstrate one line item lifecycle ===
    if let Err(e) = demo(&service, &inventory, &config).await {
        tracing::error!(error = %e, "Demo flow failed");
    }

    // === 5. Background jobs ===
    let auto_confirm = AutoConfirmJob::new(
        stores.line_items.clone(),
        service.tracker().clone(),
        service.controller().clone(),
        metrics.clone(),
        config.auto_confirm_days,
    )
    .start(config.sweep_interval);
    let compensations = CompensationWorker::new(service.reconciler().clone()).start(config.drain_interval);

    tracing::info!("⏳ Running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    auto_confirm.abort();
    compensations.abort();
    tracing::info!("👋 Shutting down");
    Ok(())
}

async fn demo(service: &FulfillmentService, inventory: &InMemoryInventory, config: &Config) -> anyhow::Result<()> {
    let variant_id = uuid::Uuid::new_v4();
    inventory.set_stock(variant_id, 10).await;

    let draft = OrderDraft {
        buyer: BuyerInfo {
            name: "Demo Buyer".to_string(),
            email: "buyer@example.com".to_string(),
            phone: "010-0000-0000".to_string(),
        },
        recipient: ShippingInfo {
            name: "Demo Buyer".to_string(),
            phone: "010-0000-0000".to_string(),
            zip_code: "06236".to_string(),
            address: "Seoul".to_string(),
            memo: None,
        },
        delivery_fee: Money(3_000),
        items: vec![NewLineItem {
            product_id: uuid::Uuid::new_v4(),
            variant_id,
            size: "M".to_string(),
            color: "Black".to_string(),
            unit_price: Money(39_000),
            discount_rate: 10,
            quantity: 2,
        }],
    };

    let reconciler = service.reconciler();
    let pending = reconciler.prepare(draft, config.gateway_timeout).await?;
    let items = match reconciler.authorize(&pending.charge_id, config.gateway_timeout).await? {
        AuthorizationOutcome::Approved { items, .. } => items,
        other => {
            tracing::warn!(outcome = ?other, "Charge not approved, demo stops here");
            return Ok(());
        }
    };

    let steps = [
        (Action::StartPreparing, ActorRole::Admin),
        (Action::Ship, ActorRole::Admin),
        (Action::MarkDelivered, ActorRole::System),
        (Action::ConfirmPurchase, ActorRole::Buyer),
    ];

    for item in items {
        let mut version = item.version;
        for (action, actor) in steps {
            if action == Action::Ship {
                service
                    .tracker()
                    .append_event(item.id, NewDeliveryEvent::new(DeliveryType::OrderOut).with_tracking("CJ", "6301-0000-0001"))
                    .await?;
            }
            let applied = service
                .apply_transition(item.id, version, TransitionRequest::new(action, actor))
                .await?;
            version = applied.item.version;
        }

        let summary = service.order_summary(item.order_id).await?;
        tracing::info!(
            line_item_id = %item.id,
            version,
            current_total = summary.current_total.amount(),
            "🎉 Demo line item completed"
        );
    }
    Ok(())
}
