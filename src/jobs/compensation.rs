use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::domain::payment::PaymentReconciler;

/// Periodically drains the compensation ledger.
pub struct CompensationWorker {
    reconciler: Arc<PaymentReconciler>,
}

impl CompensationWorker {
    pub fn new(reconciler: Arc<PaymentReconciler>) -> Self {
        Self { reconciler }
    }

    pub fn start(self, interval: Duration) -> JoinHandle<()> {
        tracing::info!(interval_secs = interval.as_secs(), "🔄 Starting compensation worker");

        tokio::spawn(async move {
            loop {
                sleep(interval).await;

                match self.reconciler.drain_compensations().await {
                    Ok(report) if report.still_pending > 0 => {
                        tracing::warn!(still_pending = report.still_pending, "Compensations left for next drain");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Compensation drain failed"),
                }
            }
        })
    }
}
