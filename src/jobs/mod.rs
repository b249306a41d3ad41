// ============================================================================
// Background Jobs
// ============================================================================
//
// - AutoConfirmJob: confirms stale DELIVERED items as the System actor
// - CompensationWorker: drains the payment compensation ledger
//
// ============================================================================

pub mod auto_confirm;
pub mod compensation;

pub use auto_confirm::{AutoConfirmJob, SweepReport, AUTO_CONFIRM_REASON};
pub use compensation::CompensationWorker;
