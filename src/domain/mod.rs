// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Each subdomain owns its types, rules and errors. Nothing in here talks to
// a database directly; persistence goes through the traits in `crate::store`.
//
// ============================================================================

pub mod fulfillment;
pub mod delivery;
pub mod review;
pub mod payment;
pub mod inventory;
