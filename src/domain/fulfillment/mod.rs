// ============================================================================
// Fulfillment Domain - Line Item Lifecycle
// ============================================================================
//
// - Value objects (LineItemStatus, ActorRole, Money)
// - Order header, line items and checkout drafts
// - Status history entries
// - Commands (Action, TransitionRequest)
// - Errors (TransitionError, DraftError)
// - Transition table (pure legality + next snapshot)
//
// ============================================================================

pub mod value_objects;
pub mod aggregate;
pub mod history;
pub mod commands;
pub mod errors;
pub mod transitions;

pub use value_objects::*;
pub use aggregate::*;
pub use history::*;
pub use commands::*;
pub use errors::*;
pub use transitions::{
    evaluate, legal_actions, legal_actions_for, GuardContext, LegalAction, SideEffect, Transition,
};
