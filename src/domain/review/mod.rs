pub mod errors;
pub mod gate;
pub mod record;
pub mod service;

pub use errors::ReviewError;
pub use gate::{can_create, can_update_or_delete};
pub use record::{ReviewDraft, ReviewRecord};
pub use service::{ReviewEligibility, ReviewService};
