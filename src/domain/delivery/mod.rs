pub mod events;
pub mod tracker;

pub use events::{
    latest_of, DeliveryEvent, DeliveryStatus, DeliveryType, NewDeliveryEvent, UnknownDeliveryValue,
};
pub use tracker::DeliveryTracker;
