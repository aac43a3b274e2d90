mod bus;

pub use bus::{StateCallback, StateSubscription, SubscriptionBus};
