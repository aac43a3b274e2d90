mod intake;
mod manager;
mod outbound;

pub use manager::{SessionOptions, SyncManager};
