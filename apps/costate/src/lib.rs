pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod replay;
pub mod session;
pub mod subscription;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use catalog::{CatalogRecord, CatalogResolver, StaticCatalog};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use model::{Action, LocalAction, Role, SyncState};
pub use session::{SessionOptions, SyncManager};
pub use subscription::StateSubscription;
pub use sync::{ContainerMetrics, PixelOffset};
pub use transport::{Progress, ProgressFn, SendReport};
