pub mod reducer;
pub mod scroll;

pub use reducer::reduce;
pub use scroll::{ContainerMetrics, PixelOffset, ScrollLeadership, ScrollPercent};
