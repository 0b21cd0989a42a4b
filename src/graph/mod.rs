pub mod paths;
pub mod snapshot;
pub mod store;

pub use paths::Path;
pub use store::{Direction, GraphStatistics, NodeInfo, TemporalGraph};
