//! Fallback paths: cached reads, spilled writes and replay

pub mod cache;
pub mod coordinator;
pub mod spillover;

pub use cache::{CachedResult, ResultCache, ResultCacheConfig, ResultCacheStats};
pub use coordinator::{
    DegradedResult, DegradedSource, FallbackCoordinator, Outcome, ReplayHandler, ReplayReport,
};
pub use spillover::{SpillReceipt, SpillRecord, SpilloverConfig, SpilloverWriter};
