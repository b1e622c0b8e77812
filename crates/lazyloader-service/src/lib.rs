//! An on-demand resource loader.
//!
//! The central type is [`LazyLoader`](loading::LazyLoader), which loads items by id through
//! registered per-type loader functions, deduplicates concurrent requests for the same id, bounds
//! the number of loads in flight, retries failures with a fixed delay and keeps successful results
//! in a time-to-live cache.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod loading;
pub mod logging;
pub mod utils;

pub use loading::{
    CacheStats, CleanupHandle, LazyLoader, LoadError, LoadItem, LoadOptions, LoadPhase,
    LoadResult, LoaderStats, PreloadItem, PreloadSummary,
};
