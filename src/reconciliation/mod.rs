//! Periodic sweeps that re-drive orders whose lifecycle stalled.

pub mod jobs;
pub mod rates;
pub mod scheduler;

pub use jobs::ReconciliationJobs;
pub use rates::QuidaxPriceFeed;
pub use scheduler::{JobStats, ReconciliationScheduler};
