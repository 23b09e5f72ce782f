//! The stages a joiner pipeline is built from.
//!
//! Each stage is a single task owning its own state. Stages talk
//! only through bounded channels and all stop on the pipeline's
//! [`tokio_util::sync::CancellationToken`].
//!
//! - [`merge_sort::EventMergeSortBlock`] merges one stream's
//!   partitions into enqueued-time order.
//! - [`join::LeftOuterJoinBlock`] attaches observations to the
//!   interactions they belong to.
//! - [`billing::BillingBlock`] counts billable events exactly once.

pub mod billing;
pub mod join;
pub mod merge_sort;

pub use billing::BillingBlock;
pub use billing::LogUsageReporter;
pub use billing::UsageReporter;
pub use join::JoinConfig;
pub use join::LeftOuterJoinBlock;
pub use merge_sort::EventMergeSortBlock;
pub use merge_sort::MergeSortConfig;
