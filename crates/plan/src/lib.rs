//! Kairo plan: turn a diff into pending operations and order them into wave buckets.

#![forbid(unsafe_code)]

pub mod graph;
pub mod schedule;

pub use graph::{build, BuildOptions, Graph, PendingOperation, PlanWarning};
pub use schedule::{Bucket, BucketInfo, Schedule, Stage};
