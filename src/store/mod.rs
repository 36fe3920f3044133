//! Job state: the single source of truth shared by submissions, watchers, and queries.

pub mod jobs;

pub use jobs::{Job, JobCounts, JobId, JobStatus, JobStore, Transition};
