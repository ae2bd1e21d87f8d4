//! The document pipeline: stage orchestration and the merge policy.

pub mod engine;
pub mod merge;

pub use engine::{EngineOutcome, HEARTBEAT_INTERVAL, LEASE_DURATION, PipelineEngine,
    RetryableKind, TerminalKind};
pub use merge::merge_pages;
