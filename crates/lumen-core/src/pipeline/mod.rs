//! Pipeline orchestration components.
//!
//! - **scheduler**: bounded per-session queues with batch formation,
//!   back-pressure, and split-retry
//! - **progress**: throttled progress reporting to the caller's sink
//! - **orchestrator**: the public entry points wiring planner, cache,
//!   scheduler, and store together

pub(crate) mod orchestrator;
pub(crate) mod progress;
pub(crate) mod scheduler;

pub use orchestrator::PipelineOrchestrator;
pub use progress::{ProgressReporter, ProgressSink};
pub use scheduler::{BatchScheduler, WorkItem};
