//! Chunk processing and job orchestration
//!
//! - [`processor`] turns raw records into entities with an explicit
//!   [`ProcessOutcome`]
//! - [`chunk`] runs one step in fixed-size chunks under a skip limit
//! - [`orchestrator`] wires readers and processors per step and runs jobs
//! - [`job`] holds step and job kinds, statuses and summaries
//! - [`schedule`] computes when each step is next due under `schedule`

pub mod chunk;
pub mod job;
pub mod orchestrator;
pub mod processor;
pub mod schedule;

pub use chunk::{ChunkEnd, ChunkOutcome, ChunkProcessor, SkippedItem, StepError};
pub use job::{JobKind, JobStatus, JobSummary, StepKind, StepSummary};
pub use orchestrator::{PipelineOrchestrator, HISTORICAL_MATCHES_CURSOR, NEW_MATCHES_CURSOR};
pub use processor::{
    parse_entity, EntityProcessor, ItemProcessor, MatchProcessor, ProcessError, ProcessOutcome, SkipReason,
};
pub use schedule::{Cadence, SchedulePlan};
