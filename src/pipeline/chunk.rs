//! Chunk-oriented step execution
//!
//! A step pulls up to `chunk_size` records from its reader, runs each
//! through the processor and writes the produced entities as one unit.
//! Single-item failures are recorded and skipped; the step only fails once
//! the tolerated number of skips is exceeded.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::processor::{ItemProcessor, ProcessOutcome};
use crate::metrics::StepMetrics;
use crate::reader::RecordReader;
use crate::shutdown::{self, SharedShutdown};
use crate::storage::EntitySink;
use crate::{record_identity, Entity};

/// Step-fatal errors
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// More items were skipped or failed than the step tolerates
    #[error("step '{step}' exceeded its skip limit ({skipped} > {limit})")]
    SkipLimitExceeded {
        /// Step name
        step: String,
        /// Skips counted toward the limit
        skipped: u64,
        /// Configured limit
        limit: u64,
    },
}

/// One skipped or failed item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
    /// Best-effort identity of the raw record or entity
    pub identity: String,
    /// Why it was dropped
    pub reason: String,
}

/// Counters for one step execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChunkOutcome {
    /// Records returned by the reader
    pub read: u64,
    /// Records turned into entities
    pub processed: u64,
    /// Records skipped by the processor
    pub skipped: u64,
    /// Entities written
    pub written: u64,
    /// Read, process or write failures
    pub failed: u64,
    /// Chunks committed
    pub commits: u64,
    /// Skips and failures counted toward the skip limit
    pub limited: u64,
    /// Every dropped item with its reason
    pub skipped_items: Vec<SkippedItem>,
}

impl ChunkOutcome {
    fn drop_item(&mut self, identity: String, reason: String, counts: bool) {
        if counts {
            self.limited += 1;
        }
        self.skipped_items.push(SkippedItem { identity, reason });
    }
}

/// How a step ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEnd {
    /// The reader ran out of records
    Exhausted,
    /// Shutdown was requested between chunks
    Cancelled,
}

/// Drives read, process and write in fixed-size chunks
#[derive(Debug, Clone)]
pub struct ChunkProcessor {
    chunk_size: usize,
    skip_limit: u64,
    shutdown: Option<SharedShutdown>,
}

impl ChunkProcessor {
    /// Create a processor; a zero chunk size is treated as one
    pub fn new(chunk_size: usize, skip_limit: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            skip_limit,
            shutdown: shutdown::global(),
        }
    }

    /// Attach a shared shutdown handle checked between chunks
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Items per chunk
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Skips tolerated per step
    pub fn skip_limit(&self) -> u64 {
        self.skip_limit
    }

    /// Run one step until the reader is exhausted
    ///
    /// Counters accumulate into `outcome`, which stays valid when an error
    /// is returned.
    ///
    /// # Errors
    /// Returns [`StepError::SkipLimitExceeded`] once too many items were
    /// dropped.
    pub async fn run(
        &self,
        step: &str,
        reader: &mut dyn RecordReader,
        processor: &dyn ItemProcessor,
        sink: &dyn EntitySink,
        metrics: &StepMetrics,
        outcome: &mut ChunkOutcome,
    ) -> Result<ChunkEnd, StepError> {
        loop {
            if self.shutdown_requested() {
                info!(step = step, written = outcome.written, "Shutdown requested, stopping between chunks");
                return Ok(ChunkEnd::Cancelled);
            }

            let (read, written, skipped, failed) = (outcome.read, outcome.written, outcome.skipped, outcome.failed);
            let (entities, exhausted) = self.fill_chunk(step, reader, processor, outcome).await;
            self.check_limit(step, outcome)?;

            if !entities.is_empty() {
                self.write_chunk(step, sink, entities, outcome);
                outcome.commits += 1;
                info!(
                    step = step,
                    chunk = outcome.commits,
                    written = outcome.written - written,
                    total_written = outcome.written,
                    "Chunk committed"
                );
                self.check_limit(step, outcome)?;
            }

            metrics.record_items("read", outcome.read - read);
            metrics.record_items("written", outcome.written - written);
            metrics.record_items("skipped", outcome.skipped - skipped);
            metrics.record_items("failed", outcome.failed - failed);

            if exhausted {
                debug!(step = step, reader = reader.name(), "Reader exhausted");
                return Ok(ChunkEnd::Exhausted);
            }
        }
    }

    /// Read and process until the chunk is full; the flag is set when the reader ran dry
    async fn fill_chunk(
        &self,
        step: &str,
        reader: &mut dyn RecordReader,
        processor: &dyn ItemProcessor,
        outcome: &mut ChunkOutcome,
    ) -> (Vec<Entity>, bool) {
        let mut entities = Vec::with_capacity(self.chunk_size);

        while entities.len() < self.chunk_size {
            let item = match reader.next().await {
                Ok(Some(item)) => item,
                Ok(None) => return (entities, true),
                Err(e) => {
                    outcome.failed += 1;
                    warn!(step = step, reader = reader.name(), error = %e, "Read failed, skipping");
                    outcome.drop_item(format!("read:{}", reader.name()), e.to_string(), true);
                    continue;
                }
            };
            outcome.read += 1;

            let identity = record_identity(&item);
            match processor.process(item).await {
                ProcessOutcome::Produced(entity) => {
                    outcome.processed += 1;
                    entities.push(entity);
                }
                ProcessOutcome::Skipped(reason) => {
                    outcome.skipped += 1;
                    warn!(step = step, item = %identity, reason = %reason, "Skipping item");
                    outcome.drop_item(identity, reason.to_string(), reason.counts_toward_limit());
                }
                ProcessOutcome::Failed(e) => {
                    outcome.failed += 1;
                    warn!(step = step, item = %identity, error = %e, "Item processing failed, skipping");
                    outcome.drop_item(identity, e.to_string(), true);
                }
            }
        }

        (entities, false)
    }

    /// Write the chunk as one unit, falling back to single writes on failure
    fn write_chunk(&self, step: &str, sink: &dyn EntitySink, entities: Vec<Entity>, outcome: &mut ChunkOutcome) {
        match sink.upsert_all(&entities) {
            Ok(()) => {
                outcome.written += entities.len() as u64;
                return;
            }
            Err(e) => {
                warn!(
                    step = step,
                    items = entities.len(),
                    error = %e,
                    "Chunk write failed, retrying item by item"
                );
            }
        }

        for entity in &entities {
            match sink.upsert(entity) {
                Ok(()) => outcome.written += 1,
                Err(e) => {
                    outcome.failed += 1;
                    let identity = format!("{}={}", entity.kind(), entity.key());
                    warn!(step = step, item = %identity, error = %e, "Write failed, skipping");
                    outcome.drop_item(identity, e.to_string(), true);
                }
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|s| s.is_shutdown_requested())
            .unwrap_or(false)
    }

    fn check_limit(&self, step: &str, outcome: &ChunkOutcome) -> Result<(), StepError> {
        if outcome.limited > self.skip_limit {
            return Err(StepError::SkipLimitExceeded {
                step: step.to_string(),
                skipped: outcome.limited,
                limit: self.skip_limit,
            });
        }
        Ok(())
    }
}
