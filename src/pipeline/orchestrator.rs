//! Job orchestration
//!
//! A job is a fixed sequence of steps run one after another, since later
//! steps read ids written by earlier ones (rankings need heroes, players
//! need rankings and notable players). A failed step is reported and the
//! job moves on; a shutdown request stops the job between chunks.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};

use super::chunk::{ChunkEnd, ChunkOutcome, ChunkProcessor};
use super::job::{JobKind, JobStatus, JobSummary, StepKind, StepSummary};
use super::processor::{EntityProcessor, ItemProcessor, MatchProcessor};
use crate::config::{ConfigError, ExpirationPolicy, IngestConfig};
use crate::gateway::{ApiGateway, Upstream};
use crate::metrics::StepMetrics;
use crate::reader::{CollectionReader, CursorReader, EntityReader, KeySource, Paging, RecordReader};
use crate::shutdown::{self, SharedShutdown};
use crate::storage::{EntitySink, SqliteStore, StateStore};
use crate::Collection;

/// Cursor name of the forward match reader
pub const NEW_MATCHES_CURSOR: &str = "matches.new";

/// Cursor name of the backward match reader
pub const HISTORICAL_MATCHES_CURSOR: &str = "matches.historical";

/// Runs jobs against an upstream and a store
pub struct PipelineOrchestrator {
    config: IngestConfig,
    expirations: ExpirationPolicy,
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn EntitySink>,
    shutdown: Option<SharedShutdown>,
    now: Option<DateTime<Utc>>,
}

impl PipelineOrchestrator {
    /// Orchestrator over the production gateway and SQLite store
    ///
    /// # Errors
    /// Returns [`ConfigError`] when an expiration entry does not parse.
    pub fn new(config: IngestConfig, gateway: Arc<ApiGateway>, store: Arc<SqliteStore>) -> Result<Self, ConfigError> {
        Self::with_parts(config, gateway, store.clone(), store)
    }

    /// Orchestrator over arbitrary collaborators
    ///
    /// # Errors
    /// Returns [`ConfigError`] when an expiration entry does not parse.
    pub fn with_parts(
        config: IngestConfig,
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn EntitySink>,
    ) -> Result<Self, ConfigError> {
        let expirations = config.expiration.resolve()?;

        Ok(Self {
            config,
            expirations,
            upstream,
            store,
            sink,
            shutdown: shutdown::global(),
            now: None,
        })
    }

    /// Attach a shared shutdown handle for graceful cancellation.
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Evaluate staleness against a fixed clock instead of `Utc::now()`
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Run every step of `job` in order
    pub async fn run(&self, job: JobKind) -> JobSummary {
        let span = info_span!("job", job = %job);
        self.run_job(job).instrument(span).await
    }

    async fn run_job(&self, job: JobKind) -> JobSummary {
        let started_at = Utc::now();
        let steps = job.steps();
        info!(steps = steps.len(), "Job started");

        let mut summaries = Vec::with_capacity(steps.len());
        for step in steps {
            if self.shutdown_requested() {
                info!(step = %step, "Shutdown requested, not starting remaining steps");
                break;
            }

            let span = info_span!("step", step = %step);
            let summary = self.run_step(job, step).instrument(span).await;
            let cancelled = summary.status == JobStatus::Cancelled;
            summaries.push(summary);
            if cancelled {
                break;
            }
        }

        let mut status = JobStatus::aggregate(summaries.iter().map(|s| &s.status));
        if status == JobStatus::Completed && self.shutdown_requested() && summaries.len() < job.steps().len() {
            status = JobStatus::Cancelled;
        }

        let summary = JobSummary {
            job,
            status,
            steps: summaries,
            breakers: self.upstream.breaker_statuses(),
            started_at,
            finished_at: Utc::now(),
        };

        if summary.status == JobStatus::Failed {
            let failed: Vec<&str> = summary
                .steps
                .iter()
                .filter(|s| s.status == JobStatus::Failed)
                .map(|s| s.step.name())
                .collect();
            error!(failed_steps = ?failed, "Job has failed steps");
        }
        info!(
            status = %summary.status,
            read = summary.total_read(),
            written = summary.total_written(),
            skipped = summary.total_skipped(),
            failed = summary.total_failed(),
            commits = summary.total_commits(),
            duration_ms = summary.duration().as_millis() as u64,
            "Job finished"
        );
        summary
    }

    /// Run a single step and summarize it
    pub async fn run_step(&self, job: JobKind, step: StepKind) -> StepSummary {
        let started_at = Utc::now();
        let metrics = StepMetrics::start(step.name());
        info!(job = %job, "Step started");
        let (mut reader, processor) = self.wire(step);

        let mut chunks = ChunkProcessor::new(self.config.reader.chunk_size, self.config.pipeline.skip_limit);
        if let Some(shutdown) = &self.shutdown {
            chunks = chunks.with_shutdown(shutdown.clone());
        }

        let mut counts = ChunkOutcome::default();
        let result = chunks
            .run(
                step.name(),
                reader.as_mut(),
                processor.as_ref(),
                self.sink.as_ref(),
                &metrics,
                &mut counts,
            )
            .await;

        let (status, error) = match result {
            Ok(ChunkEnd::Exhausted) => (JobStatus::Completed, None),
            Ok(ChunkEnd::Cancelled) => (JobStatus::Cancelled, None),
            Err(e) => {
                error!(error = %e, "Step failed");
                (JobStatus::Failed, Some(e.to_string()))
            }
        };
        metrics.finish(status);

        info!(
            status = %status,
            read = counts.read,
            processed = counts.processed,
            written = counts.written,
            skipped = counts.skipped,
            failed = counts.failed,
            commits = counts.commits,
            "Step finished"
        );

        StepSummary {
            step,
            status,
            counts,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Reader and processor for a step
    fn wire(&self, step: StepKind) -> (Box<dyn RecordReader>, Box<dyn ItemProcessor>) {
        let collection = step.collection();
        let expiration = self.expirations.for_name(collection.name());
        let upstream = self.upstream.clone();
        let store = self.store.clone();
        let max_pages = self.config.reader.max_pages_per_run;

        let collection_reader = |paging| {
            let reader = CollectionReader::new(collection, paging, expiration, upstream.clone(), store.clone());
            match self.now {
                Some(now) => reader.with_clock(now),
                None => reader,
            }
        };
        let entity_reader = |keys| {
            let reader = EntityReader::new(collection, keys, expiration, upstream.clone(), store.clone());
            match self.now {
                Some(now) => reader.with_clock(now),
                None => reader,
            }
        };
        let entities: Box<dyn ItemProcessor> = Box::new(EntityProcessor::new(collection));

        match step {
            StepKind::Heroes | StepKind::NotablePlayers => (Box::new(collection_reader(Paging::Single)), entities),
            StepKind::Teams => (
                Box::new(collection_reader(Paging::Numbered {
                    pages: self.config.reader.team_pages,
                })),
                entities,
            ),
            StepKind::HeroRankings => (Box::new(entity_reader(KeySource::Stored(Collection::Heroes))), entities),
            StepKind::Players => (Box::new(entity_reader(KeySource::CandidateAccounts)), entities),
            StepKind::NewMatches => (
                Box::new(CursorReader::forward(NEW_MATCHES_CURSOR, collection, upstream.clone(), store.clone(), max_pages)),
                Box::new(MatchProcessor::new(upstream.clone(), store.clone())),
            ),
            StepKind::HistoricalMatches => (
                Box::new(CursorReader::backward(
                    HISTORICAL_MATCHES_CURSOR,
                    collection,
                    upstream.clone(),
                    store.clone(),
                    max_pages,
                )),
                Box::new(MatchProcessor::new(upstream.clone(), store.clone())),
            ),
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|s| s.is_shutdown_requested())
            .unwrap_or(false)
    }
}
