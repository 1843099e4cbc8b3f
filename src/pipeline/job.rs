//! Job and step descriptions, status and summaries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::chunk::ChunkOutcome;
use crate::breaker::BreakerStatus;
use crate::Collection;

/// One ingestion step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// Hero metadata
    Heroes,
    /// Rankings for every stored hero
    HeroRankings,
    /// Pro player list
    NotablePlayers,
    /// Team list
    Teams,
    /// Player profiles for every referenced account
    Players,
    /// Matches newer than the newest stored one
    NewMatches,
    /// Matches older than the oldest stored one
    HistoricalMatches,
}

impl StepKind {
    /// Every step in execution order
    pub const ALL: [StepKind; 7] = [
        StepKind::Heroes,
        StepKind::HeroRankings,
        StepKind::NotablePlayers,
        StepKind::Teams,
        StepKind::Players,
        StepKind::NewMatches,
        StepKind::HistoricalMatches,
    ];

    /// Stable step name
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Heroes => "heroes",
            StepKind::HeroRankings => "hero-rankings",
            StepKind::NotablePlayers => "notable-players",
            StepKind::Teams => "teams",
            StepKind::Players => "players",
            StepKind::NewMatches => "new-matches",
            StepKind::HistoricalMatches => "historical-matches",
        }
    }

    /// Step with the given [`name`](Self::name)
    pub fn from_name(name: &str) -> Option<StepKind> {
        StepKind::ALL.into_iter().find(|step| step.name() == name)
    }

    /// Index in [`StepKind::ALL`]
    pub fn position(&self) -> usize {
        StepKind::ALL.iter().position(|step| step == self).unwrap_or(StepKind::ALL.len())
    }

    /// Collection the step writes
    pub fn collection(&self) -> Collection {
        match self {
            StepKind::Heroes => Collection::Heroes,
            StepKind::HeroRankings => Collection::HeroRankings,
            StepKind::NotablePlayers => Collection::NotablePlayers,
            StepKind::Teams => Collection::Teams,
            StepKind::Players => Collection::Players,
            StepKind::NewMatches | StepKind::HistoricalMatches => Collection::Matches,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobKind {
    /// Every step
    #[default]
    All,
    /// Both match steps
    Matches,
    /// A single step
    Step(StepKind),
}

impl JobKind {
    /// Steps in execution order
    pub fn steps(&self) -> Vec<StepKind> {
        match self {
            JobKind::All => StepKind::ALL.to_vec(),
            JobKind::Matches => vec![StepKind::NewMatches, StepKind::HistoricalMatches],
            JobKind::Step(step) => vec![*step],
        }
    }

    /// Stable job name
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::All => "all",
            JobKind::Matches => "matches",
            JobKind::Step(step) => step.name(),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for JobKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        match normalized.as_str() {
            "all" => return Ok(JobKind::All),
            "matches" => return Ok(JobKind::Matches),
            _ => {}
        }
        StepKind::ALL
            .iter()
            .find(|step| step.name() == normalized)
            .map(|step| JobKind::Step(*step))
            .ok_or_else(|| {
                let names: Vec<&str> = ["all", "matches"]
                    .into_iter()
                    .chain(StepKind::ALL.iter().map(StepKind::name))
                    .collect();
                format!("unknown job '{s}', expected one of: {}", names.join(", "))
            })
    }
}

/// Execution status of a job or step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobStatus {
    /// Not started yet
    #[default]
    Pending,
    /// Currently running
    InProgress,
    /// Finished without a fatal error
    Completed,
    /// A fatal error stopped it
    Failed,
    /// Shutdown stopped it early
    Cancelled,
}

impl JobStatus {
    /// Job status from its step statuses: any failure wins, then cancellation
    pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a JobStatus>) -> JobStatus {
        let mut result = JobStatus::Completed;
        for status in statuses {
            match status {
                JobStatus::Failed => return JobStatus::Failed,
                JobStatus::Cancelled => result = JobStatus::Cancelled,
                _ => {}
            }
        }
        result
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

fn elapsed(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Duration {
    (finished_at - started_at).to_std().unwrap_or_default()
}

/// Result of one step
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    /// Step
    pub step: StepKind,
    /// Final status
    pub status: JobStatus,
    /// Counters reached, also on failure
    pub counts: ChunkOutcome,
    /// Fatal error, if any
    pub error: Option<String>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Finish time
    pub finished_at: DateTime<Utc>,
}

impl StepSummary {
    /// Wall-clock duration
    pub fn duration(&self) -> Duration {
        elapsed(self.started_at, self.finished_at)
    }
}

/// Result of one job
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    /// Job
    pub job: JobKind,
    /// Final status
    pub status: JobStatus,
    /// Step results in execution order
    pub steps: Vec<StepSummary>,
    /// Breaker snapshots taken when the job finished
    pub breakers: Vec<BreakerStatus>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Finish time
    pub finished_at: DateTime<Utc>,
}

impl JobSummary {
    /// Wall-clock duration
    pub fn duration(&self) -> Duration {
        elapsed(self.started_at, self.finished_at)
    }

    /// Records read across all steps
    pub fn total_read(&self) -> u64 {
        self.steps.iter().map(|s| s.counts.read).sum()
    }

    /// Entities written across all steps
    pub fn total_written(&self) -> u64 {
        self.steps.iter().map(|s| s.counts.written).sum()
    }

    /// Items skipped across all steps
    pub fn total_skipped(&self) -> u64 {
        self.steps.iter().map(|s| s.counts.skipped).sum()
    }

    /// Items failed across all steps
    pub fn total_failed(&self) -> u64 {
        self.steps.iter().map(|s| s.counts.failed).sum()
    }

    /// Chunks committed across all steps
    pub fn total_commits(&self) -> u64 {
        self.steps.iter().map(|s| s.counts.commits).sum()
    }

    /// Summary of one step, if it ran
    pub fn step(&self, step: StepKind) -> Option<&StepSummary> {
        self.steps.iter().find(|s| s.step == step)
    }
}
