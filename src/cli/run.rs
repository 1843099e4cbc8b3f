//! `run` and `schedule` commands

use chrono::{DateTime, Utc};
use clap::Args;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{connect, Cli, CliError, OutputFormat};
use crate::config::{format_duration, parse_duration, ScheduleConfig};
use crate::pipeline::{JobKind, JobStatus, JobSummary, PipelineOrchestrator, SchedulePlan, StepKind};
use crate::shutdown::SharedShutdown;

/// Arguments for a single run
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Job to run: all, matches, or a single step name
    #[arg(long, default_value = "all")]
    pub job: JobKind,
}

/// Arguments for periodic runs
///
/// Without `--job` every step runs on its own cadence from `[schedule]`.
/// With `--job` that one job runs every `--every`.
#[derive(Args, Debug)]
pub struct ScheduleArgs {
    /// Run this job on a fixed interval instead of the per-step plan
    #[arg(long)]
    pub job: Option<JobKind>,

    /// Interval between runs of `--job` (e.g. 12h, 1d; default 1d)
    #[arg(long, requires = "job", value_parser = parse_interval)]
    pub every: Option<Duration>,
}

/// What a `schedule` invocation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// One job, immediately and then on a fixed interval
    Interval {
        /// Job to run
        job: JobKind,
        /// Time between the end of one run and the start of the next
        every: Duration,
    },
    /// Each step on its configured cadence
    Plan,
}

/// Interval used when `--job` is given without `--every`
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

fn parse_interval(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

impl RunArgs {
    /// Run the job once and print its summary
    ///
    /// # Errors
    /// Returns [`CliError::JobNotCompleted`] when a step failed.
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<JobSummary, CliError> {
        let config = cli.load_config()?;
        cli.start_metrics()?;
        let (store, gateway) = connect(&config)?;

        let orchestrator = PipelineOrchestrator::new(config, gateway, store)?.with_shutdown(shutdown);
        let summary = orchestrator.run(self.job).await;
        print_summary(&summary, cli.output_format)?;

        match summary.status {
            JobStatus::Failed => Err(CliError::JobNotCompleted {
                job: summary.job,
                status: summary.status,
            }),
            JobStatus::Cancelled => {
                warn!(job = %summary.job, "Job cancelled before completion");
                Ok(summary)
            }
            _ => Ok(summary),
        }
    }
}

impl ScheduleArgs {
    /// Mode selected by the flags
    pub fn mode(&self) -> ScheduleMode {
        match self.job {
            Some(job) => ScheduleMode::Interval {
                job,
                every: self.every.unwrap_or(DEFAULT_INTERVAL),
            },
            None => ScheduleMode::Plan,
        }
    }

    /// Run jobs as they come due until shutdown is requested
    ///
    /// A slot is skipped while the limiter has fewer daily requests left
    /// than `schedule.min_daily_budget`.
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<(), CliError> {
        let config = cli.load_config()?;
        cli.start_metrics()?;
        let plan = SchedulePlan::from_config(&config.schedule)?;
        let min_budget = config.schedule.min_daily_budget;
        let (store, gateway) = connect(&config)?;

        let orchestrator = PipelineOrchestrator::new(config, gateway.clone(), store)?.with_shutdown(shutdown.clone());
        let mode = self.mode();
        match mode {
            ScheduleMode::Interval { job, every } => {
                info!(job = %job, every = %format_duration(every), "Scheduler started");
            }
            ScheduleMode::Plan => {
                for cadence in plan.cadences() {
                    info!(
                        step = %cadence.step,
                        every = %format_duration(cadence.every),
                        offset = %format_duration(cadence.offset),
                        "Step scheduled"
                    );
                }
            }
        }

        let mut runs: u64 = 0;
        let mut last_finish = None;
        'slots: loop {
            let now = Utc::now();
            let Some((due, jobs)) = next_slot(mode, &plan, last_finish, now) else {
                warn!("Nothing is scheduled");
                break;
            };

            let wait = (due - now).to_std().unwrap_or(Duration::ZERO);
            if !wait.is_zero() {
                let names: Vec<&str> = jobs.iter().map(JobKind::name).collect();
                info!(next_at = %due, jobs = ?names, "Waiting for next slot");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.wait_for_shutdown() => break,
                }
            }

            let remaining = gateway.limiter().status().daily_remaining;
            if remaining < min_budget {
                warn!(
                    remaining = remaining,
                    threshold = min_budget,
                    "Daily request budget too low, skipping scheduled run"
                );
                last_finish = Some(Utc::now());
                continue;
            }

            for job in jobs {
                if shutdown.is_shutdown_requested() {
                    break 'slots;
                }
                runs += 1;
                let summary = orchestrator.run(job).await;
                print_summary(&summary, cli.output_format)?;
                if summary.status == JobStatus::Failed {
                    error!(job = %job, run = runs, "Scheduled job failed, will retry at its next slot");
                }
            }
            last_finish = Some(Utc::now());

            if shutdown.is_shutdown_requested() {
                break;
            }
        }

        info!(runs = runs, "Scheduler stopped");
        Ok(())
    }
}

/// When the next run starts and which jobs it runs
///
/// An interval job runs at once, then `every` after the previous run
/// finished. The plan picks its next slot strictly after `now`.
fn next_slot(
    mode: ScheduleMode,
    plan: &SchedulePlan,
    last_finish: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, Vec<JobKind>)> {
    match mode {
        ScheduleMode::Interval { job, every } => {
            let due = match last_finish {
                Some(finished) => finished.checked_add_signed(chrono::Duration::from_std(every).ok()?)?,
                None => now,
            };
            Some((due, vec![job]))
        }
        ScheduleMode::Plan => plan
            .next_due(now)
            .map(|(due, steps)| (due, steps.into_iter().map(JobKind::Step).collect())),
    }
}

/// Print a job summary in the requested format
pub fn print_summary(summary: &JobSummary, format: OutputFormat) -> Result<(), CliError> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(summary)?),
        OutputFormat::Human => {
            println!(
                "Job {}: {} in {:.1}s",
                summary.job,
                summary.status,
                summary.duration().as_secs_f64()
            );
            for step in &summary.steps {
                let c = &step.counts;
                println!(
                    "  {:<20} {:<10} read {:>6}  written {:>6}  skipped {:>4}  failed {:>4}  commits {:>4}",
                    step.step.name(),
                    step.status.to_string(),
                    c.read,
                    c.written,
                    c.skipped,
                    c.failed,
                    c.commits
                );
                if let Some(err) = &step.error {
                    println!("    error: {err}");
                }
            }
            for breaker in &summary.breakers {
                println!(
                    "  breaker {}: {} (success rate {:.1}%, {} calls)",
                    breaker.service, breaker.state, breaker.success_rate, breaker.total_calls
                );
            }
        }
    }
    Ok(())
}
