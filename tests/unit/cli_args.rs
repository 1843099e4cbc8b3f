//! Unit tests for command-line parsing

use clap::Parser;
use gg_ingest::cli::{Cli, Commands, OutputFormat, ScheduleMode};
use gg_ingest::pipeline::{JobKind, StepKind};
use std::time::Duration;

#[test]
fn test_run_defaults_to_all() {
    let cli = Cli::parse_from(["gg-ingest", "run"]);
    match cli.command {
        Commands::Run(args) => assert_eq!(args.job, JobKind::All),
        other => panic!("unexpected command {other:?}"),
    }
    assert!(cli.metrics_addr.is_none());
}

#[test]
fn test_schedule_with_interval_and_job() {
    let cli = Cli::parse_from(["gg-ingest", "schedule", "--every", "6h", "--job", "new_matches"]);
    match cli.command {
        Commands::Schedule(args) => {
            assert_eq!(args.every, Some(Duration::from_secs(6 * 3600)));
            assert_eq!(args.job, Some(JobKind::Step(StepKind::NewMatches)));
        }
        other => panic!("unexpected command {other:?}"),
    }
}

#[test]
fn test_schedule_without_job_follows_the_plan() {
    let cli = Cli::parse_from(["gg-ingest", "schedule"]);
    match cli.command {
        Commands::Schedule(args) => assert_eq!(args.mode(), ScheduleMode::Plan),
        other => panic!("unexpected command {other:?}"),
    }
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = Cli::parse_from([
        "gg-ingest",
        "status",
        "--output-format",
        "json",
        "--metrics-addr",
        "127.0.0.1:9100",
        "--base-url",
        "http://localhost:8080/api",
    ]);
    assert!(matches!(cli.command, Commands::Status(_)));
    assert_eq!(cli.output_format, OutputFormat::Json);
    assert_eq!(cli.metrics_addr.unwrap().port(), 9100);

    let config = cli.load_config().unwrap();
    assert_eq!(config.api.base_url, "http://localhost:8080/api");
}

#[test]
fn test_invalid_arguments_are_rejected() {
    assert!(Cli::try_parse_from(["gg-ingest", "run", "--job", "everything"]).is_err());
    assert!(Cli::try_parse_from(["gg-ingest", "schedule", "--every", "soon"]).is_err());
    assert!(Cli::try_parse_from(["gg-ingest", "--output-format", "xml", "status"]).is_err());
}
