//! Per-step run cadences for the `schedule` command
//!
//! Each step has its own interval, aligned to a UTC time of day. Slots are
//! counted from the Unix epoch plus that offset, so an interval that divides
//! a day (15m, 2h, 6h, 1d) lands on the same wall-clock times every day.
//! When several steps share a slot they run in job order, so rankings
//! still follow heroes.

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use std::time::Duration;

use super::job::StepKind;
use crate::config::{parse_duration, ConfigError, ScheduleConfig};

/// Interval and alignment of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    /// Step to run
    pub step: StepKind,
    /// Interval between runs
    pub every: Duration,
    /// Offset of the slots from UTC midnight
    pub offset: Duration,
}

impl Cadence {
    /// First slot strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let every = self.every.as_millis().max(1) as i64;
        let offset = self.offset.as_millis() as i64;
        let since_anchor = now.timestamp_millis() - offset;
        let slot = since_anchor.div_euclid(every) + 1;
        let next = offset + slot * every;
        DateTime::from_timestamp_millis(next).unwrap_or(now)
    }
}

/// Every scheduled step with its cadence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePlan {
    cadences: Vec<Cadence>,
}

impl SchedulePlan {
    /// Build the plan from `[schedule.cadence]`
    ///
    /// # Errors
    /// Returns [`ConfigError`] for an unknown step name, a bad interval or a
    /// bad time of day.
    pub fn from_config(config: &ScheduleConfig) -> Result<Self, ConfigError> {
        let mut cadences = Vec::with_capacity(config.cadence.len());
        for (name, raw) in &config.cadence {
            let step = StepKind::from_name(name).ok_or_else(|| ConfigError::Invalid {
                field: "schedule.cadence",
                reason: format!("unknown step '{name}'"),
            })?;
            let every = parse_duration(&raw.every)?;
            let offset = match raw.at.as_deref() {
                Some(at) => time_of_day(at)?,
                None => Duration::ZERO,
            };
            cadences.push(Cadence { step, every, offset });
        }
        cadences.sort_by_key(|c| c.step.position());
        Ok(Self { cadences })
    }

    /// Scheduled cadences in job order
    pub fn cadences(&self) -> &[Cadence] {
        &self.cadences
    }

    /// Next slot after `now` and every step due in it, in job order
    pub fn next_due(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, Vec<StepKind>)> {
        let due = self.cadences.iter().map(|c| c.next_after(now)).min()?;
        let steps = self
            .cadences
            .iter()
            .filter(|c| c.next_after(now) == due)
            .map(|c| c.step)
            .collect();
        Some((due, steps))
    }
}

fn time_of_day(raw: &str) -> Result<Duration, ConfigError> {
    let time = NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|e| ConfigError::Invalid {
        field: "schedule.cadence.at",
        reason: format!("'{raw}' is not an HH:MM time: {e}"),
    })?;
    Ok(Duration::from_secs(u64::from(time.num_seconds_from_midnight())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, hour, minute, 0).unwrap()
    }

    fn plan() -> SchedulePlan {
        SchedulePlan::from_config(&ScheduleConfig::default()).unwrap()
    }

    #[test]
    fn test_quarter_hour_cadence() {
        let (due, steps) = plan().next_due(at(0, 7)).unwrap();
        assert_eq!(due, at(0, 15));
        assert_eq!(steps, vec![StepKind::NewMatches]);

        // A slot equal to now is already taken
        assert_eq!(plan().next_due(at(0, 15)).unwrap().0, at(0, 30));
    }

    #[test]
    fn test_shared_slot_runs_in_job_order() {
        let (due, steps) = plan().next_due(at(1, 59)).unwrap();
        assert_eq!(due, at(2, 0));
        assert_eq!(steps, vec![StepKind::Heroes, StepKind::HeroRankings, StepKind::NewMatches]);

        let (due, steps) = plan().next_due(at(11, 50)).unwrap();
        assert_eq!(due, at(12, 0));
        assert_eq!(
            steps,
            vec![
                StepKind::HeroRankings,
                StepKind::NotablePlayers,
                StepKind::Teams,
                StepKind::Players,
                StepKind::NewMatches
            ]
        );
    }

    #[test]
    fn test_daily_slot_rolls_over_midnight() {
        let historical = plan()
            .cadences()
            .iter()
            .copied()
            .find(|c| c.step == StepKind::HistoricalMatches)
            .unwrap();
        assert_eq!(historical.next_after(at(2, 59)), at(3, 0));
        assert_eq!(
            historical.next_after(at(3, 0)),
            Utc.with_ymd_and_hms(2024, 9, 2, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_bad_entries_are_rejected() {
        let mut config = ScheduleConfig::default();
        config.cadence.insert("leaderboard".into(), crate::config::CadenceConfig {
            every: "1d".into(),
            at: None,
        });
        assert!(matches!(
            SchedulePlan::from_config(&config),
            Err(ConfigError::Invalid { field: "schedule.cadence", .. })
        ));

        let mut config = ScheduleConfig::default();
        config.cadence.get_mut("heroes").unwrap().at = Some("25:00".into());
        assert!(SchedulePlan::from_config(&config).is_err());

        let mut config = ScheduleConfig::default();
        config.cadence.get_mut("teams").unwrap().every = "0h".into();
        assert!(matches!(
            SchedulePlan::from_config(&config),
            Err(ConfigError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn test_empty_plan_has_nothing_due() {
        let config = ScheduleConfig {
            min_daily_budget: 50,
            cadence: Default::default(),
        };
        assert!(SchedulePlan::from_config(&config).unwrap().next_due(at(0, 0)).is_none());
    }
}
