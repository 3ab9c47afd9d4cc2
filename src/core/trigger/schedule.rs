use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;

use super::{Trigger, TriggerContext};
use crate::core::error::{CoreError, Result};
use crate::core::execution::{Execution, ExecutionTrigger};
use crate::core::state::State;
use uuid::Uuid;

/// How far ahead the schedule-condition search is allowed to walk before
/// giving up, to avoid scanning an unsatisfiable cron forever.
const CONDITION_SEARCH_YEARS: i32 = 10;

/// Tolerance for firing past dates: a computed date older than this is
/// considered late (the cron expression may have been edited, shifting the
/// boundaries) and is still allowed to start.
fn late_tolerance() -> ChronoDuration {
    ChronoDuration::minutes(1)
}

/// Backfill options: replay all missed schedule dates from a fixed start
/// instead of bootstrapping from "now".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backfill {
    pub start: DateTime<Utc>,
}

/// Extra predicate evaluated at each candidate date; unsatisfied candidates
/// make the schedule search forward for the next date that passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleCondition {
    /// The candidate must fall on one of the given weekdays.
    DayOfWeek { days: Vec<Weekday> },
    /// The candidate's hour must fall within `[from, to]`, inclusive.
    HourRange { from: u32, to: u32 },
}

impl ScheduleCondition {
    fn is_valid(&self, date: DateTime<Tz>) -> bool {
        match self {
            ScheduleCondition::DayOfWeek { days } => days.contains(&date.weekday()),
            ScheduleCondition::HourRange { from, to } => {
                (*from..=*to).contains(&date.hour())
            }
        }
    }
}

/// Cron-date polling trigger.
///
/// The scheduler keeps the last evaluated date per trigger id, so the cron
/// expression can be edited without replaying history; a changed id is a new
/// trigger and starts fresh (or from its backfill start).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,

    /// Standard UNIX cron expression, five fields; a seconds field may be
    /// given explicitly for sub-minute schedules.
    pub cron: String,

    /// IANA timezone name the expression is evaluated in; UTC when absent.
    #[serde(default)]
    pub timezone: Option<String>,

    /// Minimum interval between evaluations of this trigger. Pure cron-date
    /// schedules leave this unset and are checked every tick.
    #[serde(default)]
    pub interval: Option<Duration>,

    #[serde(default)]
    pub backfill: Option<Backfill>,

    #[serde(default)]
    pub schedule_conditions: Vec<ScheduleCondition>,

    /// A computed date older than `now - late_maximum_delay` is skipped
    /// forward to the next occurrence instead of firing stale.
    #[serde(default)]
    pub late_maximum_delay: Option<Duration>,

    #[serde(default)]
    pub disabled: bool,
}

impl Schedule {
    pub fn new(id: impl Into<String>, cron: impl Into<String>) -> Self {
        Schedule {
            id: id.into(),
            cron: cron.into(),
            timezone: None,
            interval: None,
            backfill: None,
            schedule_conditions: Vec::new(),
            late_maximum_delay: None,
            disabled: false,
        }
    }

    pub fn with_backfill(mut self, start: DateTime<Utc>) -> Self {
        self.backfill = Some(Backfill { start });
        self
    }

    fn cron_schedule(&self) -> Result<CronSchedule> {
        // five-field UNIX expressions get an explicit zero seconds field
        let fields = self.cron.split_whitespace().count();
        let normalized = if fields == 5 {
            format!("0 {}", self.cron)
        } else {
            self.cron.clone()
        };

        CronSchedule::from_str(&normalized).map_err(|source| CoreError::InvalidCron {
            expression: self.cron.clone(),
            source,
        })
    }

    fn tz(&self) -> Result<Tz> {
        match &self.timezone {
            None => Ok(chrono_tz::UTC),
            Some(name) => name
                .parse()
                .map_err(|_| CoreError::InvalidTimezone(name.clone())),
        }
    }

    fn conditions_hold(&self, date: DateTime<Tz>) -> bool {
        self.schedule_conditions
            .iter()
            .all(|condition| condition.is_valid(date))
    }

    /// First cron occurrence strictly after `date` that satisfies every
    /// schedule condition, searching at most ten years ahead.
    fn next_after(&self, date: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let schedule = self.cron_schedule()?;
        let tz = self.tz()?;
        let horizon = date.year() + CONDITION_SEARCH_YEARS;

        for candidate in schedule.after(&date.with_timezone(&tz)) {
            if candidate.year() > horizon {
                return Ok(None);
            }

            if self.conditions_hold(candidate) {
                return Ok(Some(candidate.with_timezone(&Utc)));
            }
        }

        Ok(None)
    }

    /// The next date this trigger is due, given the last bookmark.
    ///
    /// Without a bookmark the date seeds from the configured backfill start
    /// when one exists (so backfills replay from a fixed historical start),
    /// otherwise from the next occurrence after now. Pure function of its
    /// inputs apart from that bootstrap "now".
    pub fn next_evaluation_date(&self, last: Option<&Trigger>) -> Result<Option<DateTime<Utc>>> {
        match last {
            Some(trigger) => self.next_after(trigger.date),
            None => match &self.backfill {
                Some(backfill) => Ok(Some(backfill.start)),
                None => self.next_after(Utc::now()),
            },
        }
    }

    /// Evaluate the trigger at the given context date.
    ///
    /// Fires when the computed occurrence matches the context date exactly,
    /// or when it is late (edited cron expressions shift boundaries, so past
    /// occurrences older than one minute are allowed to start). Future dates
    /// never fire. Returns `Ok(None)` when not due.
    pub fn evaluate(&self, context: &TriggerContext) -> Result<Option<Execution>> {
        let now = Utc::now();

        let Some(mut date) = self.next_after(context.date - ChronoDuration::seconds(1))? else {
            return Ok(None);
        };

        // stale occurrences are skipped forward, never fired
        if let Some(late_max) = self.late_maximum_delay {
            let late_max = ChronoDuration::from_std(late_max)
                .map_err(|e| CoreError::InvalidExpansion(e.to_string()))?;
            let threshold = now - late_max;

            while date < threshold {
                match self.next_after(date)? {
                    Some(next) => date = next,
                    None => return Ok(None),
                }
            }
        }

        let is_ready = date == context.date;
        let is_late = date < now - late_tolerance();

        if !is_ready && !is_late {
            return Ok(None);
        }

        // we are in the future, don't allow
        if date > now + ChronoDuration::seconds(1) {
            return Ok(None);
        }

        let next = self.next_after(date)?;

        let variables = json!({
            "date": date.to_rfc3339(),
            "next": next.map(|d| d.to_rfc3339()),
        });

        let execution = Execution {
            id: Uuid::new_v4(),
            namespace: context.namespace.clone(),
            flow_id: context.flow_id.clone(),
            flow_revision: context.flow_revision,
            task_run_list: Vec::new(),
            state: State::new(),
            inputs: None,
            trigger: Some(ExecutionTrigger {
                id: self.id.clone(),
                variables,
            }),
        };

        Ok(Some(execution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn context(date: DateTime<Utc>) -> TriggerContext {
        TriggerContext {
            namespace: "io.choreo.tests".to_string(),
            flow_id: "scheduled".to_string(),
            flow_revision: 1,
            trigger_id: "schedule".to_string(),
            date,
        }
    }

    fn bookmark(date: DateTime<Utc>) -> Trigger {
        Trigger::of(&context(date))
    }

    #[test]
    fn test_next_date_is_deterministic() {
        let schedule = Schedule::new("schedule", "0 12 * * *");
        let last = bookmark(Utc.with_ymd_and_hms(2023, 3, 1, 12, 0, 0).unwrap());

        let first = schedule.next_evaluation_date(Some(&last)).unwrap();
        let second = schedule.next_evaluation_date(Some(&last)).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first.unwrap(),
            Utc.with_ymd_and_hms(2023, 3, 2, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_backfill_seeds_from_start_date() {
        let start = Utc.with_ymd_and_hms(2020, 6, 25, 14, 0, 0).unwrap();
        let schedule = Schedule::new("schedule", "*/15 * * * *").with_backfill(start);

        let date = schedule.next_evaluation_date(None).unwrap().unwrap();
        assert_eq!(date, start);
    }

    #[test]
    fn test_no_bookmark_without_backfill_starts_from_now() {
        let schedule = Schedule::new("schedule", "0 12 * * *");
        let date = schedule.next_evaluation_date(None).unwrap().unwrap();
        assert!(date > Utc::now());
    }

    #[test]
    fn test_timezone_changes_utc_instant() {
        let mut schedule = Schedule::new("schedule", "0 12 * * *");
        schedule.timezone = Some("Europe/Paris".to_string());

        // winter: Paris is UTC+1, noon local is 11:00 UTC
        let last = bookmark(Utc.with_ymd_and_hms(2023, 1, 10, 11, 0, 0).unwrap());
        let date = schedule.next_evaluation_date(Some(&last)).unwrap().unwrap();
        assert_eq!(date, Utc.with_ymd_and_hms(2023, 1, 11, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_evaluate_fires_on_exact_date() {
        let schedule = Schedule::new("schedule", "0 12 * * *");
        let date = Utc.with_ymd_and_hms(2023, 3, 2, 12, 0, 0).unwrap();

        let execution = schedule.evaluate(&context(date)).unwrap().unwrap();
        let trigger = execution.trigger.unwrap();
        assert_eq!(trigger.id, "schedule");
        assert_eq!(trigger.variables["date"], date.to_rfc3339());
    }

    #[test]
    fn test_evaluate_skips_future_date() {
        let schedule = Schedule::new("schedule", "0 12 * * *");
        let future = Utc::now() + ChronoDuration::days(2);

        // context date in the future: nothing is due yet
        assert!(schedule.evaluate(&context(future)).unwrap().is_none());
    }

    #[test]
    fn test_late_maximum_delay_skips_stale_dates() {
        let mut schedule = Schedule::new("schedule", "0 12 * * *");
        schedule.late_maximum_delay = Some(Duration::from_secs(3600));

        // a bookmark from days ago computes a stale occurrence; with the
        // delay set it must not fire that old instant
        let stale = Utc::now() - ChronoDuration::days(3);
        let result = schedule.evaluate(&context(stale)).unwrap();

        if let Some(execution) = result {
            let fired: DateTime<Utc> = execution.trigger.unwrap().variables["date"]
                .as_str()
                .unwrap()
                .parse()
                .unwrap();
            assert!(
                fired
                    >= Utc::now()
                        - ChronoDuration::from_std(Duration::from_secs(3600)).unwrap()
                        - late_tolerance()
            );
        }
    }

    #[test]
    fn test_schedule_conditions_search_forward() {
        let mut schedule = Schedule::new("schedule", "0 12 * * *");
        schedule.schedule_conditions = vec![ScheduleCondition::DayOfWeek {
            days: vec![Weekday::Mon],
        }];

        // 2023-03-01 is a Wednesday; the next satisfying noon is Monday the 6th
        let last = bookmark(Utc.with_ymd_and_hms(2023, 3, 1, 12, 0, 0).unwrap());
        let date = schedule.next_evaluation_date(Some(&last)).unwrap().unwrap();
        assert_eq!(date, Utc.with_ymd_and_hms(2023, 3, 6, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_cron_is_an_error() {
        let schedule = Schedule::new("schedule", "not a cron");
        assert!(schedule.next_evaluation_date(None).is_err());
    }
}
