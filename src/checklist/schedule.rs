//! Template recurrence: cron rule, daily deadline, active date range.
//!
//! Recurrence uses the `cron` crate. Plain 5-field expressions
//! (`min hour dom mon dow`) are accepted and get a leading seconds field.
//! All times are UTC.

use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChecklistError;

/// When a template is due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Cron expression, e.g. `"0 22 * * *"` for every night at 22:00.
    pub recurrence: String,
    /// Deadline on each due day, `HH:MM`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
}

impl ScheduleConfig {
    pub fn new(recurrence: impl Into<String>) -> Self {
        Self {
            recurrence: recurrence.into(),
            deadline: None,
            start_date: None,
            end_date: None,
        }
    }

    /// Builder: set the daily deadline (`HH:MM`).
    pub fn with_deadline(mut self, deadline: impl Into<String>) -> Self {
        self.deadline = Some(deadline.into());
        self
    }

    /// Builder: restrict to a date range (inclusive).
    pub fn between(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn validate(&self) -> Result<(), ChecklistError> {
        self.cron()?;
        self.deadline_time()?;
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                return Err(ChecklistError::InvalidSchedule(format!(
                    "end date {end} is before start date {start}"
                )));
            }
        }
        Ok(())
    }

    fn cron(&self) -> Result<cron::Schedule, ChecklistError> {
        let expr = self.recurrence.trim();
        let expr = if expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        };
        cron::Schedule::from_str(&expr)
            .map_err(|e| ChecklistError::InvalidSchedule(format!("invalid cron {expr:?}: {e}")))
    }

    fn deadline_time(&self) -> Result<Option<NaiveTime>, ChecklistError> {
        self.deadline
            .as_deref()
            .map(|d| {
                NaiveTime::parse_from_str(d.trim(), "%H:%M").map_err(|e| {
                    ChecklistError::InvalidSchedule(format!("invalid deadline {d:?}: {e}"))
                })
            })
            .transpose()
    }

    /// Whether `date` falls inside the configured date range.
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.start_date.is_none_or(|s| date >= s) && self.end_date.is_none_or(|e| date <= e)
    }

    /// Whether the recurrence fires at least once on `date`.
    pub fn occurs_on(&self, date: NaiveDate) -> Result<bool, ChecklistError> {
        if !self.is_active_on(date) {
            return Ok(false);
        }
        let cron = self.cron()?;
        let day_start = date.and_time(NaiveTime::MIN).and_utc();
        let Some(next_day) = date.checked_add_days(Days::new(1)) else {
            return Ok(false);
        };
        let day_end = next_day.and_time(NaiveTime::MIN).and_utc();
        let just_before = day_start - chrono::Duration::seconds(1);
        Ok(cron
            .after(&just_before)
            .next()
            .is_some_and(|fire| fire < day_end))
    }

    /// The deadline instant on `date`, if the template is due that day.
    pub fn deadline_on(&self, date: NaiveDate) -> Result<Option<DateTime<Utc>>, ChecklistError> {
        let Some(time) = self.deadline_time()? else {
            return Ok(None);
        };
        if !self.occurs_on(date)? {
            return Ok(None);
        }
        Ok(Some(date.and_time(time).and_utc()))
    }

    /// Next firing strictly after `after`, within the date range.
    pub fn next_occurrence(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ChecklistError> {
        let cron = self.cron()?;
        for fire in cron.after(&after) {
            let date = fire.date_naive();
            if self.end_date.is_some_and(|end| date > end) {
                return Ok(None);
            }
            if self.is_active_on(date) {
                return Ok(Some(fire));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn five_field_cron_accepted() {
        let s = ScheduleConfig::new("0 22 * * *");
        assert!(s.validate().is_ok());
        assert!(s.occurs_on(date(2026, 3, 10)).unwrap());
    }

    #[test]
    fn weekday_only_schedule() {
        // 2026-03-14 is a Saturday, 2026-03-16 a Monday.
        let s = ScheduleConfig::new("0 9 * * MON-FRI");
        assert!(!s.occurs_on(date(2026, 3, 14)).unwrap());
        assert!(s.occurs_on(date(2026, 3, 16)).unwrap());
    }

    #[test]
    fn date_range_bounds_occurrences() {
        let s = ScheduleConfig::new("0 8 * * *").between(Some(date(2026, 1, 10)), Some(date(2026, 1, 20)));
        assert!(!s.occurs_on(date(2026, 1, 9)).unwrap());
        assert!(s.occurs_on(date(2026, 1, 10)).unwrap());
        assert!(s.occurs_on(date(2026, 1, 20)).unwrap());
        assert!(!s.occurs_on(date(2026, 1, 21)).unwrap());
    }

    #[test]
    fn deadline_on_due_day() {
        let s = ScheduleConfig::new("0 22 * * *").with_deadline("23:30");
        let deadline = s.deadline_on(date(2026, 5, 1)).unwrap().unwrap();
        assert_eq!(deadline, Utc.with_ymd_and_hms(2026, 5, 1, 23, 30, 0).unwrap());
    }

    #[test]
    fn next_occurrence_skips_before_start() {
        let s = ScheduleConfig::new("0 6 * * *").between(Some(date(2026, 2, 1)), None);
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = s.next_occurrence(after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 1, 6, 0, 0).unwrap());
    }

    #[test]
    fn next_occurrence_none_after_end() {
        let s = ScheduleConfig::new("0 6 * * *").between(None, Some(date(2026, 1, 5)));
        let after = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert!(s.next_occurrence(after).unwrap().is_none());
    }

    #[test]
    fn invalid_inputs_rejected() {
        assert!(ScheduleConfig::new("not a cron").validate().is_err());
        assert!(ScheduleConfig::new("0 9 * * *").with_deadline("25:99").validate().is_err());
        let reversed = ScheduleConfig::new("0 9 * * *").between(Some(date(2026, 2, 1)), Some(date(2026, 1, 1)));
        assert!(reversed.validate().is_err());
    }
}
