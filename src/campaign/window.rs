//! Date-boundary rules and the active window derived from them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A named date boundary contributing to a campaign's active window.
///
/// Rules built from an unset deadline contribute no bound, so an event that
/// does not use a deadline simply leaves that side of the window open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateRule {
    /// Active up to and including the deadline.
    Before(Option<DateTime<Utc>>),
    /// Active from the date onwards.
    After(Option<DateTime<Utc>>),
    /// Active from `days` before the deadline until the deadline, or until
    /// `until` days before it when set.
    DaysBefore {
        days: i64,
        deadline: Option<DateTime<Utc>>,
        until: Option<i64>,
    },
    /// Active from `days` after the date onwards.
    DaysAfter {
        days: i64,
        date: Option<DateTime<Utc>>,
    },
    /// Active between two dates, inclusive.
    Between(Option<DateTime<Utc>>, Option<DateTime<Utc>>),
}

impl DateRule {
    pub fn before(deadline: impl Into<Option<DateTime<Utc>>>) -> Self {
        DateRule::Before(deadline.into())
    }

    pub fn after(date: impl Into<Option<DateTime<Utc>>>) -> Self {
        DateRule::After(date.into())
    }

    pub fn days_before(days: i64, deadline: impl Into<Option<DateTime<Utc>>>) -> Self {
        DateRule::DaysBefore {
            days,
            deadline: deadline.into(),
            until: None,
        }
    }

    pub fn days_before_until(
        days: i64,
        deadline: impl Into<Option<DateTime<Utc>>>,
        until: i64,
    ) -> Self {
        DateRule::DaysBefore {
            days,
            deadline: deadline.into(),
            until: Some(until),
        }
    }

    pub fn days_after(days: i64, date: impl Into<Option<DateTime<Utc>>>) -> Self {
        DateRule::DaysAfter {
            days,
            date: date.into(),
        }
    }

    pub fn between(
        start: impl Into<Option<DateTime<Utc>>>,
        end: impl Into<Option<DateTime<Utc>>>,
    ) -> Self {
        DateRule::Between(start.into(), end.into())
    }

    /// Lower bound contributed by this rule.
    pub fn active_after(&self) -> Option<DateTime<Utc>> {
        match *self {
            DateRule::Before(_) => None,
            DateRule::After(date) => date,
            DateRule::DaysBefore { days, deadline, .. } => {
                deadline.map(|d| d - Duration::days(days))
            }
            DateRule::DaysAfter { days, date } => date.map(|d| d + Duration::days(days)),
            DateRule::Between(start, _) => start,
        }
    }

    /// Upper bound contributed by this rule.
    pub fn active_before(&self) -> Option<DateTime<Utc>> {
        match *self {
            DateRule::Before(deadline) => deadline,
            DateRule::After(_) | DateRule::DaysAfter { .. } => None,
            DateRule::DaysBefore {
                deadline, until, ..
            } => deadline.map(|d| match until {
                Some(until) => d - Duration::days(until),
                None => d,
            }),
            DateRule::Between(_, end) => end,
        }
    }
}

/// Inclusive `[active_after, active_before]` range; either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveWindow {
    pub active_after: Option<DateTime<Utc>>,
    pub active_before: Option<DateTime<Utc>>,
}

impl ActiveWindow {
    /// Earliest lower bound and latest upper bound across all rules.
    pub fn from_rules(rules: &[DateRule]) -> Self {
        Self {
            active_after: rules.iter().filter_map(DateRule::active_after).min(),
            active_before: rules.iter().filter_map(DateRule::active_before).max(),
        }
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.active_after.is_none_or(|after| after <= now)
            && self.active_before.is_none_or(|before| now <= before)
    }

    pub fn is_unbounded(&self) -> bool {
        self.active_after.is_none() && self.active_before.is_none()
    }
}
