//! Campaign audience predicates.
//!
//! A predicate is a pure function of a subject record and the evaluation
//! context (current time plus event configuration). It must not perform
//! I/O or depend on anything else, so the same inputs always give the same
//! answer.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::EventConfig;
use crate::error::PredicateError;
use crate::subject::SubjectRecord;

/// Inputs shared by every predicate evaluated in one run.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub now: DateTime<Utc>,
    pub event: &'a EventConfig,
}

impl<'a> EvalContext<'a> {
    pub fn new(now: DateTime<Utc>, event: &'a EventConfig) -> Self {
        Self { now, event }
    }

    /// True once `days` have passed since `date`. An unset date is false.
    pub fn days_after(&self, days: i64, date: Option<DateTime<Utc>>) -> bool {
        date.is_some_and(|d| self.now >= d + Duration::days(days))
    }

    /// True strictly before `date`. An unset date is false.
    pub fn before(&self, date: Option<DateTime<Utc>>) -> bool {
        date.is_some_and(|d| self.now < d)
    }

    /// True at or after `date`. An unset date is false.
    pub fn after(&self, date: Option<DateTime<Utc>>) -> bool {
        date.is_some_and(|d| self.now >= d)
    }
}

type PredicateFn =
    dyn Fn(&SubjectRecord, &EvalContext<'_>) -> Result<bool, PredicateError> + Send + Sync;

/// A shareable audience filter.
#[derive(Clone)]
pub struct Predicate(Arc<PredicateFn>);

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&SubjectRecord, &EvalContext<'_>) -> Result<bool, PredicateError>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }

    /// Matches every record.
    pub fn always() -> Self {
        Self::new(|_, _| Ok(true))
    }

    /// Matches records whose field is truthy. A missing field is an error.
    pub fn field(path: &'static str) -> Self {
        Self::new(move |record, _| record.truthy(path))
    }

    pub fn and(self, other: Predicate) -> Self {
        Self::new(move |record, ctx| Ok(self.eval(record, ctx)? && other.eval(record, ctx)?))
    }

    pub fn or(self, other: Predicate) -> Self {
        Self::new(move |record, ctx| Ok(self.eval(record, ctx)? || other.eval(record, ctx)?))
    }

    pub fn negate(self) -> Self {
        Self::new(move |record, ctx| Ok(!self.eval(record, ctx)?))
    }

    pub fn eval(
        &self,
        record: &SubjectRecord,
        ctx: &EvalContext<'_>,
    ) -> Result<bool, PredicateError> {
        (self.0)(record, ctx)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}
