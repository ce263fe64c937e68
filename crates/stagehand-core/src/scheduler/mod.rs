//! Timing decisions for actions that produce several jobs over time.
//!
//! A [`SchedulerSpec`] is one of: sequential, cron, timeline or event-gated.
//! [`schedule`] answers whether the next job may be dispatched now and, for
//! the time based modes, when to look again.

mod timeline;

pub use timeline::{DistributionKind, Timeline, TimelineDistributionSpec};

use crate::classifier::Classifier;
use crate::config::SchedulerConfig;
use crate::error::{Result, StagehandError};
use crate::expressions::{self, ConditionalExpr};
use crate::meta::ObjectMeta;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// SchedulerSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSpec {
    /// Standard five-field cron, or a six/seven-field or `@` macro form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<TimelineDistributionSpec>,
    /// Dispatch the next job only after the previous one succeeded.
    #[serde(default)]
    pub sequential: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<ConditionalExpr>,
    /// Missed runs older than this many seconds are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<u64>,
}

impl SchedulerSpec {
    pub fn cron(expr: &str) -> Self {
        Self {
            cron: Some(expr.to_string()),
            ..Default::default()
        }
    }

    pub fn sequential() -> Self {
        Self {
            sequential: true,
            ..Default::default()
        }
    }

    pub fn event(expr: ConditionalExpr) -> Self {
        Self {
            event: Some(expr),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cron.is_some() && self.timeline.is_some() {
            return Err(StagehandError::InvalidSchedule {
                spec: self.cron.clone().unwrap_or_default(),
                reason: "cron and timeline cannot be active at the same time".to_string(),
            });
        }
        if let Some(expr) = &self.cron {
            parse_cron(expr)?;
        }
        if let Some(timeline) = &self.timeline {
            timeline.validate()?;
        }
        if let Some(event) = &self.event {
            event.validate()?;
        }
        Ok(())
    }
}

/// Parse a cron expression. Five-field expressions get a zero seconds field.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let trimmed = expr.trim();
    let normalized = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| StagehandError::InvalidSchedule {
        spec: expr.to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tickers
// ---------------------------------------------------------------------------

/// A duty cycle: the activation after a given instant.
trait Ticker {
    fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

impl Ticker for cron::Schedule {
    fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.after(&t).next()
    }
}

impl Ticker for Timeline {
    fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next(t)
    }
}

// ---------------------------------------------------------------------------
// schedule
// ---------------------------------------------------------------------------

/// Inputs to one scheduling decision.
pub struct ScheduleParams<'a> {
    pub spec: Option<&'a SchedulerSpec>,
    pub last_schedule_time: Option<DateTime<Utc>>,
    pub creation_time: DateTime<Utc>,
    /// Materialised timeline, for timeline schedules.
    pub expected_timeline: Option<&'a Timeline>,
    /// Name of the most recently dispatched job; `None` before the first.
    pub last_dispatched: Option<&'a str>,
    pub state: &'a Classifier,
    /// Object whose alert annotations back a metrics event.
    pub target: &'a ObjectMeta,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    pub ready: bool,
    /// Latest missed activation, for cron and timeline schedules.
    pub missed: Option<DateTime<Utc>>,
    /// Next future activation, used to requeue.
    pub next_tick: Option<DateTime<Utc>>,
}

impl ScheduleOutcome {
    fn ready() -> Self {
        Self {
            ready: true,
            ..Default::default()
        }
    }

    fn waiting() -> Self {
        Self::default()
    }
}

/// Decide whether the next job may be dispatched.
pub fn schedule(params: &ScheduleParams<'_>, cfg: &SchedulerConfig) -> Result<ScheduleOutcome> {
    let Some(spec) = params.spec else {
        return Ok(ScheduleOutcome::ready());
    };

    if spec.sequential {
        let ready = match params.last_dispatched {
            None => true,
            Some(prev) => params.state.is_successful(&[prev]),
        };
        return Ok(ScheduleOutcome {
            ready,
            ..Default::default()
        });
    }

    if let Some(expr) = &spec.cron {
        let ticker = parse_cron(expr)?;
        return missed_start(&ticker, spec, params, cfg);
    }

    if spec.timeline.is_some() {
        let empty = Timeline::default();
        let ticker = params.expected_timeline.unwrap_or(&empty);
        return missed_start(ticker, spec, params, cfg);
    }

    if let Some(event) = spec.event.as_ref().filter(|e| !e.is_zero()) {
        let verdict = expressions::evaluate(event, params.state, params.target)?;
        if verdict.holds {
            return Ok(ScheduleOutcome::ready());
        }
        tracing::debug!(info = %verdict.info, "event condition not met");
    }

    Ok(ScheduleOutcome::waiting())
}

/// Find the latest activation in `(earliest, now]`, where `earliest` is the
/// last schedule time (or creation) raised to the starting deadline.
fn missed_start(
    ticker: &dyn Ticker,
    spec: &SchedulerSpec,
    params: &ScheduleParams<'_>,
    cfg: &SchedulerConfig,
) -> Result<ScheduleOutcome> {
    let now = params.now;
    let mut earliest = params.last_schedule_time.unwrap_or(params.creation_time);

    let deadline = spec
        .starting_deadline_seconds
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(ChronoDuration::try_seconds);
    if let Some(deadline) = deadline {
        let floor = now - deadline;
        if floor > earliest {
            earliest = floor;
        }
    }

    if earliest > now {
        return Ok(ScheduleOutcome {
            ready: false,
            missed: None,
            next_tick: ticker.next_after(now),
        });
    }

    let mut missed = None;
    let mut starts = 0usize;
    let mut cursor = ticker.next_after(earliest);
    while let Some(t) = cursor.filter(|t| *t <= now) {
        missed = Some(t);
        starts += 1;
        if starts > cfg.max_missed_starts {
            return Err(StagehandError::TooManyMissedStarts {
                limit: cfg.max_missed_starts,
            });
        }
        cursor = ticker.next_after(t);
    }

    if let (Some(missed), Some(deadline)) = (missed, deadline) {
        if missed + deadline < now {
            return Err(StagehandError::SchedulingViolation(format!(
                "missed run at {missed} is past its starting deadline of {}s",
                deadline.num_seconds()
            )));
        }
    }

    Ok(ScheduleOutcome {
        ready: missed.is_some(),
        missed,
        next_tick: ticker.next_after(now),
    })
}
