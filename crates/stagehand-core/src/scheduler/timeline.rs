use crate::error::{Result, StagehandError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionKind {
    /// Evenly spaced events.
    Constant,
    /// Random offsets drawn from a seeded generator.
    Uniform,
}

/// How `total` seconds are divided into activation points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineDistributionSpec {
    pub distribution: DistributionKind,
    /// Seconds over which the events are spread.
    pub total: u64,
    #[serde(default)]
    pub seed: u64,
}

impl TimelineDistributionSpec {
    pub fn validate(&self) -> Result<()> {
        if self.total == 0 {
            return Err(StagehandError::InvalidSchedule {
                spec: format!("{:?}", self.distribution),
                reason: "timeline total duration must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Lay out `events` activation points starting at `start`.
    pub fn materialize(&self, start: DateTime<Utc>, events: usize) -> Result<Timeline> {
        self.validate()?;
        if events == 0 {
            return Ok(Timeline::default());
        }

        let total_ms = self.total.saturating_mul(1000) as i64;
        let mut offsets: Vec<i64> = match self.distribution {
            DistributionKind::Constant => {
                let step = total_ms / events as i64;
                (1..=events as i64).map(|i| step * i).collect()
            }
            DistributionKind::Uniform => {
                let mut rng = StdRng::seed_from_u64(self.seed);
                (0..events).map(|_| rng.gen_range(1..=total_ms)).collect()
            }
        };
        offsets.sort_unstable();

        Ok(Timeline(
            offsets
                .into_iter()
                .map(|ms| start + ChronoDuration::milliseconds(ms))
                .collect(),
        ))
    }
}

/// Materialised activation points, ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeline(pub Vec<DateTime<Utc>>);

impl Timeline {
    /// First point strictly after `after`. `None` once the timeline is spent.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.0.iter().copied().find(|t| *t > after)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
