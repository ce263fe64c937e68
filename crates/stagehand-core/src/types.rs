use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Observable phase of a Job, a multi-job action or a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Uninitialized,
    Pending,
    Running,
    Success,
    Failed,
}

impl Phase {
    pub fn all() -> &'static [Phase] {
        &[
            Phase::Uninitialized,
            Phase::Pending,
            Phase::Running,
            Phase::Success,
            Phase::Failed,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Uninitialized => "Uninitialized",
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Success => "Success",
            Phase::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Success | Phase::Failed)
    }

    pub fn is_any(self, phases: &[Phase]) -> bool {
        phases.contains(&self)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = crate::error::StagehandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::all()
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| crate::error::StagehandError::Invariant(format!("unknown phase '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Whether a Job belongs to the system under test or to long-lived
/// infrastructure (telemetry stack and the like).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Component {
    #[default]
    Sut,
    Sys,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Sut => "SUT",
            Component::Sys => "SYS",
        }
    }

    /// Anything other than an explicit `SYS` label counts as SUT.
    pub fn from_label(value: Option<&str>) -> Self {
        match value {
            Some("SYS") => Component::Sys,
            _ => Component::Sut,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ConditionType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    #[serde(rename = "CRInitialized")]
    Initialized,
    AllJobsAreScheduled,
    AllJobsAreCompleted,
    JobUnexpectedTermination,
    Assert,
}

impl ConditionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionType::Initialized => "CRInitialized",
            ConditionType::AllJobsAreScheduled => "AllJobsAreScheduled",
            ConditionType::AllJobsAreCompleted => "AllJobsAreCompleted",
            ConditionType::JobUnexpectedTermination => "JobUnexpectedTermination",
            ConditionType::Assert => "Assert",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TolerateSpec
// ---------------------------------------------------------------------------

/// Number of failed children still compatible with an overall success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TolerateSpec {
    #[serde(default)]
    pub failed_jobs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_str() {
        for p in Phase::all() {
            let parsed: Phase = p.as_str().parse().unwrap();
            assert_eq!(parsed, *p);
        }
    }

    #[test]
    fn unknown_phase_is_invariant_violation() {
        let err = "Exploded".parse::<Phase>().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn unknown_phase_rejected_on_deserialize() {
        assert!(serde_json::from_str::<Phase>("\"Exploded\"").is_err());
        let p: Phase = serde_json::from_str("\"Running\"").unwrap();
        assert_eq!(p, Phase::Running);
    }

    #[test]
    fn component_label_defaults_to_sut() {
        assert_eq!(Component::from_label(None), Component::Sut);
        assert_eq!(Component::from_label(Some("SYS")), Component::Sys);
        assert_eq!(Component::from_label(Some("whatever")), Component::Sut);
    }
}
