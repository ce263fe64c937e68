use crate::classifier::Classifier;
use crate::error::{Result, StagehandError};
use crate::types::{ConditionType, Phase, TolerateSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// StatusCondition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: bool,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Aggregate state of a workflow or a multi-job action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StatusCondition>,
}

impl Lifecycle {
    pub fn condition(&self, kind: ConditionType) -> Option<&StatusCondition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Record a condition, replacing any previous one of the same type. The
    /// transition time only moves when the status flips.
    pub fn set_condition(&mut self, kind: ConditionType, status: bool, reason: &str, message: &str) {
        let now = Utc::now();
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
            }
            None => self.conditions.push(StatusCondition {
                kind,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
            }),
        }
    }

    fn transition(&mut self, phase: Phase, reason: &str, message: String) {
        self.phase = phase;
        self.reason = reason.to_string();
        self.message = message;
    }

    pub fn pending(&mut self, message: impl Into<String>) {
        self.transition(Phase::Pending, "JobIsPending", message.into());
    }

    pub fn running(&mut self, reason: &str, message: impl Into<String>) {
        self.transition(Phase::Running, reason, message.into());
    }

    pub fn success(&mut self, reason: &str, message: impl Into<String>) {
        self.transition(Phase::Success, reason, message.into());
    }

    pub fn failed(&mut self, reason: &str, message: impl Into<String>) {
        let message = message.into();
        self.set_condition(ConditionType::JobUnexpectedTermination, true, reason, &message);
        self.transition(Phase::Failed, reason, message);
    }

    /// Phase, reason and message all match. Conditions are not compared.
    pub fn same_state(&self, other: &Lifecycle) -> bool {
        self.phase == other.phase && self.reason == other.reason && self.message == other.message
    }
}

// ---------------------------------------------------------------------------
// Decision functions
// ---------------------------------------------------------------------------

/// Fold the snapshot of `total` expected jobs into `lf`.
///
/// Rules apply in order and the first match wins; with no match `lf` is left
/// as is. Returns whether phase, reason or message changed, so callers can
/// skip the store write on an unchanged pass.
pub fn grouped_jobs(
    total: usize,
    state: &Classifier,
    lf: &mut Lifecycle,
    tolerate: Option<&TolerateSpec>,
) -> bool {
    if state.count() == 0 {
        return false;
    }

    let before = lf.clone();
    let failed = state.num_failed_jobs();
    let successful = state.num_successful_jobs();
    let running = state.num_running_jobs();

    match tolerate {
        None if failed > 0 => {
            let msg = format!("failed: {} ({:?})", failed, state.list_failed_jobs());
            lf.set_condition(
                ConditionType::JobUnexpectedTermination,
                true,
                "AtLeastOneJobHasFailed",
                &msg,
            );
            lf.transition(Phase::Failed, "AtLeastOneJobHasFailed", msg);
            return !lf.same_state(&before);
        }
        Some(tol) if failed > tol.failed_jobs => {
            let msg = format!(
                "tolerate: {}. failed: {} ({:?})",
                tol.failed_jobs,
                failed,
                state.list_failed_jobs()
            );
            lf.set_condition(
                ConditionType::JobUnexpectedTermination,
                true,
                "TooManyJobsHaveFailed",
                &msg,
            );
            lf.transition(Phase::Failed, "TooManyJobsHaveFailed", msg);
            return !lf.same_state(&before);
        }
        _ => {}
    }

    if successful == total {
        let msg = format!(
            "{} (successful) / {} (scheduled) / {} (total)",
            successful,
            state.count(),
            total
        );
        lf.set_condition(ConditionType::AllJobsAreCompleted, true, "AllJobsAreSuccessful", &msg);
        lf.transition(Phase::Success, "AllJobsAreSuccessful", msg);
        return !lf.same_state(&before);
    }

    if successful + failed == total {
        let msg = format!(
            "{} (successful) / {} (failed) / {} (total)",
            successful, failed, total
        );
        lf.set_condition(
            ConditionType::AllJobsAreCompleted,
            true,
            "ToleratedJobsAreSuccessful",
            &msg,
        );
        lf.transition(Phase::Success, "ToleratedJobsAreSuccessful", msg);
        return !lf.same_state(&before);
    }

    if running + successful == total {
        let msg = format!(
            "{} (running) / {} (successful) / {} (total)",
            running, successful, total
        );
        lf.set_condition(ConditionType::AllJobsAreScheduled, true, "AtLeastOneJobIsRunning", &msg);
        lf.transition(Phase::Running, "AtLeastOneJobIsRunning", msg);
        return !lf.same_state(&before);
    }

    false
}

/// Degenerate form of [`grouped_jobs`] for actions that own exactly one job.
///
/// More than one classified job breaks the contract of the caller and is
/// reported as an invariant violation.
pub fn single_job(state: &Classifier, lf: &mut Lifecycle) -> Result<bool> {
    match state.count() {
        0 => return Ok(false),
        1 => {}
        n => {
            return Err(StagehandError::Invariant(format!(
                "single-job action has {n} classified jobs: {state}"
            )))
        }
    }

    let before = lf.clone();

    if state.num_failed_jobs() == 1 {
        let msg = format!("failed: {:?}", state.list_failed_jobs());
        lf.set_condition(
            ConditionType::JobUnexpectedTermination,
            true,
            "ExactlyOneJobIsFailed",
            &msg,
        );
        lf.transition(Phase::Failed, "ExactlyOneJobIsFailed", msg);
    } else if state.num_successful_jobs() == 1 {
        let msg = format!("successful: {:?}", state.list_successful_jobs());
        lf.set_condition(ConditionType::AllJobsAreCompleted, true, "ExactlyOneJobIsSuccessful", &msg);
        lf.transition(Phase::Success, "ExactlyOneJobIsSuccessful", msg);
    } else if state.num_running_jobs() == 1 {
        let msg = format!("running: {:?}", state.list_running_jobs());
        lf.set_condition(ConditionType::AllJobsAreScheduled, true, "ExactlyOneJobIsRunning", &msg);
        lf.transition(Phase::Running, "ExactlyOneJobIsRunning", msg);
    } else {
        let msg = format!("pending: {:?}", state.list_pending_jobs());
        lf.set_condition(ConditionType::Initialized, true, "ExactlyOneJobIsPending", &msg);
        lf.transition(Phase::Pending, "ExactlyOneJobIsPending", msg);
    }

    Ok(!lf.same_state(&before))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobKind};

    fn snapshot(jobs: &[(&str, Phase)]) -> Classifier {
        let mut c = Classifier::new();
        for (name, phase) in jobs {
            c.classify(
                name,
                Job::builder(JobKind::Service, "ns", name)
                    .phase(*phase)
                    .build()
                    .unwrap(),
            );
        }
        c
    }

    fn pending() -> Lifecycle {
        let mut lf = Lifecycle::default();
        lf.pending("waiting");
        lf
    }

    #[test]
    fn one_failure_without_tolerance_fails() {
        let state = snapshot(&[("a", Phase::Failed), ("b", Phase::Pending), ("c", Phase::Pending)]);
        let mut lf = pending();
        assert!(grouped_jobs(3, &state, &mut lf, None));
        assert_eq!(lf.phase, Phase::Failed);
        assert_eq!(lf.reason, "AtLeastOneJobHasFailed");
        assert_eq!(lf.message, "failed: 1 ([\"a\"])");
        assert!(lf.condition(ConditionType::JobUnexpectedTermination).unwrap().status);
    }

    #[test]
    fn too_many_failures_beyond_tolerance() {
        let state = snapshot(&[("a", Phase::Failed), ("b", Phase::Failed), ("c", Phase::Success)]);
        let mut lf = pending();
        let tol = TolerateSpec { failed_jobs: 1 };
        assert!(grouped_jobs(3, &state, &mut lf, Some(&tol)));
        assert_eq!(lf.reason, "TooManyJobsHaveFailed");
        assert!(lf.message.starts_with("tolerate: 1. failed: 2"));
    }

    #[test]
    fn tolerated_failures_still_succeed() {
        let state = snapshot(&[("a", Phase::Failed), ("b", Phase::Success), ("c", Phase::Success)]);
        let mut lf = pending();
        let tol = TolerateSpec { failed_jobs: 1 };
        assert!(grouped_jobs(3, &state, &mut lf, Some(&tol)));
        assert_eq!(lf.phase, Phase::Success);
        assert_eq!(lf.reason, "ToleratedJobsAreSuccessful");
    }

    #[test]
    fn all_successful() {
        let state = snapshot(&[("a", Phase::Success), ("b", Phase::Success)]);
        let mut lf = pending();
        assert!(grouped_jobs(2, &state, &mut lf, None));
        assert_eq!(lf.phase, Phase::Success);
        assert_eq!(lf.reason, "AllJobsAreSuccessful");
        assert_eq!(lf.message, "2 (successful) / 2 (scheduled) / 2 (total)");
    }

    #[test]
    fn running_when_everything_started() {
        let state = snapshot(&[("a", Phase::Running), ("b", Phase::Success)]);
        let mut lf = pending();
        assert!(grouped_jobs(2, &state, &mut lf, None));
        assert_eq!(lf.phase, Phase::Running);
        assert_eq!(lf.reason, "AtLeastOneJobIsRunning");
    }

    #[test]
    fn not_enough_children_leaves_lifecycle_alone() {
        let state = snapshot(&[("a", Phase::Running)]);
        let mut lf = pending();
        let before = lf.clone();
        assert!(!grouped_jobs(3, &state, &mut lf, None));
        assert_eq!(lf, before);

        assert!(!grouped_jobs(3, &Classifier::new(), &mut lf, None));
    }

    #[test]
    fn grouped_jobs_is_idempotent() {
        let state = snapshot(&[("a", Phase::Running), ("b", Phase::Running)]);
        let mut lf = pending();
        assert!(grouped_jobs(2, &state, &mut lf, None));
        assert!(!grouped_jobs(2, &state, &mut lf, None));
    }

    #[test]
    fn single_job_maps_phase() {
        let mut lf = pending();
        let state = snapshot(&[("a", Phase::Running)]);
        assert!(single_job(&state, &mut lf).unwrap());
        assert_eq!(lf.reason, "ExactlyOneJobIsRunning");

        let state = snapshot(&[("a", Phase::Failed)]);
        assert!(single_job(&state, &mut lf).unwrap());
        assert_eq!(lf.phase, Phase::Failed);
        assert!(!single_job(&state, &mut lf).unwrap());

        assert!(!single_job(&Classifier::new(), &mut lf).unwrap());
    }

    #[test]
    fn single_job_with_two_children_is_invariant_violation() {
        let state = snapshot(&[("a", Phase::Running), ("b", Phase::Pending)]);
        let err = single_job(&state, &mut pending()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn condition_transition_time_moves_on_flip_only() {
        let mut lf = Lifecycle::default();
        lf.set_condition(ConditionType::Assert, false, "A", "");
        let t0 = lf.condition(ConditionType::Assert).unwrap().last_transition_time;
        lf.set_condition(ConditionType::Assert, false, "B", "changed");
        let c = lf.condition(ConditionType::Assert).unwrap();
        assert_eq!(c.last_transition_time, t0);
        assert_eq!(c.reason, "B");
        assert_eq!(lf.conditions.len(), 1);
    }
}
