use crate::classifier::Classifier;
use crate::error::{Result, StagehandError};
use crate::types::Phase;
use crate::workflow::{Action, WaitSpec};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Actions cleared for dispatch, and how long to wait for the nearest timed
/// dependency when that is all that holds others back.
#[derive(Debug, Default)]
pub struct ReadyActions<'a> {
    pub actions: Vec<&'a Action>,
    pub requeue_after: Option<Duration>,
}

impl ReadyActions<'_> {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name.as_str()).collect()
    }
}

/// Resolve which not-yet-scheduled actions have their dependencies met.
///
/// Declaration order is kept. Actions in `scheduled` are never returned again.
pub fn next_ready_actions<'a, S: AsRef<str>>(
    actions: &'a [Action],
    scheduled: &[S],
    state: &Classifier,
    created: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<ReadyActions<'a>> {
    let mut ready = ReadyActions::default();

    for action in actions {
        if scheduled.iter().any(|s| s.as_ref() == action.name) {
            continue;
        }

        let Some(deps) = &action.depends else {
            ready.actions.push(action);
            continue;
        };

        check_running_targets(action, deps, state)?;

        if !success_ok(deps, state) || !running_ok(deps, state) {
            continue;
        }

        match remaining_wait(deps, created, now) {
            None => ready.actions.push(action),
            Some(wait) => {
                ready.requeue_after = Some(match ready.requeue_after {
                    Some(current) => current.min(wait),
                    None => wait,
                });
            }
        }
    }

    Ok(ready)
}

fn success_ok(deps: &WaitSpec, state: &Classifier) -> bool {
    deps.success
        .iter()
        .all(|dep| state.is_successful(&[dep]) || state.system_phase(dep) == Some(Phase::Success))
}

fn running_ok(deps: &WaitSpec, state: &Classifier) -> bool {
    deps.running
        .iter()
        .all(|dep| state.is_running(&[dep]) || state.system_phase(dep) == Some(Phase::Running))
}

/// A running dependency can never be met once its target has completed.
fn check_running_targets(action: &Action, deps: &WaitSpec, state: &Classifier) -> Result<()> {
    for dep in &deps.running {
        if state.is_successful(&[dep]) || state.is_failed(&[dep]) {
            return Err(StagehandError::SchedulingViolation(format!(
                "action '{}' has a Running dependency on completed job '{dep}'",
                action.name
            )));
        }
    }
    Ok(())
}

/// Time left until the `after` constraint expires. `None` when it already has
/// (or there is none).
fn remaining_wait(deps: &WaitSpec, created: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    let after = deps.after_duration()?;
    let elapsed = (now - created).to_std().unwrap_or(Duration::ZERO);
    after.checked_sub(elapsed).filter(|left| !left.is_zero())
}
