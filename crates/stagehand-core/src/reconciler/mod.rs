//! Level-triggered reconcile passes.
//!
//! Each pass reads one object and its children, folds the children into the
//! object's lifecycle, writes the lifecycle back when it changed, and then
//! acts on the resulting phase. Passes are idempotent: running one twice on
//! the same snapshot makes no further changes.

mod cluster;
mod dispatch;
mod workflow;

pub use cluster::reconcile_cluster;
pub use workflow::reconcile_workflow;

use crate::classifier::Classifier;
use crate::error::Result;
use crate::expressions::{unset_alert, ALERT_NAME};
use crate::job::Job;
use crate::meta::{labels, LabelSelector, ObjectKey, Resource};
use crate::store::Store;
use crate::telemetry::TelemetryClients;
use crate::types::Component;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// What the controller should do with the key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Wait for the next change notification.
    Stop,
    RequeueAfter(Duration),
}

impl Outcome {
    /// Requeue at `at`, or right away when it has passed.
    pub fn requeue_at(at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Outcome::RequeueAfter((at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Children of an object, classified by job name.
pub(crate) struct Children {
    pub state: Classifier,
    pub jobs: Vec<Job>,
}

pub(crate) async fn populate(jobs: &dyn Store<Job>, namespace: &str, selector: &LabelSelector) -> Result<Children> {
    let listed = jobs.list(namespace, selector).await?;
    let mut state = Classifier::new();
    state.classify_all(listed.iter().cloned());
    Ok(Children { state, jobs: listed })
}

/// Delete `key` along with every job it created. Already gone is fine.
pub(crate) async fn delete_job(jobs: &dyn Store<Job>, key: &ObjectKey) -> Result<()> {
    let owned = jobs
        .list(&key.namespace, &LabelSelector::new().with(labels::CREATED_BY, &key.name))
        .await?;
    for child in owned {
        ignore_not_found(jobs.delete(&child.key()).await)?;
    }
    ignore_not_found(jobs.delete(key).await)?;
    tracing::info!(job = %key, "deleted");
    Ok(())
}

/// Unset alerts and delete every SUT job among `victims`.
pub(crate) async fn garbage_collect(
    jobs: &dyn Store<Job>,
    telemetry: &TelemetryClients,
    victims: &[&Job],
) -> Result<()> {
    for job in victims.iter().filter(|j| j.component() == Component::Sut) {
        release_alert(jobs, telemetry, job).await;
        delete_job(jobs, &job.key()).await?;
    }
    Ok(())
}

/// Best effort: a rule that cannot be removed is logged and left behind.
pub(crate) async fn release_alert(jobs: &dyn Store<Job>, telemetry: &TelemetryClients, job: &Job) {
    if job.metadata.annotation(ALERT_NAME).is_none() {
        return;
    }
    if let Err(e) = unset_alert(telemetry, jobs, job).await {
        tracing::warn!(job = %job.key(), error = %e, "cannot unset alert");
    }
}

fn ignore_not_found(res: Result<()>) -> Result<()> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
