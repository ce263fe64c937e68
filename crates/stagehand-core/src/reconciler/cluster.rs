use super::{garbage_collect, populate, release_alert, Children, Outcome};
use crate::classifier::Classifier;
use crate::context::Context;
use crate::error::{Result, StagehandError};
use crate::expressions::{evaluate, set_alert, ExprMetrics, Verdict, ALERT_NAME};
use crate::job::{Job, JobKind, ScheduleStatus};
use crate::lifecycle::grouped_jobs;
use crate::meta::{labels, LabelSelector, ObjectKey};
use crate::scheduler::{schedule, ScheduleParams, Timeline};
use crate::types::{Component, ConditionType, Phase};
use crate::workflow::ClusterSpec;
use chrono::Utc;

/// One pass over the cluster action stored under `key`.
pub async fn reconcile_cluster(ctx: &Context, key: &ObjectKey) -> Result<Outcome> {
    let mut job = match ctx.jobs.get(key).await {
        Ok(job) => job,
        Err(e) if e.is_not_found() => return Ok(Outcome::Stop),
        Err(e) => return Err(e),
    };
    if job.kind != JobKind::Cluster {
        return Err(StagehandError::Invariant(format!(
            "'{key}' is a {} job, not a cluster",
            job.kind
        )));
    }

    tracing::debug!(
        cluster = %key,
        phase = %job.phase(),
        version = job.metadata.resource_version,
        "-> Reconcile"
    );
    let outcome = match job.typed_spec::<ClusterSpec>() {
        Ok(spec) => reconcile(ctx, &mut job, &spec).await,
        Err(e) if job.phase() == Phase::Failed => {
            tracing::debug!(cluster = %key, error = %e, "failed cluster has a bad spec");
            Ok(Outcome::Stop)
        }
        Err(e) => {
            job.status.lifecycle.failed("InvalidCluster", e.to_string());
            write_and_stop(ctx, &mut job).await
        }
    };
    tracing::debug!(
        cluster = %key,
        phase = %job.phase(),
        version = job.metadata.resource_version,
        ?outcome,
        "<- Reconcile"
    );
    outcome
}

async fn reconcile(ctx: &Context, job: &mut Job, spec: &ClusterSpec) -> Result<Outcome> {
    let selector = LabelSelector::new().with(labels::CREATED_BY, job.name());
    let children = populate(ctx.jobs.as_ref(), &job.metadata.namespace, &selector).await?;

    let before = (job.status.lifecycle.clone(), job.suspend);
    update_lifecycle(job, spec, &children.state)?;
    if !job.status.lifecycle.same_state(&before.0) || job.suspend != before.1 {
        tracing::info!(
            cluster = %job.metadata.key(),
            from = %before.0.phase,
            to = %job.phase(),
            reason = %job.status.lifecycle.reason,
            "lifecycle changed"
        );
        if let Some(outcome) = write_status(ctx, job).await? {
            return Ok(outcome);
        }
    }

    if job.suspend {
        return Ok(Outcome::Stop);
    }

    match job.phase() {
        Phase::Success => {
            garbage_collect(
                ctx.jobs.as_ref(),
                &ctx.telemetry,
                &children.state.get_successful_jobs(),
            )
            .await?;
            release_alert(ctx.jobs.as_ref(), &ctx.telemetry, job).await;
            Ok(Outcome::Stop)
        }
        Phase::Failed => on_failure(ctx, job, &children).await,
        Phase::Running => Ok(Outcome::Stop),
        Phase::Uninitialized => initialize(ctx, job, spec).await,
        Phase::Pending => schedule_next(ctx, job, spec, &children.state).await,
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

fn update_lifecycle(job: &mut Job, spec: &ClusterSpec, state: &Classifier) -> Result<()> {
    let Job {
        metadata,
        status,
        suspend,
        ..
    } = job;
    let lf = &mut status.lifecycle;

    if lf
        .phase
        .is_any(&[Phase::Uninitialized, Phase::Success, Phase::Failed])
    {
        return Ok(());
    }

    let Some(until) = spec.until.as_ref().filter(|u| !u.is_zero()) else {
        let total = status.schedule.as_ref().map_or(spec.instances, |s| s.queued_jobs);
        grouped_jobs(total, state, lf, spec.tolerate.as_ref());
        return Ok(());
    };

    let verdict = match evaluate(until, state, metadata) {
        Ok(verdict) => verdict,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => Verdict {
            holds: false,
            info: e.to_string(),
        },
    };
    if verdict.holds {
        let msg = "The until condition is satisfied.";
        lf.set_condition(ConditionType::AllJobsAreScheduled, true, "UntilCondition", msg);
        lf.running("UntilCondition", msg);
        *suspend = true;
        return Ok(());
    }

    // with `until`, instances only bound the experiment
    let sent = dispatched(status.schedule.as_ref());
    let in_flight = state.num_pending_jobs() + state.num_running_jobs();
    if sent >= spec.instances && in_flight == 0 {
        let msg = format!(
            "'{}' has reached max instances [{}] before the until condition was met",
            metadata.name, spec.instances
        );
        lf.set_condition(
            ConditionType::JobUnexpectedTermination,
            true,
            "MaxInstancesReached",
            &msg,
        );
        lf.failed("MaxInstancesReached", msg);
        return Ok(());
    }

    lf.pending("Assertion is not yet satisfied.");
    lf.reason = "SpawnUntilEvent".to_string();
    Ok(())
}

fn dispatched(schedule: Option<&ScheduleStatus>) -> usize {
    schedule.map_or(0, |s| usize::try_from(s.scheduled_jobs + 1).unwrap_or(0))
}

async fn write_status(ctx: &Context, job: &mut Job) -> Result<Option<Outcome>> {
    match ctx.jobs.update(job.clone()).await {
        Ok(stored) => {
            *job = stored;
            Ok(None)
        }
        Err(e) if e.is_conflict() => {
            tracing::debug!(cluster = %job.metadata.key(), error = %e, "retry on conflict");
            Ok(Some(Outcome::RequeueAfter(ctx.config.reconcile.conflict_requeue())))
        }
        Err(e) => Err(e),
    }
}

async fn write_and_stop(ctx: &Context, job: &mut Job) -> Result<Outcome> {
    Ok(write_status(ctx, job).await?.unwrap_or(Outcome::Stop))
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// The metrics expression whose alert backs this cluster, if any. `until`
/// wins over an event schedule; validation rejects having both.
fn bound_metrics(spec: &ClusterSpec) -> Option<&ExprMetrics> {
    let event = spec.schedule.as_ref().and_then(|s| s.event.as_ref());
    spec.until
        .as_ref()
        .and_then(|u| u.metrics.as_ref())
        .or_else(|| event.and_then(|e| e.metrics.as_ref()))
        .filter(|m| !m.is_empty())
}

fn validate(spec: &ClusterSpec) -> Result<()> {
    if spec.instances == 0 {
        return Err(StagehandError::InvalidWorkflow(
            "a cluster needs at least one instance".to_string(),
        ));
    }
    if let Some(schedule) = &spec.schedule {
        schedule.validate()?;
    }
    if let Some(until) = &spec.until {
        until.validate()?;
    }
    Ok(())
}

async fn initialize(ctx: &Context, job: &mut Job, spec: &ClusterSpec) -> Result<Outcome> {
    if let Err(e) = validate(spec) {
        job.status.lifecycle.failed("InvalidCluster", e.to_string());
        return write_and_stop(ctx, job).await;
    }

    let timeline = match spec.schedule.as_ref().and_then(|s| s.timeline.as_ref()) {
        Some(distribution) => distribution.materialize(job.metadata.created_at(), spec.instances)?,
        None => Timeline::default(),
    };

    if let Some(metrics) = bound_metrics(spec) {
        if let Err(e) = set_alert(&ctx.telemetry, ctx.jobs.as_ref(), &*job, metrics).await {
            job.status.lifecycle.failed("AlertError", format!("cannot set alert: {e}"));
            return write_and_stop(ctx, job).await;
        }
        // pick up the annotation and its version
        let status = job.status.clone();
        *job = ctx.jobs.get(&job.metadata.key()).await?;
        job.status = status;
    }

    job.status.schedule = Some(ScheduleStatus {
        queued_jobs: spec.instances,
        scheduled_jobs: -1,
        last_schedule_time: None,
        expected_timeline: timeline.0,
    });
    let lf = &mut job.status.lifecycle;
    lf.set_condition(ConditionType::Initialized, true, "Initialized", "cluster is valid");
    lf.pending("ready to start submitting jobs.");
    write_and_stop(ctx, job).await
}

async fn schedule_next(ctx: &Context, job: &mut Job, spec: &ClusterSpec, state: &Classifier) -> Result<Outcome> {
    if ctx.is_shutting_down() {
        return Ok(Outcome::Stop);
    }

    let Some(status) = job.status.schedule.clone() else {
        return Err(StagehandError::Invariant(format!(
            "pending cluster '{}' has no schedule status",
            job.metadata.key()
        )));
    };
    let next = status.scheduled_jobs + 1;
    let has_until = spec.until.as_ref().is_some_and(|u| !u.is_zero());
    if dispatched(Some(&status)) >= spec.instances {
        tracing::debug!(cluster = %job.metadata.key(), "all instances dispatched");
        return Ok(Outcome::Stop);
    }

    let now = Utc::now();
    let previous = (status.scheduled_jobs >= 0).then(|| child_name(job.name(), status.scheduled_jobs));
    let timeline = Timeline(status.expected_timeline.clone());
    let params = ScheduleParams {
        spec: spec.schedule.as_ref(),
        last_schedule_time: status.last_schedule_time,
        creation_time: job.metadata.created_at(),
        expected_timeline: Some(&timeline),
        last_dispatched: previous.as_deref(),
        state,
        target: &job.metadata,
        now,
    };

    let outcome = match schedule(&params, &ctx.config.scheduler) {
        Ok(outcome) => outcome,
        Err(e) if e.is_scheduling_violation() => {
            job.status.lifecycle.failed("SchedulingViolation", e.to_string());
            return write_and_stop(ctx, job).await;
        }
        Err(e) => return Err(e),
    };

    if !outcome.ready {
        if let Some(tick) = outcome.next_tick {
            return Ok(Outcome::requeue_at(tick, now));
        }
        let event_gated = spec.schedule.as_ref().is_some_and(|s| s.event.is_some());
        return Ok(if event_gated {
            Outcome::RequeueAfter(ctx.config.reconcile.idle_requeue())
        } else {
            Outcome::Stop
        });
    }

    let name = child_name(job.name(), next);
    let child = Job::builder(JobKind::Service, &job.metadata.namespace, &name)
        .created_by(job.name())
        .component(Component::Sut)
        .spec(spec.template.clone())
        .build()?;
    match ctx.jobs.create(child).await {
        Ok(_) => tracing::info!(cluster = %job.metadata.key(), child = %name, missed = ?outcome.missed, "dispatch"),
        Err(StagehandError::AlreadyExists(_)) => tracing::info!(child = %name, "already dispatched"),
        Err(e) => return Err(e),
    }

    if let Some(schedule) = job.status.schedule.as_mut() {
        schedule.scheduled_jobs = next;
        schedule.last_schedule_time = Some(now);
    }
    if !has_until {
        let msg = format!("'{}/{}' jobs are scheduled", next + 1, spec.instances);
        job.status.lifecycle.pending(msg);
    }

    Ok(write_status(ctx, job)
        .await?
        .or(outcome.next_tick.map(|tick| Outcome::requeue_at(tick, now)))
        .unwrap_or(Outcome::Stop))
}

fn child_name(cluster: &str, index: i64) -> String {
    format!("{cluster}-{index}")
}

async fn on_failure(ctx: &Context, job: &mut Job, children: &Children) -> Result<Outcome> {
    tracing::error!(
        cluster = %job.metadata.key(),
        reason = %job.status.lifecycle.reason,
        message = %job.status.lifecycle.message,
        "!! cluster failed"
    );

    let state = &children.state;
    let mut victims = state.get_pending_jobs();
    victims.extend(state.get_running_jobs());
    victims.extend(state.get_successful_jobs());
    garbage_collect(ctx.jobs.as_ref(), &ctx.telemetry, &victims).await?;

    if job.metadata.annotation(ALERT_NAME).is_some() {
        release_alert(ctx.jobs.as_ref(), &ctx.telemetry, job).await;
        let status = job.status.clone();
        *job = ctx.jobs.get(&job.metadata.key()).await?;
        job.status = status;
    }

    job.suspend = true;
    write_and_stop(ctx, job).await
}
