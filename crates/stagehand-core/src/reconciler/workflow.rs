use super::dispatch::dispatch_action;
use super::{garbage_collect, populate, release_alert, Children, Outcome};
use crate::classifier::{Classifier, SystemState};
use crate::context::Context;
use crate::error::{Result, StagehandError};
use crate::expressions::{evaluate, set_alert, unset_alert, Verdict, ALERT_NAME};
use crate::graph::next_ready_actions;
use crate::meta::{labels, LabelSelector, ObjectKey};
use crate::types::{Component, ConditionType, Phase};
use crate::workflow::{Action, ActionKind, Workflow};
use chrono::Utc;
use std::collections::BTreeSet;

/// One pass over the workflow stored under `key`.
pub async fn reconcile_workflow(ctx: &Context, key: &ObjectKey) -> Result<Outcome> {
    let mut wf = match ctx.workflows.get(key).await {
        Ok(wf) => wf,
        Err(e) if e.is_not_found() => return Ok(Outcome::Stop),
        Err(e) => return Err(e),
    };

    tracing::debug!(
        workflow = %key,
        phase = %wf.status.lifecycle.phase,
        version = wf.metadata.resource_version,
        "-> Reconcile"
    );
    let outcome = reconcile(ctx, &mut wf).await;
    tracing::debug!(
        workflow = %key,
        phase = %wf.status.lifecycle.phase,
        version = wf.metadata.resource_version,
        ?outcome,
        "<- Reconcile"
    );
    outcome
}

async fn reconcile(ctx: &Context, wf: &mut Workflow) -> Result<Outcome> {
    let selector = LabelSelector::new().with(labels::WORKFLOW, wf.name());
    let children = populate(ctx.jobs.as_ref(), &wf.metadata.namespace, &selector).await?;

    let before = wf.status.lifecycle.clone();
    update_lifecycle(wf, &children.state)?;
    if !wf.status.lifecycle.same_state(&before) {
        tracing::info!(
            workflow = %wf.metadata.key(),
            from = %before.phase,
            to = %wf.status.lifecycle.phase,
            reason = %wf.status.lifecycle.reason,
            "lifecycle changed"
        );
        if let Some(outcome) = write_status(ctx, wf).await? {
            return Ok(outcome);
        }
    }

    if wf.spec.suspend {
        tracing::debug!(workflow = %wf.metadata.key(), "suspended");
        return Ok(Outcome::Stop);
    }

    match wf.status.lifecycle.phase {
        Phase::Success => {
            on_success(ctx, wf, &children).await?;
            Ok(Outcome::Stop)
        }
        Phase::Failed => on_failure(ctx, wf, &children).await,
        Phase::Running => Ok(Outcome::Stop),
        Phase::Uninitialized => initialize(ctx, wf).await,
        Phase::Pending => schedule_next(ctx, wf, &children.state).await,
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

fn update_lifecycle(wf: &mut Workflow, state: &Classifier) -> Result<()> {
    let total = expected_jobs(wf, state);
    let Workflow {
        metadata,
        spec,
        status,
    } = wf;

    let lf = &mut status.lifecycle;
    if lf
        .phase
        .is_any(&[Phase::Uninitialized, Phase::Success, Phase::Failed])
    {
        return Ok(());
    }

    if let SystemState::Abort(msg) = state.system_state() {
        lf.failed("SystemFailure", msg);
        return Ok(());
    }

    for name in &status.scheduled_jobs {
        let action = spec.actions.iter().find(|a| &a.name == name).ok_or_else(|| {
            StagehandError::Invariant(format!("scheduled action '{name}' is not in the workflow"))
        })?;
        let Some(assert) = action.assert.as_ref().filter(|a| !a.is_zero()) else {
            continue;
        };

        let verdict = match evaluate(assert, state, metadata) {
            Ok(verdict) => verdict,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => Verdict {
                holds: false,
                info: e.to_string(),
            },
        };
        if !verdict.holds {
            let msg = format!("AssertError for action '{}'. Info: {}", action.name, verdict.info);
            lf.set_condition(ConditionType::Assert, true, "AssertError", &msg);
            lf.failed("AssertError", msg);
            return Ok(());
        }
    }

    crate::lifecycle::grouped_jobs(total, state, lf, None);
    Ok(())
}

/// Jobs the workflow expects to see: one per SUT action, less those removed
/// by a delete action that has completed. SYS jobs are never counted.
fn expected_jobs(wf: &Workflow, state: &Classifier) -> usize {
    let removed: BTreeSet<&str> = wf
        .spec
        .actions
        .iter()
        .filter(|a| state.is_successful(&[&a.name]))
        .filter_map(|a| match &a.kind {
            ActionKind::Delete(spec) => Some(spec.jobs.iter().map(String::as_str)),
            _ => None,
        })
        .flatten()
        .collect();
    wf.spec
        .actions
        .iter()
        .filter(|a| a.kind.component() != Component::Sys)
        .filter(|a| !removed.contains(a.name.as_str()))
        .count()
}

/// Write `wf` back. A lost race yields the requeue to return.
async fn write_status(ctx: &Context, wf: &mut Workflow) -> Result<Option<Outcome>> {
    match ctx.workflows.update(wf.clone()).await {
        Ok(stored) => {
            *wf = stored;
            Ok(None)
        }
        Err(e) if e.is_conflict() => {
            tracing::debug!(workflow = %wf.metadata.key(), error = %e, "retry on conflict");
            Ok(Some(Outcome::RequeueAfter(ctx.config.reconcile.conflict_requeue())))
        }
        Err(e) => Err(e),
    }
}

async fn write_and_stop(ctx: &Context, wf: &mut Workflow) -> Result<Outcome> {
    Ok(write_status(ctx, wf).await?.unwrap_or(Outcome::Stop))
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

async fn initialize(ctx: &Context, wf: &mut Workflow) -> Result<Outcome> {
    let validated = wf.validate();
    let lf = &mut wf.status.lifecycle;
    match validated {
        Ok(()) => {
            lf.set_condition(ConditionType::Initialized, true, "Initialized", "workflow is valid");
            lf.pending("Workflow is ready to start running actions.");
        }
        Err(e) => {
            tracing::warn!(workflow = %wf.metadata.key(), error = %e, "invalid workflow");
            lf.failed("InvalidWorkflow", e.to_string());
        }
    }
    write_and_stop(ctx, wf).await
}

async fn schedule_next(ctx: &Context, wf: &mut Workflow, state: &Classifier) -> Result<Outcome> {
    if ctx.is_shutting_down() {
        tracing::debug!(workflow = %wf.metadata.key(), "shutting down, no new actions");
        return Ok(Outcome::Stop);
    }

    let now = Utc::now();
    let ready = match next_ready_actions(
        &wf.spec.actions,
        &wf.status.scheduled_jobs,
        state,
        wf.metadata.created_at(),
        now,
    ) {
        Ok(ready) => ready,
        Err(e) if e.is_scheduling_violation() => {
            wf.status.lifecycle.failed("SchedulingViolation", e.to_string());
            return write_and_stop(ctx, wf).await;
        }
        Err(e) => return Err(e),
    };

    let wait = ready.requeue_after;
    if ready.is_empty() {
        return Ok(wait.map_or(Outcome::Stop, Outcome::RequeueAfter));
    }
    let actions: Vec<Action> = ready.actions.into_iter().cloned().collect();

    if !bind_assertion_alerts(ctx, wf, &actions).await? {
        return write_and_stop(ctx, wf).await;
    }

    for action in &actions {
        let key = ObjectKey::new(&wf.metadata.namespace, &action.name);
        match ctx.jobs.get(&key).await {
            Ok(_) => tracing::info!(job = %key, "already dispatched"),
            Err(e) if e.is_not_found() => dispatch_action(ctx, wf, action, state).await?,
            Err(e) => return Err(e),
        }
        wf.status.scheduled_jobs.push(action.name.clone());
    }

    let scheduled = wf.status.scheduled_jobs.len();
    wf.status
        .lifecycle
        .pending(format!("Scheduled jobs: '{scheduled}'"));
    wf.status.last_schedule_time = Some(now);

    Ok(write_status(ctx, wf)
        .await?
        .or(wait.map(Outcome::RequeueAfter))
        .unwrap_or(Outcome::Stop))
}

/// Register the metrics assertions of `actions` against the workflow.
/// Returns false when the workflow was failed instead.
async fn bind_assertion_alerts(ctx: &Context, wf: &mut Workflow, actions: &[Action]) -> Result<bool> {
    let mut patched = false;
    for action in actions {
        let Some(metrics) = action
            .assert
            .as_ref()
            .and_then(|a| a.metrics.as_ref())
            .filter(|m| !m.is_empty())
        else {
            continue;
        };

        if let Err(e) = set_alert(&ctx.telemetry, ctx.workflows.as_ref(), &*wf, metrics).await {
            wf.status.lifecycle.failed(
                "AlertError",
                format!("cannot set alert for action '{}': {e}", action.name),
            );
            return Ok(false);
        }
        patched = true;
    }

    // the annotation patch moved the version on
    if patched {
        let status = wf.status.clone();
        *wf = ctx.workflows.get(&wf.metadata.key()).await?;
        wf.status = status;
    }
    Ok(true)
}

async fn on_success(ctx: &Context, wf: &Workflow, children: &Children) -> Result<()> {
    tracing::info!(
        workflow = %wf.metadata.key(),
        successful = ?children.state.list_successful_jobs(),
        "CleanOnSuccess"
    );

    release_workflow_alert(ctx, wf).await;
    // system jobs stay around for inspection until the workflow is deleted
    garbage_collect(
        ctx.jobs.as_ref(),
        &ctx.telemetry,
        &children.state.get_successful_jobs(),
    )
    .await
}

async fn on_failure(ctx: &Context, wf: &mut Workflow, children: &Children) -> Result<Outcome> {
    tracing::error!(
        workflow = %wf.metadata.key(),
        reason = %wf.status.lifecycle.reason,
        message = %wf.status.lifecycle.message,
        "!! workflow failed"
    );

    let state = &children.state;
    let mut victims = state.get_pending_jobs();
    victims.extend(state.get_running_jobs());
    garbage_collect(ctx.jobs.as_ref(), &ctx.telemetry, &victims).await?;

    // successful jobs are kept for postmortem, only their alerts go
    for job in state.get_successful_jobs() {
        if job.component() == Component::Sut {
            release_alert(ctx.jobs.as_ref(), &ctx.telemetry, job).await;
        }
    }

    if release_workflow_alert(ctx, wf).await {
        let status = wf.status.clone();
        *wf = ctx.workflows.get(&wf.metadata.key()).await?;
        wf.status = status;
    }

    wf.spec.suspend = true;
    tracing::info!(workflow = %wf.metadata.key(), reason = %wf.status.lifecycle.reason, "Suspended");
    write_and_stop(ctx, wf).await
}

/// Returns whether the workflow annotations were touched.
async fn release_workflow_alert(ctx: &Context, wf: &Workflow) -> bool {
    let key = wf.metadata.key();
    let patched = wf.metadata.annotation(ALERT_NAME).is_some();
    if patched {
        if let Err(e) = unset_alert(&ctx.telemetry, ctx.workflows.as_ref(), wf).await {
            tracing::warn!(workflow = %key, error = %e, "cannot unset alert");
        }
    }
    ctx.telemetry.forget(&key);
    patched
}

#[cfg(test)]
mod tests {
    use super::super::testing::{harness, harness_with, Harness};
    use super::*;
    use crate::exec::ScriptedExecutor;
    use crate::expressions::{dispatch_alert, AlertState, AlertWebhook, ConditionalExpr};
    use crate::job::{Job, JobKind};
    use crate::workflow::{CallSpec, ClusterSpec, DeleteSpec, MatchOutputs, ResourceTemplate, WaitSpec};
    use serde_json::json;
    use std::time::Duration;

    fn service(name: &str) -> Action {
        Action::new(
            name,
            ActionKind::Service(ResourceTemplate {
                component: Component::Sut,
                spec: json!({"image": format!("{name}:latest")}),
            }),
        )
    }

    fn after_success(action: Action, dep: &str) -> Action {
        action.depends(WaitSpec {
            success: vec![dep.to_string()],
            ..Default::default()
        })
    }

    fn after_running(action: Action, dep: &str) -> Action {
        action.depends(WaitSpec {
            running: vec![dep.to_string()],
            ..Default::default()
        })
    }

    async fn submit(h: &Harness, actions: Vec<Action>) -> ObjectKey {
        let wf = Workflow::new("ns", "wf", actions);
        h.ctx.workflows.create(wf).await.unwrap().metadata.key()
    }

    async fn pass(h: &Harness, key: &ObjectKey) -> Outcome {
        reconcile_workflow(&h.ctx, key).await.unwrap()
    }

    #[tokio::test]
    async fn missing_workflow_stops() {
        let h = harness();
        let outcome = pass(&h, &ObjectKey::new("ns", "ghost")).await;
        assert_eq!(outcome, Outcome::Stop);
    }

    #[tokio::test]
    async fn runs_dependent_actions_in_order() {
        let h = harness();
        let key = submit(&h, vec![service("server"), after_success(service("client"), "server")]).await;

        pass(&h, &key).await;
        let wf = h.workflow("wf").await;
        assert_eq!(wf.status.lifecycle.phase, Phase::Pending);
        assert!(wf.status.lifecycle.condition(ConditionType::Initialized).is_some());

        pass(&h, &key).await;
        let wf = h.workflow("wf").await;
        assert_eq!(wf.status.scheduled_jobs, vec!["server"]);
        assert_eq!(wf.status.lifecycle.message, "Scheduled jobs: '1'");
        let server = h.job("server").await;
        assert_eq!(server.kind, JobKind::Service);
        assert_eq!(server.metadata.workflow(), Some("wf"));
        assert_eq!(server.spec, json!({"image": "server:latest"}));

        // nothing new while the dependency is unmet
        h.set_phase("server", Phase::Running).await;
        let version = h.workflow("wf").await.metadata.resource_version;
        pass(&h, &key).await;
        pass(&h, &key).await;
        assert_eq!(h.workflow("wf").await.metadata.resource_version, version);
        assert!(!h.has_job("client").await);

        h.set_phase("server", Phase::Success).await;
        pass(&h, &key).await;
        assert_eq!(h.workflow("wf").await.status.scheduled_jobs, vec!["server", "client"]);

        h.set_phase("client", Phase::Success).await;
        pass(&h, &key).await;
        let wf = h.workflow("wf").await;
        assert_eq!(wf.status.lifecycle.phase, Phase::Success);
        assert_eq!(wf.status.lifecycle.reason, "AllJobsAreSuccessful");
        assert!(!h.has_job("server").await);
        assert!(!h.has_job("client").await);
    }

    #[tokio::test]
    async fn invalid_workflow_fails_and_suspends() {
        let h = harness();
        let key = submit(&h, vec![after_success(service("a"), "nope")]).await;

        pass(&h, &key).await;
        let wf = h.workflow("wf").await;
        assert_eq!(wf.status.lifecycle.phase, Phase::Failed);
        assert_eq!(wf.status.lifecycle.reason, "InvalidWorkflow");

        pass(&h, &key).await;
        assert!(h.workflow("wf").await.spec.suspend);
        assert_eq!(pass(&h, &key).await, Outcome::Stop);
    }

    #[tokio::test]
    async fn failed_job_tears_down_sut_but_keeps_system() {
        let h = harness();
        let mut prometheus = service("prometheus");
        if let ActionKind::Service(t) = &mut prometheus.kind {
            t.component = Component::Sys;
        }
        let key = submit(&h, vec![prometheus, service("server"), service("client")]).await;
        pass(&h, &key).await;
        pass(&h, &key).await;

        h.set_phase("prometheus", Phase::Running).await;
        h.set_phase("server", Phase::Running).await;
        h.set_phase("client", Phase::Failed).await;
        pass(&h, &key).await;

        let wf = h.workflow("wf").await;
        assert_eq!(wf.status.lifecycle.phase, Phase::Failed);
        assert_eq!(wf.status.lifecycle.reason, "AtLeastOneJobHasFailed");
        assert!(wf.spec.suspend);
        assert!(!h.has_job("server").await);
        assert!(h.has_job("client").await);
        assert!(h.has_job("prometheus").await);
    }

    #[tokio::test]
    async fn system_jobs_do_not_hold_back_success() {
        let h = harness();
        let mut prometheus = service("prometheus");
        if let ActionKind::Service(t) = &mut prometheus.kind {
            t.component = Component::Sys;
        }
        let key = submit(&h, vec![prometheus, service("server")]).await;
        pass(&h, &key).await;
        pass(&h, &key).await;

        h.set_phase("prometheus", Phase::Running).await;
        h.set_phase("server", Phase::Success).await;
        for _ in 0..3 {
            pass(&h, &key).await;
        }

        let wf = h.workflow("wf").await;
        assert_eq!(wf.status.lifecycle.phase, Phase::Success);
        assert!(h.has_job("prometheus").await);
    }

    #[tokio::test]
    async fn failing_state_assertion_fails_workflow() {
        let h = harness();
        let key = submit(
            &h,
            vec![
                service("server"),
                service("client").assert(ConditionalExpr::state(r#"{{.IsFailed "server"}} == false"#)),
            ],
        )
        .await;
        pass(&h, &key).await;
        pass(&h, &key).await;

        h.set_phase("client", Phase::Running).await;
        h.set_phase("server", Phase::Failed).await;
        pass(&h, &key).await;

        let wf = h.workflow("wf").await;
        assert_eq!(wf.status.lifecycle.phase, Phase::Failed);
        assert_eq!(wf.status.lifecycle.reason, "AssertError");
        assert!(wf
            .status
            .lifecycle
            .message
            .starts_with("AssertError for action 'client'. Info:"));
        assert!(wf.status.lifecycle.condition(ConditionType::Assert).is_some());
    }

    #[tokio::test]
    async fn metrics_assertion_follows_alert_webhook() {
        let h = harness();
        let expr = "avg() of query(board/1/bitrate, 5m, now) is below(10)";
        let key = submit(&h, vec![service("server").assert(ConditionalExpr::metrics(expr))]).await;
        pass(&h, &key).await;
        pass(&h, &key).await;

        assert_eq!(h.registry.rule_names(), vec!["ns/Workflow/wf"]);
        let wf = h.workflow("wf").await;
        assert_eq!(wf.metadata.annotation(ALERT_NAME), Some("ns/Workflow/wf"));
        assert_eq!(wf.status.scheduled_jobs, vec!["server"]);

        h.set_phase("server", Phase::Running).await;
        pass(&h, &key).await;
        assert_eq!(h.workflow("wf").await.status.lifecycle.phase, Phase::Running);

        let body = AlertWebhook {
            title: "[Alerting] bitrate".into(),
            rule_id: 1,
            rule_name: "ns/Workflow/wf".into(),
            rule_url: String::new(),
            state: AlertState::Alerting,
            message: "bitrate dropped".into(),
            eval_matches: Vec::new(),
            image_url: None,
            tags: Default::default(),
        };
        dispatch_alert(&body, h.ctx.jobs.as_ref(), h.ctx.workflows.as_ref(), Utc::now())
            .await
            .unwrap();

        pass(&h, &key).await;
        let wf = h.workflow("wf").await;
        assert_eq!(wf.status.lifecycle.reason, "AssertError");

        pass(&h, &key).await;
        let wf = h.workflow("wf").await;
        assert!(wf.spec.suspend);
        assert!(wf.metadata.annotation(ALERT_NAME).is_none());
        assert!(h.registry.rule_names().is_empty());
    }

    #[tokio::test]
    async fn delete_action_removes_target() {
        let h = harness();
        let key = submit(
            &h,
            vec![
                service("server"),
                after_running(
                    Action::new(
                        "kill",
                        ActionKind::Delete(DeleteSpec {
                            jobs: vec!["server".into()],
                        }),
                    ),
                    "server",
                ),
            ],
        )
        .await;
        pass(&h, &key).await;
        pass(&h, &key).await;

        h.set_phase("server", Phase::Running).await;
        pass(&h, &key).await;

        assert!(!h.has_job("server").await);
        let kill = h.job("kill").await;
        assert_eq!(kill.kind, JobKind::Virtual);
        assert_eq!(kill.phase(), Phase::Success);

        pass(&h, &key).await;
        assert_eq!(h.workflow("wf").await.status.lifecycle.phase, Phase::Success);
    }

    #[tokio::test]
    async fn delete_of_completed_job_fails_virtual_job() {
        let h = harness();
        let key = submit(
            &h,
            vec![
                service("server"),
                after_success(
                    Action::new(
                        "kill",
                        ActionKind::Delete(DeleteSpec {
                            jobs: vec!["server".into()],
                        }),
                    ),
                    "server",
                ),
            ],
        )
        .await;
        pass(&h, &key).await;
        pass(&h, &key).await;
        h.set_phase("server", Phase::Success).await;
        pass(&h, &key).await;

        let kill = h.job("kill").await;
        assert_eq!(kill.phase(), Phase::Failed);
        assert!(kill
            .status
            .lifecycle
            .message
            .contains("referenced job 'server' is not currently deletable"));

        pass(&h, &key).await;
        assert_eq!(h.workflow("wf").await.status.lifecycle.phase, Phase::Failed);
    }

    #[tokio::test]
    async fn call_action_stores_outputs() {
        let h = harness_with(ScriptedExecutor::new().reply("server", "pong\n", ""));
        let key = submit(
            &h,
            vec![Action::new(
                "ping",
                ActionKind::Call(CallSpec {
                    callable: "ping".into(),
                    services: vec!["server".into()],
                    expect: vec![MatchOutputs {
                        stdout: Some("^pong".into()),
                        stderr: None,
                    }],
                }),
            )],
        )
        .await;
        pass(&h, &key).await;
        pass(&h, &key).await;

        let job = h.job("ping").await;
        assert_eq!(job.phase(), Phase::Success);
        assert_eq!(job.status.data.get("server.stdout").map(String::as_str), Some("pong\n"));
        assert_eq!(
            job.status.lifecycle.message,
            "Job completed. <StoredData>: '[server.stderr server.stdout]'"
        );
    }

    #[tokio::test]
    async fn call_output_mismatch_fails_job() {
        let h = harness_with(ScriptedExecutor::new().reply("server", "error", ""));
        let key = submit(
            &h,
            vec![Action::new(
                "ping",
                ActionKind::Call(CallSpec {
                    callable: "ping".into(),
                    services: vec!["server".into()],
                    expect: vec![MatchOutputs {
                        stdout: Some("^pong".into()),
                        stderr: None,
                    }],
                }),
            )],
        )
        .await;
        pass(&h, &key).await;
        pass(&h, &key).await;
        assert_eq!(h.job("ping").await.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn cluster_action_creates_cluster_job() {
        let h = harness();
        let spec = ClusterSpec {
            template: json!({"image": "worker"}),
            instances: 3,
            schedule: None,
            tolerate: None,
            until: None,
        };
        let key = submit(&h, vec![Action::new("workers", ActionKind::Cluster(spec.clone()))]).await;
        pass(&h, &key).await;
        pass(&h, &key).await;

        let job = h.job("workers").await;
        assert_eq!(job.kind, JobKind::Cluster);
        assert_eq!(job.typed_spec::<ClusterSpec>().unwrap(), spec);
    }

    #[tokio::test]
    async fn running_dependency_on_finished_job_is_a_violation() {
        let h = harness();
        let key = submit(&h, vec![service("server"), after_running(service("client"), "server")]).await;
        pass(&h, &key).await;
        pass(&h, &key).await;

        h.set_phase("server", Phase::Success).await;
        pass(&h, &key).await;
        let wf = h.workflow("wf").await;
        assert_eq!(wf.status.lifecycle.phase, Phase::Failed);
        assert_eq!(wf.status.lifecycle.reason, "SchedulingViolation");
    }

    #[tokio::test]
    async fn timed_dependency_requeues() {
        let h = harness();
        let key = submit(
            &h,
            vec![service("late").depends(WaitSpec {
                after: Some(3600),
                ..Default::default()
            })],
        )
        .await;
        pass(&h, &key).await;
        match pass(&h, &key).await {
            Outcome::RequeueAfter(wait) => assert!(wait > Duration::from_secs(3500)),
            other => panic!("expected requeue, got {other:?}"),
        }
        assert!(!h.has_job("late").await);
    }

    #[tokio::test]
    async fn shutdown_stops_new_dispatches() {
        let h = harness();
        let key = submit(&h, vec![service("server")]).await;
        pass(&h, &key).await;

        h.shutdown.send(true).unwrap();
        assert_eq!(pass(&h, &key).await, Outcome::Stop);
        assert!(!h.has_job("server").await);
    }

    #[tokio::test]
    async fn existing_job_is_adopted_not_recreated() {
        let h = harness();
        let key = submit(&h, vec![service("server")]).await;
        pass(&h, &key).await;

        let orphan = Job::builder(JobKind::Service, "ns", "server")
            .workflow("wf")
            .action("server")
            .build()
            .unwrap();
        h.ctx.jobs.create(orphan).await.unwrap();

        pass(&h, &key).await;
        assert_eq!(h.workflow("wf").await.status.scheduled_jobs, vec!["server"]);
        assert_eq!(h.job("server").await.spec, serde_json::Value::Null);
    }
}
