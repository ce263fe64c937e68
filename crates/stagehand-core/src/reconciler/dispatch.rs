use super::delete_job;
use crate::classifier::Classifier;
use crate::context::Context;
use crate::error::Result;
use crate::job::{Job, JobKind};
use crate::meta::ObjectKey;
use crate::types::Component;
use crate::vexec::VExecData;
use crate::workflow::{Action, ActionKind, CallSpec, DeleteSpec, ResourceTemplate, Workflow};
use regex::Regex;

/// Start `action` on behalf of `wf`. The caller records it as scheduled.
pub(crate) async fn dispatch_action(ctx: &Context, wf: &Workflow, action: &Action, state: &Classifier) -> Result<()> {
    tracing::info!(workflow = %wf.metadata.key(), action = %action.name, kind = action.kind.as_str(), "dispatch");

    match &action.kind {
        ActionKind::Service(template) => create_child(ctx, wf, action, JobKind::Service, template).await,
        ActionKind::Chaos(template) => create_child(ctx, wf, action, JobKind::Chaos, template).await,
        ActionKind::Cascade(template) => create_child(ctx, wf, action, JobKind::Cascade, template).await,
        ActionKind::Cluster(spec) => {
            let job = Job::builder(JobKind::Cluster, &wf.metadata.namespace, &action.name)
                .workflow(wf.name())
                .action(&action.name)
                .component(Component::Sut)
                .spec(serde_json::to_value(spec)?)
                .build()?;
            ctx.jobs.create(job).await?;
            Ok(())
        }
        ActionKind::Delete(spec) => run_delete(ctx, wf, action, spec, state).await,
        ActionKind::Call(spec) => run_call(ctx, wf, action, spec).await,
    }
}

async fn create_child(
    ctx: &Context,
    wf: &Workflow,
    action: &Action,
    kind: JobKind,
    template: &ResourceTemplate,
) -> Result<()> {
    let job = Job::builder(kind, &wf.metadata.namespace, &action.name)
        .workflow(wf.name())
        .action(&action.name)
        .component(template.component)
        .spec(template.spec.clone())
        .build()?;
    ctx.jobs.create(job).await?;
    Ok(())
}

/// Deletability is decided now, against the snapshot that cleared the
/// action for dispatch. The deletions themselves run in the callback.
async fn run_delete(
    ctx: &Context,
    wf: &Workflow,
    action: &Action,
    spec: &DeleteSpec,
    state: &Classifier,
) -> Result<()> {
    let mut targets: Vec<ObjectKey> = Vec::with_capacity(spec.jobs.len());
    let mut blocked = None;
    for name in &spec.jobs {
        match state.get_deletable(name) {
            Some(job) => targets.push(job.metadata.key()),
            None => {
                blocked = Some(name.clone());
                break;
            }
        }
    }

    let jobs = ctx.jobs.clone();
    let task = ctx
        .vexec
        .run_virtual(wf, &action.name, move || async move {
            if let Some(name) = blocked {
                anyhow::bail!("referenced job '{name}' is not currently deletable");
            }
            for key in &targets {
                delete_job(jobs.as_ref(), key).await?;
            }
            Ok(VExecData::new())
        })
        .await?;
    tracing::debug!(job = task.name(), finished = task.is_finished(), "delete started");
    Ok(())
}

/// Outputs land in the virtual job's data as `<service>.stdout` and
/// `<service>.stderr`.
async fn run_call(ctx: &Context, wf: &Workflow, action: &Action, spec: &CallSpec) -> Result<()> {
    let executor = ctx.executor.clone();
    let namespace = wf.metadata.namespace.clone();
    let spec = spec.clone();

    let task = ctx
        .vexec
        .run_virtual(wf, &action.name, move || async move {
            let mut data = VExecData::new();
            for (i, service) in spec.services.iter().enumerate() {
                let out = executor.exec(&namespace, service, &spec.callable).await?;
                if let Some(expect) = spec.expect.get(i) {
                    expect_match(service, "stdout", expect.stdout.as_deref(), &out.stdout)?;
                    expect_match(service, "stderr", expect.stderr.as_deref(), &out.stderr)?;
                }
                data.insert(format!("{service}.stdout"), out.stdout);
                data.insert(format!("{service}.stderr"), out.stderr);
            }
            Ok(data)
        })
        .await?;
    tracing::debug!(job = task.name(), finished = task.is_finished(), "call started");
    Ok(())
}

fn expect_match(service: &str, stream: &str, pattern: Option<&str>, output: &str) -> anyhow::Result<()> {
    let Some(pattern) = pattern else {
        return Ok(());
    };
    let re = Regex::new(pattern)?;
    if !re.is_match(output) {
        anyhow::bail!(
            "{stream} of '{service}' does not match '{pattern}': '{}'",
            output.trim()
        );
    }
    Ok(())
}
