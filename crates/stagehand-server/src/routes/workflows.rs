use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use stagehand_core::meta::{labels, LabelSelector, ObjectKey};
use stagehand_core::workflow::{Workflow, WorkflowStatus};

use crate::error::AppError;
use crate::state::AppState;

fn summary(wf: &Workflow) -> serde_json::Value {
    let lf = &wf.status.lifecycle;
    serde_json::json!({
        "name": wf.metadata.name,
        "namespace": wf.metadata.namespace,
        "phase": lf.phase,
        "reason": lf.reason,
        "message": lf.message,
        "conditions": lf.conditions,
        "suspend": wf.spec.suspend,
        "scheduledJobs": wf.status.scheduled_jobs,
        "lastScheduleTime": wf.status.last_schedule_time,
    })
}

/// GET /api/workflows/{namespace} — every workflow in a namespace.
pub async fn list_workflows(
    State(app): State<AppState>,
    Path(namespace): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let workflows = app.ctx.workflows.list(&namespace, &LabelSelector::new()).await?;
    let list: Vec<serde_json::Value> = workflows.iter().map(summary).collect();
    Ok(Json(serde_json::json!(list)))
}

/// GET /api/workflows/{namespace}/{name}
pub async fn get_workflow(
    State(app): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let wf = app.ctx.workflows.get(&ObjectKey::new(namespace, name)).await?;
    Ok(Json(summary(&wf)))
}

/// GET /api/workflows/{namespace}/{name}/jobs — jobs the workflow owns.
pub async fn list_workflow_jobs(
    State(app): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let selector = LabelSelector::new().with(labels::WORKFLOW, &name);
    let jobs = app.ctx.jobs.list(&namespace, &selector).await?;
    let list: Vec<serde_json::Value> = jobs
        .iter()
        .map(|j| {
            serde_json::json!({
                "name": j.metadata.name,
                "kind": j.kind,
                "component": j.component().as_str(),
                "phase": j.phase(),
                "reason": j.status.lifecycle.reason,
                "message": j.status.lifecycle.message,
                "data": j.status.data,
            })
        })
        .collect();
    Ok(Json(serde_json::json!(list)))
}

/// POST /api/workflows — submit a workflow.
///
/// Structural problems are rejected here instead of surfacing later as a
/// failed workflow. Any submitted status is discarded.
pub async fn create_workflow(
    State(app): State<AppState>,
    Json(mut wf): Json<Workflow>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if wf.metadata.name.is_empty() {
        return Err(AppError::bad_request("metadata.name is required"));
    }
    wf.validate()?;
    wf.status = WorkflowStatus::default();
    wf.metadata.resource_version = 0;

    let created = app.ctx.workflows.create(wf).await?;
    let key = created.metadata.key();
    tracing::info!(workflow = %key, actions = created.spec.actions.len(), "workflow submitted");
    app.poke_workflow(key);

    Ok((StatusCode::CREATED, Json(summary(&created))))
}

/// DELETE /api/workflows/{namespace}/{name}
///
/// Jobs the workflow created are left to the caller.
pub async fn delete_workflow(
    State(app): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    app.ctx.workflows.delete(&ObjectKey::new(namespace, name)).await?;
    Ok(StatusCode::NO_CONTENT)
}
