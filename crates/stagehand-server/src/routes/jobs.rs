use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use stagehand_core::job::{Job, JobKind};
use stagehand_core::meta::ObjectKey;
use stagehand_core::types::Phase;

use crate::error::AppError;
use crate::state::AppState;

const STATUS_WRITE_ATTEMPTS: usize = 3;

/// Progress report from whatever runs a job outside the orchestrator.
#[derive(Debug, Deserialize)]
pub struct StatusReport {
    pub phase: Phase,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

fn detail(job: &Job) -> serde_json::Value {
    serde_json::json!({
        "name": job.metadata.name,
        "namespace": job.metadata.namespace,
        "kind": job.kind,
        "labels": job.metadata.labels,
        "annotations": job.metadata.annotations,
        "spec": job.spec,
        "suspend": job.suspend,
        "status": job.status,
    })
}

/// GET /api/jobs/{namespace}/{name}
pub async fn get_job(
    State(app): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let job = app.ctx.jobs.get(&ObjectKey::new(namespace, name)).await?;
    Ok(Json(detail(&job)))
}

/// POST /api/jobs/{namespace}/{name}/status — record a phase change.
///
/// Clusters and virtual jobs are driven by the orchestrator and refuse
/// outside reports.
pub async fn report_status(
    State(app): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(report): Json<StatusReport>,
) -> Result<Json<serde_json::Value>, AppError> {
    let key = ObjectKey::new(namespace, name);

    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut job = app.ctx.jobs.get(&key).await?;
        if matches!(job.kind, JobKind::Cluster | JobKind::Virtual) {
            return Err(AppError::bad_request(format!(
                "status of {} job '{}' is managed by the orchestrator",
                job.kind.as_str(),
                key
            )));
        }
        let lf = &mut job.status.lifecycle;
        lf.phase = report.phase;
        lf.reason = report.reason.clone();
        lf.message = report.message.clone();

        match app.ctx.jobs.update(job).await {
            Ok(updated) => {
                tracing::info!(job = %key, phase = report.phase.as_str(), "status reported");
                return Ok(Json(detail(&updated)));
            }
            Err(e) if e.is_conflict() && attempt < STATUS_WRITE_ATTEMPTS => {
                tracing::debug!(job = %key, attempt, "status write conflict, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
}
