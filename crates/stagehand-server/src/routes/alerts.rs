use axum::extract::State;
use axum::Json;
use stagehand_core::expressions::{dispatch_alert, AlertWebhook, DispatchOutcome};

use crate::error::AppError;
use crate::state::AppState;

/// POST /alerts — Grafana notification channel target.
///
/// Rules that do not name a managed object are acknowledged and dropped so
/// that Grafana stops retrying them.
pub async fn receive_alert(
    State(app): State<AppState>,
    Json(body): Json<AlertWebhook>,
) -> Result<Json<serde_json::Value>, AppError> {
    let outcome = dispatch_alert(
        &body,
        app.ctx.jobs.as_ref(),
        app.ctx.workflows.as_ref(),
        chrono::Utc::now(),
    )
    .await?;

    let detail = match outcome {
        DispatchOutcome::Applied(key) => format!("annotated {key}"),
        DispatchOutcome::Ignored(why) => format!("ignored: {why}"),
    };
    Ok(Json(serde_json::json!({ "status": "ok", "detail": detail })))
}
