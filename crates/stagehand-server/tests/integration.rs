use axum::http::StatusCode;
use http_body_util::BodyExt;
use stagehand_core::config::{ExecutionMode, OrchestratorConfig, RetryPolicy};
use stagehand_core::context::Context;
use stagehand_core::exec::{RemoteExecutor, ScriptedExecutor};
use stagehand_core::expressions::ALERT_STATE;
use stagehand_core::job::{Job, JobKind};
use stagehand_core::meta::ObjectKey;
use stagehand_core::store::InMemoryStore;
use stagehand_core::telemetry::{AlertRegistry, RecordingRegistry, TelemetryClients};
use stagehand_core::workflow::Workflow;
use stagehand_server::controller::{Controller, WorkQueue};
use stagehand_server::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct TestApp {
    state: AppState,
    shutdown: watch::Sender<bool>,
}

impl TestApp {
    fn new() -> Self {
        let mut config = OrchestratorConfig::default();
        config.namespace = "lab".into();
        config.reconcile.conflict_requeue_ms = 10;
        config.virtual_exec.mode = ExecutionMode::Inline;
        config.virtual_exec.retry = RetryPolicy {
            initial_backoff_ms: 1,
            factor: 1.0,
            steps: 3,
        };
        let (shutdown, rx) = watch::channel(false);
        let registry: Arc<dyn AlertRegistry> = Arc::new(RecordingRegistry::new());
        let ctx = Context::new(
            config,
            InMemoryStore::<Job>::new_arc(),
            InMemoryStore::<Workflow>::new_arc(),
            TelemetryClients::new(Some(registry)),
            Arc::new(ScriptedExecutor::new()) as Arc<dyn RemoteExecutor>,
            rx,
        );
        Self {
            state: AppState::new(Arc::new(ctx), WorkQueue::new()),
            shutdown,
        }
    }

    fn router(&self) -> axum::Router {
        stagehand_server::build_router(self.state.clone())
    }

    fn spawn_controller(&self) -> tokio::task::JoinHandle<stagehand_core::Result<()>> {
        let controller = Controller::new(self.state.ctx.clone(), self.state.queue.clone());
        tokio::spawn(controller.run())
    }
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a POST request with a JSON body via `oneshot` and return (status, parsed JSON body).
async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Poll `uri` until `field` equals `want`, or panic after a few seconds.
async fn wait_for(app: &axum::Router, uri: &str, field: &str, want: &str) -> serde_json::Value {
    for _ in 0..300 {
        let (status, json) = get(app.clone(), uri).await;
        if status == StatusCode::OK && json[field] == want {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (_, last) = get(app.clone(), uri).await;
    panic!("{uri}: {field} never became {want}, last seen {last}");
}

fn two_step_workflow(name: &str) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "name": name, "namespace": "lab" },
        "spec": {
            "actions": [
                { "name": "server", "action": "service", "spec": { "image": "iperf" } },
                {
                    "name": "client",
                    "action": "service",
                    "spec": { "image": "iperf" },
                    "depends": { "success": ["server"] }
                }
            ]
        }
    })
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn healthz_reports_ok() {
    let app = TestApp::new();
    let (status, json) = get(app.router(), "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_workflow_is_404() {
    let app = TestApp::new();
    let (status, json) = get(app.router(), "/api/workflows/lab/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn submitted_workflow_is_stored_and_queued() {
    let app = TestApp::new();
    let (status, json) = post_json(app.router(), "/api/workflows", two_step_workflow("bitrate")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["name"], "bitrate");
    assert_eq!(json["phase"], "Uninitialized");
    assert_eq!(app.state.queue.len(), 1);

    let (status, json) = get(app.router(), "/api/workflows/lab/bitrate").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["namespace"], "lab");

    let (status, list) = get(app.router(), "/api/workflows/lab").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn duplicate_workflow_is_409() {
    let app = TestApp::new();
    let (status, _) = post_json(app.router(), "/api/workflows", two_step_workflow("wf")).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = post_json(app.router(), "/api/workflows", two_step_workflow("wf")).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn invalid_workflow_is_400() {
    let app = TestApp::new();
    let body = serde_json::json!({
        "metadata": { "name": "broken", "namespace": "lab" },
        "spec": {
            "actions": [
                {
                    "name": "client",
                    "action": "service",
                    "depends": { "success": ["ghost"] }
                }
            ]
        }
    });
    let (status, _) = post_json(app.router(), "/api/workflows", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(app.router(), "/api/workflows/lab/broken").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn foreign_alert_is_acknowledged() {
    let app = TestApp::new();
    let body = serde_json::json!({
        "ruleName": "cpu is on fire",
        "state": "alerting",
        "message": "not ours"
    });
    let (status, json) = post_json(app.router(), "/alerts", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn alert_annotates_the_bound_workflow() {
    let app = TestApp::new();
    let (status, _) = post_json(app.router(), "/api/workflows", two_step_workflow("wf")).await;
    assert_eq!(status, StatusCode::CREATED);

    let body = serde_json::json!({
        "ruleName": "lab/Workflow/wf",
        "state": "alerting",
        "evalMatches": [{ "value": 97.0, "metric": "cpu" }]
    });
    let (status, json) = post_json(app.router(), "/alerts", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");

    let wf = app
        .state
        .ctx
        .workflows
        .get(&ObjectKey::new("lab", "wf"))
        .await
        .unwrap();
    assert_eq!(wf.metadata.annotation(ALERT_STATE), Some("alerting"));
}

#[tokio::test]
async fn alert_for_vanished_object_is_404() {
    let app = TestApp::new();
    let body = serde_json::json!({ "ruleName": "lab/Workflow/gone", "state": "ok" });
    let (status, _) = post_json(app.router(), "/alerts", body).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_report_updates_job_phase() {
    let app = TestApp::new();
    let job = Job::builder(JobKind::Service, "lab", "server").build().unwrap();
    app.state.ctx.jobs.create(job).await.unwrap();

    let body = serde_json::json!({ "phase": "Running", "reason": "Started" });
    let (status, json) = post_json(app.router(), "/api/jobs/lab/server/status", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"]["phase"], "Running");

    let (_, json) = get(app.router(), "/api/jobs/lab/server").await;
    assert_eq!(json["status"]["reason"], "Started");
}

#[tokio::test]
async fn status_report_refuses_managed_kinds() {
    let app = TestApp::new();
    let job = Job::builder(JobKind::Cluster, "lab", "workers").build().unwrap();
    app.state.ctx.jobs.create(job).await.unwrap();

    let body = serde_json::json!({ "phase": "Success" });
    let (status, _) = post_json(app.router(), "/api/jobs/lab/workers/status", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn controller_drives_workflow_to_success() {
    let app = TestApp::new();
    let controller = app.spawn_controller();
    let router = app.router();

    let (status, _) = post_json(router.clone(), "/api/workflows", two_step_workflow("e2e")).await;
    assert_eq!(status, StatusCode::CREATED);

    wait_for(&router, "/api/jobs/lab/server", "name", "server").await;
    let (status, _) = get(router.clone(), "/api/jobs/lab/client").await;
    assert_eq!(status, StatusCode::NOT_FOUND, "client depends on server success");

    let done = serde_json::json!({ "phase": "Success" });
    let (status, _) = post_json(router.clone(), "/api/jobs/lab/server/status", done.clone()).await;
    assert_eq!(status, StatusCode::OK);

    wait_for(&router, "/api/jobs/lab/client", "name", "client").await;
    let (status, _) = post_json(router.clone(), "/api/jobs/lab/client/status", done).await;
    assert_eq!(status, StatusCode::OK);

    let wf = wait_for(&router, "/api/workflows/lab/e2e", "phase", "Success").await;
    assert_eq!(wf["scheduledJobs"], serde_json::json!(["server", "client"]));

    app.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), controller)
        .await
        .expect("controller stops on shutdown")
        .unwrap()
        .unwrap();
}
