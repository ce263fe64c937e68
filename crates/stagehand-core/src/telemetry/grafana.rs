use super::{AlertRegistry, RuleHandle};
use crate::config::{RetryPolicy, TelemetryConfig};
use crate::error::{Result, StagehandError};
use crate::expressions::AlertRule;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Registers legacy dashboard alerts through the Grafana HTTP API.
///
/// A rule is attached to the panel its query points at; the panel must not
/// already carry an alert. Alerts are routed to the default notification
/// channel, which is expected to point at the orchestrator's webhook.
pub struct GrafanaClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
    handles: Mutex<HashMap<String, RuleHandle>>,
}

impl GrafanaClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            retry,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Build from config. `None` when no Grafana URL is configured.
    pub fn from_config(cfg: &TelemetryConfig) -> Result<Option<Self>> {
        match cfg.grafana_url.as_deref() {
            Some(url) => Ok(Some(Self::new(
                url,
                cfg.api_key.clone(),
                Duration::from_secs(cfg.timeout_secs),
                cfg.retry.clone(),
            )?)),
            None => Ok(None),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Send with bounded retries on transport errors. HTTP error statuses are
    /// returned as they are.
    async fn send(&self, build: impl Fn() -> reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt + 1 < self.retry.steps && (e.is_connect() || e.is_timeout()) => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(error = %e, attempt, ?delay, "grafana unreachable, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn get_dashboard(&self, uid: &str) -> Result<Value> {
        let path = format!("/api/dashboards/uid/{uid}");
        let resp = self.send(|| self.request(reqwest::Method::GET, &path)).await?;
        if !resp.status().is_success() {
            return Err(StagehandError::Telemetry(format!(
                "cannot retrieve dashboard {uid}: HTTP {}",
                resp.status()
            )));
        }
        let mut body: Value = resp.json().await?;
        Ok(body
            .get_mut("dashboard")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    async fn save_dashboard(&self, dashboard: &Value) -> Result<()> {
        let body = json!({ "dashboard": dashboard, "overwrite": true });
        let resp = self
            .send(|| self.request(reqwest::Method::POST, "/api/dashboards/db").json(&body))
            .await?;
        if !resp.status().is_success() {
            return Err(StagehandError::Telemetry(format!(
                "cannot save dashboard: HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

fn panel_mut(dashboard: &mut Value, panel_id: u64) -> Option<&mut Value> {
    dashboard
        .get_mut("panels")?
        .as_array_mut()?
        .iter_mut()
        .find(|p| p.get("id").and_then(Value::as_u64) == Some(panel_id))
}

fn alert_body(rule: &AlertRule, name: &str, message: &str) -> Value {
    json!({
        "name": name,
        "message": message,
        "conditions": [{
            "type": "query",
            "evaluator": { "type": rule.evaluator.as_str(), "params": rule.params },
            "operator": { "type": "and" },
            "query": { "params": [rule.metric, rule.from, rule.to] },
            "reducer": { "type": rule.reducer, "params": [] },
        }],
        "executionErrorState": "keep_state",
        "noDataState": "no_data",
        "handler": 1,
        "frequency": rule.frequency,
        "for": rule.pending_for,
    })
}

#[async_trait]
impl AlertRegistry for GrafanaClient {
    async fn register_rule(&self, rule: &AlertRule, name: &str, message: &str) -> Result<RuleHandle> {
        let mut dashboard = self.get_dashboard(&rule.dashboard_uid).await?;

        let panel = panel_mut(&mut dashboard, rule.panel_id).ok_or_else(|| {
            StagehandError::Telemetry(format!(
                "dashboard {} has no panel {}",
                rule.dashboard_uid, rule.panel_id
            ))
        })?;
        if let Some(existing) = panel.get("alert") {
            let existing = existing.get("name").and_then(Value::as_str).unwrap_or("?");
            return Err(StagehandError::Telemetry(format!(
                "alert [{existing}] has already been set for this panel"
            )));
        }
        if let Some(obj) = panel.as_object_mut() {
            obj.insert("alert".to_string(), alert_body(rule, name, message));
        }

        self.save_dashboard(&dashboard).await?;

        let handle = RuleHandle {
            name: name.to_string(),
            dashboard_uid: rule.dashboard_uid.clone(),
            panel_id: rule.panel_id,
        };
        if let Ok(mut handles) = self.handles.lock() {
            handles.insert(name.to_string(), handle.clone());
        }
        tracing::info!(rule = name, dashboard = %rule.dashboard_uid, panel = rule.panel_id, "alert registered");
        Ok(handle)
    }

    async fn unregister_rule(&self, name: &str) -> Result<()> {
        let handle = self
            .handles
            .lock()
            .ok()
            .and_then(|mut handles| handles.remove(name));
        let Some(handle) = handle else {
            tracing::debug!(rule = name, "no alert to remove");
            return Ok(());
        };

        let mut dashboard = self.get_dashboard(&handle.dashboard_uid).await?;
        let removed = panel_mut(&mut dashboard, handle.panel_id)
            .and_then(Value::as_object_mut)
            .and_then(|panel| panel.remove("alert"))
            .is_some();
        if removed {
            self.save_dashboard(&dashboard).await?;
            tracing::info!(rule = name, "alert removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn rule() -> AlertRule {
        AlertRule::parse("avg() of query(board1/2/bitrate, 15m, now) is below(14)").unwrap()
    }

    fn client(url: &str) -> GrafanaClient {
        GrafanaClient::new(url, Some("token".into()), Duration::from_secs(5), RetryPolicy::default()).unwrap()
    }

    fn dashboard(with_alert: bool) -> String {
        let mut panel = json!({"id": 2, "title": "bitrate"});
        if with_alert {
            panel["alert"] = json!({"name": "someone-else"});
        }
        json!({"dashboard": {"uid": "board1", "panels": [{"id": 1}, panel]}, "meta": {}}).to_string()
    }

    #[tokio::test]
    async fn register_attaches_alert_to_panel() {
        let mut server = mockito::Server::new_async().await;
        let get = server
            .mock("GET", "/api/dashboards/uid/board1")
            .match_header("authorization", "Bearer token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(dashboard(false))
            .create_async()
            .await;
        let post = server
            .mock("POST", "/api/dashboards/db")
            .match_body(Matcher::PartialJson(json!({
                "overwrite": true,
                "dashboard": {"panels": [{"id": 1}, {"id": 2, "alert": {"name": "ns/Workflow/wf", "frequency": "1m"}}]}
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let c = client(&server.url());
        let handle = c.register_rule(&rule(), "ns/Workflow/wf", "assertion").await.unwrap();
        assert_eq!(handle.dashboard_uid, "board1");
        assert_eq!(handle.panel_id, 2);

        get.assert_async().await;
        post.assert_async().await;
    }

    #[tokio::test]
    async fn register_refuses_occupied_panel() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/dashboards/uid/board1")
            .with_status(200)
            .with_body(dashboard(true))
            .create_async()
            .await;

        let err = client(&server.url())
            .register_rule(&rule(), "ns/Workflow/wf", "")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("someone-else"));
    }

    #[tokio::test]
    async fn missing_dashboard_is_telemetry_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/dashboards/uid/board1")
            .with_status(404)
            .create_async()
            .await;

        let err = client(&server.url())
            .register_rule(&rule(), "ns/Workflow/wf", "")
            .await
            .unwrap_err();
        assert!(matches!(err, StagehandError::Telemetry(_)));
    }

    #[tokio::test]
    async fn unregister_unknown_rule_is_noop() {
        let server = mockito::Server::new_async().await;
        client(&server.url()).unregister_rule("ns/Workflow/nope").await.unwrap();
    }
}
