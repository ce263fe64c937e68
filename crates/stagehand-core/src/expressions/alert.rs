use super::ExprMetrics;
use crate::error::{Result, StagehandError};
use crate::job::Job;
use crate::meta::{ObjectKey, ObjectMeta, Resource};
use crate::store::Store;
use crate::telemetry::{RuleHandle, TelemetryClients};
use crate::workflow::Workflow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ALERT_NAME: &str = "alert.stagehand.dev/name";
pub const ALERT_STATE: &str = "alert.stagehand.dev/state";
pub const ALERT_TIMESTAMP: &str = "alert.stagehand.dev/timestamp";
pub const ALERT_DETAILS: &str = "alert.stagehand.dev/details";

// ---------------------------------------------------------------------------
// Webhook payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Ok,
    Paused,
    Alerting,
    Pending,
    NoData,
}

impl AlertState {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertState::Ok => "ok",
            AlertState::Paused => "paused",
            AlertState::Alerting => "alerting",
            AlertState::Pending => "pending",
            AlertState::NoData => "no_data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalMatch {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub metric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

/// Legacy Grafana alert notification body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertWebhook {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub rule_id: i64,
    pub rule_name: String,
    #[serde(default)]
    pub rule_url: String,
    pub state: AlertState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub eval_matches: Vec<EvalMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Rule naming
// ---------------------------------------------------------------------------

/// `namespace/Kind/name` of the object an alert is bound to.
pub fn rule_name<R: Resource + ?Sized>(obj: &R) -> String {
    format!("{}/{}/{}", obj.meta().namespace, obj.kind(), obj.meta().name)
}

fn parse_rule_name(name: &str) -> Option<(&str, &str, &str)> {
    let fields: Vec<&str> = name.split('/').collect();
    match fields.as_slice() {
        [ns, kind, obj] if !ns.is_empty() && !kind.is_empty() && !obj.is_empty() => {
            Some((ns, kind, obj))
        }
        _ => None,
    }
}

/// The workflow whose telemetry client serves `obj`.
fn owning_workflow<R: Resource + ?Sized>(obj: &R) -> ObjectKey {
    let meta = obj.meta();
    match meta.workflow() {
        Some(wf) => ObjectKey::new(&meta.namespace, wf),
        None => meta.key(),
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register `expr` as an alert rule bound to `obj` and record the rule name
/// on it.
pub async fn set_alert<T>(
    clients: &TelemetryClients,
    store: &dyn Store<T>,
    obj: &T,
    expr: &ExprMetrics,
) -> Result<RuleHandle>
where
    T: Resource + Clone + 'static,
{
    let rule = expr.parse()?;
    let name = rule_name(obj);
    let message = format!(
        "Alert [{name}] for object {} {} has been fired",
        obj.kind(),
        obj.meta().name
    );

    let client = clients.client_for(&owning_workflow(obj))?;
    let handle = client.register_rule(&rule, &name, &message).await?;

    let mut patch = BTreeMap::new();
    patch.insert(ALERT_NAME.to_string(), Some(name.clone()));
    store.patch_annotations(&obj.key(), patch).await?;

    tracing::info!(rule = %name, expr = %expr, "alert set");
    Ok(handle)
}

/// Drop the alert rule bound to `obj`, if any, and clear its annotations.
pub async fn unset_alert<T>(clients: &TelemetryClients, store: &dyn Store<T>, obj: &T) -> Result<()>
where
    T: Resource + Clone + 'static,
{
    let Some(name) = obj.meta().annotation(ALERT_NAME).map(str::to_string) else {
        return Ok(());
    };

    let client = clients.client_for(&owning_workflow(obj))?;
    client.unregister_rule(&name).await?;

    let patch = [ALERT_NAME, ALERT_STATE, ALERT_TIMESTAMP, ALERT_DETAILS]
        .into_iter()
        .map(|k| (k.to_string(), None))
        .collect();
    match store.patch_annotations(&obj.key(), patch).await {
        Ok(_) => {}
        // already gone
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    tracing::info!(rule = %name, "alert unset");
    Ok(())
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertReport {
    pub fired: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub details: String,
}

impl AlertReport {
    fn quiet() -> Self {
        Self {
            fired: false,
            timestamp: None,
            details: String::new(),
        }
    }
}

/// Read the last alert state recorded on an object.
///
/// Objects without a bound alert, and alerts last reported `ok`, are not
/// fired. An `alerting` state must come with a timestamp and details.
pub fn alert_is_fired(meta: &ObjectMeta) -> Result<AlertReport> {
    if meta.annotation(ALERT_NAME).is_none() {
        return Ok(AlertReport::quiet());
    }

    // bound but never delivered
    let Some(state) = meta.annotation(ALERT_STATE) else {
        return Ok(AlertReport::quiet());
    };

    match state {
        s if s == AlertState::Alerting.as_str() => {
            let ts = meta.annotation(ALERT_TIMESTAMP).ok_or_else(|| {
                StagehandError::AlertInconsistent(format!("'{}' is alerting without a timestamp", meta.name))
            })?;
            let ts = DateTime::parse_from_rfc3339(ts)
                .map_err(|e| StagehandError::AlertInconsistent(format!("bad alert timestamp '{ts}': {e}")))?
                .with_timezone(&Utc);
            let details = meta.annotation(ALERT_DETAILS).ok_or_else(|| {
                StagehandError::AlertInconsistent(format!("'{}' is alerting without details", meta.name))
            })?;
            Ok(AlertReport {
                fired: true,
                timestamp: Some(ts),
                details: details.to_string(),
            })
        }
        s if s == AlertState::Ok.as_str() => Ok(AlertReport::quiet()),
        other => Err(StagehandError::Invariant(format!(
            "unexpected alert state '{other}' on '{}'",
            meta.name
        ))),
    }
}

// ---------------------------------------------------------------------------
// Webhook dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Annotations were written to the bound object.
    Applied(ObjectKey),
    /// Delivery was valid but carried nothing to record.
    Ignored(String),
}

/// Record a webhook delivery on the object named by its rule.
pub async fn dispatch_alert(
    body: &AlertWebhook,
    jobs: &dyn Store<Job>,
    workflows: &dyn Store<Workflow>,
    now: DateTime<Utc>,
) -> Result<DispatchOutcome> {
    tracing::info!(rule = %body.rule_name, state = body.state.as_str(), message = %body.message, "alert received");

    match body.state {
        AlertState::Paused | AlertState::NoData => {
            tracing::debug!(rule = %body.rule_name, state = body.state.as_str(), "ignoring idle alert");
            return Ok(DispatchOutcome::Ignored(format!("state {}", body.state.as_str())));
        }
        AlertState::Alerting | AlertState::Ok => {}
        AlertState::Pending => {
            return Err(StagehandError::Telemetry(format!(
                "alert state '{}' is not handled, only alerting and ok are",
                body.state.as_str()
            )))
        }
    }

    let Some((namespace, kind, name)) = parse_rule_name(&body.rule_name) else {
        tracing::info!(rule = %body.rule_name, "alert is not bound to a managed object");
        return Ok(DispatchOutcome::Ignored(format!("foreign rule '{}'", body.rule_name)));
    };

    let details = serde_json::to_string(body)?;
    let patch: BTreeMap<String, Option<String>> = [
        (ALERT_NAME, body.rule_name.clone()),
        (ALERT_STATE, body.state.as_str().to_string()),
        (ALERT_DETAILS, details),
        (ALERT_TIMESTAMP, now.to_rfc3339()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), Some(v)))
    .collect();

    let key = ObjectKey::new(namespace, name);
    if kind == "Workflow" {
        workflows.patch_annotations(&key, patch).await?;
    } else {
        jobs.patch_annotations(&key, patch).await?;
    }
    Ok(DispatchOutcome::Applied(key))
}
