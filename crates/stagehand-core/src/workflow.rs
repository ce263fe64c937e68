use crate::error::{Result, StagehandError};
use crate::expressions::ConditionalExpr;
use crate::lifecycle::Lifecycle;
use crate::meta::{ObjectMeta, Resource};
use crate::scheduler::SchedulerSpec;
use crate::types::{Component, TolerateSpec};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use std::time::Duration;

// ---------------------------------------------------------------------------
// WaitSpec
// ---------------------------------------------------------------------------

/// Conditions that must all hold before an action is dispatched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitSpec {
    /// Actions whose jobs must be Successful.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success: Vec<String>,
    /// Actions whose jobs must be Running.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub running: Vec<String>,
    /// Minimum seconds since the workflow was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<u64>,
}

impl WaitSpec {
    pub fn after_duration(&self) -> Option<Duration> {
        self.after.map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTemplate {
    /// SYS templates are long-lived infrastructure and never garbage collected.
    #[serde(default)]
    pub component: Component,
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    #[serde(default)]
    pub template: serde_json::Value,
    pub instances: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<SchedulerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerate: Option<TolerateSpec>,
    /// Keep spawning instances until this holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<ConditionalExpr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSpec {
    pub jobs: Vec<String>,
}

/// Regexes the output of a remote call must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSpec {
    pub callable: String,
    pub services: Vec<String>,
    /// One entry per service, in the same order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expect: Vec<MatchOutputs>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    Service(ResourceTemplate),
    Cluster(ClusterSpec),
    Chaos(ResourceTemplate),
    Cascade(ResourceTemplate),
    Delete(DeleteSpec),
    Call(CallSpec),
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Service(_) => "service",
            ActionKind::Cluster(_) => "cluster",
            ActionKind::Chaos(_) => "chaos",
            ActionKind::Cascade(_) => "cascade",
            ActionKind::Delete(_) => "delete",
            ActionKind::Call(_) => "call",
        }
    }

    /// Component of the job this action creates. Only templated actions can
    /// be SYS.
    pub fn component(&self) -> Component {
        match self {
            ActionKind::Service(t) | ActionKind::Chaos(t) | ActionKind::Cascade(t) => t.component,
            _ => Component::Sut,
        }
    }

    /// Actions that run through virtual execution instead of a child resource.
    pub fn is_virtual(&self) -> bool {
        matches!(self, ActionKind::Delete(_) | ActionKind::Call(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends: Option<WaitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assert: Option<ConditionalExpr>,
}

impl Action {
    pub fn new(name: &str, kind: ActionKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            depends: None,
            assert: None,
        }
    }

    pub fn depends(mut self, wait: WaitSpec) -> Self {
        self.depends = Some(wait);
        self
    }

    pub fn assert(mut self, expr: ConditionalExpr) -> Self {
        self.assert = Some(expr);
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub actions: Vec<Action>,
    #[serde(default)]
    pub suspend: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
    /// Actions dispatched so far, in dispatch order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scheduled_jobs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub metadata: ObjectMeta,
    pub spec: WorkflowSpec,
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl Resource for Workflow {
    fn kind(&self) -> &str {
        "Workflow"
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Workflow {
    pub fn new(namespace: &str, name: &str, actions: Vec<Action>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: WorkflowSpec {
                actions,
                suspend: false,
            },
            status: WorkflowStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn action(&self, name: &str) -> Option<&Action> {
        self.spec.actions.iter().find(|a| a.name == name)
    }

    pub fn is_scheduled(&self, action: &str) -> bool {
        self.status.scheduled_jobs.iter().any(|s| s == action)
    }

    /// Static checks run once before the first action is dispatched.
    pub fn validate(&self) -> Result<()> {
        let mut index: BTreeMap<&str, &Action> = BTreeMap::new();
        for action in &self.spec.actions {
            validate_action_name(&action.name)?;
            if index.insert(action.name.as_str(), action).is_some() {
                return Err(invalid(format!("duplicate action '{}'", action.name)));
            }
        }

        for action in &self.spec.actions {
            check_dependencies(action, &index)?;
            check_assertion(action)?;
            check_kind(action, &index)?;
        }

        // Assertion alerts are bound to the workflow, which holds one rule.
        let metrics_asserts: Vec<&str> = self
            .spec
            .actions
            .iter()
            .filter(|a| a.assert.as_ref().is_some_and(|e| e.has_metrics_expr()))
            .map(|a| a.name.as_str())
            .collect();
        if metrics_asserts.len() > 1 {
            return Err(invalid(format!(
                "at most one action may assert on metrics, found {metrics_asserts:?}"
            )));
        }
        Ok(())
    }
}

fn invalid(msg: String) -> StagehandError {
    StagehandError::InvalidWorkflow(msg)
}

static ACTION_NAME_RE: OnceLock<Regex> = OnceLock::new();

fn action_name_re() -> &'static Regex {
    ACTION_NAME_RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9\-]*[a-z0-9])?$").unwrap())
}

/// Action names become job names, so they must be DNS-1123 labels.
pub fn validate_action_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 || !action_name_re().is_match(name) {
        return Err(invalid(format!(
            "invalid action name '{name}': must be a lowercase DNS-1123 label"
        )));
    }
    Ok(())
}

fn check_dependencies(action: &Action, index: &BTreeMap<&str, &Action>) -> Result<()> {
    let Some(deps) = &action.depends else {
        return Ok(());
    };
    for dep in deps.success.iter().chain(deps.running.iter()) {
        if !index.contains_key(dep.as_str()) {
            return Err(invalid(format!(
                "action '{}' depends on unknown action '{dep}'",
                action.name
            )));
        }
    }
    Ok(())
}

fn check_assertion(action: &Action) -> Result<()> {
    let Some(assert) = action.assert.as_ref().filter(|a| !a.is_zero()) else {
        return Ok(());
    };
    if matches!(action.kind, ActionKind::Delete(_)) {
        return Err(invalid(format!(
            "delete action '{}' cannot have an assertion",
            action.name
        )));
    }
    assert.validate()
}

fn check_kind(action: &Action, index: &BTreeMap<&str, &Action>) -> Result<()> {
    match &action.kind {
        ActionKind::Delete(spec) => {
            let mut seen = BTreeSet::new();
            for job in &spec.jobs {
                let target = index.get(job.as_str()).ok_or_else(|| {
                    invalid(format!("job '{job}' of action '{}' does not exist", action.name))
                })?;
                if matches!(target.kind, ActionKind::Delete(_)) {
                    return Err(invalid(format!(
                        "cycle deletion: job '{job}' of action '{}' is a deletion job",
                        action.name
                    )));
                }
                if !seen.insert(job) {
                    return Err(invalid(format!(
                        "job '{job}' is listed twice in action '{}'",
                        action.name
                    )));
                }
            }
        }
        ActionKind::Cluster(spec) => {
            if spec.instances == 0 {
                return Err(invalid(format!(
                    "cluster '{}' must have at least one instance",
                    action.name
                )));
            }
            if let Some(schedule) = &spec.schedule {
                schedule.validate()?;
            }
            if let Some(until) = &spec.until {
                until.validate()?;
            }
            let event_metrics = spec
                .schedule
                .as_ref()
                .and_then(|s| s.event.as_ref())
                .is_some_and(|e| e.has_metrics_expr());
            let until_metrics = spec.until.as_ref().is_some_and(|e| e.has_metrics_expr());
            if event_metrics && until_metrics {
                return Err(invalid(format!(
                    "cluster '{}' cannot use metrics in both its event schedule and its until condition",
                    action.name
                )));
            }
        }
        ActionKind::Call(spec) => {
            if spec.callable.is_empty() || spec.services.is_empty() {
                return Err(invalid(format!(
                    "call '{}' needs a callable and at least one service",
                    action.name
                )));
            }
            if !spec.expect.is_empty() && spec.expect.len() != spec.services.len() {
                return Err(invalid(format!(
                    "call '{}' expects {} outputs for {} services",
                    action.name,
                    spec.expect.len(),
                    spec.services.len()
                )));
            }
            for outputs in &spec.expect {
                for pattern in outputs.stdout.iter().chain(outputs.stderr.iter()) {
                    Regex::new(pattern).map_err(|e| {
                        invalid(format!("call '{}' has a bad pattern: {e}", action.name))
                    })?;
                }
            }
        }
        ActionKind::Service(_) | ActionKind::Chaos(_) | ActionKind::Cascade(_) => {}
    }
    Ok(())
}
