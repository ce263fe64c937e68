//! Telemetry collaborator: where alert rules get registered.

mod grafana;

pub use grafana::GrafanaClient;

use crate::error::{Result, StagehandError};
use crate::expressions::AlertRule;
use crate::meta::ObjectKey;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

/// Where a registered rule lives on the collaborator's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHandle {
    pub name: String,
    pub dashboard_uid: String,
    pub panel_id: u64,
}

#[async_trait]
pub trait AlertRegistry: Send + Sync {
    async fn register_rule(&self, rule: &AlertRule, name: &str, message: &str) -> Result<RuleHandle>;

    /// Remove a rule by name. Unknown names are not an error.
    async fn unregister_rule(&self, name: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// TelemetryClients
// ---------------------------------------------------------------------------

/// Telemetry clients by workflow, with an optional fallback.
#[derive(Default)]
pub struct TelemetryClients {
    default: Option<Arc<dyn AlertRegistry>>,
    by_workflow: RwLock<HashMap<ObjectKey, Arc<dyn AlertRegistry>>>,
}

impl TelemetryClients {
    pub fn new(default: Option<Arc<dyn AlertRegistry>>) -> Self {
        Self {
            default,
            by_workflow: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, workflow: ObjectKey, client: Arc<dyn AlertRegistry>) {
        if let Ok(mut map) = self.by_workflow.write() {
            map.insert(workflow, client);
        }
    }

    pub fn forget(&self, workflow: &ObjectKey) {
        if let Ok(mut map) = self.by_workflow.write() {
            map.remove(workflow);
        }
    }

    pub fn client_for(&self, workflow: &ObjectKey) -> Result<Arc<dyn AlertRegistry>> {
        let registered = self
            .by_workflow
            .read()
            .ok()
            .and_then(|map| map.get(workflow).cloned());
        registered
            .or_else(|| self.default.clone())
            .ok_or_else(|| {
                StagehandError::Telemetry(format!("no telemetry client for workflow '{workflow}'"))
            })
    }
}

// ---------------------------------------------------------------------------
// RecordingRegistry
// ---------------------------------------------------------------------------

/// Registry that only remembers what it was asked to do.
#[derive(Default)]
pub struct RecordingRegistry {
    rules: Mutex<BTreeMap<String, (AlertRule, String)>>,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules
            .lock()
            .map(|rules| rules.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rule(&self, name: &str) -> Option<AlertRule> {
        self.rules
            .lock()
            .ok()
            .and_then(|rules| rules.get(name).map(|(rule, _)| rule.clone()))
    }
}

#[async_trait]
impl AlertRegistry for RecordingRegistry {
    async fn register_rule(&self, rule: &AlertRule, name: &str, message: &str) -> Result<RuleHandle> {
        let mut rules = self
            .rules
            .lock()
            .map_err(|_| StagehandError::Telemetry("registry lock poisoned".to_string()))?;
        if rules.contains_key(name) {
            return Err(StagehandError::Telemetry(format!(
                "alert '{name}' is already registered"
            )));
        }
        rules.insert(name.to_string(), (rule.clone(), message.to_string()));
        Ok(RuleHandle {
            name: name.to_string(),
            dashboard_uid: rule.dashboard_uid.clone(),
            panel_id: rule.panel_id,
        })
    }

    async fn unregister_rule(&self, name: &str) -> Result<()> {
        if let Ok(mut rules) = self.rules.lock() {
            rules.remove(name);
        }
        Ok(())
    }
}
