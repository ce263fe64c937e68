use crate::error::{Result, StagehandError};
use crate::lifecycle::Lifecycle;
use crate::meta::{labels, ObjectMeta, Resource};
use crate::types::{Component, Phase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// Closed set of child-resource kinds the orchestrator understands. Every kind
/// carries a [`Lifecycle`], so status handling never needs a runtime probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    Service,
    Cluster,
    Chaos,
    Cascade,
    Call,
    Virtual,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Service => "Service",
            JobKind::Cluster => "Cluster",
            JobKind::Chaos => "Chaos",
            JobKind::Cascade => "Cascade",
            JobKind::Call => "Call",
            JobKind::Virtual => "Virtual",
        }
    }

    /// Kinds whose children are managed by the orchestrator itself.
    pub fn is_multi_job(self) -> bool {
        matches!(self, JobKind::Cluster)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Scheduling bookkeeping for actions that produce several jobs over time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    /// Number of queued job templates.
    #[serde(default)]
    pub queued_jobs: usize,
    /// Index of the last dispatched job; -1 before the first dispatch.
    #[serde(default = "default_scheduled")]
    pub scheduled_jobs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_timeline: Vec<DateTime<Utc>>,
}

fn default_scheduled() -> i64 {
    -1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
    /// Output produced by a virtual execution.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleStatus>,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub kind: JobKind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default)]
    pub status: JobStatus,
}

impl Job {
    pub fn builder(kind: JobKind, namespace: &str, name: &str) -> JobBuilder {
        JobBuilder::new(kind, namespace, name)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn phase(&self) -> Phase {
        self.status.lifecycle.phase
    }

    pub fn component(&self) -> Component {
        self.metadata.component()
    }

    /// Set a field of the opaque spec, addressed by JSON pointer
    /// (`/containers/0/image`). Missing intermediate objects are created;
    /// stepping through a non-object value is an error.
    pub fn set_spec_field(&mut self, pointer: &str, value: serde_json::Value) -> Result<()> {
        set_pointer(&mut self.spec, pointer, value)
    }

    /// Decode the opaque spec into a typed view.
    pub fn typed_spec<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.spec.clone())?)
    }
}

impl Resource for Job {
    fn kind(&self) -> &str {
        self.kind.as_str()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

fn set_pointer(root: &mut serde_json::Value, pointer: &str, value: serde_json::Value) -> Result<()> {
    let path = pointer
        .strip_prefix('/')
        .ok_or_else(|| StagehandError::InvalidWorkflow(format!("field path '{pointer}' must start with '/'")))?;

    if root.is_null() {
        *root = serde_json::Value::Object(Default::default());
    }

    let segments: Vec<String> = path
        .split('/')
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| StagehandError::InvalidWorkflow(format!("empty field path '{pointer}'")))?;

    let mut cursor = root;
    for seg in parents {
        cursor = match cursor {
            serde_json::Value::Object(map) => map
                .entry(seg.clone())
                .or_insert_with(|| serde_json::Value::Object(Default::default())),
            serde_json::Value::Array(items) => {
                let idx: usize = seg.parse().map_err(|_| {
                    StagehandError::InvalidWorkflow(format!("'{seg}' is not an index in '{pointer}'"))
                })?;
                items.get_mut(idx).ok_or_else(|| {
                    StagehandError::InvalidWorkflow(format!("index {idx} out of range in '{pointer}'"))
                })?
            }
            _ => {
                return Err(StagehandError::InvalidWorkflow(format!(
                    "cannot descend into '{seg}' of '{pointer}': not an object"
                )))
            }
        };
    }

    match cursor {
        serde_json::Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        serde_json::Value::Array(items) => {
            let idx: usize = last.parse().map_err(|_| {
                StagehandError::InvalidWorkflow(format!("'{last}' is not an index in '{pointer}'"))
            })?;
            let slot = items.get_mut(idx).ok_or_else(|| {
                StagehandError::InvalidWorkflow(format!("index {idx} out of range in '{pointer}'"))
            })?;
            *slot = value;
            Ok(())
        }
        _ => Err(StagehandError::InvalidWorkflow(format!(
            "cannot set '{last}' of '{pointer}': parent is not an object"
        ))),
    }
}

// ---------------------------------------------------------------------------
// JobBuilder
// ---------------------------------------------------------------------------

/// Typed construction of child jobs. Covers the fields dispatch needs:
/// ownership labels, annotations and the spec body.
pub struct JobBuilder {
    job: Job,
    patches: Vec<(String, serde_json::Value)>,
}

impl JobBuilder {
    pub fn new(kind: JobKind, namespace: &str, name: &str) -> Self {
        Self {
            job: Job {
                kind,
                metadata: ObjectMeta::new(namespace, name),
                spec: serde_json::Value::Null,
                suspend: false,
                status: JobStatus::default(),
            },
            patches: Vec::new(),
        }
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.job
            .metadata
            .labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.job
            .metadata
            .annotations
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn workflow(self, workflow: &str) -> Self {
        self.label(labels::WORKFLOW, workflow)
    }

    pub fn action(self, action: &str) -> Self {
        self.label(labels::ACTION, action)
    }

    pub fn component(self, component: Component) -> Self {
        self.label(labels::COMPONENT, component.as_str())
    }

    pub fn created_by(self, owner: &str) -> Self {
        self.label(labels::CREATED_BY, owner)
    }

    pub fn spec(mut self, spec: serde_json::Value) -> Self {
        self.job.spec = spec;
        self
    }

    pub fn field(mut self, pointer: &str, value: serde_json::Value) -> Self {
        self.patches.push((pointer.to_string(), value));
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.job.status.lifecycle.phase = phase;
        self
    }

    pub fn build(mut self) -> Result<Job> {
        for (pointer, value) in self.patches {
            self.job.set_spec_field(&pointer, value)?;
        }
        Ok(self.job)
    }
}
