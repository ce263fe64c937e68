//! Virtual execution: run a side effect that creates no resource of its own
//! (a deletion, a remote call) and report its outcome through a placeholder
//! job, so the classifier and lifecycle treat it like any other child.

use crate::config::{ExecutionMode, RetryPolicy, VirtualExecConfig};
use crate::error::{Result, StagehandError};
use crate::job::{Job, JobKind};
use crate::meta::{ObjectKey, Resource};
use crate::store::Store;
use crate::types::Component;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Output a callback leaves on its virtual job.
pub type VExecData = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// VirtualTask
// ---------------------------------------------------------------------------

enum TaskState {
    Spawned(JoinHandle<Result<Job>>),
    Finished(Result<Job>),
}

/// Handle on a running virtual execution. Dropping it detaches the task.
pub struct VirtualTask {
    name: String,
    state: TaskState,
}

impl VirtualTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            TaskState::Spawned(handle) => handle.is_finished(),
            TaskState::Finished(_) => true,
        }
    }

    /// Stop the callback. The virtual job keeps whatever phase it had.
    pub fn abort(&self) {
        if let TaskState::Spawned(handle) = &self.state {
            handle.abort();
        }
    }

    /// Wait for the callback and the status write, returning the stored job.
    pub async fn join(self) -> Result<Job> {
        match self.state {
            TaskState::Finished(result) => result,
            TaskState::Spawned(handle) => handle.await.map_err(|e| {
                StagehandError::VirtualExec(format!("virtual job '{}' did not complete: {e}", self.name))
            })?,
        }
    }
}

// ---------------------------------------------------------------------------
// VirtualExecutor
// ---------------------------------------------------------------------------

pub struct VirtualExecutor {
    jobs: Arc<dyn Store<Job>>,
    mode: ExecutionMode,
    retry: RetryPolicy,
}

impl VirtualExecutor {
    pub fn new(jobs: Arc<dyn Store<Job>>, cfg: &VirtualExecConfig) -> Self {
        Self {
            jobs,
            mode: cfg.mode,
            retry: cfg.retry.clone(),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Create the placeholder job `job_name` under `parent` and run `callback`.
    ///
    /// Returns once the placeholder is visible in the store. In spawned mode
    /// the callback runs on its own task; in inline mode it has finished
    /// before this returns. Either way the outcome lands on the job with a
    /// single status write.
    pub async fn run_virtual<P, F, Fut>(&self, parent: &P, job_name: &str, callback: F) -> Result<VirtualTask>
    where
        P: Resource + ?Sized,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<VExecData>> + Send + 'static,
    {
        let meta = parent.meta();
        let placeholder = Job::builder(JobKind::Virtual, &meta.namespace, job_name)
            .workflow(&meta.name)
            .action(job_name)
            .component(Component::Sut)
            .build()?;

        self.jobs.create(placeholder).await.map_err(|e| {
            StagehandError::VirtualExec(format!("cannot create virtual job '{job_name}': {e}"))
        })?;

        let key = ObjectKey::new(&meta.namespace, job_name);
        let job = get_with_retry(self.jobs.as_ref(), &key, &self.retry).await?;

        tracing::info!(parent = %meta.key(), job = job_name, "VExecBegin");

        let jobs = self.jobs.clone();
        let retry = self.retry.clone();
        let run = async move {
            let outcome = callback().await;
            complete(jobs.as_ref(), job, outcome, &retry).await
        };

        let state = match self.mode {
            ExecutionMode::Inline => TaskState::Finished(run.await),
            ExecutionMode::Spawned => TaskState::Spawned(tokio::spawn(run)),
        };
        Ok(VirtualTask {
            name: job_name.to_string(),
            state,
        })
    }
}

/// Read back a freshly created object, tolerating a short visibility lag.
async fn get_with_retry(jobs: &dyn Store<Job>, key: &ObjectKey, retry: &RetryPolicy) -> Result<Job> {
    let mut attempt = 0;
    loop {
        match jobs.get(key).await {
            Ok(job) => return Ok(job),
            Err(e) if e.is_not_found() && attempt + 1 < retry.steps => {
                tokio::time::sleep(retry.delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(StagehandError::VirtualExec(format!(
                    "virtual job '{key}' is not visible: {e}"
                )))
            }
        }
    }
}

/// Record the callback outcome on the virtual job.
async fn complete(
    jobs: &dyn Store<Job>,
    mut job: Job,
    outcome: anyhow::Result<VExecData>,
    retry: &RetryPolicy,
) -> Result<Job> {
    let lifecycle = &mut job.status.lifecycle;
    match outcome {
        Ok(data) => {
            tracing::info!(job = %job.metadata.name, "VExecSuccess");
            lifecycle.success("VExecSuccess", "Job completed");
            job.status.data = data;
        }
        Err(e) => {
            tracing::warn!(job = %job.metadata.name, error = %e, "VExecFailed");
            lifecycle.failed("VExecFailed", format!("Job failed: {e:#}"));
        }
    }

    if !job.status.data.is_empty() {
        let keys: Vec<&str> = job.status.data.keys().map(String::as_str).collect();
        job.status.lifecycle.message = format!(
            "{}. <StoredData>: '[{}]'",
            job.status.lifecycle.message,
            keys.join(" ")
        );
    }

    // Annotation patches bump the version behind our back; carry the same
    // status onto the latest copy.
    let status = job.status.clone();
    let key = job.key();
    let mut attempt = 0;
    loop {
        match jobs.update(job).await {
            Ok(stored) => return Ok(stored),
            Err(e) if e.is_conflict() && attempt + 1 < retry.steps => {
                tokio::time::sleep(retry.delay(attempt)).await;
                attempt += 1;
                job = jobs.get(&key).await?;
                job.status = status.clone();
            }
            Err(e) => {
                return Err(StagehandError::VirtualExec(format!(
                    "status update of virtual job '{key}' failed: {e}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::labels;
    use crate::store::InMemoryStore;
    use crate::types::Phase;
    use crate::workflow::Workflow;

    fn executor(mode: ExecutionMode) -> (Arc<InMemoryStore<Job>>, VirtualExecutor) {
        let store = InMemoryStore::new_arc();
        let cfg = VirtualExecConfig {
            mode,
            retry: RetryPolicy {
                initial_backoff_ms: 1,
                factor: 1.0,
                steps: 3,
            },
        };
        let vexec = VirtualExecutor::new(store.clone(), &cfg);
        (store, vexec)
    }

    fn parent() -> Workflow {
        Workflow::new("ns", "wf", Vec::new())
    }

    #[tokio::test]
    async fn successful_callback_marks_job_success() {
        let (store, vexec) = executor(ExecutionMode::Spawned);
        let task = vexec
            .run_virtual(&parent(), "cleanup", || async { Ok(VExecData::new()) })
            .await
            .unwrap();
        let job = task.join().await.unwrap();

        assert_eq!(job.kind, JobKind::Virtual);
        assert_eq!(job.phase(), Phase::Success);
        assert_eq!(job.status.lifecycle.reason, "VExecSuccess");
        assert_eq!(job.status.lifecycle.message, "Job completed");
        assert_eq!(job.metadata.workflow(), Some("wf"));
        assert_eq!(job.metadata.label(labels::ACTION), Some("cleanup"));
        assert_eq!(job.component(), Component::Sut);

        let stored = store.get(&ObjectKey::new("ns", "cleanup")).await.unwrap();
        assert_eq!(stored.phase(), Phase::Success);
    }

    #[tokio::test]
    async fn failing_callback_embeds_error() {
        let (_, vexec) = executor(ExecutionMode::Inline);
        let task = vexec
            .run_virtual(&parent(), "kill", || async { Err(anyhow::anyhow!("target vanished")) })
            .await
            .unwrap();
        assert!(task.is_finished());
        let job = task.join().await.unwrap();

        assert_eq!(job.phase(), Phase::Failed);
        assert_eq!(job.status.lifecycle.reason, "VExecFailed");
        assert_eq!(job.status.lifecycle.message, "Job failed: target vanished");
    }

    #[tokio::test]
    async fn stored_data_is_listed_in_message() {
        let (_, vexec) = executor(ExecutionMode::Inline);
        let task = vexec
            .run_virtual(&parent(), "call", || async {
                let mut data = VExecData::new();
                data.insert("b".into(), "2".into());
                data.insert("a".into(), "1".into());
                Ok(data)
            })
            .await
            .unwrap();
        let job = task.join().await.unwrap();
        assert_eq!(job.status.lifecycle.message, "Job completed. <StoredData>: '[a b]'");
        assert_eq!(job.status.data.len(), 2);
    }

    #[tokio::test]
    async fn spawned_mode_returns_before_callback_completes() {
        let (store, vexec) = executor(ExecutionMode::Spawned);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = vexec
            .run_virtual(&parent(), "slow", move || async move {
                let _ = rx.await;
                Ok(VExecData::new())
            })
            .await
            .unwrap();

        let placeholder = store.get(&ObjectKey::new("ns", "slow")).await.unwrap();
        assert_eq!(placeholder.phase(), Phase::Uninitialized);
        assert!(!task.is_finished());

        tx.send(()).unwrap();
        assert_eq!(task.join().await.unwrap().phase(), Phase::Success);
    }

    #[tokio::test]
    async fn aborted_task_reports_error_on_join() {
        let (_, vexec) = executor(ExecutionMode::Spawned);
        let task = vexec
            .run_virtual(&parent(), "forever", || async {
                std::future::pending::<()>().await;
                Ok(VExecData::new())
            })
            .await
            .unwrap();
        task.abort();
        assert!(matches!(task.join().await, Err(StagehandError::VirtualExec(_))));
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let (_, vexec) = executor(ExecutionMode::Inline);
        vexec
            .run_virtual(&parent(), "once", || async { Ok(VExecData::new()) })
            .await
            .unwrap();
        let err = vexec
            .run_virtual(&parent(), "once", || async { Ok(VExecData::new()) })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StagehandError::VirtualExec(_)));
    }
}
