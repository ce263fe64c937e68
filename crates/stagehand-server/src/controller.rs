//! Key queue and reconcile workers.
//!
//! Store change notifications are mapped to the object that owns the changed
//! job and pushed onto a deduplicating queue. Workers pop keys and run the
//! matching reconcile pass. A key that changes while it is being reconciled
//! is parked and re-queued once the running pass finishes, so no key is ever
//! reconciled by two workers at once.

use stagehand_core::context::Context;
use stagehand_core::job::JobKind;
use stagehand_core::meta::{labels, LabelSelector, ObjectKey};
use stagehand_core::reconciler::{reconcile_cluster, reconcile_workflow, Outcome};
use stagehand_core::store::{WatchEvent, WatchEventKind};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinSet;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Workflow(ObjectKey),
    Cluster(ObjectKey),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Workflow(key) => write!(f, "Workflow/{key}"),
            Target::Cluster(key) => write!(f, "Cluster/{key}"),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    queued: VecDeque<Target>,
    /// Waiting in `queued`.
    waiting: HashSet<Target>,
    /// Popped and not yet marked done.
    active: HashSet<Target>,
    /// Added while active; re-queued by `done`.
    dirty: HashSet<Target>,
}

/// Deduplicating FIFO of reconcile targets.
#[derive(Clone, Default)]
pub struct WorkQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, target: Target) {
        let mut st = self.lock();
        if st.waiting.contains(&target) {
            return;
        }
        if st.active.contains(&target) {
            st.dirty.insert(target);
            return;
        }
        st.waiting.insert(target.clone());
        st.queued.push_back(target);
        drop(st);
        self.notify.notify_one();
    }

    /// Add `target` once `delay` has elapsed.
    pub fn add_after(&self, target: Target, delay: Duration) {
        if delay.is_zero() {
            self.add(target);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(target);
        });
    }

    /// Wait for the next target and mark it active.
    pub async fn pop(&self) -> Target {
        loop {
            let notified = self.notify.notified();
            if let Some(target) = self.try_pop() {
                return target;
            }
            notified.await;
        }
    }

    fn try_pop(&self) -> Option<Target> {
        let mut st = self.lock();
        let target = st.queued.pop_front()?;
        st.waiting.remove(&target);
        st.active.insert(target.clone());
        let more = !st.queued.is_empty();
        drop(st);
        if more {
            self.notify.notify_one();
        }
        Some(target)
    }

    pub fn done(&self, target: &Target) {
        let mut st = self.lock();
        st.active.remove(target);
        let requeue = st.dirty.remove(target);
        drop(st);
        if requeue {
            self.add(target.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // Every update leaves the sets consistent, so poisoning is harmless.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Event routing
// ---------------------------------------------------------------------------

/// Reconcile targets interested in a job change.
pub fn job_targets(event: &WatchEvent) -> Vec<Target> {
    let mut targets = Vec::new();
    let namespace = &event.key.namespace;
    if event.kind == JobKind::Cluster.as_str() && event.event != WatchEventKind::Deleted {
        targets.push(Target::Cluster(event.key.clone()));
    }
    if let Some(owner) = event.labels.get(labels::CREATED_BY) {
        targets.push(Target::Cluster(ObjectKey::new(namespace.clone(), owner.clone())));
    }
    if let Some(workflow) = event.labels.get(labels::WORKFLOW) {
        targets.push(Target::Workflow(ObjectKey::new(namespace.clone(), workflow.clone())));
    }
    targets
}

fn workflow_targets(event: &WatchEvent) -> Vec<Target> {
    match event.event {
        WatchEventKind::Deleted => Vec::new(),
        _ => vec![Target::Workflow(event.key.clone())],
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Controller {
    ctx: Arc<Context>,
    queue: WorkQueue,
}

impl Controller {
    pub fn new(ctx: Arc<Context>, queue: WorkQueue) -> Self {
        Self { ctx, queue }
    }

    /// Queue every workflow and cluster in the configured namespace.
    pub async fn resync(&self) -> stagehand_core::Result<()> {
        resync(&self.ctx, &self.queue).await
    }

    /// Run until the shutdown signal flips. Passes already started finish
    /// before this returns.
    pub async fn run(self) -> stagehand_core::Result<()> {
        let mut shutdown = self.ctx.shutdown_signal();
        let workers = self.ctx.config.reconcile.workers.max(1);
        tracing::info!(workers, namespace = %self.ctx.config.namespace, "controller starting");

        let mut tasks = JoinSet::new();
        tasks.spawn(forward(
            self.ctx.clone(),
            self.queue.clone(),
            self.ctx.jobs.watch(),
            job_targets,
            shutdown.clone(),
        ));
        tasks.spawn(forward(
            self.ctx.clone(),
            self.queue.clone(),
            self.ctx.workflows.watch(),
            workflow_targets,
            shutdown.clone(),
        ));
        for id in 0..workers {
            tasks.spawn(worker(id, self.ctx.clone(), self.queue.clone(), shutdown.clone()));
        }

        self.resync().await?;

        if !*shutdown.borrow() {
            let _ = shutdown.changed().await;
        }
        while tasks.join_next().await.is_some() {}
        tracing::info!("controller stopped");
        Ok(())
    }
}

async fn resync(ctx: &Context, queue: &WorkQueue) -> stagehand_core::Result<()> {
    let namespace = &ctx.config.namespace;
    let workflows = ctx.workflows.list(namespace, &LabelSelector::new()).await?;
    let jobs = ctx.jobs.list(namespace, &LabelSelector::new()).await?;
    for wf in &workflows {
        queue.add(Target::Workflow(wf.metadata.key()));
    }
    for job in jobs.iter().filter(|j| j.kind == JobKind::Cluster) {
        queue.add(Target::Cluster(job.metadata.key()));
    }
    tracing::debug!(queued = queue.len(), "resync");
    Ok(())
}

async fn forward(
    ctx: Arc<Context>,
    queue: WorkQueue,
    mut rx: broadcast::Receiver<WatchEvent>,
    route: fn(&WatchEvent) -> Vec<Target>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            recv = rx.recv() => match recv {
                Ok(event) => {
                    for target in route(&event) {
                        queue.add(target);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "watch lagged, resyncing");
                    if let Err(e) = resync(&ctx, &queue).await {
                        tracing::warn!(error = %e, "resync failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = shutdown.changed() => return,
        }
    }
}

async fn worker(id: usize, ctx: Arc<Context>, queue: WorkQueue, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let target = tokio::select! {
            target = queue.pop() => target,
            _ = shutdown.changed() => return,
        };
        process(id, &ctx, &queue, &target).await;
        queue.done(&target);
    }
}

async fn process(id: usize, ctx: &Context, queue: &WorkQueue, target: &Target) {
    let result = match target {
        Target::Workflow(key) => reconcile_workflow(ctx, key).await,
        Target::Cluster(key) => reconcile_cluster(ctx, key).await,
    };
    match result {
        Ok(Outcome::Stop) => {}
        Ok(Outcome::RequeueAfter(delay)) => {
            tracing::debug!(worker = id, target = %target, delay_ms = delay.as_millis() as u64, "requeue");
            queue.add_after(target.clone(), delay);
        }
        Err(e) if e.is_fatal() => {
            tracing::error!(worker = id, target = %target, error = %e, "reconcile failed permanently");
        }
        Err(e) => {
            tracing::warn!(worker = id, target = %target, error = %e, "reconcile failed, retrying");
            queue.add_after(target.clone(), ctx.config.reconcile.conflict_requeue());
        }
    }
}
