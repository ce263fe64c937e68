use crate::controller::{Target, WorkQueue};
use stagehand_core::context::Context;
use stagehand_core::meta::ObjectKey;
use std::sync::Arc;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<Context>,
    pub queue: WorkQueue,
}

impl AppState {
    pub fn new(ctx: Arc<Context>, queue: WorkQueue) -> Self {
        Self { ctx, queue }
    }

    /// Ask the controller to look at a workflow without waiting for the
    /// store notification.
    pub fn poke_workflow(&self, key: ObjectKey) {
        self.queue.add(Target::Workflow(key));
    }
}
