//! Declarative object store the orchestrator reconciles against.
//!
//! The core only relies on keyed CRUD with label filtering, per-object
//! optimistic concurrency on `update`, and a notification stream that wakes
//! the controller loop.

mod memory;

pub use memory::InMemoryStore;

use crate::error::Result;
use crate::meta::{LabelSelector, ObjectKey, Resource};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Updated,
    Deleted,
}

/// Change notification. Carries labels so listeners can find the owner
/// without another lookup.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event: WatchEventKind,
    pub kind: String,
    pub key: ObjectKey,
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait Store<T: Resource + Clone + 'static>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<T>;

    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<T>>;

    /// Store a new object. Assigns uid, creation time and the first version.
    async fn create(&self, obj: T) -> Result<T>;

    /// Replace an object. Fails with `Conflict` unless `obj` carries the
    /// version currently stored.
    async fn update(&self, obj: T) -> Result<T>;

    /// Merge annotations without a version check. `None` removes the key.
    async fn patch_annotations(
        &self,
        key: &ObjectKey,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<T>;

    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
