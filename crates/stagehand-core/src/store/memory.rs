use super::{Store, WatchEvent, WatchEventKind};
use crate::error::{Result, StagehandError};
use crate::meta::{LabelSelector, ObjectKey, Resource};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Process-local store for a single object kind.
pub struct InMemoryStore<T> {
    objects: RwLock<BTreeMap<ObjectKey, T>>,
    events: broadcast::Sender<WatchEvent>,
}

impl<T: Resource + Clone + 'static> InMemoryStore<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn notify(&self, event: WatchEventKind, obj: &T) {
        // no receivers is fine
        let _ = self.events.send(WatchEvent {
            event,
            kind: obj.kind().to_string(),
            key: obj.key(),
            labels: obj.meta().labels.clone(),
        });
    }
}

impl<T: Resource + Clone + 'static> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Resource + Clone + 'static> Store<T> for InMemoryStore<T> {
    async fn get(&self, key: &ObjectKey) -> Result<T> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StagehandError::NotFound(key.to_string()))
    }

    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<T>> {
        Ok(self
            .objects
            .read()
            .await
            .values()
            .filter(|obj| obj.meta().namespace == namespace && selector.matches(&obj.meta().labels))
            .cloned()
            .collect())
    }

    async fn create(&self, mut obj: T) -> Result<T> {
        let key = obj.key();
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(StagehandError::AlreadyExists(key.to_string()));
        }

        let meta = obj.meta_mut();
        meta.uid = Some(Uuid::new_v4());
        meta.creation_timestamp.get_or_insert_with(Utc::now);
        meta.resource_version = 1;

        objects.insert(key, obj.clone());
        drop(objects);

        self.notify(WatchEventKind::Created, &obj);
        Ok(obj)
    }

    async fn update(&self, mut obj: T) -> Result<T> {
        let key = obj.key();
        let mut objects = self.objects.write().await;
        let stored = objects
            .get(&key)
            .ok_or_else(|| StagehandError::NotFound(key.to_string()))?;

        let current = stored.meta().resource_version;
        if obj.meta().resource_version != current {
            return Err(StagehandError::Conflict(format!(
                "{} '{}': version {} is stale (current {})",
                obj.kind(),
                key,
                obj.meta().resource_version,
                current
            )));
        }

        // identity fields are owned by the store
        let (uid, created) = (stored.meta().uid, stored.meta().creation_timestamp);
        let meta = obj.meta_mut();
        meta.uid = uid;
        meta.creation_timestamp = created;
        meta.resource_version = current + 1;

        objects.insert(key, obj.clone());
        drop(objects);

        self.notify(WatchEventKind::Updated, &obj);
        Ok(obj)
    }

    async fn patch_annotations(
        &self,
        key: &ObjectKey,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<T> {
        let mut objects = self.objects.write().await;
        let obj = objects
            .get_mut(key)
            .ok_or_else(|| StagehandError::NotFound(key.to_string()))?;

        let meta = obj.meta_mut();
        for (k, v) in annotations {
            match v {
                Some(v) => {
                    meta.annotations.insert(k, v);
                }
                None => {
                    meta.annotations.remove(&k);
                }
            }
        }
        meta.resource_version += 1;

        let patched = obj.clone();
        drop(objects);

        self.notify(WatchEventKind::Updated, &patched);
        Ok(patched)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let removed = self
            .objects
            .write()
            .await
            .remove(key)
            .ok_or_else(|| StagehandError::NotFound(key.to_string()))?;
        self.notify(WatchEventKind::Deleted, &removed);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobKind};
    use crate::meta::labels;
    use crate::types::Phase;

    fn job(name: &str, workflow: &str) -> Job {
        Job::builder(JobKind::Service, "ns", name)
            .workflow(workflow)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn create_assigns_identity() {
        let store = InMemoryStore::new();
        let created = store.create(job("a", "wf")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.creation_timestamp.is_some());
        assert_eq!(created.metadata.resource_version, 1);

        let err = store.create(job("a", "wf")).await.unwrap_err();
        assert!(matches!(err, StagehandError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = InMemoryStore::new();
        let created = store.create(job("a", "wf")).await.unwrap();

        let mut first = created.clone();
        first.status.lifecycle.phase = Phase::Running;
        let updated = store.update(first).await.unwrap();
        assert_eq!(updated.metadata.resource_version, 2);

        let mut stale = created;
        stale.status.lifecycle.phase = Phase::Failed;
        let err = store.update(stale).await.unwrap_err();
        assert!(err.is_conflict());

        let key = ObjectKey::new("ns", "a");
        assert_eq!(store.get(&key).await.unwrap().phase(), Phase::Running);
    }

    #[tokio::test]
    async fn list_filters_namespace_and_labels() {
        let store = InMemoryStore::new();
        store.create(job("a", "wf")).await.unwrap();
        store.create(job("b", "other")).await.unwrap();
        let mut foreign = job("c", "wf");
        foreign.metadata.namespace = "elsewhere".to_string();
        store.create(foreign).await.unwrap();

        let selector = LabelSelector::new().with(labels::WORKFLOW, "wf");
        let found = store.list("ns", &selector).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name(), "a");
    }

    #[tokio::test]
    async fn patch_annotations_merges_and_removes() {
        let store = InMemoryStore::new();
        let mut seeded = job("a", "wf");
        seeded
            .metadata
            .annotations
            .insert("keep".to_string(), "1".to_string());
        seeded
            .metadata
            .annotations
            .insert("drop".to_string(), "1".to_string());
        store.create(seeded).await.unwrap();

        let mut patch = BTreeMap::new();
        patch.insert("drop".to_string(), None);
        patch.insert("new".to_string(), Some("2".to_string()));
        let patched = store
            .patch_annotations(&ObjectKey::new("ns", "a"), patch)
            .await
            .unwrap();

        assert_eq!(patched.metadata.annotation("keep"), Some("1"));
        assert_eq!(patched.metadata.annotation("new"), Some("2"));
        assert_eq!(patched.metadata.annotation("drop"), None);
    }

    #[tokio::test]
    async fn watch_reports_changes() {
        let store = InMemoryStore::new();
        let mut rx = store.watch();
        store.create(job("a", "wf")).await.unwrap();
        store.delete(&ObjectKey::new("ns", "a")).await.unwrap();

        let created = rx.recv().await.unwrap();
        assert_eq!(created.event, WatchEventKind::Created);
        assert_eq!(created.labels.get(labels::WORKFLOW).map(String::as_str), Some("wf"));
        assert_eq!(rx.recv().await.unwrap().event, WatchEventKind::Deleted);
    }
}
