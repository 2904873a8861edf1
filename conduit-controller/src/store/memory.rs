//! In-memory store
//!
//! Behaves like the API server for the parts the reconcilers rely on: UIDs, increasing
//! resourceVersions, creation timestamps, name uniqueness, resourceVersion conflicts and
//! UID preconditions on delete. Every write made through `ResourceStore` is recorded so
//! tests can assert on exactly what a sync did.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{ResourceStore, Selector};
use crate::error::StoreError;

/// A write made through the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAction {
    Create { namespace: String, name: String },
    Update { namespace: String, name: String },
    UpdateStatus { namespace: String, name: String },
    Delete { namespace: String, name: String },
}

impl StoreAction {
    pub fn verb(&self) -> &'static str {
        match self {
            StoreAction::Create { .. } => "create",
            StoreAction::Update { .. } => "update",
            StoreAction::UpdateStatus { .. } => "update-status",
            StoreAction::Delete { .. } => "delete",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StoreAction::Create { name, .. }
            | StoreAction::Update { name, .. }
            | StoreAction::UpdateStatus { name, .. }
            | StoreAction::Delete { name, .. } => name,
        }
    }
}

type ObjectKey = (String, String);

pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<ObjectKey, K>>,
    actions: Mutex<Vec<StoreAction>>,
    next_version: AtomicU64,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            actions: Mutex::new(Vec::new()),
            next_version: AtomicU64::new(1),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an object as another actor would, without recording it
    pub fn put(&self, mut obj: K) -> K {
        self.stamp(&mut obj);
        let key = (obj.namespace().unwrap_or_default(), obj.name_any());
        self.objects.lock().insert(key, obj.clone());
        obj
    }

    /// Removes an object without recording it
    pub fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .remove(&(namespace.to_string(), name.to_string()))
    }

    pub fn all(&self) -> Vec<K> {
        self.objects.lock().values().cloned().collect()
    }

    /// Writes recorded so far, oldest first
    pub fn actions(&self) -> Vec<StoreAction> {
        self.actions.lock().clone()
    }

    pub fn clear_actions(&self) {
        self.actions.lock().clear();
    }

    /// Sets server-owned metadata: uid and creation time once, a new resourceVersion always
    fn stamp(&self, obj: &mut K) {
        let meta = obj.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        }
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        meta.resource_version = Some(version.to_string());
    }

    fn record(&self, action: StoreAction) {
        self.actions.lock().push(action);
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn locate(obj: &K) -> Result<ObjectKey, StoreError> {
        let name = obj.name_any();
        let namespace = obj.namespace().ok_or_else(|| StoreError::MissingNamespace {
            kind: Self::kind(),
            name: name.clone(),
        })?;
        Ok((namespace, name))
    }

    /// Fails unless `obj` carries the stored resourceVersion, or none at all
    fn check_version(stored: &K, obj: &K, key: &ObjectKey) -> Result<(), StoreError> {
        match obj.resource_version() {
            Some(version) if Some(&version) != stored.meta().resource_version.as_ref() => {
                Err(StoreError::Conflict {
                    kind: Self::kind(),
                    key: format!("{}/{}", key.0, key.1),
                    message: format!("resourceVersion {version} is stale"),
                })
            }
            _ => Ok(()),
        }
    }

    /// Everything but the status comes from `obj` when `keep_status`, only the
    /// status otherwise
    fn replace(&self, obj: &K, keep_status: bool) -> Result<K, StoreError> {
        let key = Self::locate(obj)?;
        let mut objects = self.objects.lock();
        let stored = objects.get(&key).ok_or_else(|| StoreError::NotFound {
            kind: Self::kind(),
            key: format!("{}/{}", key.0, key.1),
        })?;
        Self::check_version(stored, obj, &key)?;

        let mut updated = if keep_status {
            with_status_of(obj, stored)?
        } else {
            with_status_of(stored, obj)?
        };
        let meta = updated.meta_mut();
        meta.uid = stored.meta().uid.clone();
        meta.creation_timestamp = stored.meta().creation_timestamp.clone();
        self.stamp(&mut updated);
        objects.insert(key, updated.clone());
        Ok(updated)
    }
}

/// `target` with the status of `source`
fn with_status_of<K: Serialize + DeserializeOwned>(target: &K, source: &K) -> Result<K, StoreError> {
    let mut value = serde_json::to_value(target)?;
    let status = serde_json::to_value(source)?
        .get_mut("status")
        .map(Value::take)
        .filter(|s| !s.is_null());
    if let Some(fields) = value.as_object_mut() {
        match status {
            Some(status) => {
                fields.insert("status".to_string(), status);
            }
            None => {
                fields.remove("status");
            }
        }
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn list(&self, namespace: &str, selector: &Selector) -> Vec<K> {
        self.objects
            .lock()
            .iter()
            .filter(|((ns, _), obj)| ns == namespace && selector.matches(obj.labels()))
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::locate(obj)?;
        let created = {
            let mut objects = self.objects.lock();
            if objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    kind: Self::kind(),
                    key: format!("{}/{}", key.0, key.1),
                });
            }
            let mut created = obj.clone();
            let meta = created.meta_mut();
            meta.uid = None;
            meta.creation_timestamp = None;
            self.stamp(&mut created);
            objects.insert(key.clone(), created.clone());
            created
        };
        self.record(StoreAction::Create {
            namespace: key.0,
            name: key.1,
        });
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let updated = self.replace(obj, true)?;
        self.record(StoreAction::Update {
            namespace: updated.namespace().unwrap_or_default(),
            name: updated.name_any(),
        });
        Ok(updated)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let updated = self.replace(obj, false)?;
        self.record(StoreAction::UpdateStatus {
            namespace: updated.namespace().unwrap_or_default(),
            name: updated.name_any(),
        });
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<(), StoreError> {
        let key = (namespace.to_string(), name.to_string());
        {
            let mut objects = self.objects.lock();
            let stored = objects.get(&key).ok_or_else(|| StoreError::NotFound {
                kind: Self::kind(),
                key: format!("{namespace}/{name}"),
            })?;
            if let Some(uid) = uid {
                if stored.meta().uid.as_deref() != Some(uid) {
                    return Err(StoreError::Conflict {
                        kind: Self::kind(),
                        key: format!("{namespace}/{name}"),
                        message: format!("uid precondition {uid} failed"),
                    });
                }
            }
            objects.remove(&key);
        }
        self.record(StoreAction::Delete {
            namespace: key.0,
            name: key.1,
        });
        Ok(())
    }

    async fn wait_until_ready(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
