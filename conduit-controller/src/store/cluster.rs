//! Store backed by an informer cache and the API server

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, PostParams, Preconditions, PropagationPolicy};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ResourceStore, Selector};
use crate::error::StoreError;

/// Reads from a reflector store, writes through the API
pub struct KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    client: Client,
    reader: Store<K>,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + 'static,
{
    /// Creates a store over the reader of a running informer
    pub fn new(client: Client, reader: Store<K>) -> Self {
        Self { client, reader }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Namespace and name of an object about to be written
    fn locate(obj: &K) -> Result<(String, String), StoreError> {
        let name = obj.name_any();
        let namespace = obj.namespace().ok_or_else(|| StoreError::MissingNamespace {
            kind: K::kind(&()).to_string(),
            name: name.clone(),
        })?;
        Ok((namespace, name))
    }
}

/// Maps API errors onto store errors; `conflict_is_exists` for creates
fn map_error<K: Resource<DynamicType = ()>>(
    err: kube::Error,
    namespace: &str,
    name: &str,
    conflict_is_exists: bool,
) -> StoreError {
    let kind = K::kind(&()).to_string();
    let key = format!("{namespace}/{name}");
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound { kind, key },
        kube::Error::Api(resp) if resp.code == 409 && conflict_is_exists => {
            StoreError::AlreadyExists { kind, key }
        }
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict {
            kind,
            key,
            message: resp.message,
        },
        other => StoreError::Kube(other),
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Option<K> {
        self.reader
            .get(&ObjectRef::new(name).within(namespace))
            .map(|obj| (*obj).clone())
    }

    fn list(&self, namespace: &str, selector: &Selector) -> Vec<K> {
        self.reader
            .state()
            .into_iter()
            .filter(|obj| obj.namespace().as_deref() == Some(namespace))
            .filter(|obj| selector.matches(obj.labels()))
            .map(|obj| (*obj).clone())
            .collect()
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = Self::locate(obj)?;
        debug!(kind = %K::kind(&()), %namespace, %name, "create");
        self.api(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_error::<K>(e, &namespace, &name, true))
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = Self::locate(obj)?;
        debug!(kind = %K::kind(&()), %namespace, %name, "update");
        self.api(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_error::<K>(e, &namespace, &name, false))
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = Self::locate(obj)?;
        debug!(kind = %K::kind(&()), %namespace, %name, "update status");
        // Whole object: cleared status fields must reach the server, and its
        // resourceVersion makes stale writes fail
        let body = serde_json::to_vec(obj)?;
        self.api(&namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| map_error::<K>(e, &namespace, &name, false))
    }

    async fn delete(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<(), StoreError> {
        debug!(kind = %K::kind(&()), %namespace, %name, "delete");
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..Default::default()
        };
        self.api(namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| map_error::<K>(e, namespace, name, false))
    }

    async fn wait_until_ready(&self) -> Result<(), StoreError> {
        self.reader
            .wait_until_ready()
            .await
            .map_err(|_| StoreError::NotReady(K::kind(&()).to_string()))
    }
}
