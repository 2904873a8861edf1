//! Store layer
//!
//! Stores give the controllers a cache-backed read path and a write path for each
//! resource kind. Reads never leave the process; writes go to the API server and use
//! resourceVersion and UID preconditions for optimistic concurrency.
//!
//! All stores are trait-based so reconcilers can run against `MemoryStore` in tests.

mod cluster;
mod memory;
mod selector;

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{Event, Flow, Pipe};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod};

use crate::error::StoreError;

// Re-export implementations
pub use cluster::KubeStore;
pub use memory::{MemoryStore, StoreAction};
pub use selector::Selector;

/// Read and write access to one resource kind
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    /// Cached object by namespace and name
    fn get(&self, namespace: &str, name: &str) -> Option<K>;

    /// Cached objects of a namespace matching `selector`
    fn list(&self, namespace: &str, selector: &Selector) -> Vec<K>;

    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replaces the object, leaving its status alone
    async fn update(&self, obj: &K) -> Result<K, StoreError>;

    /// Replaces the status of the object, leaving its spec alone
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;

    /// Deletes the object, children in the background
    ///
    /// With `uid` set the delete only applies to that incarnation of the object.
    async fn delete(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<(), StoreError>;

    /// Waits for the initial list of the cache
    async fn wait_until_ready(&self) -> Result<(), StoreError>;
}

/// One store per kind the controllers touch
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn ResourceStore<Event>>,
    pub pipes: Arc<dyn ResourceStore<Pipe>>,
    pub flows: Arc<dyn ResourceStore<Flow>>,
    pub jobs: Arc<dyn ResourceStore<Job>>,
    pub pods: Arc<dyn ResourceStore<Pod>>,
    pub pvcs: Arc<dyn ResourceStore<PersistentVolumeClaim>>,
    pub config_maps: Arc<dyn ResourceStore<ConfigMap>>,
}

impl Stores {
    /// Waits until every cache has synced
    pub async fn wait_until_ready(&self) -> Result<(), StoreError> {
        self.events.wait_until_ready().await?;
        self.pipes.wait_until_ready().await?;
        self.flows.wait_until_ready().await?;
        self.jobs.wait_until_ready().await?;
        self.pods.wait_until_ready().await?;
        self.pvcs.wait_until_ready().await?;
        self.config_maps.wait_until_ready().await?;
        Ok(())
    }
}
