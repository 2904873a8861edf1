//! Informer wiring
//!
//! One watcher per kind feeds a reflector cache and calls a change handler for every
//! touched object. The caches back the `KubeStore` reads; the handlers turn changes
//! into pipe and flow keys.

use std::fmt::Debug;
use std::sync::Arc;

use conduit_core::labels::REVISION_LABEL;
use conduit_core::{Event, Flow, Pipe};
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::handlers::{
    flow_key_for_job, flow_key_for_owned, flow_key_for_pod, object_key, pipe_keys_for_event,
};
use crate::queue::WorkQueue;
use crate::store::{KubeStore, Stores};

/// Starts a watcher for `api` and returns the cache it fills
///
/// `on_change` runs for every applied or deleted object, after the cache saw it.
pub fn spawn_informer<K, F>(
    api: Api<K>,
    config: watcher::Config,
    stop: CancellationToken,
    on_change: F,
) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    F: Fn(&K) + Send + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = watcher(api, config)
        .default_backoff()
        .reflect(writer)
        .touched_objects();

    tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(obj)) => on_change(&obj),
                    Some(Err(e)) => warn!(kind = %K::kind(&()), "watch failed: {}", e),
                    None => break,
                },
            }
        }
        debug!(kind = %K::kind(&()), "informer stopped");
    });
    reader
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn store<K>(client: &Client, reader: Store<K>) -> Arc<KubeStore<K>>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + 'static,
{
    Arc::new(KubeStore::new(client.clone(), reader))
}

/// Starts every informer the controllers need
///
/// Pipes and events feed `pipe_queue`; flows and everything flows own feed
/// `flow_queue`. Owned kinds are only watched when they carry a revision label.
pub fn start(
    client: &Client,
    config: &Config,
    pipe_queue: &WorkQueue,
    flow_queue: &WorkQueue,
    stop: &CancellationToken,
) -> Stores {
    let ns = config.namespace.as_deref();
    let all = watcher::Config::default;
    let owned = || watcher::Config::default().labels(REVISION_LABEL);

    let queue = pipe_queue.clone();
    let pipes = spawn_informer(api::<Pipe>(client, ns), all(), stop.clone(), move |pipe| {
        if let Some(key) = object_key(pipe) {
            queue.add(key);
        }
    });

    let queue = pipe_queue.clone();
    let pipe_reader = pipes.clone();
    let events = spawn_informer(api::<Event>(client, ns), all(), stop.clone(), move |event| {
        let pipes: Vec<Pipe> = pipe_reader.state().iter().map(|p| p.as_ref().clone()).collect();
        for key in pipe_keys_for_event(event, &pipes) {
            queue.add(key);
        }
    });

    let queue = flow_queue.clone();
    let flows = spawn_informer(api::<Flow>(client, ns), all(), stop.clone(), move |flow| {
        if let Some(key) = object_key(flow) {
            queue.add(key);
        }
    });

    let queue = flow_queue.clone();
    let jobs = spawn_informer(api::<Job>(client, ns), owned(), stop.clone(), move |job| {
        if let Some(key) = flow_key_for_job(job) {
            queue.add(key);
        }
    });

    let queue = flow_queue.clone();
    let job_reader = jobs.clone();
    let pods = spawn_informer(api::<Pod>(client, ns), owned(), stop.clone(), move |pod| {
        let lookup = |namespace: &str, name: &str| {
            job_reader
                .get(&ObjectRef::new(name).within(namespace))
                .map(|job| job.as_ref().clone())
        };
        if let Some(key) = flow_key_for_pod(pod, lookup) {
            queue.add(key);
        }
    });

    let queue = flow_queue.clone();
    let pvcs = spawn_informer(
        api::<PersistentVolumeClaim>(client, ns),
        owned(),
        stop.clone(),
        move |pvc| {
            if let Some(key) = flow_key_for_owned(pvc) {
                queue.add(key);
            }
        },
    );

    // Never mutated once created, nothing to react to
    let config_maps = spawn_informer(
        api::<ConfigMap>(client, ns),
        owned(),
        stop.clone(),
        |_: &ConfigMap| {},
    );

    Stores {
        events: store(client, events),
        pipes: store(client, pipes),
        flows: store(client, flows),
        jobs: store(client, jobs),
        pods: store(client, pods),
        pvcs: store(client, pvcs),
        config_maps: store(client, config_maps),
    }
}
