//! Fixtures shared by the controller tests

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use conduit_client::{ClientError, ManifestSource};
use conduit_core::{Action, ActionTemplate, Event, Flow, Mario, MarioSpec, Pipe};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, PodCondition, PodStatus};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;

use crate::store::{MemoryStore, StoreAction, Stores};

/// In-memory stores, kept typed so tests can seed and inspect them
pub struct Harness {
    pub events: Arc<MemoryStore<Event>>,
    pub pipes: Arc<MemoryStore<Pipe>>,
    pub flows: Arc<MemoryStore<Flow>>,
    pub jobs: Arc<MemoryStore<Job>>,
    pub pods: Arc<MemoryStore<Pod>>,
    pub pvcs: Arc<MemoryStore<PersistentVolumeClaim>>,
    pub config_maps: Arc<MemoryStore<ConfigMap>>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            events: Arc::new(MemoryStore::new()),
            pipes: Arc::new(MemoryStore::new()),
            flows: Arc::new(MemoryStore::new()),
            jobs: Arc::new(MemoryStore::new()),
            pods: Arc::new(MemoryStore::new()),
            pvcs: Arc::new(MemoryStore::new()),
            config_maps: Arc::new(MemoryStore::new()),
        }
    }

    pub fn stores(&self) -> Stores {
        Stores {
            events: self.events.clone(),
            pipes: self.pipes.clone(),
            flows: self.flows.clone(),
            jobs: self.jobs.clone(),
            pods: self.pods.clone(),
            pvcs: self.pvcs.clone(),
            config_maps: self.config_maps.clone(),
        }
    }

    /// Every recorded write as `<verb> <name>`, grouped by kind
    pub fn writes(&self) -> Vec<String> {
        let mut writes = Vec::new();
        let mut push = |kind: &str, actions: Vec<StoreAction>| {
            for action in actions {
                writes.push(format!("{} {} {}", action.verb(), kind, action.name()));
            }
        };
        push("event", self.events.actions());
        push("pipe", self.pipes.actions());
        push("flow", self.flows.actions());
        push("job", self.jobs.actions());
        push("pod", self.pods.actions());
        push("pvc", self.pvcs.actions());
        push("configmap", self.config_maps.actions());
        writes
    }

    pub fn clear_writes(&self) {
        self.events.clear_actions();
        self.pipes.clear_actions();
        self.flows.clear_actions();
        self.jobs.clear_actions();
        self.pods.clear_actions();
        self.pvcs.clear_actions();
        self.config_maps.clear_actions();
    }

    /// Marks a stored job finished with the given condition type
    pub fn finish_job(&self, namespace: &str, name: &str, condition: &str) {
        let mut job = self.jobs.get_object(namespace, name);
        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: condition.to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        self.jobs.put(job);
    }

    /// Adds a ready pod controlled by the stored job
    pub fn ready_pod(&self, namespace: &str, job: &str, ip: &str) -> Pod {
        let job = self.jobs.get_object(namespace, job);
        let labels = job
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone());
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-pod", job.name_any())),
                namespace: Some(namespace.to_string()),
                labels,
                owner_references: job.controller_owner_ref(&()).map(|r| vec![r]),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: Some(ip.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.pods.put(pod)
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + serde::Serialize + serde::de::DeserializeOwned,
{
    /// Stored object, panicking when absent
    pub fn get_object(&self, namespace: &str, name: &str) -> K {
        self.all()
            .into_iter()
            .find(|o| o.namespace().as_deref() == Some(namespace) && o.name_any() == name)
            .unwrap_or_else(|| panic!("{} {namespace}/{name} not stored", K::kind(&())))
    }

    pub fn names(&self) -> Vec<String> {
        self.all().iter().map(|o| o.name_any()).collect()
    }
}

/// Manifest source answering from memory
#[derive(Default)]
pub struct FakeManifests {
    manifest: Mutex<Option<Mario>>,
    calls: AtomicUsize,
}

impl FakeManifests {
    pub fn serving(mario: Mario) -> Self {
        Self {
            manifest: Mutex::new(Some(mario)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestSource for FakeManifests {
    async fn fetch_manifest(&self, _pod_ip: &str) -> conduit_client::Result<Mario> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.manifest
            .lock()
            .clone()
            .ok_or_else(|| ClientError::api_error(503, "not serving"))
    }
}

/// Manifest with one action per `(name, image)`
pub fn mario(actions: &[(&str, &str)]) -> Mario {
    Mario {
        api_version: conduit_core::domain::mario::MARIO_API_VERSION.to_string(),
        kind: conduit_core::domain::mario::MARIO_KIND.to_string(),
        spec: MarioSpec {
            actions: actions
                .iter()
                .map(|(name, image)| Action {
                    name: name.to_string(),
                    template: Some(ActionTemplate {
                        image: image.to_string(),
                        ..Default::default()
                    }),
                    env: Vec::new(),
                })
                .collect(),
        },
        ..Default::default()
    }
}

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
