//! Pipe controller
//!
//! Keeps exactly one Flow per (pipe, triggering revision). Flows are never deleted here;
//! the ownership cascade removes them with their pipe.
//!
//! The flow cache lags behind our own creates. Each create is remembered until the cache
//! shows the flow, or `CREATE_EXPECTATION_TTL` passes, and no second flow is created for
//! that revision meanwhile.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::labels::REVISION_LABEL;
use conduit_core::naming::{flow_name, revision_hash};
use conduit_core::{Event, Flow, FlowSpec, FlowStatus, Pipe};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::engine::Syncer;
use crate::error::Result;
use crate::handlers::split_key;
use crate::ownership::{controller_ref, is_controlled_by};
use crate::store::{Selector, Stores};

/// How long a created flow may stay out of the cache before it is created again
pub const CREATE_EXPECTATION_TTL: Duration = Duration::from_secs(300);

/// A flow we created and the cache has not shown yet
struct Expectation {
    flow: String,
    created_at: Instant,
}

pub struct PipeController {
    stores: Stores,
    /// Keyed by `<namespace>/<pipe uid>/<revision>`
    expectations: Mutex<HashMap<String, Expectation>>,
}

#[async_trait]
impl Syncer for PipeController {
    async fn sync(&self, key: &str) -> Result<()> {
        self.sync_pipe(key).await
    }
}

impl PipeController {
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            expectations: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles the flows of the pipe stored under `key`
    #[instrument(skip(self))]
    pub async fn sync_pipe(&self, key: &str) -> Result<()> {
        let started = Instant::now();
        let (namespace, name) = split_key(key)?;
        let Some(pipe) = self.stores.pipes.get(namespace, name) else {
            debug!("pipe not found, nothing to do");
            return Ok(());
        };

        // One event per revision: the cache may not show a flow created earlier in this sync
        let events = self.stores.events.list(namespace, &Selector::everything());
        let mut revisions: BTreeMap<String, &Event> = BTreeMap::new();
        for event in events.iter().filter(|e| pipe.spec.watches(&e.spec)) {
            revisions
                .entry(revision_hash(&event.spec.repo, &event.spec.git_ref))
                .or_insert(event);
        }
        for (revision, event) in revisions {
            self.sync_event(&pipe, event, &revision).await?;
        }

        debug!(elapsed = ?started.elapsed(), "finished syncing pipe");
        Ok(())
    }

    async fn sync_event(&self, pipe: &Pipe, event: &Event, revision: &str) -> Result<()> {
        let namespace = pipe.namespace().unwrap_or_default();
        let flows: Vec<Flow> = self
            .stores
            .flows
            .list(&namespace, &Selector::label(REVISION_LABEL, revision))
            .into_iter()
            .filter(|flow| is_controlled_by(flow, pipe))
            .collect();

        let expectation_key = format!(
            "{}/{}/{}",
            namespace,
            pipe.uid().unwrap_or_default(),
            revision
        );
        let expected = expected_flow(pipe, event, revision)?;
        if flows.is_empty() {
            if let Some(flow) = self.pending_flow(&expectation_key) {
                debug!(%flow, %revision, "created flow not in cache yet");
                return Ok(());
            }
            let created = self.stores.flows.create(&expected).await?;
            info!(
                flow = %created.name_any(),
                event = %event.name_any(),
                %revision,
                "created flow"
            );
            self.expectations.lock().insert(
                expectation_key,
                Expectation {
                    flow: created.name_any(),
                    created_at: Instant::now(),
                },
            );
            return Ok(());
        }
        self.expectations.lock().remove(&expectation_key);

        for flow in flows {
            let git = &flow.spec.git;
            if git.repo != event.spec.repo || git.git_ref != event.spec.git_ref {
                continue;
            }
            if flow.spec.same_plan(&expected.spec) {
                continue;
            }

            let mut changed = flow.clone();
            changed.spec.git = expected.spec.git.clone();
            changed.spec.stages = expected.spec.stages.clone();
            changed.spec.mario = None;
            let mut updated = self.stores.flows.update(&changed).await?;
            updated.status = Some(FlowStatus::default());
            self.stores.flows.update_status(&updated).await?;
            info!(flow = %flow.name_any(), "flow plan changed, restarting");
        }
        Ok(())
    }
}

impl PipeController {
    /// Name of a flow created for `key` that the cache may still be missing
    fn pending_flow(&self, key: &str) -> Option<String> {
        let mut expectations = self.expectations.lock();
        match expectations.get(key) {
            Some(e) if e.created_at.elapsed() < CREATE_EXPECTATION_TTL => Some(e.flow.clone()),
            Some(_) => {
                expectations.remove(key);
                None
            }
            None => None,
        }
    }
}

/// Flow `pipe` runs for `event`
///
/// The selector is the pipe's label selector narrowed to the revision. Only label
/// equalities can be stamped on children, so expressions are not carried over.
pub fn expected_flow(pipe: &Pipe, event: &Event, revision: &str) -> Result<Flow> {
    let mut labels: BTreeMap<String, String> = pipe
        .spec
        .selector
        .as_ref()
        .and_then(|s| s.match_labels.clone())
        .unwrap_or_default();
    labels.insert(REVISION_LABEL.to_string(), revision.to_string());

    let mut git = pipe.spec.git.clone();
    git.git_ref = event.spec.git_ref.clone();

    Ok(Flow {
        metadata: ObjectMeta {
            name: Some(flow_name(&pipe.name_any())),
            namespace: pipe.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![controller_ref(pipe)?]),
            ..Default::default()
        },
        spec: FlowSpec {
            selector: LabelSelector {
                match_labels: Some(labels),
                match_expressions: None,
            },
            git,
            stages: pipe.spec.stages.clone(),
            mario: None,
        },
        status: None,
    })
}
