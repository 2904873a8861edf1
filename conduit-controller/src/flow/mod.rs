//! Flow controller
//!
//! Drives a Flow from its spec to a terminal phase:
//! 1. claim the live jobs of the flow, deleting strays, stale and duplicate jobs
//! 2. bootstrap: volume, checkout script, fetch job, attach job, manifest
//! 3. run the user stages in order, one job each
//! 4. write the status derived from what exists now
//!
//! Nothing is remembered between syncs; every decision is recomputed from the cache.

pub mod jobs;
pub mod status;

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use conduit_client::ManifestSource;
use conduit_core::labels::{SPEC_HASH_LABEL, STAGE_LABEL};
use conduit_core::{Flow, StageKey};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::engine::Syncer;
use crate::error::{Error, Result};
use crate::handlers::split_key;
use crate::ownership::is_controlled_by;
use crate::store::{Selector, Stores};

pub use jobs::JobSettings;
pub use status::JobMap;
use status::{compute_status, is_job_complete, is_pod_ready};

pub struct FlowController {
    stores: Stores,
    manifests: Arc<dyn ManifestSource>,
    settings: JobSettings,
}

#[async_trait]
impl Syncer for FlowController {
    async fn sync(&self, key: &str) -> Result<()> {
        self.sync_flow(key).await
    }
}

impl FlowController {
    pub fn new(stores: Stores, manifests: Arc<dyn ManifestSource>, settings: JobSettings) -> Self {
        Self {
            stores,
            manifests,
            settings,
        }
    }

    /// Reconciles the flow stored under `key`
    #[instrument(skip(self))]
    pub async fn sync_flow(&self, key: &str) -> Result<()> {
        let started = Instant::now();
        let (namespace, name) = split_key(key)?;
        let Some(flow) = self.stores.flows.get(namespace, name) else {
            debug!("flow not found, nothing to do");
            return Ok(());
        };
        let spec_hash = flow.spec.spec_hash()?;

        let mut jobs = self.claim_jobs(&flow, &spec_hash).await;
        let mut pvc = self.owned(&flow, self.stores.pvcs.get(namespace, name))?;

        let flow = if flow.spec.mario.is_none() {
            self.bootstrap(flow, &spec_hash, &mut jobs, &mut pvc).await?
        } else {
            flow
        };

        if flow.spec.mario.is_some() && !flow.phase().is_terminal() {
            self.run_stages(&flow, &spec_hash, &mut jobs).await?;
        }

        self.sync_status(&flow, &spec_hash, &jobs, pvc.as_ref()).await?;
        debug!(elapsed = ?started.elapsed(), "finished syncing flow");
        Ok(())
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Live jobs of the flow by stage
    ///
    /// Jobs controlled by someone else are ignored. Our jobs with an unknown stage or
    /// an outdated spec hash are deleted, and so are all but the newest job of a stage.
    async fn claim_jobs(&self, flow: &Flow, spec_hash: &str) -> JobMap {
        let namespace = flow.namespace().unwrap_or_default();
        let selector = Selector::from(flow.spec.selector.clone());
        let mut by_stage: BTreeMap<StageKey, Vec<Job>> = BTreeMap::new();

        for job in self.stores.jobs.list(&namespace, &selector) {
            if !is_controlled_by(&job, flow) {
                continue;
            }
            let labels = job.labels();
            let stage = labels
                .get(STAGE_LABEL)
                .and_then(|value| StageKey::parse(value))
                .filter(|stage| match stage {
                    StageKey::User(name) => flow.spec.stages.iter().any(|s| s.name == *name),
                    _ => true,
                });
            let Some(stage) = stage else {
                warn!(job = %job.name_any(), "deleting job with unknown stage");
                self.delete_job(&job).await;
                continue;
            };
            if labels.get(SPEC_HASH_LABEL).map(String::as_str) != Some(spec_hash) {
                info!(job = %job.name_any(), "deleting job created for an older spec");
                self.delete_job(&job).await;
                continue;
            }
            by_stage.entry(stage).or_default().push(job);
        }

        let mut claimed = JobMap::new();
        for (stage, mut candidates) in by_stage {
            candidates.sort_by_key(|job| {
                Reverse((
                    job.creation_timestamp().map(|t| t.0),
                    job.name_any(),
                ))
            });
            let mut candidates = candidates.into_iter();
            let Some(newest) = candidates.next() else {
                continue;
            };
            for duplicate in candidates {
                warn!(
                    job = %duplicate.name_any(),
                    kept = %newest.name_any(),
                    %stage,
                    "deleting duplicate job of stage"
                );
                self.delete_job(&duplicate).await;
            }
            claimed.insert(stage, newest);
        }
        claimed
    }

    /// Deletes one incarnation of a job; failures are logged only
    async fn delete_job(&self, job: &Job) {
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        match self
            .stores
            .jobs
            .delete(&namespace, &name, job.meta().uid.as_deref())
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(job = %name, "failed to delete job: {}", e),
        }
    }

    async fn create_job(&self, jobs: &mut JobMap, stage: StageKey, job: Job) -> Result<()> {
        let created = self.stores.jobs.create(&job).await?;
        info!(job = %created.name_any(), %stage, "created job");
        jobs.insert(stage, created);
        Ok(())
    }

    // ========================================================================
    // Bootstrap
    // ========================================================================

    /// Gets the flow to an attached manifest; returns the flow as last written
    async fn bootstrap(
        &self,
        flow: Flow,
        spec_hash: &str,
        jobs: &mut JobMap,
        pvc: &mut Option<PersistentVolumeClaim>,
    ) -> Result<Flow> {
        if pvc.is_none() {
            let created = self
                .stores
                .pvcs
                .create(&jobs::repo_volume_claim(&flow, &self.settings)?)
                .await?;
            info!(pvc = %created.name_any(), "created volume claim");
            *pvc = Some(created);
        }
        self.ensure_config_map(&flow).await?;

        let fetch = jobs.get(&StageKey::Fetch);
        let attach = jobs.get(&StageKey::Attach);
        match (fetch, attach) {
            (None, None) => {
                let job = jobs::fetch_job(&flow, &self.settings, spec_hash)?;
                self.create_job(jobs, StageKey::Fetch, job).await?;
            }
            (Some(fetch), None) if is_job_complete(fetch) => {
                let job = jobs::attach_job(&flow, &self.settings, spec_hash)?;
                self.create_job(jobs, StageKey::Attach, job).await?;
            }
            _ => {}
        }

        match jobs.get(&StageKey::Attach) {
            Some(attach) => self.attach_manifest(flow, attach).await,
            None => Ok(flow),
        }
    }

    async fn ensure_config_map(&self, flow: &Flow) -> Result<()> {
        let namespace = flow.namespace().unwrap_or_default();
        let existing = self.stores.config_maps.get(&namespace, &flow.name_any());
        if self.owned(flow, existing)?.is_some() {
            return Ok(());
        }
        let created = self
            .stores
            .config_maps
            .create(&jobs::script_config_map(flow)?)
            .await?;
        info!(config_map = %created.name_any(), "created checkout script");
        Ok(())
    }

    /// Copies the manifest served by a ready attach pod into the flow spec
    ///
    /// Fetch failures are logged and leave the flow untouched.
    async fn attach_manifest(&self, flow: Flow, attach: &Job) -> Result<Flow> {
        let namespace = flow.namespace().unwrap_or_default();
        let selector = attach
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.clone())
            .map(Selector::from)
            .unwrap_or_else(|| Selector::from_labels(template_labels(attach)));

        let pods = self.stores.pods.list(&namespace, &selector);
        for pod in pods.iter().filter(|p| is_pod_ready(p) && is_controlled_by(*p, attach)) {
            let Some(ip) = pod.status.as_ref().and_then(|s| s.pod_ip.as_deref()) else {
                continue;
            };
            match self.manifests.fetch_manifest(ip).await {
                Ok(mario) => {
                    let mut updated = flow.clone();
                    updated.spec.mario = Some(mario);
                    let updated = self.stores.flows.update(&updated).await?;
                    info!(pod = %pod.name_any(), "attached manifest");
                    return Ok(updated);
                }
                Err(e) => warn!(pod = %pod.name_any(), %ip, "can't fetch manifest: {}", e),
            }
        }
        Ok(flow)
    }

    // ========================================================================
    // Stages
    // ========================================================================

    /// Creates the job of the stage following the last stage with a job, once that
    /// job completed
    async fn run_stages(&self, flow: &Flow, spec_hash: &str, jobs: &mut JobMap) -> Result<()> {
        let Some(mario) = flow.spec.mario.as_ref() else {
            return Ok(());
        };
        let stages = &flow.spec.stages;
        let last = stages
            .iter()
            .rposition(|s| jobs.contains_key(&StageKey::user(&s.name)));
        let next = match last {
            Some(i) => {
                let done = jobs
                    .get(&StageKey::user(&stages[i].name))
                    .is_some_and(is_job_complete);
                if !done {
                    return Ok(());
                }
                i + 1
            }
            None => 0,
        };
        let Some(stage) = stages.get(next) else {
            return Ok(());
        };

        match jobs::user_job(flow, stage, mario, spec_hash) {
            Ok(job) => self.create_job(jobs, StageKey::user(&stage.name), job).await,
            Err(Error::Action(e)) => {
                warn!(stage = %stage.name, "can't run stage: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    async fn sync_status(
        &self,
        flow: &Flow,
        spec_hash: &str,
        jobs: &JobMap,
        pvc: Option<&PersistentVolumeClaim>,
    ) -> Result<()> {
        let now = Time(chrono::Utc::now());
        let status = compute_status(flow, spec_hash, jobs, pvc, &now);
        if flow.status.as_ref() == Some(&status) {
            return Ok(());
        }

        let mut updated = flow.clone();
        updated.status = Some(status);
        let updated = self.stores.flows.update_status(&updated).await?;
        info!(phase = %updated.phase(), "updated flow status");
        Ok(())
    }

    /// Passes through an object only if the flow controls it
    fn owned<K>(&self, flow: &Flow, obj: Option<K>) -> Result<Option<K>>
    where
        K: Resource<DynamicType = ()>,
    {
        match obj {
            Some(obj) if !is_controlled_by(&obj, flow) => Err(Error::NotControlled {
                kind: K::kind(&()).to_string(),
                name: obj.name_any(),
                owner: format!("Flow {}", flow.name_any()),
            }),
            obj => Ok(obj),
        }
    }
}

fn template_labels(job: &Job) -> BTreeMap<String, String> {
    job.spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.labels.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ResourceStore;
    use crate::testing::{FakeManifests, Harness, labels, mario};
    use conduit_core::labels::REVISION_LABEL;
    use conduit_core::{FlowPhase, FlowSpec, Git, Stage, StagePhase};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;

    const NS: &str = "ci";
    const FLOW: &str = "app-abc1234";
    const KEY: &str = "ci/app-abc1234";

    fn flow(stages: &[(&str, &str)]) -> Flow {
        let mut flow = Flow::new(
            FLOW,
            FlowSpec {
                selector: LabelSelector {
                    match_labels: Some(labels(&[(REVISION_LABEL, "0123456789a")])),
                    match_expressions: None,
                },
                git: Git {
                    repo: "https://example.com/acme/app.git".to_string(),
                    git_ref: "main".to_string(),
                    ..Default::default()
                },
                stages: stages.iter().map(|(n, a)| Stage::new(*n, *a)).collect(),
                mario: None,
            },
        );
        flow.metadata.namespace = Some(NS.to_string());
        flow.metadata.labels = Some(labels(&[(REVISION_LABEL, "0123456789a")]));
        flow
    }

    fn controller(harness: &Harness, manifests: Arc<FakeManifests>) -> FlowController {
        FlowController::new(harness.stores(), manifests, JobSettings::default())
    }

    /// Runs a flow through bootstrap up to the first stage job
    async fn attached(harness: &Harness, ctrl: &FlowController) {
        ctrl.sync_flow(KEY).await.unwrap();
        harness.finish_job(NS, "app-abc1234-git", "Complete");
        ctrl.sync_flow(KEY).await.unwrap();
        harness.ready_pod(NS, "app-abc1234-mario", "10.0.0.7");
        ctrl.sync_flow(KEY).await.unwrap();
        harness.clear_writes();
    }

    fn stored(harness: &Harness) -> Flow {
        harness.flows.get_object(NS, FLOW)
    }

    #[tokio::test]
    async fn test_bootstrap_creates_volume_script_and_fetch_job() {
        let harness = Harness::new();
        harness.flows.put(flow(&[("build", "make")]));
        let ctrl = controller(&harness, Arc::new(FakeManifests::default()));

        ctrl.sync_flow(KEY).await.unwrap();
        assert_eq!(
            harness.writes(),
            vec![
                "update-status flow app-abc1234",
                "create job app-abc1234-git",
                "create pvc app-abc1234",
                "create configmap app-abc1234",
            ]
        );
        let status = stored(&harness).status.unwrap();
        assert_eq!(status.phase, FlowPhase::Pending);
        assert!(status.stage_statuses.is_empty());

        harness.clear_writes();
        ctrl.sync_flow(KEY).await.unwrap();
        assert!(harness.writes().is_empty());
    }

    #[tokio::test]
    async fn test_attach_job_waits_for_fetch() {
        let harness = Harness::new();
        harness.flows.put(flow(&[("build", "make")]));
        let ctrl = controller(&harness, Arc::new(FakeManifests::default()));

        ctrl.sync_flow(KEY).await.unwrap();
        harness.finish_job(NS, "app-abc1234-git", "Failed");
        ctrl.sync_flow(KEY).await.unwrap();
        assert_eq!(harness.jobs.names(), vec!["app-abc1234-git"]);

        harness.finish_job(NS, "app-abc1234-git", "Complete");
        ctrl.sync_flow(KEY).await.unwrap();
        assert_eq!(
            harness.jobs.names(),
            vec!["app-abc1234-git", "app-abc1234-mario"]
        );
    }

    #[tokio::test]
    async fn test_manifest_is_attached_once() {
        let harness = Harness::new();
        harness.flows.put(flow(&[("build", "make")]));
        let manifests = Arc::new(FakeManifests::serving(mario(&[("make", "rust:1")])));
        let ctrl = controller(&harness, manifests.clone());

        attached(&harness, &ctrl).await;
        let flow = stored(&harness);
        assert_eq!(flow.spec.mario, Some(mario(&[("make", "rust:1")])));
        assert!(harness.jobs.get("ci", "app-abc1234-user-build").is_some());
        assert_eq!(manifests.calls(), 1);

        ctrl.sync_flow(KEY).await.unwrap();
        assert!(harness.writes().is_empty());
        assert_eq!(manifests.calls(), 1);
    }

    #[tokio::test]
    async fn test_manifest_fetch_failure_leaves_flow_alone() {
        let harness = Harness::new();
        harness.flows.put(flow(&[("build", "make")]));
        let manifests = Arc::new(FakeManifests::default());
        let ctrl = controller(&harness, manifests.clone());

        attached(&harness, &ctrl).await;
        assert_eq!(manifests.calls(), 1);
        assert!(stored(&harness).spec.mario.is_none());
        assert!(harness.jobs.get("ci", "app-abc1234-user-build").is_none());
    }

    #[tokio::test]
    async fn test_stages_run_in_order_until_succeeded() {
        let harness = Harness::new();
        harness.flows.put(flow(&[("build", "make"), ("test", "check")]));
        let manifests = Arc::new(FakeManifests::serving(mario(&[
            ("make", "rust:1"),
            ("check", "rust:1"),
        ])));
        let ctrl = controller(&harness, manifests);

        attached(&harness, &ctrl).await;
        let status = stored(&harness).status.unwrap();
        assert_eq!(status.phase, FlowPhase::Running);
        assert_eq!(status.stage_statuses[0].phase, StagePhase::Running);

        ctrl.sync_flow(KEY).await.unwrap();
        assert!(harness.jobs.get("ci", "app-abc1234-user-test").is_none());

        harness.finish_job(NS, "app-abc1234-user-build", "Complete");
        ctrl.sync_flow(KEY).await.unwrap();
        assert!(harness.jobs.get("ci", "app-abc1234-user-test").is_some());

        harness.finish_job(NS, "app-abc1234-user-test", "Complete");
        ctrl.sync_flow(KEY).await.unwrap();
        let status = stored(&harness).status.unwrap();
        assert_eq!(status.phase, FlowPhase::Succeeded);
        assert!(status.stage_statuses.iter().all(|s| s.phase == StagePhase::Complete));

        harness.clear_writes();
        ctrl.sync_flow(KEY).await.unwrap();
        assert!(harness.writes().is_empty());
    }

    #[tokio::test]
    async fn test_failed_stage_stops_the_flow() {
        let harness = Harness::new();
        harness.flows.put(flow(&[("build", "make"), ("test", "check")]));
        let manifests = Arc::new(FakeManifests::serving(mario(&[
            ("make", "rust:1"),
            ("check", "rust:1"),
        ])));
        let ctrl = controller(&harness, manifests);

        attached(&harness, &ctrl).await;
        harness.finish_job(NS, "app-abc1234-user-build", "Failed");
        ctrl.sync_flow(KEY).await.unwrap();
        ctrl.sync_flow(KEY).await.unwrap();

        assert_eq!(stored(&harness).phase(), FlowPhase::Failed);
        assert!(harness.jobs.get("ci", "app-abc1234-user-test").is_none());
    }

    #[tokio::test]
    async fn test_unknown_action_creates_no_job() {
        let harness = Harness::new();
        harness.flows.put(flow(&[("build", "missing")]));
        let manifests = Arc::new(FakeManifests::serving(mario(&[("make", "rust:1")])));
        let ctrl = controller(&harness, manifests);

        attached(&harness, &ctrl).await;
        assert!(harness.jobs.get("ci", "app-abc1234-user-build").is_none());
        assert_eq!(stored(&harness).phase(), FlowPhase::Pending);
    }

    #[tokio::test]
    async fn test_duplicate_jobs_keep_the_newest() {
        let harness = Harness::new();
        let flow = harness.flows.put(flow(&[("build", "make")]));
        let spec_hash = flow.spec.spec_hash().unwrap();
        let settings = JobSettings::default();

        let mut older = jobs::fetch_job(&flow, &settings, &spec_hash).unwrap();
        older.metadata.name = Some("app-abc1234-git-old".to_string());
        older.metadata.creation_timestamp = Some(Time(chrono::Utc::now() - chrono::Duration::minutes(5)));
        harness.jobs.put(older);
        harness.jobs.put(jobs::fetch_job(&flow, &settings, &spec_hash).unwrap());

        let ctrl = controller(&harness, Arc::new(FakeManifests::default()));
        ctrl.sync_flow(KEY).await.unwrap();
        assert_eq!(harness.jobs.names(), vec!["app-abc1234-git"]);
        assert!(harness.writes().contains(&"delete job app-abc1234-git-old".to_string()));
    }

    #[tokio::test]
    async fn test_stale_and_stray_jobs_are_deleted() {
        let harness = Harness::new();
        let flow = harness.flows.put(flow(&[("build", "make")]));
        let settings = JobSettings::default();

        let stale = jobs::fetch_job(&flow, &settings, "stalehash00").unwrap();
        harness.jobs.put(stale);
        let mut stray = jobs::fetch_job(&flow, &settings, &flow.spec.spec_hash().unwrap()).unwrap();
        stray.metadata.name = Some("app-abc1234-user-gone".to_string());
        if let Some(labels) = stray.metadata.labels.as_mut() {
            labels.insert(STAGE_LABEL.to_string(), "user-gone".to_string());
        }
        harness.jobs.put(stray);

        let ctrl = controller(&harness, Arc::new(FakeManifests::default()));
        ctrl.sync_flow(KEY).await.unwrap();

        let writes = harness.writes();
        assert!(writes.contains(&"delete job app-abc1234-git".to_string()));
        assert!(writes.contains(&"delete job app-abc1234-user-gone".to_string()));
        assert!(writes.contains(&"create job app-abc1234-git".to_string()));
        let job = harness.jobs.get_object(NS, "app-abc1234-git");
        assert_eq!(
            job.labels().get(SPEC_HASH_LABEL),
            Some(&flow.spec.spec_hash().unwrap())
        );
    }

    #[tokio::test]
    async fn test_jobs_of_other_owners_are_ignored() {
        let harness = Harness::new();
        let flow = harness.flows.put(flow(&[("build", "make")]));
        let mut foreign = jobs::fetch_job(&flow, &JobSettings::default(), "whatever000").unwrap();
        foreign.metadata.name = Some("someone-elses".to_string());
        if let Some(refs) = foreign.metadata.owner_references.as_mut() {
            refs[0].uid = "another-uid".to_string();
        }
        harness.jobs.put(foreign);

        let ctrl = controller(&harness, Arc::new(FakeManifests::default()));
        ctrl.sync_flow(KEY).await.unwrap();
        assert!(harness.jobs.get(NS, "someone-elses").is_some());
        assert!(!harness.writes().iter().any(|w| w.starts_with("delete")));
    }

    #[tokio::test]
    async fn test_foreign_volume_is_an_error() {
        let harness = Harness::new();
        harness.flows.put(flow(&[("build", "make")]));
        harness.pvcs.put(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(FLOW.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        let ctrl = controller(&harness, Arc::new(FakeManifests::default()));
        let err = ctrl.sync_flow(KEY).await.unwrap_err();
        assert!(matches!(err, Error::NotControlled { .. }));
        assert!(harness.writes().is_empty());
    }

    #[tokio::test]
    async fn test_missing_flow_is_not_an_error() {
        let harness = Harness::new();
        let ctrl = controller(&harness, Arc::new(FakeManifests::default()));
        ctrl.sync_flow("ci/gone").await.unwrap();
        assert!(ctrl.sync_flow("nonsense").await.is_err());
    }
}
