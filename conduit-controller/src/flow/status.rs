//! Flow status, derived from the owned jobs and volume
//!
//! The status is recomputed from scratch on every sync. Condition timestamps are the
//! only thing carried over from the stored status, and only while a condition keeps
//! the same state, so an unchanged world yields an identical status.

use std::collections::BTreeMap;

use conduit_core::domain::flow::reason;
use conduit_core::{
    ConditionStatus, Flow, FlowCondition, FlowConditionType, FlowPhase, FlowStatus, Stage,
    StageKey, StagePhase, StageStatus,
};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

/// Live jobs of a flow by stage, at most one per stage
pub type JobMap = BTreeMap<StageKey, Job>;

pub fn is_job_complete(job: &Job) -> bool {
    has_job_condition(job, "Complete")
}

pub fn is_job_failed(job: &Job) -> bool {
    has_job_condition(job, "Failed")
}

fn has_job_condition(job: &Job, type_: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == type_ && c.status == "True"))
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// Status of `flow` given its live jobs and volume
pub fn compute_status(
    flow: &Flow,
    spec_hash: &str,
    jobs: &JobMap,
    pvc: Option<&PersistentVolumeClaim>,
    now: &Time,
) -> FlowStatus {
    let mut conditions = vec![
        git_volume_condition(pvc, now),
        mario_condition(
            flow,
            jobs.get(&StageKey::Fetch),
            jobs.get(&StageKey::Attach),
            now,
        ),
    ];
    carry_timestamps(flow.status.as_ref(), &mut conditions);

    let stage_statuses = stage_statuses(&flow.spec.stages, jobs);
    let phase = flow_phase(flow.spec.stages.len(), &stage_statuses);
    FlowStatus {
        phase,
        stage_statuses,
        conditions,
        observed_spec_hash: Some(spec_hash.to_string()),
    }
}

fn git_volume_condition(pvc: Option<&PersistentVolumeClaim>, now: &Time) -> FlowCondition {
    let condition = |status, reason, message: &str| {
        FlowCondition::new(
            FlowConditionType::GitVolumeReady,
            status,
            reason,
            message,
            now.clone(),
        )
    };

    let Some(pvc) = pvc else {
        return condition(
            ConditionStatus::False,
            reason::GIT_VOLUME_CLAIMING,
            "PersistentVolumeClaim is not created",
        );
    };
    let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());
    match phase {
        Some("Pending") => condition(
            ConditionStatus::False,
            reason::GIT_VOLUME_PENDING,
            "PersistentVolumeClaim is pending",
        ),
        Some("Bound") => condition(
            ConditionStatus::True,
            reason::GIT_VOLUME_BOUND,
            "PersistentVolumeClaim is bound",
        ),
        Some("Lost") => condition(
            ConditionStatus::False,
            reason::GIT_VOLUME_LOST,
            "Volume of the PersistentVolumeClaim is lost",
        ),
        _ => condition(
            ConditionStatus::Unknown,
            reason::GIT_VOLUME_UNKNOWN,
            "PersistentVolumeClaim status is unknown",
        ),
    }
}

fn mario_condition(flow: &Flow, fetch: Option<&Job>, attach: Option<&Job>, now: &Time) -> FlowCondition {
    let condition = |status, reason, message: String| {
        FlowCondition::new(
            FlowConditionType::MarioReady,
            status,
            reason,
            message,
            now.clone(),
        )
    };

    if flow.spec.mario.is_some() {
        return condition(
            ConditionStatus::True,
            reason::MARIO_READY,
            "Manifest is attached".to_string(),
        );
    }
    if let Some(job) = attach {
        if is_job_failed(job) {
            return condition(
                ConditionStatus::False,
                reason::MARIO_FAILED,
                format!("Attach job {} failed", job.name_any()),
            );
        }
        return condition(
            ConditionStatus::False,
            reason::MARIO_PENDING,
            format!("Waiting for attach job {} to serve the manifest", job.name_any()),
        );
    }
    match fetch {
        Some(job) if is_job_failed(job) => condition(
            ConditionStatus::False,
            reason::GIT_FAILED,
            format!("git failed: fetch job {} failed", job.name_any()),
        ),
        Some(job) if is_job_complete(job) => condition(
            ConditionStatus::False,
            reason::MARIO_PENDING,
            "Waiting to attach the manifest".to_string(),
        ),
        _ => condition(
            ConditionStatus::False,
            reason::GIT_PENDING,
            "Waiting for fetch job to check the repository out".to_string(),
        ),
    }
}

/// Keeps stored timestamps of conditions whose state did not change
///
/// The transition time also survives a reason or message change as long as the
/// status itself is the same.
fn carry_timestamps(previous: Option<&FlowStatus>, conditions: &mut [FlowCondition]) {
    let Some(previous) = previous else {
        return;
    };
    for condition in conditions.iter_mut() {
        let Some(old) = previous.condition(condition.type_) else {
            continue;
        };
        if old.same_state(condition) {
            condition.last_probe_time = old.last_probe_time.clone();
            condition.last_transition_time = old.last_transition_time.clone();
        } else if old.status == condition.status {
            condition.last_transition_time = old.last_transition_time.clone();
        }
    }
}

/// One status per stage up to the last stage with a job
///
/// Stages without a job before that point are reported as `Missing`; trailing stages
/// without a job are not reported at all.
pub fn stage_statuses(stages: &[Stage], jobs: &JobMap) -> Vec<StageStatus> {
    let mut statuses = Vec::new();
    let mut missing = 0;
    for stage in stages {
        let Some(job) = jobs.get(&StageKey::user(&stage.name)) else {
            missing += 1;
            continue;
        };
        statuses.extend((0..missing).map(|_| StageStatus::missing()));
        missing = 0;

        let phase = if is_job_failed(job) {
            StagePhase::Failed
        } else if is_job_complete(job) {
            StagePhase::Complete
        } else {
            StagePhase::Running
        };
        statuses.push(StageStatus {
            job: Some(job.name_any()),
            phase,
        });
    }
    statuses
}

pub fn flow_phase(stage_count: usize, statuses: &[StageStatus]) -> FlowPhase {
    match statuses.last() {
        None => FlowPhase::Pending,
        Some(last) if last.phase == StagePhase::Failed => FlowPhase::Failed,
        Some(last) if last.phase == StagePhase::Complete && statuses.len() == stage_count => {
            FlowPhase::Succeeded
        }
        Some(_) => FlowPhase::Running,
    }
}
