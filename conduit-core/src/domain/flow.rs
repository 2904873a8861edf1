//! Flow domain type
//!
//! A Flow is one run of a Pipe against one (repository, ref). Its spec is written by the
//! pipe controller, except for `mario` which the flow controller attaches exactly once.
//! Its status is derived from the Jobs and the volume the flow owns.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::mario::Mario;
use super::pipe::{Git, Stage};
use crate::labels::REVISION_LABEL;
use crate::naming;

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "conduit.dev",
    version = "v1alpha1",
    kind = "Flow",
    namespaced,
    status = "FlowStatus",
    printcolumn = r#"{"name":"Repo", "type":"string", "jsonPath":".spec.git.repo"}"#,
    printcolumn = r#"{"name":"Ref", "type":"string", "jsonPath":".spec.git.ref"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FlowSpec {
    /// Labels shared by the flow and every object it owns
    pub selector: LabelSelector,
    pub git: Git,
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// Manifest read from the repository, set once the attach job serves it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mario: Option<Mario>,
}

impl FlowSpec {
    /// Whether two specs would run the same plan, ignoring the attached manifest
    pub fn same_plan(&self, other: &FlowSpec) -> bool {
        self.git == other.git && self.stages == other.stages
    }

    /// Short hash over git and stages, stamped on every job of the flow
    pub fn spec_hash(&self) -> Result<String, serde_json::Error> {
        let body = serde_json::to_string(&(&self.git, &self.stages))?;
        Ok(naming::short_hash(&body))
    }
}

impl Flow {
    /// Content hash of the (repository, ref) this flow was generated for
    pub fn revision(&self) -> Option<&str> {
        self.labels().get(REVISION_LABEL).map(String::as_str)
    }

    pub fn phase(&self) -> FlowPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatus {
    #[serde(default)]
    pub phase: FlowPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stage_statuses: Vec<StageStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<FlowCondition>,
    /// Spec hash the status was computed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_spec_hash: Option<String>,
}

impl FlowStatus {
    pub fn condition(&self, type_: FlowConditionType) -> Option<&FlowCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum FlowPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl FlowPhase {
    /// No further stage jobs are created once a flow is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowPhase::Succeeded | FlowPhase::Failed)
    }
}

impl fmt::Display for FlowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowPhase::Pending => "Pending",
            FlowPhase::Running => "Running",
            FlowPhase::Succeeded => "Succeeded",
            FlowPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Observed state of one user stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StageStatus {
    /// Job running the stage, absent when the job is missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    pub phase: StagePhase,
}

impl StageStatus {
    pub fn missing() -> Self {
        Self {
            job: None,
            phase: StagePhase::Missing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum StagePhase {
    Missing,
    Running,
    Complete,
    Failed,
}

// ============================================================================
// Conditions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum FlowConditionType {
    /// The volume holding the repository is bound
    GitVolumeReady,
    /// The manifest is attached to the flow
    MarioReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowCondition {
    #[serde(rename = "type")]
    pub type_: FlowConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl FlowCondition {
    pub fn new(
        type_: FlowConditionType,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        now: Time,
    ) -> Self {
        Self {
            type_,
            status,
            last_probe_time: Some(now.clone()),
            last_transition_time: Some(now),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    /// Same status, reason and message, timestamps aside
    pub fn same_state(&self, other: &FlowCondition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Condition reasons
pub mod reason {
    pub const GIT_VOLUME_CLAIMING: &str = "Claiming";
    pub const GIT_VOLUME_PENDING: &str = "Pending";
    pub const GIT_VOLUME_BOUND: &str = "Ready";
    pub const GIT_VOLUME_LOST: &str = "Lost";
    pub const GIT_VOLUME_UNKNOWN: &str = "Unknown";

    pub const MARIO_READY: &str = "Ready";
    pub const MARIO_FAILED: &str = "Failed";
    pub const MARIO_PENDING: &str = "Pending";
    pub const GIT_FAILED: &str = "GitFailed";
    pub const GIT_PENDING: &str = "GitPending";
}
