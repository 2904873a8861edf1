//! Pipe domain type

use k8s_openapi::api::core::v1::{LocalObjectReference, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::event::EventSpec;

/// Declares which events start a Flow and what that Flow runs.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "conduit.dev",
    version = "v1alpha1",
    kind = "Pipe",
    namespaced,
    printcolumn = r#"{"name":"Repo", "type":"string", "jsonPath":".spec.git.repo"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PipeSpec {
    pub git: Git,
    /// Trigger kinds this pipe reacts to
    #[serde(default)]
    pub when: Vec<String>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// Labels copied onto every Flow generated from this pipe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

impl PipeSpec {
    /// Whether an event is a trigger for this pipe
    pub fn watches(&self, event: &EventSpec) -> bool {
        event.repo == self.git.repo && self.when.iter().any(|w| *w == event.when)
    }
}

/// Source repository of a pipe or flow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Git {
    pub repo: String,
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    /// Secret holding credentials for the repository, mounted into git jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<LocalObjectReference>,
    /// Template of the volume the repository is checked out to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<PersistentVolumeClaim>,
}

/// One step of a flow, run by the manifest action of the same name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Stage {
    pub name: String,
    pub action: String,
}

impl Stage {
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> PipeSpec {
        PipeSpec {
            git: Git {
                repo: "github.com/acme/app".to_string(),
                git_ref: "main".to_string(),
                ..Default::default()
            },
            when: vec!["push".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_watches_matching_event() {
        let event = EventSpec::new("github.com/acme/app", "push", "feature");
        assert!(spec().watches(&event));
    }

    #[test]
    fn test_ignores_other_repo_or_trigger() {
        assert!(!spec().watches(&EventSpec::new("github.com/acme/other", "push", "main")));
        assert!(!spec().watches(&EventSpec::new("github.com/acme/app", "tag", "main")));
    }

    #[test]
    fn test_ref_is_serialized_as_ref() {
        let value = serde_json::to_value(&spec().git).unwrap();
        assert_eq!(value["ref"], "main");
        assert!(value.get("pullSecret").is_none());
    }
}
