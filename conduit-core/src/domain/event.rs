//! Event domain type

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Something that happened to a repository, e.g. a push.
///
/// Events are written by the ingestion side and only ever read by the controllers.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "conduit.dev",
    version = "v1alpha1",
    kind = "Event",
    namespaced,
    printcolumn = r#"{"name":"Repo", "type":"string", "jsonPath":".spec.repo"}"#,
    printcolumn = r#"{"name":"When", "type":"string", "jsonPath":".spec.when"}"#,
    printcolumn = r#"{"name":"Ref", "type":"string", "jsonPath":".spec.ref"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EventSpec {
    /// Repository the event happened on
    pub repo: String,
    /// Trigger kind, matched against `Pipe.spec.when`
    pub when: String,
    /// Git ref the event points at
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl EventSpec {
    pub fn new(repo: impl Into<String>, when: impl Into<String>, git_ref: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            when: when.into(),
            git_ref: git_ref.into(),
            extra: BTreeMap::new(),
        }
    }
}
