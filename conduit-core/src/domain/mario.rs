//! Mario manifest
//!
//! The manifest checked into a repository describing the actions stages can run. The
//! attach job serves it over HTTP and the flow controller copies it into `Flow.spec.mario`.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const MARIO_API_VERSION: &str = "conduit.dev/v1alpha1";
pub const MARIO_KIND: &str = "Mario";

/// Env var the ref is injected under when an action does not name one
pub const DEFAULT_VERSION_ENV: &str = "VERSION";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Mario {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: MarioMetadata,
    #[serde(default)]
    pub spec: MarioSpec,
}

impl Mario {
    /// Whether apiVersion and kind identify a Mario document
    pub fn is_mario(&self) -> bool {
        self.api_version == MARIO_API_VERSION && self.kind == MARIO_KIND
    }

    pub fn action(&self, name: &str) -> Option<&Action> {
        self.spec.actions.iter().find(|a| a.name == name)
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MarioMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MarioSpec {
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// A named container invocation a stage can run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Action {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<ActionTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<ActionEnv>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActionTemplate {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub version: ActionVersion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActionVersion {
    #[serde(default = "default_version_env")]
    pub env_name: String,
}

impl Default for ActionVersion {
    fn default() -> Self {
        Self {
            env_name: default_version_env(),
        }
    }
}

fn default_version_env() -> String {
    DEFAULT_VERSION_ENV.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionEnv {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_decoding() {
        let body = r#"{
            "apiVersion": "conduit.dev/v1alpha1",
            "kind": "Mario",
            "spec": { "actions": [ { "name": "make", "template": { "image": "rust:1" } } ] }
        }"#;
        let mario: Mario = serde_json::from_str(body).unwrap();
        assert!(mario.is_mario());
        let template = mario.action("make").unwrap().template.as_ref().unwrap();
        assert_eq!(template.version.env_name, "VERSION");
        assert!(mario.action("deploy").is_none());
    }
}
