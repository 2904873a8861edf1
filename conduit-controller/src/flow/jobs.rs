//! Objects generated for a flow
//!
//! Every generator is a pure function of the flow (plus settings) so the reconciler
//! can rebuild the same object on every sync.
//!
//! - PVC `<flow>`: volume the repository is checked out to
//! - ConfigMap `<flow>`: holds `git.sh`, the checkout script
//! - Job `<flow>-git`: runs `git.sh` against the volume
//! - Job `<flow>-mario`: serves the repository's manifest to the controller
//! - Job `<flow>-user-<stage>`: runs the manifest action named by a stage

use std::collections::BTreeMap;

use conduit_core::labels::{SPEC_HASH_LABEL, STAGE_LABEL};
use conduit_core::{Flow, Git, Mario, Stage, StageKey};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, HTTPGetAction,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    PodSpec, PodTemplateSpec, Probe, SecretVolumeSource, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::config::Config;
use crate::error::{ActionError, Result};
use crate::ownership::controller_ref;

pub const REPO_PATH: &str = "/repo";
pub const SCRIPT_DIR: &str = "/app";
pub const SCRIPT_NAME: &str = "git.sh";

const GIT_VOLUME: &str = "git";
const SCRIPT_VOLUME: &str = "git-script";
const SECRET_VOLUME: &str = "git-secret";
const SECRET_PATH: &str = "/etc/git-secret";
const SSH_KEY: &str = "ssh-privatekey";
const HEALTH_PATH: &str = "/healthz";

/// Settings of generated objects that come from the controller configuration
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub git_image: String,
    pub mario_image: String,
    pub mario_port: u16,
    pub mario_token: String,
    pub mario_service_account: Option<String>,
    pub default_volume_size: String,
}

impl From<&Config> for JobSettings {
    fn from(config: &Config) -> Self {
        Self {
            git_image: config.git_image.clone(),
            mario_image: config.mario_image.clone(),
            mario_port: config.mario_port,
            mario_token: config.mario_token.clone(),
            mario_service_account: config.mario_service_account.clone(),
            default_volume_size: config.default_volume_size.clone(),
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

// ============================================================================
// Labels and metadata
// ============================================================================

/// Labels of the flow selector, carried by everything the flow owns
pub fn selector_labels(flow: &Flow) -> BTreeMap<String, String> {
    flow.spec.selector.match_labels.clone().unwrap_or_default()
}

/// Labels of a job of the flow and of its pods
pub fn job_labels(flow: &Flow, stage: &StageKey, spec_hash: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(flow);
    labels.insert(STAGE_LABEL.to_string(), stage.to_string());
    labels.insert(SPEC_HASH_LABEL.to_string(), spec_hash.to_string());
    labels
}

fn owned_metadata(flow: &Flow, name: String, labels: BTreeMap<String, String>) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        name: Some(name),
        namespace: flow.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![controller_ref(flow)?]),
        ..Default::default()
    })
}

fn new_job(flow: &Flow, stage: &StageKey, labels: BTreeMap<String, String>, pod: PodSpec) -> Result<Job> {
    Ok(Job {
        metadata: owned_metadata(flow, stage.job_name(&flow.name_any()), labels.clone())?,
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        status: None,
    })
}

// ============================================================================
// Volumes
// ============================================================================

fn git_volume(flow: &Flow) -> Volume {
    Volume {
        name: GIT_VOLUME.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: flow.name_any(),
            read_only: None,
        }),
        ..Default::default()
    }
}

/// Mount of the repository volume at `path`
fn git_mount(path: &str) -> VolumeMount {
    VolumeMount {
        name: GIT_VOLUME.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn script_volume(flow: &Flow) -> Volume {
    Volume {
        name: SCRIPT_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: flow.name_any(),
            default_mode: Some(0o755),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Volume, mount and ssh env for the pull secret of `git`, if any
fn secret_parts(git: &Git) -> Option<(Volume, VolumeMount, EnvVar)> {
    let secret = git.pull_secret.as_ref()?;
    let volume = Volume {
        name: SECRET_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.name.clone()),
            default_mode: Some(0o400),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mount = VolumeMount {
        name: SECRET_VOLUME.to_string(),
        mount_path: SECRET_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    };
    let env = EnvVar {
        name: "GIT_SSH_COMMAND".to_string(),
        value: Some(format!(
            "ssh -i {SECRET_PATH}/{SSH_KEY} -o StrictHostKeyChecking=no"
        )),
        ..Default::default()
    };
    Some((volume, mount, env))
}

// ============================================================================
// PVC and ConfigMap
// ============================================================================

/// Repository volume, from the volume claim template or `default_volume_size`
pub fn repo_volume_claim(flow: &Flow, settings: &JobSettings) -> Result<PersistentVolumeClaim> {
    let template = flow.spec.git.volume_claim_template.clone();
    let (template_labels, spec) = match template {
        Some(pvc) => (pvc.metadata.labels.unwrap_or_default(), pvc.spec),
        None => (
            BTreeMap::new(),
            Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(settings.default_volume_size.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        ),
    };

    let mut labels = template_labels;
    labels.extend(selector_labels(flow));
    Ok(PersistentVolumeClaim {
        metadata: owned_metadata(flow, flow.name_any(), labels)?,
        spec,
        status: None,
    })
}

/// ConfigMap holding the checkout script
pub fn script_config_map(flow: &Flow) -> Result<ConfigMap> {
    Ok(ConfigMap {
        metadata: owned_metadata(flow, flow.name_any(), selector_labels(flow))?,
        data: Some(BTreeMap::from([(
            SCRIPT_NAME.to_string(),
            git_script(&flow.spec.git),
        )])),
        ..Default::default()
    })
}

/// Checkout script, safe to re-run against an already populated volume
pub fn git_script(git: &Git) -> String {
    let repo = shell_quote(&git.repo);
    let git_ref = shell_quote(&git.git_ref);
    format!(
        "#!/bin/sh\n\
         set -e\n\
         cd {REPO_PATH}\n\
         git init\n\
         git remote add origin {repo} || git remote set-url origin {repo}\n\
         git fetch origin {git_ref} --depth=1\n\
         git reset --hard FETCH_HEAD\n"
    )
}

/// Single-quotes a value for `sh`
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

// ============================================================================
// Jobs
// ============================================================================

/// Job checking the repository out to the flow volume
pub fn fetch_job(flow: &Flow, settings: &JobSettings, spec_hash: &str) -> Result<Job> {
    let stage = StageKey::Fetch;
    let mut volumes = vec![git_volume(flow), script_volume(flow)];
    let mut mounts = vec![
        git_mount(REPO_PATH),
        VolumeMount {
            name: SCRIPT_VOLUME.to_string(),
            mount_path: SCRIPT_DIR.to_string(),
            ..Default::default()
        },
    ];
    let mut env = Vec::new();
    if let Some((volume, mount, ssh)) = secret_parts(&flow.spec.git) {
        volumes.push(volume);
        mounts.push(mount);
        env.push(ssh);
    }

    let container = Container {
        name: GIT_VOLUME.to_string(),
        image: Some(settings.git_image.clone()),
        command: Some(vec![format!("{SCRIPT_DIR}/{SCRIPT_NAME}")]),
        working_dir: Some(REPO_PATH.to_string()),
        env: (!env.is_empty()).then_some(env),
        volume_mounts: Some(mounts),
        ..Default::default()
    };
    let pod = PodSpec {
        containers: vec![container],
        volumes: Some(volumes),
        restart_policy: Some("Never".to_string()),
        ..Default::default()
    };
    new_job(flow, &stage, job_labels(flow, &stage, spec_hash), pod)
}

/// Job serving the manifest of the repository over HTTP
pub fn attach_job(flow: &Flow, settings: &JobSettings, spec_hash: &str) -> Result<Job> {
    let stage = StageKey::Attach;
    let port = i32::from(settings.mario_port);
    let mut volumes = vec![git_volume(flow)];
    let mut mounts = vec![git_mount(REPO_PATH)];
    let mut env = Vec::new();
    if let Some((volume, mount, ssh)) = secret_parts(&flow.spec.git) {
        volumes.push(volume);
        mounts.push(mount);
        env.push(ssh);
    }

    let container = Container {
        name: "mario".to_string(),
        image: Some(settings.mario_image.clone()),
        command: Some(vec![
            format!("{SCRIPT_DIR}/mario"),
            "--remote".to_string(),
            flow.spec.git.repo.clone(),
            "--ref".to_string(),
            flow.spec.git.git_ref.clone(),
            "--addr".to_string(),
            format!(":{}", settings.mario_port),
            "--token".to_string(),
            settings.mario_token.clone(),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: port,
            name: Some("http".to_string()),
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some(HEALTH_PATH.to_string()),
                port: IntOrString::Int(port),
                ..Default::default()
            }),
            period_seconds: Some(2),
            ..Default::default()
        }),
        working_dir: Some(REPO_PATH.to_string()),
        env: (!env.is_empty()).then_some(env),
        volume_mounts: Some(mounts),
        ..Default::default()
    };
    let pod = PodSpec {
        containers: vec![container],
        volumes: Some(volumes),
        service_account_name: settings.mario_service_account.clone(),
        restart_policy: Some("Never".to_string()),
        ..Default::default()
    };
    new_job(flow, &stage, job_labels(flow, &stage, spec_hash), pod)
}

/// Job running `stage` with the manifest action it names
///
/// The ref is injected under the action's version env name, ahead of the action's
/// own env. Manifest labels are added to the job labels without overriding them.
pub fn user_job(flow: &Flow, stage: &Stage, mario: &Mario, spec_hash: &str) -> Result<Job> {
    let action = mario
        .action(&stage.action)
        .ok_or_else(|| ActionError::ActionNotFound(stage.action.clone()))?;
    let template = action
        .template
        .as_ref()
        .ok_or_else(|| ActionError::MissingTemplate(action.name.clone()))?;

    let version_env = &template.version.env_name;
    if action.env.iter().any(|e| e.name == *version_env) {
        return Err(ActionError::VersionEnvConflict {
            action: action.name.clone(),
            env: version_env.clone(),
        }
        .into());
    }

    let mut env = vec![EnvVar {
        name: version_env.clone(),
        value: Some(flow.spec.git.git_ref.clone()),
        ..Default::default()
    }];
    env.extend(action.env.iter().map(|e| EnvVar {
        name: e.name.clone(),
        value: Some(e.value.clone()),
        ..Default::default()
    }));

    // The checkout is mounted where the action runs
    let working_dir = template.working_dir.as_deref().unwrap_or(REPO_PATH);
    let container = Container {
        name: "action".to_string(),
        image: Some(template.image.clone()),
        command: (!template.command.is_empty()).then(|| template.command.clone()),
        args: (!template.args.is_empty()).then(|| template.args.clone()),
        working_dir: Some(working_dir.to_string()),
        env: Some(env),
        volume_mounts: Some(vec![git_mount(working_dir)]),
        ..Default::default()
    };
    let pod = PodSpec {
        containers: vec![container],
        volumes: Some(vec![git_volume(flow)]),
        restart_policy: Some("Never".to_string()),
        ..Default::default()
    };

    let key = StageKey::user(&stage.name);
    let mut labels = mario.labels().clone();
    labels.extend(job_labels(flow, &key, spec_hash));
    new_job(flow, &key, labels, pod)
}
