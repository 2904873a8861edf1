//! Change handlers
//!
//! Pure functions mapping a changed object to the queue keys that must be synced.
//! The informers call them; nothing here touches the API.

use conduit_core::{Event, Flow, Pipe};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};

use crate::error::{Error, Result};
use crate::ownership::controller_of;

/// `<namespace>/<name>` key of a namespaced object
pub fn object_key<K: Resource>(obj: &K) -> Option<String> {
    let namespace = obj.meta().namespace.as_deref()?;
    let name = obj.meta().name.as_deref()?;
    Some(format!("{namespace}/{name}"))
}

/// Splits a queue key into namespace and name
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
            Ok((namespace, name))
        }
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}

/// Keys of the pipes of the event's namespace watching the event
pub fn pipe_keys_for_event(event: &Event, pipes: &[Pipe]) -> Vec<String> {
    let namespace = event.namespace();
    pipes
        .iter()
        .filter(|pipe| pipe.namespace() == namespace)
        .filter(|pipe| pipe.spec.watches(&event.spec))
        .filter_map(object_key)
        .collect()
}

/// Key of the flow controlling a job
pub fn flow_key_for_job(job: &Job) -> Option<String> {
    flow_key_for_owned(job)
}

/// Key of the flow controlling any object, e.g. the repository volume
pub fn flow_key_for_owned<K: Resource>(obj: &K) -> Option<String> {
    let owner = controller_of(obj.meta())?;
    if owner.kind != Flow::kind(&()) || owner.api_version != Flow::api_version(&()) {
        return None;
    }
    let namespace = obj.meta().namespace.as_deref()?;
    Some(format!("{}/{}", namespace, owner.name))
}

/// Key of the flow controlling the job controlling a pod
///
/// `lookup_job` resolves a job by namespace and name; the job must be the exact
/// incarnation the pod points at.
pub fn flow_key_for_pod<F>(pod: &Pod, lookup_job: F) -> Option<String>
where
    F: Fn(&str, &str) -> Option<Job>,
{
    let owner = controller_of(&pod.metadata)?;
    if owner.kind != Job::kind(&()) {
        return None;
    }
    let namespace = pod.namespace()?;
    let job = lookup_job(&namespace, &owner.name)?;
    if job.metadata.uid.as_deref() != Some(owner.uid.as_str()) {
        return None;
    }
    flow_key_for_job(&job)
}
