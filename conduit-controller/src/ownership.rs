//! Controller references between generated objects and their owners

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::error::{Error, Result};

/// The owner reference marked as controller, if any
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Whether `obj` is controlled by `owner`: same kind and same UID
pub fn is_controlled_by<T, O>(obj: &T, owner: &O) -> bool
where
    T: Resource,
    O: Resource<DynamicType = ()>,
{
    let Some(uid) = owner.meta().uid.as_deref() else {
        return false;
    };
    controller_of(obj.meta()).is_some_and(|r| r.kind == O::kind(&()) && r.uid == uid)
}

/// Controller reference pointing at `owner`
pub fn controller_ref<O>(owner: &O) -> Result<OwnerReference>
where
    O: Resource<DynamicType = ()>,
{
    owner
        .controller_owner_ref(&())
        .ok_or_else(|| Error::MissingUid(format!("{} {}", O::kind(&()), owner.name_any())))
}
