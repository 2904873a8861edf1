//! Hashing and naming of generated objects
//!
//! Flows are named `<pipe>-<suffix>`. Everything a flow owns is named after the flow:
//! the PVC and ConfigMap take the flow name, jobs append their stage key.

use std::fmt;

use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};

/// Length of content hashes used in labels
pub const HASH_LEN: usize = 11;

/// Length of the random suffix of a flow name
pub const SUFFIX_LEN: usize = 7;

const FETCH_KEY: &str = "git";
const ATTACH_KEY: &str = "mario";
const USER_PREFIX: &str = "user-";

/// First `HASH_LEN` hex chars of the sha256 of `input`
pub fn short_hash(input: &str) -> String {
    let mut encoded = hex::encode(Sha256::digest(input.as_bytes()));
    encoded.truncate(HASH_LEN);
    encoded
}

/// Identity of a (repository, ref) pair
pub fn revision_hash(repo: &str, git_ref: &str) -> String {
    short_hash(&format!("{repo}@{git_ref}"))
}

/// Random name for a new flow of `pipe`
pub fn flow_name(pipe: &str) -> String {
    format!("{}-{}", pipe, random_suffix(SUFFIX_LEN))
}

/// Lowercase alphanumeric suffix, valid in DNS-1123 names
pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Stage a job of a flow runs
///
/// Stored in the `conduit.dev/stage` label; job names are derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKey {
    /// Checks the repository out to the flow volume
    Fetch,
    /// Serves the manifest of the checked out repository
    Attach,
    /// User stage, by stage name
    User(String),
}

impl StageKey {
    pub fn user(name: impl Into<String>) -> Self {
        StageKey::User(name.into())
    }

    /// Parse a stage label value. Returns `None` for anything we never write.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            FETCH_KEY => Some(StageKey::Fetch),
            ATTACH_KEY => Some(StageKey::Attach),
            other => other
                .strip_prefix(USER_PREFIX)
                .filter(|name| !name.is_empty())
                .map(StageKey::user),
        }
    }

    pub fn job_name(&self, flow: &str) -> String {
        format!("{flow}-{self}")
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKey::Fetch => f.write_str(FETCH_KEY),
            StageKey::Attach => f.write_str(ATTACH_KEY),
            StageKey::User(name) => write!(f, "{USER_PREFIX}{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash_is_stable() {
        let a = revision_hash("github.com/acme/app", "main");
        assert_eq!(a.len(), HASH_LEN);
        assert_eq!(a, revision_hash("github.com/acme/app", "main"));
        assert_ne!(a, revision_hash("github.com/acme/app", "dev"));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_flow_name() {
        let name = flow_name("app");
        assert!(name.starts_with("app-"));
        let suffix = &name["app-".len()..];
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_stage_key_labels() {
        assert_eq!(StageKey::parse("git"), Some(StageKey::Fetch));
        assert_eq!(StageKey::parse("mario"), Some(StageKey::Attach));
        assert_eq!(StageKey::parse("user-build"), Some(StageKey::user("build")));
        assert_eq!(StageKey::parse("user-"), None);
        assert_eq!(StageKey::parse("deploy"), None);
        assert_eq!(StageKey::user("build").to_string(), "user-build");
    }

    #[test]
    fn test_job_names() {
        assert_eq!(StageKey::Fetch.job_name("app-x1"), "app-x1-git");
        assert_eq!(StageKey::Attach.job_name("app-x1"), "app-x1-mario");
        assert_eq!(StageKey::user("build").job_name("app-x1"), "app-x1-user-build");
    }
}
