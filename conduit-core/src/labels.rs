//! Label keys set on generated objects

/// Content hash of the (repository, ref) a flow runs against
pub const REVISION_LABEL: &str = "conduit.dev/revision";

/// Stage key of a job and its pods (`git`, `mario` or `user-<stage>`)
pub const STAGE_LABEL: &str = "conduit.dev/stage";

/// Hash of the flow's git and stages at the time a job was created
pub const SPEC_HASH_LABEL: &str = "conduit.dev/spec-hash";
