//! Controller configuration
//!
//! Defines all configurable parameters of the controllers: worker counts, images and
//! settings of the generated jobs, retry backoff and shutdown timing.

use std::time::Duration;

/// Controller configuration
///
/// Every field has a default suited to a single-replica deployment; the binary
/// overrides them from command line flags or `CONDUIT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace to watch, `None` for all namespaces
    pub namespace: Option<String>,

    /// Number of workers syncing pipes
    pub pipe_workers: usize,

    /// Number of workers syncing flows
    pub flow_workers: usize,

    /// Image of the job checking the repository out
    pub git_image: String,

    /// Image of the job serving the manifest
    pub mario_image: String,

    /// Port the attach server listens on
    pub mario_port: u16,

    /// Bearer token shared between the controller and the attach server
    pub mario_token: String,

    /// Service account of attach pods
    pub mario_service_account: Option<String>,

    /// Size of the repository volume when a pipe has no volume claim template
    pub default_volume_size: String,

    /// First retry delay of a failing key
    pub backoff_base: Duration,

    /// Upper bound of the retry delay
    pub backoff_max: Duration,

    /// Timeout of a single manifest fetch
    pub manifest_fetch_timeout: Duration,

    /// How long in-flight syncs may run after a stop signal
    pub shutdown_grace_period: Duration,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new() -> Self {
        Self {
            namespace: None,
            pipe_workers: 1,
            flow_workers: 2,
            git_image: "alpine/git:v2.24.3".to_string(),
            mario_image: "conduit/mario:latest".to_string(),
            mario_port: 8080,
            mario_token: "conduit".to_string(),
            mario_service_account: None,
            default_volume_size: "1Gi".to_string(),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            manifest_fetch_timeout: Duration::from_secs(10),
            shutdown_grace_period: Duration::from_secs(20),
        }
    }

    /// Restricts the controllers to one namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the service account attach pods run as
    pub fn with_mario_service_account(mut self, account: impl Into<String>) -> Self {
        self.mario_service_account = Some(account.into());
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pipe_workers == 0 || self.flow_workers == 0 {
            anyhow::bail!("worker counts must be greater than 0");
        }

        if self.git_image.is_empty() || self.mario_image.is_empty() {
            anyhow::bail!("images cannot be empty");
        }

        if self.mario_port == 0 {
            anyhow::bail!("mario_port must be greater than 0");
        }

        if self.mario_token.is_empty() {
            anyhow::bail!("mario_token cannot be empty");
        }

        if self.default_volume_size.is_empty() {
            anyhow::bail!("default_volume_size cannot be empty");
        }

        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_max {
            anyhow::bail!("backoff_base must be greater than 0 and at most backoff_max");
        }

        if self.manifest_fetch_timeout.is_zero() {
            anyhow::bail!("manifest_fetch_timeout must be greater than 0");
        }

        if matches!(&self.namespace, Some(ns) if ns.is_empty()) {
            anyhow::bail!("namespace cannot be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
