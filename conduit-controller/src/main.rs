//! Conduit Controller
//!
//! Watches Pipes, Events and Flows and runs each Flow as a chain of Kubernetes Jobs.
//!
//! Startup:
//! - Configuration: command line flags, each backed by a `CONDUIT_*` variable
//! - Informers: one cache per kind, feeding the pipe and flow queues
//! - Controllers: started once every cache has synced
//!
//! SIGINT or SIGTERM stops the controllers; in-flight syncs get a grace period.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use conduit_client::ManifestClient;
use conduit_controller::flow::JobSettings;
use conduit_controller::{Config, Controller, FlowController, PipeController, WorkQueue, informer};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "conduit-controller")]
#[command(about = "Conduit CI/CD controller", long_about = None)]
struct Cli {
    /// Namespace to watch, all namespaces when unset
    #[arg(long, env = "CONDUIT_NAMESPACE")]
    namespace: Option<String>,

    /// Workers syncing pipes
    #[arg(long, env = "CONDUIT_PIPE_WORKERS", default_value = "1")]
    pipe_workers: usize,

    /// Workers syncing flows
    #[arg(long, env = "CONDUIT_FLOW_WORKERS", default_value = "2")]
    flow_workers: usize,

    /// Image of the checkout job
    #[arg(long, env = "CONDUIT_GIT_IMAGE", default_value = "alpine/git:v2.24.3")]
    git_image: String,

    /// Image of the manifest attach job
    #[arg(long, env = "CONDUIT_MARIO_IMAGE", default_value = "conduit/mario:latest")]
    mario_image: String,

    #[arg(long, env = "CONDUIT_MARIO_PORT", default_value = "8080")]
    mario_port: u16,

    /// Bearer token the attach server expects
    #[arg(long, env = "CONDUIT_MARIO_TOKEN", default_value = "conduit")]
    mario_token: String,

    #[arg(long, env = "CONDUIT_MARIO_SERVICE_ACCOUNT")]
    mario_service_account: Option<String>,

    /// Repository volume size when a pipe has no volume claim template
    #[arg(long, env = "CONDUIT_DEFAULT_VOLUME_SIZE", default_value = "1Gi")]
    default_volume_size: String,

    /// First retry delay of a failing key, in milliseconds
    #[arg(long, env = "CONDUIT_BACKOFF_BASE_MS", default_value = "5")]
    backoff_base_ms: u64,

    /// Maximum retry delay, in seconds
    #[arg(long, env = "CONDUIT_BACKOFF_MAX_SECS", default_value = "1000")]
    backoff_max_secs: u64,

    /// Timeout of one manifest fetch, in seconds
    #[arg(long, env = "CONDUIT_MANIFEST_FETCH_TIMEOUT_SECS", default_value = "10")]
    manifest_fetch_timeout_secs: u64,

    /// Time in-flight syncs get after a stop signal, in seconds
    #[arg(long, env = "CONDUIT_SHUTDOWN_GRACE_PERIOD_SECS", default_value = "20")]
    shutdown_grace_period_secs: u64,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Config {
            namespace: cli.namespace,
            pipe_workers: cli.pipe_workers,
            flow_workers: cli.flow_workers,
            git_image: cli.git_image,
            mario_image: cli.mario_image,
            mario_port: cli.mario_port,
            mario_token: cli.mario_token,
            mario_service_account: cli.mario_service_account,
            default_volume_size: cli.default_volume_size,
            backoff_base: Duration::from_millis(cli.backoff_base_ms),
            backoff_max: Duration::from_secs(cli.backoff_max_secs),
            manifest_fetch_timeout: Duration::from_secs(cli.manifest_fetch_timeout_secs),
            shutdown_grace_period: Duration::from_secs(cli.shutdown_grace_period_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_controller=info,kube=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Conduit Controller");

    let config = Config::from(Cli::parse());
    config.validate().context("Invalid configuration")?;
    info!(
        "Loaded configuration: namespace={}, pipe_workers={}, flow_workers={}",
        config.namespace.as_deref().unwrap_or("<all>"),
        config.pipe_workers,
        config.flow_workers
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let http = reqwest::Client::builder()
        .timeout(config.manifest_fetch_timeout)
        .build()
        .context("Failed to create manifest HTTP client")?;
    let manifests = Arc::new(ManifestClient::with_client(
        config.mario_port,
        config.mario_token.clone(),
        http,
    ));

    let stop = CancellationToken::new();
    let pipe_queue = WorkQueue::new(config.backoff_base, config.backoff_max);
    let flow_queue = WorkQueue::new(config.backoff_base, config.backoff_max);

    let stores = informer::start(&client, &config, &pipe_queue, &flow_queue, &stop);
    info!("Waiting for caches to sync");
    stores
        .wait_until_ready()
        .await
        .context("Failed to sync caches")?;
    info!("Caches synced");

    let pipes = Controller::new(
        "pipe",
        pipe_queue,
        Arc::new(PipeController::new(stores.clone())),
        config.pipe_workers,
    );
    let flows = Controller::new(
        "flow",
        flow_queue,
        Arc::new(FlowController::new(
            stores,
            manifests,
            JobSettings::from(&config),
        )),
        config.flow_workers,
    );

    let mut controllers = JoinSet::new();
    controllers.spawn(pipes.run(stop.clone()));
    controllers.spawn(flows.run(stop.clone()));

    shutdown_signal().await;
    info!("Shutdown signal received");
    stop.cancel();

    let drain = async { while controllers.join_next().await.is_some() {} };
    if tokio::time::timeout(config.shutdown_grace_period, drain)
        .await
        .is_err()
    {
        warn!(
            "Controllers still busy after {:?}, aborting",
            config.shutdown_grace_period
        );
        controllers.abort_all();
    }

    info!("Conduit Controller stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
