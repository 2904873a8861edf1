//! Reconciler engine
//!
//! Drives a `Syncer` from a `WorkQueue` with a pool of workers. The engine knows nothing
//! about the resources being synced: a key goes in, the syncer either succeeds and the
//! key's retry state is cleared, or fails and the key comes back after a backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::queue::WorkQueue;

/// Pause of a worker after a failed sync
const ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Level-triggered sync of one object, identified by its queue key
#[async_trait]
pub trait Syncer: Send + Sync {
    async fn sync(&self, key: &str) -> Result<()>;
}

/// A sync that failed and was requeued
#[derive(Debug, Error)]
#[error("failed to sync {key}: {source}")]
pub struct SyncFailure {
    pub key: String,
    #[source]
    pub source: Error,
}

/// Outcome of a successful `reconcile_once`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// A key was synced
    Synced,
    /// The queue is shut down and empty
    Drained,
}

/// One worker's view of a queue and its syncer
pub struct Reconciler<S: ?Sized> {
    queue: WorkQueue,
    syncer: Arc<S>,
}

impl<S: ?Sized> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            syncer: Arc::clone(&self.syncer),
        }
    }
}

pub fn build_reconciler<S: Syncer + ?Sized>(queue: WorkQueue, syncer: Arc<S>) -> Reconciler<S> {
    Reconciler { queue, syncer }
}

impl<S: Syncer + ?Sized> Reconciler<S> {
    /// Pops one key and syncs it
    ///
    /// Blocks until a key is available. A failed key is requeued with backoff and
    /// returned as the error; a successful one has its retry state forgotten.
    pub async fn reconcile_once(&self) -> std::result::Result<Progress, SyncFailure> {
        let Some(key) = self.queue.get().await else {
            return Ok(Progress::Drained);
        };

        let result = self.syncer.sync(&key).await;
        let outcome = match result {
            Ok(()) => {
                self.queue.forget(&key);
                Ok(Progress::Synced)
            }
            Err(source) => {
                self.queue.add_rate_limited(&key);
                Err(SyncFailure {
                    key: key.clone(),
                    source,
                })
            }
        };
        self.queue.done(&key);
        outcome
    }
}

/// Runs `reconcile_once` until the queue drains or `stop` fires
pub async fn run_loop<S: Syncer + ?Sized>(name: &str, reconciler: Reconciler<S>, stop: CancellationToken) {
    debug!(worker = name, "worker started");
    while !stop.is_cancelled() {
        match reconciler.reconcile_once().await {
            Ok(Progress::Synced) => {}
            Ok(Progress::Drained) => break,
            Err(failure) => {
                error!(worker = name, key = %failure.key, "{}", failure);
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_PAUSE) => {}
                }
            }
        }
    }
    debug!(worker = name, "worker stopped");
}

/// A named queue plus the workers draining it
pub struct Controller<S: ?Sized> {
    name: &'static str,
    queue: WorkQueue,
    syncer: Arc<S>,
    workers: usize,
}

impl<S: Syncer + ?Sized + 'static> Controller<S> {
    pub fn new(name: &'static str, queue: WorkQueue, syncer: Arc<S>, workers: usize) -> Self {
        Self {
            name,
            queue,
            syncer,
            workers,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Runs the workers until `stop` fires, then shuts the queue down and waits for
    /// in-flight syncs to finish
    pub async fn run(self, stop: CancellationToken) {
        info!("Starting {} controller with {} worker(s)", self.name, self.workers);

        let mut workers = JoinSet::new();
        for i in 0..self.workers {
            let reconciler = build_reconciler(self.queue.clone(), Arc::clone(&self.syncer));
            let stop = stop.clone();
            let name = format!("{}-{}", self.name, i);
            workers.spawn(async move { run_loop(&name, reconciler, stop).await });
        }

        stop.cancelled().await;
        info!("Stopping {} controller", self.name);
        self.queue.shut_down();

        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                warn!("{} worker panicked: {}", self.name, e);
            }
        }
        info!("{} controller stopped", self.name);
    }
}
