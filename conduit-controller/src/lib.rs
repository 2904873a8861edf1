//! Conduit controller
//!
//! Turns Events into Flows (the pipe controller) and drives each Flow through checkout,
//! manifest attach and its stages as Kubernetes Jobs (the flow controller).
//!
//! Architecture:
//! - Engine: work queues and worker pools, no domain knowledge
//! - Stores: informer caches for reads, the API server for writes
//! - Handlers: map changed objects to the keys that must be synced
//! - Controllers: level-triggered `sync_pipe` and `sync_flow`

pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod handlers;
pub mod informer;
pub mod ownership;
pub mod pipe;
pub mod queue;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use engine::{Controller, Syncer};
pub use error::{Error, Result, StoreError};
pub use flow::FlowController;
pub use pipe::PipeController;
pub use queue::WorkQueue;
