//! Conduit Core
//!
//! Core types and abstractions for the Conduit CI/CD controllers.
//!
//! This crate contains:
//! - Domain types: the `Event`, `Pipe` and `Flow` custom resources and the `Mario` manifest
//! - Labels: well-known label keys set on every generated object
//! - Naming: content hashes and the naming convention of generated objects

pub mod domain;
pub mod labels;
pub mod naming;

pub use domain::event::{Event, EventSpec};
pub use domain::flow::{
    ConditionStatus, Flow, FlowCondition, FlowConditionType, FlowPhase, FlowSpec, FlowStatus,
    StagePhase, StageStatus,
};
pub use domain::mario::{Action, ActionEnv, ActionTemplate, ActionVersion, Mario, MarioMetadata, MarioSpec};
pub use domain::pipe::{Git, Pipe, PipeSpec, Stage};
pub use naming::StageKey;

/// API group shared by every Conduit resource
pub const API_GROUP: &str = "conduit.dev";

/// API version shared by every Conduit resource
pub const API_VERSION: &str = "v1alpha1";
