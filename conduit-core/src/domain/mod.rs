//! Core domain types
//!
//! Custom resources watched by the controllers and the manifest document attached to
//! a Flow once its repository has been fetched.

pub mod event;
pub mod flow;
pub mod mario;
pub mod pipe;
