//! Core model for the cplane reconciliation framework.
//!
//! This crate defines the value objects shared by the agent and builder
//! loops, and the hash engine that makes convergence detection a pure
//! digest comparison:
//!
//! - [`Resource`] / [`TargetResource`]: observed vs declared objects.
//! - [`Payload`]: the capability/fact bundle exchanged between planes.
//! - [`Agent`]: agent identity and capability declaration.
//! - [`hash`]: canonical-JSON digests over full values and target-field
//!   subsets.
//!
//! # Invariants
//!
//! - Digests are deterministic functions of value content plus the
//!   target-field set; field order never matters.
//! - Payload-hash equality is the single convergence oracle; no component
//!   re-derives it by structural comparison.

pub mod agent;
pub mod error;
pub mod hash;
pub mod payload;
pub mod resource;

pub use agent::{Agent, AgentStatus};
pub use error::ModelError;
pub use payload::Payload;
pub use resource::{status, ResKey, Resource, TargetResource};
