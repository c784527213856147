//! Server-side derivative management for the cplane framework.
//!
//! An *instance* is a control-plane logical entity (a cluster, a node set)
//! that owns the decision of which *derivative* resources should exist.
//! This crate keeps instances and their derivatives actualized as upstream
//! state changes:
//!
//! - [`handler`]: the per-kind hook surface with framework defaults.
//! - [`reconciler`]: expansion, replace-all updates, drift actualization
//!   and master-hash propagation.
//! - [`store`]: the persistence seam plus an in-memory implementation.
//!
//! Derivative targets produced here feed the same payload pipeline the
//! agent loop consumes.

pub mod error;
pub mod handler;
pub mod reconciler;
pub mod store;

pub use error::BuilderError;
pub use handler::{Actualization, DeliveryMode, DerivativePair, InstanceHandler};
pub use reconciler::{BuilderConfig, BuilderStats, DerivativeReconciler, HandlerRegistry};
pub use store::{BuilderStore, InMemoryBuilderStore};
