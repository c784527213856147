//! Agent-side reconciliation for the cplane framework.
//!
//! The agent converges local data-plane state to the target payload declared
//! by the orchestrator:
//!
//! - [`driver`]: capability/fact driver traits and the immutable registry.
//! - [`dispatch`]: per-kind delta classification and driver invocation.
//! - [`reconciler`]: the polling loop tying fetch, diff, dispatch and
//!   reporting together.
//! - [`drivers`]: reusable direct and meta driver bases.
//! - [`storage`]: target-fields persistence (SQLite and in-memory).
//! - [`client`]: the orchestrator transport seam.
//!
//! Everything transport- and backend-shaped is a trait; this crate contains
//! the reconciliation semantics only.

pub mod client;
pub mod dispatch;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod reconciler;
pub mod storage;

pub use client::OrchClient;
pub use dispatch::{plan_kind, Action};
pub use driver::{CapabilityDriver, DriverRegistry, FactDriver};
pub use error::{BackendError, DriverError, OrchError, StorageError};
pub use reconciler::{AgentConfig, AgentReconciler, TickStats};
pub use storage::{
    InMemoryTargetFieldsStorage, SqliteTargetFieldsStorage, TargetFieldItem, TargetFieldsStorage,
};
