//! Reusable driver bases.
//!
//! Two shapes cover most data planes:
//!
//! - [`direct::DirectDriver`] for backends that can enumerate and return
//!   their objects on demand; only the target-field sets are persisted
//!   locally.
//! - [`meta::MetaDriver`] for data planes that cannot enumerate or
//!   re-derive target state on their own (thousands of indistinguishable
//!   files); an authoritative meta file carries the identifying fields.

pub mod direct;
pub mod meta;
