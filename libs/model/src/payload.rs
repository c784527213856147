//! Payload bundles exchanged between the control plane and the data plane.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::resource::{ResKey, Resource, TargetResource};

/// A bundle of target capabilities and observed facts.
///
/// Equality of two payload hashes means no reconciliation action is required
/// in either direction. The reconciliation loops compare hashes only —
/// structural comparison would make the check cost depend on value size.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Control-plane change counter, carried for cheap "anything new?" checks.
    #[serde(default)]
    pub version: u64,

    /// Kind → orchestrator-declared, driver-managed resources.
    pub capabilities: BTreeMap<String, Vec<TargetResource>>,

    /// Kind → data-plane-observed, read-only resources.
    pub facts: BTreeMap<String, Vec<Resource>>,

    /// Digest over capability hashes and fact full hashes, in `(kind, uuid)`
    /// order. Maintained by [`Payload::rehash`].
    #[serde(default)]
    pub hash: String,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a capability kind exists, even with no resources.
    pub fn declare_capability(&mut self, kind: impl Into<String>) {
        self.capabilities.entry(kind.into()).or_default();
    }

    /// Ensure a fact kind exists, even with no resources.
    pub fn declare_fact(&mut self, kind: impl Into<String>) {
        self.facts.entry(kind.into()).or_default();
    }

    pub fn add_capability(&mut self, resource: TargetResource) {
        self.capabilities
            .entry(resource.resource.kind.clone())
            .or_default()
            .push(resource);
    }

    pub fn add_fact(&mut self, resource: Resource) {
        self.facts
            .entry(resource.kind.clone())
            .or_default()
            .push(resource);
    }

    /// Resources declared for a capability kind.
    pub fn capability(&self, kind: &str) -> &[TargetResource] {
        self.capabilities.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remove a capability resource by identity. Returns true if present.
    pub fn remove_capability(&mut self, key: &ResKey) -> bool {
        match self.capabilities.get_mut(&key.0) {
            Some(resources) => {
                let before = resources.len();
                resources.retain(|r| r.resource.uuid != key.1);
                resources.len() != before
            }
            None => false,
        }
    }

    /// Compute the convergence digest.
    ///
    /// Capability resources contribute their target-field hash, facts their
    /// full hash. The fold order is canonical — ascending `(kind, uuid)` —
    /// because the digest is a correctness signal, not a debugging aid.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();

        for (kind, resources) in &self.capabilities {
            let mut ordered: Vec<_> = resources
                .iter()
                .map(|r| (r.resource.uuid, r.resource.hash.as_str()))
                .collect();
            ordered.sort();
            for (uuid, hash) in ordered {
                hasher.update(kind.as_bytes());
                hasher.update(uuid.as_bytes());
                hasher.update(hash.as_bytes());
            }
        }

        for (kind, resources) in &self.facts {
            let mut ordered: Vec<_> = resources
                .iter()
                .map(|r| (r.uuid, r.full_hash.as_str()))
                .collect();
            ordered.sort();
            for (uuid, full_hash) in ordered {
                hasher.update(kind.as_bytes());
                hasher.update(uuid.as_bytes());
                hasher.update(full_hash.as_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Recompute and store the convergence digest.
    pub fn rehash(&mut self) -> &str {
        self.hash = self.compute_hash();
        &self.hash
    }
}
