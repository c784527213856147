//! Resource and target-resource value objects.
//!
//! A [`Resource`] is an observed data-plane object; a [`TargetResource`] is
//! the control-plane declaration of what that object should look like, plus
//! the bookkeeping needed to route it (agent assignment) and to track the
//! upstream it was derived from (master identity and hashes).
//!
//! Both are immutable by convention: mutation goes through the `replace_*`
//! and `with_*` helpers which recompute the digests.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ModelError;
use crate::hash;

/// Well-known status values.
///
/// The vocabulary is open: drivers and instance handlers may introduce their
/// own tags, these are the ones the framework itself assigns or inspects.
pub mod status {
    pub const NEW: &str = "NEW";
    pub const IN_PROGRESS: &str = "IN_PROGRESS";
    pub const ACTIVE: &str = "ACTIVE";
    pub const ERROR: &str = "ERROR";
}

/// Canonical resource identity: `(kind, uuid)`.
pub type ResKey = (String, Uuid);

/// An observed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource type / capability, e.g. `"config"` or `"node"`.
    pub kind: String,

    /// Stable identity, unique within a kind.
    pub uuid: Uuid,

    /// The full observed value.
    pub value: Map<String, Value>,

    /// Lifecycle tag, open vocabulary (see [`status`]).
    pub status: String,

    /// Digest over the target-field subset of `value`.
    pub hash: String,

    /// Digest over all of `value`.
    pub full_hash: String,
}

impl Resource {
    /// Build a resource from an observed value, computing both digests.
    ///
    /// The identity is taken from the value's `uuid` field, mirroring how
    /// data-plane objects carry their own identity.
    pub fn from_value(
        value: Map<String, Value>,
        kind: impl Into<String>,
        target_fields: &BTreeSet<String>,
    ) -> Result<Self, ModelError> {
        let uuid = extract_uuid(&value)?;
        Ok(Self::new(kind, uuid, value, target_fields))
    }

    /// Build a resource with an explicit identity.
    pub fn new(
        kind: impl Into<String>,
        uuid: Uuid,
        value: Map<String, Value>,
        target_fields: &BTreeSet<String>,
    ) -> Self {
        let hash = hash::target_hash(&value, target_fields);
        let full_hash = hash::full_hash(&value);
        Self {
            kind: kind.into(),
            uuid,
            value,
            status: status::ACTIVE.to_string(),
            hash,
            full_hash,
        }
    }

    /// Return a copy with a new value and recomputed digests.
    pub fn replace_value(
        &self,
        value: Map<String, Value>,
        target_fields: &BTreeSet<String>,
    ) -> Self {
        Self {
            kind: self.kind.clone(),
            uuid: self.uuid,
            status: self.status.clone(),
            hash: hash::target_hash(&value, target_fields),
            full_hash: hash::full_hash(&value),
            value,
        }
    }

    /// Return a copy with the given status.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Canonical identity tuple.
    pub fn res_key(&self) -> ResKey {
        (self.kind.clone(), self.uuid)
    }
}

/// A resource destined for a data plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResource {
    #[serde(flatten)]
    pub resource: Resource,

    /// Agent responsible for realizing this resource, set by the scheduler.
    pub agent: Option<Uuid>,

    /// Weak reference to the resource this one is derived from.
    ///
    /// Identity only, never ownership: the master does not know its
    /// dependents and a dependent never outlives pairing by identity.
    pub master: Option<Uuid>,

    /// Master's target-field hash at the time this resource was last
    /// actualized. Empty until the first actualization.
    #[serde(default)]
    pub master_hash: String,

    /// Master's full hash at the time this resource was last actualized.
    #[serde(default)]
    pub master_full_hash: String,

    /// Timestamp of the last reconciliation attempt.
    pub tracked_at: DateTime<Utc>,
}

impl TargetResource {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            agent: None,
            master: None,
            master_hash: String::new(),
            master_full_hash: String::new(),
            tracked_at: Utc::now(),
        }
    }

    /// Attach a master reference, stamping the master's current digests.
    pub fn with_master(mut self, master: &Resource) -> Self {
        self.master = Some(master.uuid);
        self.master_hash = master.hash.clone();
        self.master_full_hash = master.full_hash.clone();
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.resource.status = status.into();
        self
    }

    /// Record a reconciliation attempt.
    pub fn touch(&mut self) {
        self.tracked_at = Utc::now();
    }

    pub fn res_key(&self) -> ResKey {
        self.resource.res_key()
    }
}

impl From<Resource> for TargetResource {
    fn from(resource: Resource) -> Self {
        Self::new(resource)
    }
}

fn extract_uuid(value: &Map<String, Value>) -> Result<Uuid, ModelError> {
    let raw = value
        .get("uuid")
        .and_then(Value::as_str)
        .ok_or(ModelError::MissingUuid)?;
    raw.parse()
        .map_err(|_| ModelError::InvalidUuid(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn value_with_uuid(uuid: Uuid) -> Map<String, Value> {
        let mut value = Map::new();
        value.insert("uuid".to_string(), json!(uuid.to_string()));
        value.insert("name".to_string(), json!("foo"));
        value
    }

    #[test]
    fn test_from_value_takes_identity_from_value() {
        let uuid = Uuid::new_v4();
        let value = value_with_uuid(uuid);
        let fields: BTreeSet<String> = ["name".to_string()].into();

        let resource = Resource::from_value(value, "config", &fields).unwrap();
        assert_eq!(resource.uuid, uuid);
        assert_eq!(resource.kind, "config");
        assert!(!resource.hash.is_empty());
        assert_ne!(resource.hash, resource.full_hash);
    }

    #[test]
    fn test_from_value_missing_uuid() {
        let mut value = Map::new();
        value.insert("name".to_string(), json!("foo"));

        let err = Resource::from_value(value, "config", &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, ModelError::MissingUuid));
    }

    #[test]
    fn test_replace_value_recomputes_digests() {
        let uuid = Uuid::new_v4();
        let fields: BTreeSet<String> = ["name".to_string()].into();
        let resource = Resource::from_value(value_with_uuid(uuid), "config", &fields).unwrap();

        let mut changed = resource.value.clone();
        changed.insert("name".to_string(), json!("bar"));
        let updated = resource.replace_value(changed, &fields);

        assert_eq!(updated.uuid, resource.uuid);
        assert_ne!(updated.hash, resource.hash);
        assert_ne!(updated.full_hash, resource.full_hash);
    }

    #[test]
    fn test_with_master_stamps_hashes() {
        let fields: BTreeSet<String> = ["name".to_string()].into();
        let master =
            Resource::from_value(value_with_uuid(Uuid::new_v4()), "cluster", &fields).unwrap();
        let derived =
            Resource::from_value(value_with_uuid(Uuid::new_v4()), "node", &fields).unwrap();

        let target = TargetResource::new(derived).with_master(&master);
        assert_eq!(target.master, Some(master.uuid));
        assert_eq!(target.master_hash, master.hash);
        assert_eq!(target.master_full_hash, master.full_hash);
    }
}
