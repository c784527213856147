//! Driver traits and the driver registry.
//!
//! A capability driver manages one or more resource kinds end-to-end
//! (create/update/delete); a fact driver only observes. Drivers are invoked
//! once per reconciliation tick under the iteration contract
//!
//! ```text
//! start -> list -> [create | update | delete]* -> finalize
//! ```
//!
//! `start` is the place to load storages or open connections, `finalize` the
//! place to persist and clean up.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use cplane_model::Resource;

use crate::error::DriverError;

/// A driver that realizes target resources on the data plane.
#[async_trait]
pub trait CapabilityDriver: Send + Sync {
    /// Capability kinds this driver manages.
    fn get_capabilities(&self) -> BTreeSet<String>;

    /// Called once before any other operation in a tick.
    async fn start(&self) -> Result<(), DriverError> {
        Ok(())
    }

    /// List all observed resources of a capability kind.
    async fn list(&self, capability: &str) -> Result<Vec<Resource>, DriverError>;

    /// Fetch a single resource by identity.
    async fn get(&self, resource: &Resource) -> Result<Resource, DriverError>;

    /// Create the resource; returns the realized observed state.
    async fn create(&self, resource: &Resource) -> Result<Resource, DriverError>;

    /// Update the resource; returns the realized observed state.
    async fn update(&self, resource: &Resource) -> Result<Resource, DriverError>;

    /// Delete the resource. A missing resource is already converged, so
    /// implementations tolerate NotFound from the data plane.
    async fn delete(&self, resource: &Resource) -> Result<(), DriverError>;

    /// Called once after all operations in a tick.
    async fn finalize(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// A read-only driver reporting data-plane-observed resources.
#[async_trait]
pub trait FactDriver: Send + Sync {
    /// Fact kinds this driver observes.
    fn get_facts(&self) -> BTreeSet<String>;

    /// List all observed resources of a fact kind.
    async fn list(&self, fact: &str) -> Result<Vec<Resource>, DriverError>;
}

/// Immutable driver registry, constructed once at startup and passed by
/// reference into the reconciliation loop.
pub struct DriverRegistry {
    capability_drivers: Vec<Arc<dyn CapabilityDriver>>,
    fact_drivers: Vec<Arc<dyn FactDriver>>,
    by_capability: BTreeMap<String, usize>,
    by_fact: BTreeMap<String, usize>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("capability_drivers", &self.capability_drivers.len())
            .field("fact_drivers", &self.fact_drivers.len())
            .field("by_capability", &self.by_capability)
            .field("by_fact", &self.by_fact)
            .finish()
    }
}

impl DriverRegistry {
    /// Build a registry, rejecting duplicate kind claims.
    pub fn new(
        capability_drivers: Vec<Arc<dyn CapabilityDriver>>,
        fact_drivers: Vec<Arc<dyn FactDriver>>,
    ) -> Result<Self, DriverError> {
        let mut by_capability = BTreeMap::new();
        for (idx, driver) in capability_drivers.iter().enumerate() {
            for kind in driver.get_capabilities() {
                if by_capability.insert(kind.clone(), idx).is_some() {
                    return Err(DriverError::Validation(format!(
                        "capability {kind} claimed by more than one driver"
                    )));
                }
            }
        }

        let mut by_fact = BTreeMap::new();
        for (idx, driver) in fact_drivers.iter().enumerate() {
            for kind in driver.get_facts() {
                if by_fact.insert(kind.clone(), idx).is_some() {
                    return Err(DriverError::Validation(format!(
                        "fact {kind} claimed by more than one driver"
                    )));
                }
            }
        }

        Ok(Self {
            capability_drivers,
            fact_drivers,
            by_capability,
            by_fact,
        })
    }

    /// All registered capability kinds, in stable order.
    pub fn capability_kinds(&self) -> impl Iterator<Item = &str> {
        self.by_capability.keys().map(String::as_str)
    }

    /// All registered fact kinds, in stable order.
    pub fn fact_kinds(&self) -> impl Iterator<Item = &str> {
        self.by_fact.keys().map(String::as_str)
    }

    pub fn capability_driver(&self, kind: &str) -> Option<&Arc<dyn CapabilityDriver>> {
        self.by_capability
            .get(kind)
            .map(|idx| &self.capability_drivers[*idx])
    }

    pub fn fact_driver(&self, kind: &str) -> Option<&Arc<dyn FactDriver>> {
        self.by_fact.get(kind).map(|idx| &self.fact_drivers[*idx])
    }

    /// Every capability driver, once each.
    pub fn capability_drivers(&self) -> impl Iterator<Item = &Arc<dyn CapabilityDriver>> {
        self.capability_drivers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDriver {
        kinds: BTreeSet<String>,
    }

    #[async_trait]
    impl CapabilityDriver for FakeDriver {
        fn get_capabilities(&self) -> BTreeSet<String> {
            self.kinds.clone()
        }

        async fn list(&self, _capability: &str) -> Result<Vec<Resource>, DriverError> {
            Ok(vec![])
        }

        async fn get(&self, resource: &Resource) -> Result<Resource, DriverError> {
            Err(DriverError::not_found(resource))
        }

        async fn create(&self, resource: &Resource) -> Result<Resource, DriverError> {
            Ok(resource.clone())
        }

        async fn update(&self, resource: &Resource) -> Result<Resource, DriverError> {
            Ok(resource.clone())
        }

        async fn delete(&self, _resource: &Resource) -> Result<(), DriverError> {
            Ok(())
        }
    }

    fn driver(kinds: &[&str]) -> Arc<dyn CapabilityDriver> {
        Arc::new(FakeDriver {
            kinds: kinds.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_registry_routes_by_kind() {
        let registry =
            DriverRegistry::new(vec![driver(&["config"]), driver(&["node"])], vec![]).unwrap();

        assert!(registry.capability_driver("config").is_some());
        assert!(registry.capability_driver("node").is_some());
        assert!(registry.capability_driver("other").is_none());
        let kinds: Vec<_> = registry.capability_kinds().collect();
        assert_eq!(kinds, vec!["config", "node"]);
    }

    #[test]
    fn test_registry_rejects_duplicate_kind() {
        let err =
            DriverRegistry::new(vec![driver(&["config"]), driver(&["config"])], vec![]).unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));
    }
}
