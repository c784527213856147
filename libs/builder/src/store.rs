//! Builder store: the persistence seam for instances, derivatives and
//! observed state.
//!
//! Persistence engines are external collaborators; the reconciler only
//! requires this narrow interface plus one consistency property: within one
//! actualization pass, the `(target, actual)` pairs read for an instance
//! must come from a consistent snapshot, so a derivative added concurrently
//! by a user action is not dropped by a pass computed from a stale view.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use cplane_model::{Resource, TargetResource};

use crate::error::BuilderError;

#[async_trait]
pub trait BuilderStore: Send + Sync {
    async fn get_instance(&self, kind: &str, uuid: Uuid) -> Result<TargetResource, BuilderError>;

    /// Upsert an instance row.
    async fn save_instance(&self, instance: &TargetResource) -> Result<(), BuilderError>;

    async fn delete_instance(&self, kind: &str, uuid: Uuid) -> Result<(), BuilderError>;

    /// Update only the instance status, leaving the rest of the row alone.
    async fn set_instance_status(
        &self,
        kind: &str,
        uuid: Uuid,
        status: &str,
    ) -> Result<(), BuilderError>;

    /// All instances of a kind, in ascending uuid order.
    async fn list_instances(&self, kind: &str) -> Result<Vec<TargetResource>, BuilderError>;

    /// Instances whose `master` references the given uuid.
    async fn list_dependent_instances(
        &self,
        master: Uuid,
    ) -> Result<Vec<TargetResource>, BuilderError>;

    /// Derivative targets owned by an instance, in ascending uuid order.
    async fn list_derivatives(&self, master: Uuid) -> Result<Vec<TargetResource>, BuilderError>;

    /// Upsert a derivative target.
    async fn save_derivative(&self, derivative: &TargetResource) -> Result<(), BuilderError>;

    async fn delete_derivative(&self, kind: &str, uuid: Uuid) -> Result<(), BuilderError>;

    /// Observed data-plane state for a derivative, if any was reported yet.
    async fn get_actual(&self, kind: &str, uuid: Uuid)
        -> Result<Option<Resource>, BuilderError>;
}

#[derive(Default)]
struct State {
    instances: BTreeMap<Uuid, TargetResource>,
    derivatives: BTreeMap<Uuid, TargetResource>,
    actuals: BTreeMap<Uuid, Resource>,
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryBuilderStore {
    state: Mutex<State>,
}

impl InMemoryBuilderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed observed data-plane state, as the agent report path would.
    pub fn set_actual(&self, actual: Resource) {
        let mut state = self.state.lock().expect("store mutex poisoned");
        state.actuals.insert(actual.uuid, actual);
    }

    pub fn remove_actual(&self, uuid: Uuid) {
        let mut state = self.state.lock().expect("store mutex poisoned");
        state.actuals.remove(&uuid);
    }
}

#[async_trait]
impl BuilderStore for InMemoryBuilderStore {
    async fn get_instance(&self, kind: &str, uuid: Uuid) -> Result<TargetResource, BuilderError> {
        let state = self.state.lock().expect("store mutex poisoned");
        state
            .instances
            .get(&uuid)
            .filter(|i| i.resource.kind == kind)
            .cloned()
            .ok_or_else(|| BuilderError::InstanceNotFound {
                kind: kind.to_string(),
                uuid,
            })
    }

    async fn save_instance(&self, instance: &TargetResource) -> Result<(), BuilderError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        state
            .instances
            .insert(instance.resource.uuid, instance.clone());
        Ok(())
    }

    async fn delete_instance(&self, kind: &str, uuid: Uuid) -> Result<(), BuilderError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        match state.instances.get(&uuid) {
            Some(i) if i.resource.kind == kind => {
                state.instances.remove(&uuid);
                Ok(())
            }
            _ => Err(BuilderError::InstanceNotFound {
                kind: kind.to_string(),
                uuid,
            }),
        }
    }

    async fn set_instance_status(
        &self,
        kind: &str,
        uuid: Uuid,
        status: &str,
    ) -> Result<(), BuilderError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        match state.instances.get_mut(&uuid) {
            Some(i) if i.resource.kind == kind => {
                i.resource.status = status.to_string();
                Ok(())
            }
            _ => Err(BuilderError::InstanceNotFound {
                kind: kind.to_string(),
                uuid,
            }),
        }
    }

    async fn list_instances(&self, kind: &str) -> Result<Vec<TargetResource>, BuilderError> {
        let state = self.state.lock().expect("store mutex poisoned");
        Ok(state
            .instances
            .values()
            .filter(|i| i.resource.kind == kind)
            .cloned()
            .collect())
    }

    async fn list_dependent_instances(
        &self,
        master: Uuid,
    ) -> Result<Vec<TargetResource>, BuilderError> {
        let state = self.state.lock().expect("store mutex poisoned");
        Ok(state
            .instances
            .values()
            .filter(|i| i.master == Some(master))
            .cloned()
            .collect())
    }

    async fn list_derivatives(&self, master: Uuid) -> Result<Vec<TargetResource>, BuilderError> {
        let state = self.state.lock().expect("store mutex poisoned");
        Ok(state
            .derivatives
            .values()
            .filter(|d| d.master == Some(master))
            .cloned()
            .collect())
    }

    async fn save_derivative(&self, derivative: &TargetResource) -> Result<(), BuilderError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        state
            .derivatives
            .insert(derivative.resource.uuid, derivative.clone());
        Ok(())
    }

    async fn delete_derivative(&self, kind: &str, uuid: Uuid) -> Result<(), BuilderError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        if let Some(d) = state.derivatives.get(&uuid) {
            if d.resource.kind == kind {
                state.derivatives.remove(&uuid);
            }
        }
        Ok(())
    }

    async fn get_actual(
        &self,
        kind: &str,
        uuid: Uuid,
    ) -> Result<Option<Resource>, BuilderError> {
        let state = self.state.lock().expect("store mutex poisoned");
        Ok(state
            .actuals
            .get(&uuid)
            .filter(|a| a.kind == kind)
            .cloned())
    }
}
