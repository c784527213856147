//! Instance handler: the overridable hook surface per instance kind.
//!
//! The framework owns pairing, diffing and persistence; handlers own the
//! domain logic — what derivatives an instance expands into and how
//! data-plane or master drift maps back onto instance state. Every hook has
//! a default, so a minimal handler implements `kind` and
//! `create_derivatives` only.

use async_trait::async_trait;

use cplane_model::{status, Resource, TargetResource};

use crate::error::BuilderError;

/// Which derivative pairs an actualization hook receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Every derivative of the instance, changed or not. The safe default:
    /// the built-in status aggregation only makes sense over the full set.
    #[default]
    AllDerivatives,

    /// Only derivatives whose observed state drifted since the last
    /// actualization. For handlers that process derivatives one by one and
    /// do their own aggregation.
    ChangedOnly,
}

/// A derivative target paired with its observed data-plane state.
///
/// `actual` is `None` while the data plane has no corresponding object yet.
#[derive(Debug, Clone)]
pub struct DerivativePair {
    pub target: TargetResource,
    pub actual: Option<Resource>,
}

impl DerivativePair {
    /// Whether the observed side has drifted since the last actualization.
    ///
    /// The target row records what the instance last saw: actualization
    /// adopts the observed status back into the re-affirmed target, so a
    /// converged derivative stops registering as drifted and repeated ticks
    /// settle into no-ops.
    pub fn is_drifted(&self) -> bool {
        match &self.actual {
            None => true,
            Some(actual) => {
                actual.hash != self.target.resource.hash
                    || actual.status != self.target.resource.status
            }
        }
    }
}

/// The authoritative outcome of an actualization hook.
#[derive(Debug, Clone)]
pub struct Actualization {
    /// The new complete derivative target set. May re-affirm the input,
    /// modify values, add derivatives or drop them.
    pub derivatives: Vec<TargetResource>,

    /// Recomputed instance status, if the hook derived one.
    pub instance_status: Option<String>,
}

impl Actualization {
    /// Re-affirm the delivered targets and aggregate instance status:
    /// every derivative observed and `ACTIVE` means the instance is
    /// `ACTIVE`, anything else means it is still converging.
    ///
    /// Observed statuses are adopted into the re-affirmed targets; that
    /// write is what makes repeated actualization of a settled instance a
    /// no-op.
    pub fn reaffirm(pairs: &[DerivativePair]) -> Self {
        let all_active = pairs.iter().all(|p| {
            p.actual
                .as_ref()
                .map(|a| a.status == status::ACTIVE)
                .unwrap_or(false)
        });

        let derivatives = pairs
            .iter()
            .map(|p| {
                let mut target = p.target.clone();
                if let Some(actual) = &p.actual {
                    target.resource.status = actual.status.clone();
                }
                target
            })
            .collect();

        Self {
            derivatives,
            instance_status: Some(if all_active {
                status::ACTIVE.to_string()
            } else {
                status::IN_PROGRESS.to_string()
            }),
        }
    }
}

/// Hook surface for one instance kind.
#[async_trait]
pub trait InstanceHandler: Send + Sync {
    /// The instance kind this handler manages.
    fn kind(&self) -> &str;

    /// Pair delivery for the actualization hooks.
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::default()
    }

    /// Called before an instance is first persisted; no derivatives exist
    /// yet.
    async fn pre_create(&self, _instance: &TargetResource) -> Result<(), BuilderError> {
        Ok(())
    }

    /// Produce the full desired derivative set for an instance.
    ///
    /// Must be a pure function of instance state and idempotent: unchanged
    /// instance state yields structurally identical sets (same uuids, same
    /// target-field values) on every call.
    async fn create_derivatives(
        &self,
        instance: &TargetResource,
    ) -> Result<Vec<TargetResource>, BuilderError>;

    /// Called after the instance and its derivatives are persisted.
    async fn post_create(
        &self,
        _instance: &TargetResource,
        _derivatives: &[TargetResource],
    ) -> Result<(), BuilderError> {
        Ok(())
    }

    /// Called before a user-initiated instance edit is applied.
    async fn pre_update(&self, _instance: &TargetResource) -> Result<(), BuilderError> {
        Ok(())
    }

    /// Compute the desired derivative set after a user-initiated edit.
    ///
    /// The default recomputes from instance fields and the reconciler
    /// applies it as a full replace: derivatives absent from the result are
    /// deleted, new ones created, matching identities left untouched. That
    /// replace is unsafe for derivatives whose membership depends on
    /// data-plane-observed facts rather than instance fields — anything
    /// added outside `create_derivatives` gets deleted on the next update.
    /// Override with merge logic when such derivatives exist.
    async fn update_derivatives(
        &self,
        instance: &TargetResource,
        _existing: &[TargetResource],
    ) -> Result<Vec<TargetResource>, BuilderError> {
        self.create_derivatives(instance).await
    }

    /// Called after an instance edit and its derivative diff are persisted.
    async fn post_update(
        &self,
        _instance: &TargetResource,
        _derivatives: &[TargetResource],
    ) -> Result<(), BuilderError> {
        Ok(())
    }

    /// Called before an instance is torn down. Derivative teardown ordering
    /// (derivatives before instance, or explicit orphaning) belongs here.
    async fn pre_delete(&self, _instance: &TargetResource) -> Result<(), BuilderError> {
        Ok(())
    }

    /// React to data-plane drift on the instance's derivatives.
    async fn actualize_derivatives(
        &self,
        _instance: &TargetResource,
        pairs: &[DerivativePair],
    ) -> Result<Actualization, BuilderError> {
        Ok(Actualization::reaffirm(pairs))
    }

    /// React to a master changing its target fields.
    async fn actualize_master_hash_instance(
        &self,
        _instance: &TargetResource,
        _master: &TargetResource,
        pairs: &[DerivativePair],
    ) -> Result<Actualization, BuilderError> {
        Ok(Actualization::reaffirm(pairs))
    }

    /// React to a master changing any field.
    async fn actualize_master_full_hash_instance(
        &self,
        _instance: &TargetResource,
        _master: &TargetResource,
        pairs: &[DerivativePair],
    ) -> Result<Actualization, BuilderError> {
        Ok(Actualization::reaffirm(pairs))
    }
}
