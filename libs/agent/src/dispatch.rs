//! Delta classification and driver dispatch.
//!
//! [`plan_kind`] is the pure half: given the target and observed resources
//! of one kind, classify every identity into create/update/delete.
//! [`apply_kind`] is the effectful half: it walks the plan sequentially —
//! operations on the same `(kind, uuid)` must never run concurrently — and
//! collects realized state and per-resource failures.
//!
//! Kinds are independent of each other, so the reconciler runs one
//! `apply_kind` per kind in parallel.

use std::time::Duration;

use tracing::{debug, warn};

use cplane_model::{ResKey, Resource, TargetResource};

use crate::driver::CapabilityDriver;
use crate::error::DriverError;

/// One planned driver operation.
#[derive(Debug, Clone)]
pub enum Action {
    /// Present in target, absent on the data plane.
    Create(TargetResource),

    /// Present in both with differing target-field hash.
    Update(TargetResource),

    /// Present on the data plane, absent in target.
    Delete(Resource),
}

impl Action {
    pub fn res_key(&self) -> ResKey {
        match self {
            Action::Create(t) | Action::Update(t) => t.res_key(),
            Action::Delete(r) => r.res_key(),
        }
    }
}

/// Classify the delta for one kind.
///
/// Identities present on both sides with equal hash produce no action —
/// hash comparison is the only convergence check, never a deep compare.
/// The plan is ordered by uuid for determinism.
pub fn plan_kind(targets: &[TargetResource], observed: &[Resource]) -> Vec<Action> {
    use std::collections::BTreeMap;

    let target_by: BTreeMap<_, _> = targets.iter().map(|t| (t.resource.uuid, t)).collect();
    let observed_by: BTreeMap<_, _> = observed.iter().map(|r| (r.uuid, r)).collect();

    let mut actions = Vec::new();

    for (uuid, target) in &target_by {
        match observed_by.get(uuid) {
            None => actions.push(Action::Create((*target).clone())),
            Some(actual) if actual.hash != target.resource.hash => {
                actions.push(Action::Update((*target).clone()))
            }
            Some(_) => {}
        }
    }

    for (uuid, actual) in &observed_by {
        if !target_by.contains_key(uuid) {
            actions.push(Action::Delete((*actual).clone()));
        }
    }

    actions
}

/// Outcome of applying one kind's plan.
#[derive(Debug, Default)]
pub struct KindOutcome {
    /// Realized observed state of created/updated resources.
    pub realized: Vec<Resource>,

    /// Identities removed from the data plane.
    pub deleted: Vec<ResKey>,

    /// Per-resource failures, left for the next tick.
    pub failed: Vec<(ResKey, DriverError)>,
}

/// Apply a plan through a driver, one operation at a time.
///
/// Each call is bounded by `op_timeout`; an elapsed timeout classifies as
/// transient and the resource is retried next tick. A failed operation never
/// partially applies: the driver either returns the realized resource or an
/// error, and only the error is recorded.
pub async fn apply_kind(
    driver: &dyn CapabilityDriver,
    actions: Vec<Action>,
    op_timeout: Duration,
) -> KindOutcome {
    let mut outcome = KindOutcome::default();

    for action in actions {
        let key = action.res_key();
        let result = apply_action(driver, &action, op_timeout).await;

        match (action, result) {
            (Action::Delete(_), Ok(None)) => {
                debug!(kind = %key.0, uuid = %key.1, "Deleted resource");
                outcome.deleted.push(key);
            }
            (_, Ok(Some(realized))) => {
                debug!(kind = %key.0, uuid = %key.1, "Realized resource");
                outcome.realized.push(realized);
            }
            (_, Ok(None)) => outcome.deleted.push(key),
            (_, Err(err)) => {
                warn!(
                    kind = %key.0,
                    uuid = %key.1,
                    error = %err,
                    "Driver operation failed, will retry next tick"
                );
                outcome.failed.push((key, err));
            }
        }
    }

    outcome
}

async fn apply_action(
    driver: &dyn CapabilityDriver,
    action: &Action,
    op_timeout: Duration,
) -> Result<Option<Resource>, DriverError> {
    match action {
        Action::Create(target) => {
            let realized = with_timeout(op_timeout, driver.create(&target.resource)).await?;
            Ok(Some(realized))
        }
        Action::Update(target) => {
            match with_timeout(op_timeout, driver.update(&target.resource)).await {
                Ok(realized) => Ok(Some(realized)),
                // The object vanished between list and update: fall back to
                // create within the same tick.
                Err(DriverError::NotFound { .. }) => {
                    debug!(
                        kind = %target.resource.kind,
                        uuid = %target.resource.uuid,
                        "Update target missing, falling back to create"
                    );
                    let realized =
                        with_timeout(op_timeout, driver.create(&target.resource)).await?;
                    Ok(Some(realized))
                }
                Err(err) => Err(err),
            }
        }
        Action::Delete(resource) => {
            match with_timeout(op_timeout, driver.delete(resource)).await {
                Ok(()) => Ok(None),
                // Already gone means already converged.
                Err(DriverError::NotFound { .. }) => Ok(None),
                Err(err) => Err(err),
            }
        }
    }
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, DriverError>>,
) -> Result<T, DriverError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Transient(format!(
            "driver call timed out after {limit:?}"
        ))),
    }
}
