//! The derivative reconciler and its polling loop.
//!
//! For each logical instance the reconciler drives a small state machine:
//!
//! - creation expands the instance into derivative targets;
//! - user edits re-expand and apply the result as a replace-all diff;
//! - data-plane drift pairs targets with observed actuals and hands them to
//!   the handler's actualization hook;
//! - master drift (a referenced upstream instance changed) triggers the
//!   master variants of the same hook.
//!
//! Within one tick, master-driven actualization runs before data-plane
//! driven actualization — derivative target values may be functions of
//! master fields, so the order is a correctness dependency. The target-hash
//! variant runs before the full-hash variant and refreshes both stored
//! master digests, so a master change that touches target fields does not
//! actualize the same dependent twice.
//!
//! Failure semantics: a failed hook leaves the instance's persisted status
//! untouched. Status is written last, only after the derivative diff
//! persisted cleanly — an instance never auto-advances to a success status
//! off a failed pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cplane_model::TargetResource;

use crate::error::BuilderError;
use crate::handler::{Actualization, DeliveryMode, DerivativePair, InstanceHandler};
use crate::store::BuilderStore;

/// Immutable handler registry, one handler per instance kind.
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn InstanceHandler>>,
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn InstanceHandler>>) -> Result<Self, BuilderError> {
        let mut by_kind = BTreeMap::new();
        for handler in handlers {
            let kind = handler.kind().to_string();
            if by_kind.insert(kind.clone(), handler).is_some() {
                return Err(BuilderError::Hook(format!(
                    "instance kind {kind} claimed by more than one handler"
                )));
            }
        }
        Ok(Self { handlers: by_kind })
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn handler(&self, kind: &str) -> Result<&Arc<dyn InstanceHandler>, BuilderError> {
        self.handlers
            .get(kind)
            .ok_or_else(|| BuilderError::UnknownKind(kind.to_string()))
    }
}

/// Builder loop configuration.
pub struct BuilderConfig {
    /// Interval between actualization passes.
    pub tick_interval: Duration,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
        }
    }
}

/// Statistics from one builder pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuilderStats {
    pub actualized: usize,
    pub master_actualized: usize,
    pub failed: usize,
}

/// The server-side derivative reconciler.
pub struct DerivativeReconciler<S> {
    store: S,
    registry: HandlerRegistry,
    config: BuilderConfig,
}

impl<S: BuilderStore> DerivativeReconciler<S> {
    pub fn new(store: S, registry: HandlerRegistry, config: BuilderConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create an instance and its derivatives.
    pub async fn create_instance(
        &self,
        mut instance: TargetResource,
    ) -> Result<TargetResource, BuilderError> {
        let handler = self.registry.handler(&instance.resource.kind)?;

        handler.pre_create(&instance).await?;

        let derivatives: Vec<TargetResource> = handler
            .create_derivatives(&instance)
            .await?
            .into_iter()
            .map(|d| stamp_master(d, &instance))
            .collect();

        instance.touch();
        self.store.save_instance(&instance).await?;
        for derivative in &derivatives {
            self.store.save_derivative(derivative).await?;
        }

        handler.post_create(&instance, &derivatives).await?;

        info!(
            kind = %instance.resource.kind,
            uuid = %instance.resource.uuid,
            derivatives = derivatives.len(),
            "Created instance"
        );
        Ok(instance)
    }

    /// Apply a user-initiated instance edit.
    ///
    /// The handler's desired set replaces the existing one: derivatives
    /// absent from the result are deleted, new ones created, matching
    /// identities left untouched.
    pub async fn update_instance(
        &self,
        mut instance: TargetResource,
    ) -> Result<TargetResource, BuilderError> {
        let handler = self.registry.handler(&instance.resource.kind)?;

        handler.pre_update(&instance).await?;

        let existing = self.store.list_derivatives(instance.resource.uuid).await?;
        let desired: Vec<TargetResource> = handler
            .update_derivatives(&instance, &existing)
            .await?
            .into_iter()
            .map(|d| stamp_master(d, &instance))
            .collect();

        let desired_ids: BTreeMap<Uuid, &TargetResource> =
            desired.iter().map(|d| (d.resource.uuid, d)).collect();
        let existing_ids: BTreeMap<Uuid, &TargetResource> =
            existing.iter().map(|d| (d.resource.uuid, d)).collect();

        for (uuid, stale) in &existing_ids {
            if !desired_ids.contains_key(uuid) {
                debug!(uuid = %uuid, "Deleting derivative dropped by update");
                self.store
                    .delete_derivative(&stale.resource.kind, *uuid)
                    .await?;
            }
        }
        for (uuid, fresh) in &desired_ids {
            if !existing_ids.contains_key(uuid) {
                debug!(uuid = %uuid, "Creating derivative added by update");
                self.store.save_derivative(fresh).await?;
            }
        }

        instance.touch();
        self.store.save_instance(&instance).await?;

        handler.post_update(&instance, &desired).await?;

        info!(
            kind = %instance.resource.kind,
            uuid = %instance.resource.uuid,
            "Updated instance"
        );
        Ok(instance)
    }

    /// Tear an instance down, derivatives first.
    pub async fn delete_instance(&self, kind: &str, uuid: Uuid) -> Result<(), BuilderError> {
        let handler = self.registry.handler(kind)?;
        let instance = self.store.get_instance(kind, uuid).await?;

        handler.pre_delete(&instance).await?;

        for derivative in self.store.list_derivatives(uuid).await? {
            self.store
                .delete_derivative(&derivative.resource.kind, derivative.resource.uuid)
                .await?;
        }
        self.store.delete_instance(kind, uuid).await?;

        info!(kind, %uuid, "Deleted instance");
        Ok(())
    }

    /// Pair every derivative target of an instance with its observed state.
    pub async fn build_pairs(
        &self,
        instance: &TargetResource,
    ) -> Result<Vec<DerivativePair>, BuilderError> {
        let mut pairs = Vec::new();
        for target in self.store.list_derivatives(instance.resource.uuid).await? {
            let actual = self
                .store
                .get_actual(&target.resource.kind, target.resource.uuid)
                .await?;
            pairs.push(DerivativePair { target, actual });
        }
        Ok(pairs)
    }

    /// Actualize every instance of a kind whose derivatives drifted.
    pub async fn actualize_outdated_instances(
        &self,
        kind: &str,
    ) -> Result<BuilderStats, BuilderError> {
        let handler = self.registry.handler(kind)?;
        let mut stats = BuilderStats::default();

        for instance in self.store.list_instances(kind).await? {
            let pairs = self.build_pairs(&instance).await?;
            if !pairs.iter().any(DerivativePair::is_drifted) {
                continue;
            }

            let delivered: Vec<DerivativePair> = match handler.delivery_mode() {
                DeliveryMode::AllDerivatives => pairs.clone(),
                DeliveryMode::ChangedOnly => {
                    pairs.iter().filter(|p| p.is_drifted()).cloned().collect()
                }
            };

            match handler.actualize_derivatives(&instance, &delivered).await {
                Ok(result) => {
                    // The result is authoritative over the delivered pairs
                    // only; in changed-only mode the undelivered derivatives
                    // must survive untouched.
                    self.apply_actualization(&instance, &delivered, result)
                        .await?;
                    stats.actualized += 1;
                }
                Err(e) => {
                    // Instance status stays at its last persisted value.
                    warn!(
                        kind,
                        uuid = %instance.resource.uuid,
                        error = %e,
                        "Actualization hook failed"
                    );
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Dependents whose stored master hash no longer matches the master's
    /// current target-field hash.
    pub async fn track_outdated_master_hash_instances(
        &self,
        master: &TargetResource,
    ) -> Result<Vec<TargetResource>, BuilderError> {
        Ok(self
            .store
            .list_dependent_instances(master.resource.uuid)
            .await?
            .into_iter()
            .filter(|i| i.master_hash != master.resource.hash)
            .collect())
    }

    /// Dependents whose stored master full hash no longer matches the
    /// master's current full hash.
    pub async fn track_outdated_master_full_hash_instances(
        &self,
        master: &TargetResource,
    ) -> Result<Vec<TargetResource>, BuilderError> {
        Ok(self
            .store
            .list_dependent_instances(master.resource.uuid)
            .await?
            .into_iter()
            .filter(|i| i.master_full_hash != master.resource.full_hash)
            .collect())
    }

    /// Actualize a dependent after its master changed target fields.
    ///
    /// Refreshes both stored master digests afterwards: a target-field
    /// change implies a full-hash change, and handling both here keeps the
    /// full-hash pass from re-actualizing the same dependent.
    pub async fn actualize_outdated_master_hash_instance(
        &self,
        master: &TargetResource,
        instance: &TargetResource,
    ) -> Result<(), BuilderError> {
        let handler = self.registry.handler(&instance.resource.kind)?;
        let pairs = self.build_pairs(instance).await?;

        let result = handler
            .actualize_master_hash_instance(instance, master, &pairs)
            .await?;

        // Record the caught-up digests before the derivative diff so the
        // status write stays last.
        let mut refreshed = instance.clone();
        refreshed.master_hash = master.resource.hash.clone();
        refreshed.master_full_hash = master.resource.full_hash.clone();
        refreshed.touch();
        self.store.save_instance(&refreshed).await?;

        self.apply_actualization(&refreshed, &pairs, result).await
    }

    /// Actualize a dependent after its master changed non-target fields.
    pub async fn actualize_outdated_master_full_hash_instance(
        &self,
        master: &TargetResource,
        instance: &TargetResource,
    ) -> Result<(), BuilderError> {
        let handler = self.registry.handler(&instance.resource.kind)?;
        let pairs = self.build_pairs(instance).await?;

        let result = handler
            .actualize_master_full_hash_instance(instance, master, &pairs)
            .await?;

        let mut refreshed = instance.clone();
        refreshed.master_full_hash = master.resource.full_hash.clone();
        refreshed.touch();
        self.store.save_instance(&refreshed).await?;

        self.apply_actualization(&refreshed, &pairs, result).await
    }

    /// One full builder pass: master-driven actualization first, then
    /// data-plane-driven, each in deterministic kind/uuid order.
    pub async fn tick(&self) -> BuilderStats {
        let mut stats = BuilderStats::default();

        for kind in self.registry.kinds() {
            let masters = match self.store.list_instances(kind).await {
                Ok(masters) => masters,
                Err(e) => {
                    error!(kind, error = %e, "Listing instances failed");
                    continue;
                }
            };

            for master in masters {
                stats.merge(
                    self.propagate_master(&master)
                        .await
                        .unwrap_or_else(|e| {
                            error!(
                                kind,
                                master = %master.resource.uuid,
                                error = %e,
                                "Master propagation failed"
                            );
                            BuilderStats {
                                failed: 1,
                                ..BuilderStats::default()
                            }
                        }),
                );
            }
        }

        for kind in self.registry.kinds() {
            match self.actualize_outdated_instances(kind).await {
                Ok(kind_stats) => stats.merge(kind_stats),
                Err(e) => {
                    error!(kind, error = %e, "Actualization pass failed");
                    stats.failed += 1;
                }
            }
        }

        info!(
            actualized = stats.actualized,
            master_actualized = stats.master_actualized,
            failed = stats.failed,
            "Builder pass complete"
        );
        stats
    }

    /// Run the builder loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_interval_secs = self.config.tick_interval.as_secs(),
            "Starting builder loop"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Builder shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Propagate one master's drift to its dependents.
    async fn propagate_master(
        &self,
        master: &TargetResource,
    ) -> Result<BuilderStats, BuilderError> {
        let mut stats = BuilderStats::default();

        // Target-field drift first: it subsumes full drift for the same
        // dependent.
        for dependent in self.track_outdated_master_hash_instances(master).await? {
            match self
                .actualize_outdated_master_hash_instance(master, &dependent)
                .await
            {
                Ok(()) => stats.master_actualized += 1,
                Err(e) => {
                    warn!(
                        master = %master.resource.uuid,
                        dependent = %dependent.resource.uuid,
                        error = %e,
                        "Master-hash actualization failed"
                    );
                    stats.failed += 1;
                }
            }
        }

        for dependent in self
            .track_outdated_master_full_hash_instances(master)
            .await?
        {
            match self
                .actualize_outdated_master_full_hash_instance(master, &dependent)
                .await
            {
                Ok(()) => stats.master_actualized += 1,
                Err(e) => {
                    warn!(
                        master = %master.resource.uuid,
                        dependent = %dependent.resource.uuid,
                        error = %e,
                        "Master-full-hash actualization failed"
                    );
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Persist an actualization result: diff the authoritative derivative
    /// set against the previous targets, then write the instance status
    /// last.
    async fn apply_actualization(
        &self,
        instance: &TargetResource,
        previous: &[DerivativePair],
        result: Actualization,
    ) -> Result<(), BuilderError> {
        let fresh: Vec<TargetResource> = result
            .derivatives
            .into_iter()
            .map(|d| stamp_master(d, instance))
            .collect();

        let fresh_ids: BTreeMap<Uuid, &TargetResource> =
            fresh.iter().map(|d| (d.resource.uuid, d)).collect();
        let previous_ids: BTreeMap<Uuid, &TargetResource> = previous
            .iter()
            .map(|p| (p.target.resource.uuid, &p.target))
            .collect();

        for (uuid, stale) in &previous_ids {
            if !fresh_ids.contains_key(uuid) {
                self.store
                    .delete_derivative(&stale.resource.kind, *uuid)
                    .await?;
            }
        }
        for (uuid, derivative) in &fresh_ids {
            match previous_ids.get(uuid) {
                // Untouched derivatives are not rewritten.
                Some(prev)
                    if prev.resource.hash == derivative.resource.hash
                        && prev.resource.full_hash == derivative.resource.full_hash
                        && prev.resource.status == derivative.resource.status => {}
                _ => self.store.save_derivative(derivative).await?,
            }
        }

        if let Some(status) = result.instance_status {
            debug!(
                kind = %instance.resource.kind,
                uuid = %instance.resource.uuid,
                status = %status,
                "Instance status recomputed"
            );
            self.store
                .set_instance_status(&instance.resource.kind, instance.resource.uuid, &status)
                .await?;
        }

        Ok(())
    }
}

impl BuilderStats {
    fn merge(&mut self, other: BuilderStats) {
        self.actualized += other.actualized;
        self.master_actualized += other.master_actualized;
        self.failed += other.failed;
    }
}

/// Derivatives always reference their instance by identity; handlers that
/// already set a master keep it.
fn stamp_master(mut derivative: TargetResource, instance: &TargetResource) -> TargetResource {
    if derivative.master.is_none() {
        derivative = derivative.with_master(&instance.resource);
    }
    derivative
}
