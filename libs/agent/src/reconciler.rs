//! The agent reconciliation loop.
//!
//! Each tick is a bounded, independent unit of work:
//!
//! 1. Fetch the target payload from the orchestrator (hash/version gated).
//! 2. Build the observed payload by listing every capability driver, and the
//!    facts payload from fact drivers.
//! 3. Compare payload hashes; equal hashes end the tick with a facts report
//!    and zero CRUD calls.
//! 4. Otherwise classify per-kind deltas and dispatch them, kinds in
//!    parallel, same-kind operations in sequence.
//! 5. Report the realized data-plane state upstream.
//!
//! No state is held across ticks beyond the cached target payload; a
//! restarted agent rebuilds everything from its storages and the next fetch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::future::join_all;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use cplane_model::{Agent, Payload, Resource};

use crate::client::OrchClient;
use crate::dispatch::{apply_kind, plan_kind, KindOutcome};
use crate::driver::DriverRegistry;
use crate::error::OrchError;

/// Reconciliation loop configuration.
pub struct AgentConfig {
    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,

    /// Upper bound for a single driver operation.
    pub op_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            op_timeout: Duration::from_secs(60),
        }
    }
}

/// Statistics from one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    pub realized: usize,
    pub deleted: usize,
    pub failed: usize,

    /// True when payload hashes matched and no driver CRUD ran.
    pub converged: bool,
}

/// The agent-side reconciler.
pub struct AgentReconciler {
    agent: Agent,
    client: Arc<dyn OrchClient>,
    registry: DriverRegistry,
    config: AgentConfig,

    /// Last target payload seen from the orchestrator.
    target: Mutex<Option<Payload>>,
}

impl AgentReconciler {
    pub fn new(
        agent: Agent,
        client: Arc<dyn OrchClient>,
        registry: DriverRegistry,
        config: AgentConfig,
    ) -> Self {
        Self {
            agent,
            client,
            registry,
            config,
            target: Mutex::new(None),
        }
    }

    /// Register this agent with the orchestrator.
    ///
    /// An already-registered agent gets its capabilities and facts updated
    /// instead.
    pub async fn register(&self) -> Result<(), OrchError> {
        match self.client.register_agent(&self.agent).await {
            Ok(()) => {
                info!(agent = %self.agent.uuid, "Agent registered");
                Ok(())
            }
            Err(OrchError::AgentAlreadyExists(_)) => {
                warn!(agent = %self.agent.uuid, "Agent already registered, updating");
                self.client.update_agent(&self.agent).await
            }
            Err(err) => Err(err),
        }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            agent = %self.agent.uuid,
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.config.reconcile_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "Reconciliation failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Agent reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single reconciliation pass.
    pub async fn reconcile(&self) -> anyhow::Result<TickStats> {
        debug!("Starting reconciliation");

        for driver in self.registry.capability_drivers() {
            driver.start().await.context("driver start failed")?;
        }

        let result = self.reconcile_inner().await;

        // Finalize runs even when the tick failed; storages must persist
        // whatever was applied.
        for driver in self.registry.capability_drivers() {
            if let Err(e) = driver.finalize().await {
                warn!(error = %e, "Driver finalize failed");
            }
        }

        result
    }

    async fn reconcile_inner(&self) -> anyhow::Result<TickStats> {
        let mut observed = self.observe_capabilities().await?;

        // Facts are part of the payload digest: fact drift alone makes the
        // hashes differ, which is what pushes fresh facts upstream.
        observed.facts = self.observe_facts().await.facts;

        let target = match self.fetch_target().await? {
            Some(target) => target,
            None => {
                // Nothing declared for this agent yet; still report facts.
                self.report(observed).await;
                return Ok(TickStats {
                    converged: true,
                    ..TickStats::default()
                });
            }
        };

        observed.rehash();
        if observed.hash == target.hash {
            debug!(hash = %target.hash, "Payloads converged, nothing to do");
            self.report(observed).await;
            return Ok(TickStats {
                converged: true,
                ..TickStats::default()
            });
        }

        // Union of kinds on both sides: a kind present only in target needs
        // creates, present only in observed needs deletes.
        let mut kinds: Vec<&str> = target
            .capabilities
            .keys()
            .chain(observed.capabilities.keys())
            .map(String::as_str)
            .collect();
        kinds.sort_unstable();
        kinds.dedup();

        let mut tasks = Vec::new();
        for kind in kinds {
            let Some(driver) = self.registry.capability_driver(kind) else {
                warn!(kind, "No driver for capability, leaving resources untouched");
                continue;
            };

            let observed_kind: Vec<Resource> = observed
                .capability(kind)
                .iter()
                .map(|t| t.resource.clone())
                .collect();
            let actions = plan_kind(target.capability(kind), &observed_kind);
            if actions.is_empty() {
                continue;
            }

            debug!(kind, actions = actions.len(), "Dispatching kind delta");
            let driver = Arc::clone(driver);
            let op_timeout = self.config.op_timeout;
            tasks.push(async move { apply_kind(driver.as_ref(), actions, op_timeout).await });
        }

        let outcomes: Vec<KindOutcome> = join_all(tasks).await;

        let mut stats = TickStats::default();
        for outcome in outcomes {
            stats.realized += outcome.realized.len();
            stats.deleted += outcome.deleted.len();
            stats.failed += outcome.failed.len();

            for realized in outcome.realized {
                observed.upsert_observed(realized);
            }
            for key in outcome.deleted {
                observed.remove_capability(&key);
            }
        }

        info!(
            realized = stats.realized,
            deleted = stats.deleted,
            failed = stats.failed,
            "Reconciliation pass complete"
        );

        self.report(observed).await;
        Ok(stats)
    }

    /// Build the observed payload by listing every capability kind.
    ///
    /// A failed list aborts the tick: planning against a partial view would
    /// mass-create resources that merely failed to enumerate.
    async fn observe_capabilities(&self) -> anyhow::Result<Payload> {
        let lists = join_all(self.registry.capability_kinds().map(|kind| {
            let driver = self
                .registry
                .capability_driver(kind)
                .expect("kind indexed by registry")
                .clone();
            let kind = kind.to_string();
            async move {
                let result = driver.list(&kind).await;
                (kind, result)
            }
        }))
        .await;

        let mut observed = Payload::new();
        for (kind, result) in lists {
            let resources =
                result.with_context(|| format!("listing capability {kind} failed"))?;
            observed.declare_capability(kind);
            for resource in resources {
                observed.add_observed(resource);
            }
        }

        Ok(observed)
    }

    /// Build the facts payload. Facts are informational: a failed fact list
    /// is logged and skipped rather than aborting the tick.
    async fn observe_facts(&self) -> Payload {
        let lists = join_all(self.registry.fact_kinds().map(|kind| {
            let driver = self
                .registry
                .fact_driver(kind)
                .expect("kind indexed by registry")
                .clone();
            let kind = kind.to_string();
            async move {
                let result = driver.list(&kind).await;
                (kind, result)
            }
        }))
        .await;

        let mut facts = Payload::new();
        for (kind, result) in lists {
            match result {
                Ok(resources) => {
                    facts.declare_fact(kind);
                    for resource in resources {
                        facts.add_fact(resource);
                    }
                }
                Err(e) => warn!(kind, error = %e, "Fact listing failed, skipping"),
            }
        }

        facts
    }

    /// Fetch the target payload, reusing the cached one when the
    /// orchestrator reports no change.
    async fn fetch_target(&self) -> anyhow::Result<Option<Payload>> {
        let mut cached = self.target.lock().await;
        let (version, hash) = cached
            .as_ref()
            .map(|p| (p.version, p.hash.clone()))
            .unwrap_or((0, String::new()));

        match self.client.get_payload(&self.agent, version, &hash).await {
            Ok(Some(fresh)) => {
                debug!(version = fresh.version, "Fetched new target payload");
                *cached = Some(fresh);
            }
            Ok(None) => debug!(version, "Target payload unchanged"),
            Err(e) => {
                warn!(error = %e, "Failed to fetch target payload, will retry");
                anyhow::bail!("target payload fetch failed: {e}");
            }
        }

        Ok(cached.clone())
    }

    /// Report realized capabilities and facts upstream. Report failures are
    /// not fatal; the next tick repeats the report.
    async fn report(&self, mut actual: Payload) {
        actual.rehash();

        if let Err(e) = self.client.report(&self.agent, &actual).await {
            warn!(error = %e, "Failed to report actual state");
        }
    }
}

/// Observed-side helpers on [`Payload`].
///
/// The observed payload reuses the capability map so payload hashing stays a
/// single code path; observed entries are wrapped into target resources with
/// empty agent/master metadata on insert.
trait ObservedPayload {
    fn add_observed(&mut self, resource: Resource);
    fn upsert_observed(&mut self, resource: Resource);
}

impl ObservedPayload for Payload {
    fn add_observed(&mut self, resource: Resource) {
        self.add_capability(resource.into());
    }

    fn upsert_observed(&mut self, resource: Resource) {
        self.remove_capability(&resource.res_key());
        self.add_capability(resource.into());
    }
}
