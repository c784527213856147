//! Integration tests for the derivative reconciler.
//!
//! A `cluster` instance with `nodes_number` expands into that many `node`
//! derivatives; the tests drive creation, user edits, data-plane drift and
//! master propagation through an in-memory store.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use cplane_builder::{
    Actualization, BuilderConfig, BuilderError, BuilderStore, DeliveryMode, DerivativePair,
    DerivativeReconciler, HandlerRegistry, InMemoryBuilderStore, InstanceHandler,
};
use cplane_model::{status, Resource, TargetResource};

/// Expands a cluster into `nodes_number` node derivatives and records which
/// hooks fired. The logs are shared handles so tests keep access after the
/// handler moves into the registry.
struct ClusterHandler {
    delivery: DeliveryMode,
    fail_actualize: bool,
    fired: Arc<Mutex<Vec<String>>>,
    delivered_pairs: Arc<Mutex<Vec<usize>>>,
}

impl ClusterHandler {
    fn new() -> Self {
        Self {
            delivery: DeliveryMode::AllDerivatives,
            fail_actualize: false,
            fired: Arc::new(Mutex::new(Vec::new())),
            delivered_pairs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn fired_handle(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.fired)
    }

    fn delivered_handle(&self) -> Arc<Mutex<Vec<usize>>> {
        Arc::clone(&self.delivered_pairs)
    }

    fn record(&self, hook: &str) {
        self.fired.lock().unwrap().push(hook.to_string());
    }
}

fn node_uuid(instance: Uuid, index: u64) -> Uuid {
    Uuid::new_v5(&instance, format!("node-{index}").as_bytes())
}

fn node_value(instance: &TargetResource, index: u64) -> Map<String, Value> {
    let name = instance
        .resource
        .value
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let mut value = Map::new();
    value.insert(
        "uuid".to_string(),
        json!(node_uuid(instance.resource.uuid, index).to_string()),
    );
    value.insert("name".to_string(), json!(format!("{name}-node-{index}")));
    value
}

#[async_trait]
impl InstanceHandler for ClusterHandler {
    fn kind(&self) -> &str {
        "cluster"
    }

    fn delivery_mode(&self) -> DeliveryMode {
        self.delivery
    }

    async fn create_derivatives(
        &self,
        instance: &TargetResource,
    ) -> Result<Vec<TargetResource>, BuilderError> {
        self.record("create_derivatives");

        let nodes_number = instance
            .resource
            .value
            .get("nodes_number")
            .and_then(Value::as_u64)
            .ok_or_else(|| BuilderError::hook("cluster without nodes_number"))?;

        let mut derivatives = Vec::new();
        for index in 0..nodes_number {
            let value = node_value(instance, index);
            let fields: BTreeSet<String> = value.keys().cloned().collect();
            let resource = Resource::from_value(value, "node", &fields)
                .map_err(|e| BuilderError::hook(e.to_string()))?
                .with_status(status::NEW);
            derivatives.push(resource.into());
        }
        Ok(derivatives)
    }

    async fn actualize_derivatives(
        &self,
        _instance: &TargetResource,
        pairs: &[DerivativePair],
    ) -> Result<Actualization, BuilderError> {
        self.record("actualize_derivatives");
        self.delivered_pairs.lock().unwrap().push(pairs.len());

        if self.fail_actualize {
            return Err(BuilderError::hook("backend rejected the node set"));
        }
        Ok(Actualization::reaffirm(pairs))
    }

    async fn actualize_master_hash_instance(
        &self,
        _instance: &TargetResource,
        _master: &TargetResource,
        pairs: &[DerivativePair],
    ) -> Result<Actualization, BuilderError> {
        self.record("actualize_master_hash_instance");
        Ok(Actualization::reaffirm(pairs))
    }

    async fn actualize_master_full_hash_instance(
        &self,
        _instance: &TargetResource,
        _master: &TargetResource,
        pairs: &[DerivativePair],
    ) -> Result<Actualization, BuilderError> {
        self.record("actualize_master_full_hash_instance");
        Ok(Actualization::reaffirm(pairs))
    }
}

fn cluster(name: &str, nodes_number: u64) -> TargetResource {
    let uuid = Uuid::new_v4();
    let mut value = Map::new();
    value.insert("uuid".to_string(), json!(uuid.to_string()));
    value.insert("name".to_string(), json!(name));
    value.insert("nodes_number".to_string(), json!(nodes_number));
    let fields: BTreeSet<String> = value.keys().cloned().collect();
    Resource::from_value(value, "cluster", &fields)
        .unwrap()
        .with_status(status::NEW)
        .into()
}

fn reconciler_with(handler: ClusterHandler) -> DerivativeReconciler<InMemoryBuilderStore> {
    let registry = HandlerRegistry::new(vec![Arc::new(handler)]).unwrap();
    DerivativeReconciler::new(InMemoryBuilderStore::new(), registry, BuilderConfig::default())
}

#[tokio::test]
async fn test_create_expands_instance_into_nodes() {
    let reconciler = reconciler_with(ClusterHandler::new());

    let instance = reconciler.create_instance(cluster("db1", 2)).await.unwrap();

    let derivatives = reconciler
        .store()
        .list_derivatives(instance.resource.uuid)
        .await
        .unwrap();
    assert_eq!(derivatives.len(), 2);

    let names: BTreeSet<&str> = derivatives
        .iter()
        .filter_map(|d| d.resource.value.get("name").and_then(Value::as_str))
        .collect();
    assert_eq!(names, ["db1-node-0", "db1-node-1"].into());

    let uuids: BTreeSet<Uuid> = derivatives.iter().map(|d| d.resource.uuid).collect();
    assert_eq!(uuids.len(), 2);

    // Every derivative references its instance and carries its digests.
    for derivative in &derivatives {
        assert_eq!(derivative.master, Some(instance.resource.uuid));
        assert_eq!(derivative.master_hash, instance.resource.hash);
        assert_eq!(derivative.master_full_hash, instance.resource.full_hash);
    }
}

#[tokio::test]
async fn test_create_derivatives_is_idempotent() {
    let handler = ClusterHandler::new();
    let instance = cluster("db1", 3);

    let first = handler.create_derivatives(&instance).await.unwrap();
    let second = handler.create_derivatives(&instance).await.unwrap();

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.resource.uuid, b.resource.uuid);
        assert_eq!(a.resource.value, b.resource.value);
        assert_eq!(a.resource.hash, b.resource.hash);
    }
}

#[tokio::test]
async fn test_default_update_policy_is_replace_all() {
    let reconciler = reconciler_with(ClusterHandler::new());

    let instance = reconciler.create_instance(cluster("db1", 3)).await.unwrap();
    let before = reconciler
        .store()
        .list_derivatives(instance.resource.uuid)
        .await
        .unwrap();
    assert_eq!(before.len(), 3);

    // Scale down to 2: node-2 deleted, node-0 and node-1 untouched.
    let mut edited = instance.clone();
    let mut value = edited.resource.value.clone();
    value.insert("nodes_number".to_string(), json!(2));
    let fields: BTreeSet<String> = value.keys().cloned().collect();
    edited.resource = edited.resource.replace_value(value, &fields);

    reconciler.update_instance(edited.clone()).await.unwrap();

    let after = reconciler
        .store()
        .list_derivatives(instance.resource.uuid)
        .await
        .unwrap();
    assert_eq!(after.len(), 2);

    let kept: BTreeSet<Uuid> = after.iter().map(|d| d.resource.uuid).collect();
    assert!(kept.contains(&node_uuid(instance.resource.uuid, 0)));
    assert!(kept.contains(&node_uuid(instance.resource.uuid, 1)));
    assert!(!kept.contains(&node_uuid(instance.resource.uuid, 2)));

    // Matching identities kept their original rows (no rewrite).
    for derivative in &after {
        let original = before
            .iter()
            .find(|d| d.resource.uuid == derivative.resource.uuid)
            .unwrap();
        assert_eq!(original.tracked_at, derivative.tracked_at);
    }

    // Scale back up to 3: exactly the dropped identity reappears.
    reconciler.update_instance(instance.clone()).await.unwrap();
    let restored = reconciler
        .store()
        .list_derivatives(instance.resource.uuid)
        .await
        .unwrap();
    let restored_ids: BTreeSet<Uuid> = restored.iter().map(|d| d.resource.uuid).collect();
    assert!(restored_ids.contains(&node_uuid(instance.resource.uuid, 2)));
    assert_eq!(restored.len(), 3);
}

#[tokio::test]
async fn test_actualize_aggregates_instance_status() {
    let reconciler = reconciler_with(ClusterHandler::new());
    let instance = reconciler.create_instance(cluster("db1", 2)).await.unwrap();

    let derivatives = reconciler
        .store()
        .list_derivatives(instance.resource.uuid)
        .await
        .unwrap();

    // One node reported ACTIVE, the other not observed yet.
    reconciler
        .store()
        .set_actual(derivatives[0].resource.clone().with_status(status::ACTIVE));

    reconciler
        .actualize_outdated_instances("cluster")
        .await
        .unwrap();
    let refreshed = reconciler
        .store()
        .get_instance("cluster", instance.resource.uuid)
        .await
        .unwrap();
    assert_eq!(refreshed.resource.status, status::IN_PROGRESS);

    // Second node shows up ACTIVE: the instance goes ACTIVE.
    reconciler
        .store()
        .set_actual(derivatives[1].resource.clone().with_status(status::ACTIVE));

    reconciler
        .actualize_outdated_instances("cluster")
        .await
        .unwrap();
    let refreshed = reconciler
        .store()
        .get_instance("cluster", instance.resource.uuid)
        .await
        .unwrap();
    assert_eq!(refreshed.resource.status, status::ACTIVE);
}

#[tokio::test]
async fn test_delivery_mode_filters_pairs() {
    // ChangedOnly: only the unobserved node is delivered.
    let handler = ClusterHandler {
        delivery: DeliveryMode::ChangedOnly,
        ..ClusterHandler::new()
    };
    let delivered = handler.delivered_handle();
    let reconciler = reconciler_with(handler);
    let instance = reconciler.create_instance(cluster("db1", 2)).await.unwrap();

    let derivatives = reconciler
        .store()
        .list_derivatives(instance.resource.uuid)
        .await
        .unwrap();
    // The first node matches its target exactly; only the unobserved second
    // node counts as changed.
    reconciler
        .store()
        .set_actual(derivatives[0].resource.clone());

    reconciler
        .actualize_outdated_instances("cluster")
        .await
        .unwrap();
    assert_eq!(delivered.lock().unwrap().as_slice(), &[1]);

    // All-derivatives mode: both pairs arrive regardless.
    let handler = ClusterHandler {
        delivery: DeliveryMode::AllDerivatives,
        ..ClusterHandler::new()
    };
    let delivered = handler.delivered_handle();
    let all_reconciler = reconciler_with(handler);
    let instance = all_reconciler
        .create_instance(cluster("db2", 2))
        .await
        .unwrap();
    let derivatives = all_reconciler
        .store()
        .list_derivatives(instance.resource.uuid)
        .await
        .unwrap();
    all_reconciler
        .store()
        .set_actual(derivatives[0].resource.clone().with_status(status::ACTIVE));

    all_reconciler
        .actualize_outdated_instances("cluster")
        .await
        .unwrap();
    assert_eq!(delivered.lock().unwrap().as_slice(), &[2]);
}

#[tokio::test]
async fn test_failed_hook_leaves_status_untouched() {
    let handler = ClusterHandler {
        fail_actualize: true,
        ..ClusterHandler::new()
    };
    let reconciler = reconciler_with(handler);

    let instance = reconciler.create_instance(cluster("db1", 1)).await.unwrap();
    reconciler
        .store()
        .set_instance_status("cluster", instance.resource.uuid, status::ACTIVE)
        .await
        .unwrap();

    // The lone derivative is unobserved, so the hook fires — and fails.
    let stats = reconciler
        .actualize_outdated_instances("cluster")
        .await
        .unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.actualized, 0);

    let refreshed = reconciler
        .store()
        .get_instance("cluster", instance.resource.uuid)
        .await
        .unwrap();
    assert_eq!(refreshed.resource.status, status::ACTIVE);
}

#[tokio::test]
async fn test_master_full_hash_drift_fires_only_full_variant() {
    let reconciler = reconciler_with(ClusterHandler::new());

    let master = reconciler.create_instance(cluster("db1", 1)).await.unwrap();

    // A dependent cluster tracking the master, digests in sync.
    let mut dependent = cluster("db1-replica", 1);
    dependent = dependent.with_master(&master.resource);
    let dependent = reconciler.create_instance(dependent).await.unwrap();

    // Change a non-target field on the master: full hash drifts, target
    // hash does not.
    let mut refreshed_master = master.clone();
    let mut value = refreshed_master.resource.value.clone();
    value.insert("note".to_string(), json!("observed annotation"));
    let target_fields: BTreeSet<String> = master.resource.value.keys().cloned().collect();
    refreshed_master.resource = refreshed_master.resource.replace_value(value, &target_fields);
    assert_eq!(refreshed_master.resource.hash, master.resource.hash);
    assert_ne!(refreshed_master.resource.full_hash, master.resource.full_hash);
    reconciler
        .store()
        .save_instance(&refreshed_master)
        .await
        .unwrap();

    let hash_outdated = reconciler
        .track_outdated_master_hash_instances(&refreshed_master)
        .await
        .unwrap();
    assert!(hash_outdated.is_empty());

    let full_outdated = reconciler
        .track_outdated_master_full_hash_instances(&refreshed_master)
        .await
        .unwrap();
    assert_eq!(full_outdated.len(), 1);
    assert_eq!(full_outdated[0].resource.uuid, dependent.resource.uuid);

    reconciler
        .actualize_outdated_master_full_hash_instance(&refreshed_master, &full_outdated[0])
        .await
        .unwrap();

    // The stored digest caught up: the check is idempotent.
    let again = reconciler
        .track_outdated_master_full_hash_instances(&refreshed_master)
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_master_hash_drift_refreshes_both_digests() {
    let reconciler = reconciler_with(ClusterHandler::new());

    let master = reconciler.create_instance(cluster("db1", 1)).await.unwrap();
    let dependent = cluster("db1-replica", 1).with_master(&master.resource);
    let dependent = reconciler.create_instance(dependent).await.unwrap();

    // Change a target field: both digests drift.
    let mut refreshed_master = master.clone();
    let mut value = refreshed_master.resource.value.clone();
    value.insert("nodes_number".to_string(), json!(2));
    let fields: BTreeSet<String> = value.keys().cloned().collect();
    refreshed_master.resource = refreshed_master.resource.replace_value(value, &fields);
    reconciler
        .store()
        .save_instance(&refreshed_master)
        .await
        .unwrap();

    let outdated = reconciler
        .track_outdated_master_hash_instances(&refreshed_master)
        .await
        .unwrap();
    assert_eq!(outdated.len(), 1);

    reconciler
        .actualize_outdated_master_hash_instance(&refreshed_master, &outdated[0])
        .await
        .unwrap();

    // The target-hash pass also refreshed the full digest, so the full-hash
    // pass has nothing left to do for this dependent.
    let refreshed = reconciler
        .store()
        .get_instance("cluster", dependent.resource.uuid)
        .await
        .unwrap();
    assert_eq!(refreshed.master_hash, refreshed_master.resource.hash);
    assert_eq!(
        refreshed.master_full_hash,
        refreshed_master.resource.full_hash
    );
    assert!(reconciler
        .track_outdated_master_full_hash_instances(&refreshed_master)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_tick_runs_master_propagation_before_dataplane() {
    let handler = ClusterHandler::new();
    let fired = handler.fired_handle();
    let reconciler = reconciler_with(handler);

    let master = reconciler.create_instance(cluster("db1", 1)).await.unwrap();
    let dependent = cluster("db1-replica", 1).with_master(&master.resource);
    reconciler.create_instance(dependent).await.unwrap();

    // Drift the master's target fields; derivatives are also unobserved, so
    // both trigger paths are pending at once.
    let mut refreshed_master = master.clone();
    let mut value = refreshed_master.resource.value.clone();
    value.insert("nodes_number".to_string(), json!(2));
    let fields: BTreeSet<String> = value.keys().cloned().collect();
    refreshed_master.resource = refreshed_master.resource.replace_value(value, &fields);
    reconciler
        .store()
        .save_instance(&refreshed_master)
        .await
        .unwrap();

    reconciler.tick().await;

    // Hook order within the tick: master-driven before data-plane-driven.
    let fired = fired.lock().unwrap().clone();
    let master_idx = fired
        .iter()
        .position(|h| h == "actualize_master_hash_instance");
    let dataplane_idx = fired.iter().position(|h| h == "actualize_derivatives");
    assert!(master_idx.is_some());
    assert!(dataplane_idx.is_some());
    assert!(master_idx < dataplane_idx);
}

#[tokio::test]
async fn test_delete_tears_down_derivatives_first() {
    let reconciler = reconciler_with(ClusterHandler::new());
    let instance = reconciler.create_instance(cluster("db1", 2)).await.unwrap();

    reconciler
        .delete_instance("cluster", instance.resource.uuid)
        .await
        .unwrap();

    assert!(reconciler
        .store()
        .list_derivatives(instance.resource.uuid)
        .await
        .unwrap()
        .is_empty());
    assert!(matches!(
        reconciler
            .store()
            .get_instance("cluster", instance.resource.uuid)
            .await,
        Err(BuilderError::InstanceNotFound { .. })
    ));
}
