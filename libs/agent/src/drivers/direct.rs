//! Direct driver: fetches all state straight from the backend.
//!
//! The backend is authoritative for values; the driver persists only the
//! target-field set per resource so observed values hash against the same
//! fields the target was authored with.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use cplane_model::{Resource, status};

use crate::driver::CapabilityDriver;
use crate::error::{BackendError, DriverError};
use crate::storage::{TargetFieldItem, TargetFieldsStorage};

/// A client against the live data plane.
///
/// Values travel as plain JSON maps; the driver turns them into resources
/// using the stored target-field sets.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn get(&self, resource: &Resource) -> Result<Map<String, Value>, BackendError>;

    async fn list(&self, kind: &str) -> Result<Vec<Map<String, Value>>, BackendError>;

    async fn create(&self, resource: &Resource) -> Result<Map<String, Value>, BackendError>;

    async fn update(&self, resource: &Resource) -> Result<Map<String, Value>, BackendError>;

    async fn delete(&self, resource: &Resource) -> Result<(), BackendError>;
}

/// Post-processing applied to backend views before hashing.
///
/// The first shipped transformation drops null attributes, either across the
/// whole view or for a listed attribute set. Backends that echo unset
/// attributes as explicit nulls would otherwise never hash-converge with
/// targets that simply omit them.
#[derive(Debug, Clone, Default)]
pub struct ResourceTransformer {
    pub ignore_null_attributes: bool,
    pub attributes: Option<BTreeSet<String>>,
}

impl ResourceTransformer {
    pub fn transform(&self, view: Map<String, Value>) -> Map<String, Value> {
        if !self.ignore_null_attributes {
            return view;
        }

        match &self.attributes {
            // If attributes are not specified, ignore all null attributes
            None => view.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            // Otherwise ignore only null attributes from the list
            Some(attributes) => view
                .into_iter()
                .filter(|(k, v)| !(v.is_null() && attributes.contains(k)))
                .collect(),
        }
    }

    /// Parse a transformer from a configuration map.
    ///
    /// Accepts native types or their string forms
    /// (`"true"`, `"name, body"`), matching how driver options arrive from
    /// config files.
    pub fn from_map(data: &Map<String, Value>) -> Self {
        let ignore_null_attributes = match data.get("ignore_null_attributes") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };

        let attributes = match data.get("attributes") {
            Some(Value::String(s)) => Some(s.split(',').map(|a| a.trim().to_string()).collect()),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        };

        Self {
            ignore_null_attributes,
            attributes,
        }
    }
}

/// Direct driver over a backend client and a target-fields storage.
pub struct DirectDriver<C, S> {
    client: C,
    storage: S,
    capabilities: BTreeSet<String>,
    transformers: BTreeMap<String, ResourceTransformer>,
}

impl<C, S> DirectDriver<C, S>
where
    C: BackendClient,
    S: TargetFieldsStorage,
{
    pub fn new(
        client: C,
        storage: S,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            client,
            storage,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            transformers: BTreeMap::new(),
        }
    }

    pub fn with_transformer(mut self, kind: impl Into<String>, t: ResourceTransformer) -> Self {
        self.transformers.insert(kind.into(), t);
        self
    }

    fn validate(&self, kind: &str) -> Result<(), DriverError> {
        if self.capabilities.contains(kind) {
            Ok(())
        } else {
            Err(DriverError::UnsupportedKind(kind.to_string()))
        }
    }

    fn transform(&self, kind: &str, view: Map<String, Value>) -> Map<String, Value> {
        match self.transformers.get(kind) {
            Some(t) => t.transform(view),
            None => view,
        }
    }

    /// Target fields are the keys of the authored value; stored so later
    /// observations hash with the same set even after the live object grows
    /// extra backend-managed fields.
    fn fields_of(resource: &Resource) -> BTreeSet<String> {
        resource.value.keys().cloned().collect()
    }

    fn realized(
        &self,
        origin: &Resource,
        view: Map<String, Value>,
        fields: &BTreeSet<String>,
    ) -> Resource {
        let view = self.transform(&origin.kind, view);
        origin.replace_value(view, fields).with_status(status::ACTIVE)
    }
}

#[async_trait]
impl<C, S> CapabilityDriver for DirectDriver<C, S>
where
    C: BackendClient,
    S: TargetFieldsStorage,
{
    fn get_capabilities(&self) -> BTreeSet<String> {
        self.capabilities.clone()
    }

    async fn start(&self) -> Result<(), DriverError> {
        Ok(self.storage.load()?)
    }

    async fn list(&self, capability: &str) -> Result<Vec<Resource>, DriverError> {
        self.validate(capability)?;

        let storage_items: BTreeMap<Uuid, TargetFieldItem> = self
            .storage
            .list(capability)?
            .into_iter()
            .map(|item| (item.uuid, item))
            .collect();

        let views = self
            .client
            .list(capability)
            .await
            .map_err(|e| match e {
                BackendError::Transient(msg) => DriverError::Transient(msg),
                other => DriverError::Transient(other.to_string()),
            })?;

        // An object is reported only when both sides know it: a view without
        // a storage item cannot be hashed correctly, a storage item without
        // a view is gone from the data plane.
        let mut resources = Vec::new();
        for view in views {
            let uuid = match view.get("uuid").and_then(Value::as_str) {
                Some(raw) => match raw.parse::<Uuid>() {
                    Ok(uuid) => uuid,
                    Err(_) => {
                        warn!(kind = capability, uuid = raw, "Malformed uuid in backend view");
                        continue;
                    }
                },
                None => {
                    warn!(kind = capability, "Backend view without uuid");
                    continue;
                }
            };

            let Some(item) = storage_items.get(&uuid) else {
                warn!(kind = capability, %uuid, "Missing storage item for backend object");
                continue;
            };

            let view = self.transform(capability, view);
            resources.push(Resource::from_value(view, capability, &item.fields)?);
        }

        Ok(resources)
    }

    async fn get(&self, resource: &Resource) -> Result<Resource, DriverError> {
        self.validate(&resource.kind)?;

        let item = self
            .storage
            .get(&resource.kind, resource.uuid)
            .map_err(|_| DriverError::not_found(resource))?;
        let view = self
            .client
            .get(resource)
            .await
            .map_err(|e| e.into_driver_error(resource))?;

        Ok(self.realized(resource, view, &item.fields))
    }

    async fn create(&self, resource: &Resource) -> Result<Resource, DriverError> {
        self.validate(&resource.kind)?;

        let fields = Self::fields_of(resource);
        let item = TargetFieldItem::new(resource.kind.clone(), resource.uuid, fields.clone());

        // Storage first: if the backend call fails the item already exists
        // and the resource is simply created on the next iteration.
        self.storage.create(&item, true)?;

        let view = self
            .client
            .create(resource)
            .await
            .map_err(|e| e.into_driver_error(resource))?;
        debug!(kind = %resource.kind, uuid = %resource.uuid, "Created resource");

        Ok(self.realized(resource, view, &fields))
    }

    async fn update(&self, resource: &Resource) -> Result<Resource, DriverError> {
        self.validate(&resource.kind)?;

        let fields = Self::fields_of(resource);
        let item = TargetFieldItem::new(resource.kind.clone(), resource.uuid, fields.clone());

        let view = self
            .client
            .update(resource)
            .await
            .map_err(|e| e.into_driver_error(resource))?;

        // The target-field set is refreshed only after a successful update;
        // a failed one keeps hashing against the old set.
        self.storage.update(&item)?;
        debug!(kind = %resource.kind, uuid = %resource.uuid, "Updated resource");

        Ok(self.realized(resource, view, &fields))
    }

    async fn delete(&self, resource: &Resource) -> Result<(), DriverError> {
        self.validate(&resource.kind)?;

        match self.client.delete(resource).await {
            Ok(()) => debug!(kind = %resource.kind, uuid = %resource.uuid, "Deleted resource"),
            Err(BackendError::NotFound) => {
                warn!(kind = %resource.kind, uuid = %resource.uuid, "Resource already deleted");
            }
            Err(e) => return Err(e.into_driver_error(resource)),
        }

        self.storage.delete(&resource.kind, resource.uuid)?;
        Ok(())
    }

    async fn finalize(&self) -> Result<(), DriverError> {
        Ok(self.storage.persist()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use serde_json::json;

    use crate::storage::InMemoryTargetFieldsStorage;

    /// Backend over a plain map, shared so tests can inspect it.
    #[derive(Default)]
    struct FakeBackend {
        objects: Mutex<BTreeMap<Uuid, Map<String, Value>>>,
    }

    impl FakeBackend {
        fn insert(&self, view: Map<String, Value>) {
            let uuid: Uuid = view["uuid"].as_str().unwrap().parse().unwrap();
            self.objects.lock().unwrap().insert(uuid, view);
        }
    }

    #[async_trait]
    impl BackendClient for &FakeBackend {
        async fn get(&self, resource: &Resource) -> Result<Map<String, Value>, BackendError> {
            self.objects
                .lock()
                .unwrap()
                .get(&resource.uuid)
                .cloned()
                .ok_or(BackendError::NotFound)
        }

        async fn list(&self, _kind: &str) -> Result<Vec<Map<String, Value>>, BackendError> {
            Ok(self.objects.lock().unwrap().values().cloned().collect())
        }

        async fn create(&self, resource: &Resource) -> Result<Map<String, Value>, BackendError> {
            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(&resource.uuid) {
                return Err(BackendError::AlreadyExists);
            }
            let mut view = resource.value.clone();
            view.insert("uuid".to_string(), json!(resource.uuid.to_string()));
            objects.insert(resource.uuid, view.clone());
            Ok(view)
        }

        async fn update(&self, resource: &Resource) -> Result<Map<String, Value>, BackendError> {
            let mut objects = self.objects.lock().unwrap();
            if !objects.contains_key(&resource.uuid) {
                return Err(BackendError::NotFound);
            }
            objects.insert(resource.uuid, resource.value.clone());
            Ok(resource.value.clone())
        }

        async fn delete(&self, resource: &Resource) -> Result<(), BackendError> {
            match self.objects.lock().unwrap().remove(&resource.uuid) {
                Some(_) => Ok(()),
                None => Err(BackendError::NotFound),
            }
        }
    }

    fn target(kind: &str, name: &str) -> Resource {
        let uuid = Uuid::new_v4();
        let mut value = Map::new();
        value.insert("uuid".to_string(), json!(uuid.to_string()));
        value.insert("name".to_string(), json!(name));
        let fields: BTreeSet<String> = ["name".to_string(), "uuid".to_string()].into();
        Resource::from_value(value, kind, &fields).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_list_roundtrip() {
        let backend = FakeBackend::default();
        let driver = DirectDriver::new(&backend, InMemoryTargetFieldsStorage::new(), ["config"]);

        let resource = target("config", "foo");
        let created = driver.create(&resource).await.unwrap();
        assert_eq!(created.uuid, resource.uuid);
        assert_eq!(created.hash, resource.hash);

        let listed = driver.list("config").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].hash, resource.hash);
    }

    #[tokio::test]
    async fn test_list_skips_objects_without_storage_item() {
        let backend = FakeBackend::default();
        let mut foreign = Map::new();
        foreign.insert("uuid".to_string(), json!(Uuid::new_v4().to_string()));
        foreign.insert("name".to_string(), json!("not-ours"));
        backend.insert(foreign);

        let driver = DirectDriver::new(&backend, InMemoryTargetFieldsStorage::new(), ["config"]);
        assert!(driver.list("config").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storage_item_survives_failed_create() {
        let backend = FakeBackend::default();
        let storage = InMemoryTargetFieldsStorage::new();
        let resource = target("config", "foo");

        // Seed the backend so create collides.
        let mut view = resource.value.clone();
        view.insert("uuid".to_string(), json!(resource.uuid.to_string()));
        backend.insert(view);

        let driver = DirectDriver::new(&backend, storage, ["config"]);
        let err = driver.create(&resource).await.unwrap_err();
        assert!(matches!(err, DriverError::AlreadyExists { .. }));

        // The storage item was written before the backend call, so the next
        // list already pairs the live object.
        let listed = driver.list("config").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_object() {
        let backend = FakeBackend::default();
        let driver = DirectDriver::new(&backend, InMemoryTargetFieldsStorage::new(), ["config"]);

        driver.delete(&target("config", "gone")).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_kind_rejected() {
        let backend = FakeBackend::default();
        let driver = DirectDriver::new(&backend, InMemoryTargetFieldsStorage::new(), ["config"]);

        let err = driver.create(&target("node", "x")).await.unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedKind(_)));
    }

    #[test]
    fn test_transformer_drops_nulls() {
        let t = ResourceTransformer {
            ignore_null_attributes: true,
            attributes: None,
        };
        let mut view = Map::new();
        view.insert("name".to_string(), json!("foo"));
        view.insert("note".to_string(), Value::Null);

        let out = t.transform(view);
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("name"));
    }

    #[test]
    fn test_transformer_attribute_list() {
        let t = ResourceTransformer {
            ignore_null_attributes: true,
            attributes: Some(["note".to_string()].into()),
        };
        let mut view = Map::new();
        view.insert("name".to_string(), Value::Null);
        view.insert("note".to_string(), Value::Null);

        let out = t.transform(view);
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("name"));
    }

    #[test]
    fn test_transformer_from_map_string_forms() {
        let mut data = Map::new();
        data.insert("ignore_null_attributes".to_string(), json!("True"));
        data.insert("attributes".to_string(), json!("name, note"));

        let t = ResourceTransformer::from_map(&data);
        assert!(t.ignore_null_attributes);
        assert_eq!(
            t.attributes,
            Some(["name".to_string(), "note".to_string()].into())
        );
    }
}
