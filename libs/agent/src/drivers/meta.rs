//! Meta driver: models partly described by a shared meta file.
//!
//! Some data planes cannot answer "which objects are mine" — configuration
//! files are the classic case, one among thousands of look-alikes. The meta
//! file records the identifying part per object (uuid, path, target fields);
//! everything else is restored from the data plane itself.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};
use uuid::Uuid;

use cplane_model::Resource;

use crate::driver::CapabilityDriver;
use crate::error::{DriverError, StorageError};

/// A data-plane model managed through the meta file.
#[async_trait]
pub trait MetaModel: Send + Sync {
    fn uuid(&self) -> Uuid;

    /// The model's full view: every field, including ones restored from the
    /// data plane. Must contain `uuid`.
    fn view(&self) -> Map<String, Value>;

    /// Fields belonging to the orchestrator-managed surface.
    fn target_fields(&self) -> BTreeSet<String>;

    /// Fields persisted in the meta file alongside `uuid`.
    ///
    /// Meta fields are the ones that cannot be fetched back from the data
    /// plane. `None` means the whole view is persisted.
    fn meta_model_fields(&self) -> Option<BTreeSet<String>>;

    /// Materialize on the data plane. Fails with AlreadyExists when the
    /// object is already present.
    async fn dump_to_dp(&self) -> Result<(), DriverError>;

    /// Validate presence and restore data-plane-held fields. Fails with
    /// NotFound when the object is gone.
    async fn restore_from_dp(&mut self) -> Result<(), DriverError>;

    /// Remove from the data plane.
    async fn delete_from_dp(&self) -> Result<(), DriverError>;

    /// Update in place. The default recreates: delete, then dump.
    async fn update_on_dp(&self) -> Result<(), DriverError> {
        self.delete_from_dp().await?;
        self.dump_to_dp().await
    }
}

/// Factory rebuilding models from meta views and target resources.
pub trait MetaModelFactory: Send + Sync {
    /// Restore a model from its persisted meta view.
    fn from_view(&self, view: &Map<String, Value>) -> Result<Box<dyn MetaModel>, DriverError>;

    /// Build a model from an authored target resource. Target fields are the
    /// keys of the resource value.
    fn from_resource(&self, resource: &Resource) -> Result<Box<dyn MetaModel>, DriverError>;
}

/// Read the persisted target-field set out of a meta view.
pub fn target_fields_from_view(view: &Map<String, Value>) -> BTreeSet<String> {
    view.get("target_fields")
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Whole-file JSON storage for meta views.
///
/// Layout: `{ "<kind>": { "resources": { "<uuid>": view } } }`.
pub struct JsonMetaStorage {
    path: PathBuf,
    data: Mutex<Map<String, Value>>,
}

impl JsonMetaStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            data: Mutex::new(Map::new()),
        }
    }

    pub fn load(&self) -> Result<(), StorageError> {
        let mut data = self.data.lock().expect("meta storage mutex poisoned");
        *data = match std::fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(())
    }

    pub fn persist(&self) -> Result<(), StorageError> {
        let data = self.data.lock().expect("meta storage mutex poisoned");
        let raw = serde_json::to_vec_pretty(&Value::Object(data.clone()))?;

        // Write-then-rename so a crash mid-write never truncates the file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// All views of a kind.
    pub fn views(&self, kind: &str) -> Vec<Map<String, Value>> {
        let data = self.data.lock().expect("meta storage mutex poisoned");
        data.get(kind)
            .and_then(|k| k.get("resources"))
            .and_then(Value::as_object)
            .map(|resources| {
                resources
                    .values()
                    .filter_map(Value::as_object)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn insert(&self, kind: &str, uuid: Uuid, view: Map<String, Value>) {
        let mut data = self.data.lock().expect("meta storage mutex poisoned");
        let resources = data
            .entry(kind.to_string())
            .or_insert_with(|| json!({ "resources": {} }))
            .as_object_mut()
            .expect("kind entry is an object")
            .entry("resources".to_string())
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .expect("resources entry is an object");
        resources.insert(uuid.to_string(), Value::Object(view));
    }

    pub fn remove(&self, kind: &str, uuid: Uuid) -> bool {
        let mut data = self.data.lock().expect("meta storage mutex poisoned");
        data.get_mut(kind)
            .and_then(|k| k.get_mut("resources"))
            .and_then(Value::as_object_mut)
            .and_then(|resources| resources.remove(&uuid.to_string()))
            .is_some()
    }
}

/// Meta driver over a factory map and a shared meta file.
pub struct MetaDriver {
    factories: BTreeMap<String, Box<dyn MetaModelFactory>>,
    storage: JsonMetaStorage,
}

impl MetaDriver {
    pub fn new<P: AsRef<Path>>(meta_file: P) -> Self {
        Self {
            factories: BTreeMap::new(),
            storage: JsonMetaStorage::new(meta_file),
        }
    }

    pub fn with_model(
        mut self,
        kind: impl Into<String>,
        factory: Box<dyn MetaModelFactory>,
    ) -> Self {
        self.factories.insert(kind.into(), factory);
        self
    }

    fn factory(&self, kind: &str) -> Result<&dyn MetaModelFactory, DriverError> {
        self.factories
            .get(kind)
            .map(Box::as_ref)
            .ok_or_else(|| DriverError::UnsupportedKind(kind.to_string()))
    }

    fn model_to_resource(
        &self,
        kind: &str,
        model: &dyn MetaModel,
    ) -> Result<Resource, DriverError> {
        let mut view = model.view();
        view.insert("uuid".to_string(), json!(model.uuid().to_string()));
        view.remove("target_fields");
        Ok(Resource::from_value(view, kind, &model.target_fields())?)
    }

    /// Persist the model's meta part: the declared meta fields plus `uuid`
    /// and `target_fields`.
    fn save_meta(&self, kind: &str, model: &dyn MetaModel) {
        let mut view = model.view();
        view.insert("uuid".to_string(), json!(model.uuid().to_string()));

        if let Some(meta_fields) = model.meta_model_fields() {
            view.retain(|k, _| k == "uuid" || meta_fields.contains(k));
        }
        view.insert(
            "target_fields".to_string(),
            json!(model.target_fields().iter().collect::<Vec<_>>()),
        );

        debug!(kind, uuid = %model.uuid(), "Saved meta resource");
        self.storage.insert(kind, model.uuid(), view);
    }

    fn find_view(&self, kind: &str, uuid: Uuid) -> Option<Map<String, Value>> {
        self.storage
            .views(kind)
            .into_iter()
            .find(|view| view.get("uuid").and_then(Value::as_str) == Some(&uuid.to_string()))
    }
}

#[async_trait]
impl CapabilityDriver for MetaDriver {
    fn get_capabilities(&self) -> BTreeSet<String> {
        self.factories.keys().cloned().collect()
    }

    async fn start(&self) -> Result<(), DriverError> {
        Ok(self.storage.load()?)
    }

    async fn list(&self, capability: &str) -> Result<Vec<Resource>, DriverError> {
        let factory = self.factory(capability)?;

        let mut resources = Vec::new();
        for view in self.storage.views(capability) {
            let mut model = factory.from_view(&view)?;
            match model.restore_from_dp().await {
                Ok(()) => resources.push(self.model_to_resource(capability, model.as_ref())?),
                Err(DriverError::NotFound { .. }) => {
                    error!(
                        kind = capability,
                        uuid = ?view.get("uuid"),
                        "Resource not found on the data plane"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(resources)
    }

    async fn get(&self, resource: &Resource) -> Result<Resource, DriverError> {
        let factory = self.factory(&resource.kind)?;

        let view = self
            .find_view(&resource.kind, resource.uuid)
            .ok_or_else(|| DriverError::not_found(resource))?;

        let mut model = factory.from_view(&view)?;
        model.restore_from_dp().await?;
        self.model_to_resource(&resource.kind, model.as_ref())
    }

    async fn create(&self, resource: &Resource) -> Result<Resource, DriverError> {
        let factory = self.factory(&resource.kind)?;

        match self.get(resource).await {
            Err(DriverError::NotFound { .. }) => {}
            Ok(_) => return Err(DriverError::already_exists(resource)),
            Err(e) => return Err(e),
        }

        let model = factory.from_resource(resource)?;
        model.dump_to_dp().await?;
        self.save_meta(&resource.kind, model.as_ref());

        debug!(kind = %resource.kind, uuid = %resource.uuid, "Created resource");
        self.model_to_resource(&resource.kind, model.as_ref())
    }

    async fn update(&self, resource: &Resource) -> Result<Resource, DriverError> {
        let factory = self.factory(&resource.kind)?;

        if self.find_view(&resource.kind, resource.uuid).is_none() {
            return Err(DriverError::not_found(resource));
        }

        let model = factory.from_resource(resource)?;
        model.update_on_dp().await?;

        // Simplest meta update: drop and re-add.
        self.storage.remove(&resource.kind, resource.uuid);
        self.save_meta(&resource.kind, model.as_ref());

        debug!(kind = %resource.kind, uuid = %resource.uuid, "Updated resource");
        self.model_to_resource(&resource.kind, model.as_ref())
    }

    async fn delete(&self, resource: &Resource) -> Result<(), DriverError> {
        let factory = self.factory(&resource.kind)?;

        let model = factory.from_resource(resource)?;
        match model.delete_from_dp().await {
            Ok(()) => {}
            Err(DriverError::NotFound { .. }) => {
                warn!(kind = %resource.kind, uuid = %resource.uuid, "Resource already deleted");
            }
            Err(e) => return Err(e),
        }

        self.storage.remove(&resource.kind, resource.uuid);
        debug!(kind = %resource.kind, uuid = %resource.uuid, "Deleted resource");
        Ok(())
    }

    async fn finalize(&self) -> Result<(), DriverError> {
        Ok(self.storage.persist()?)
    }
}
