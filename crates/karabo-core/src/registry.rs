//! Device classes known to a process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use karabo_data::{KaraboError, Result, Schema};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::device::{class_schema, DeviceClass};

/// Builds a compiled-in device class; plugin manifests name one by its
/// entry.
pub type ClassFactory = fn() -> Arc<dyn DeviceClass>;

/// Class id to class, plus the factories plugin manifests may refer to.
#[derive(Default)]
pub struct DeviceRegistry {
    classes: RwLock<BTreeMap<String, Arc<dyn DeviceClass>>>,
    factories: RwLock<HashMap<String, ClassFactory>>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("classes", &self.class_ids())
            .field("factories", &self.factories.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a class. A class with the same id is replaced.
    pub fn register(&self, class: Arc<dyn DeviceClass>) {
        let id = class.class_id().to_string();
        if self.classes.write().insert(id.clone(), class).is_some() {
            warn!(class_id = %id, "Device class registered twice, keeping the latest");
        } else {
            debug!(class_id = %id, "Device class registered");
        }
    }

    /// Make `factory` loadable under `entry`.
    pub fn register_factory(&self, entry: &str, factory: ClassFactory) {
        self.factories.write().insert(entry.to_string(), factory);
    }

    /// Instantiate the class behind `entry`.
    pub fn load_entry(&self, entry: &str) -> Result<Arc<dyn DeviceClass>> {
        let factory = self
            .factories
            .read()
            .get(entry)
            .copied()
            .ok_or_else(|| KaraboError::Plugin(format!("no device class entry '{entry}'")))?;
        Ok(factory())
    }

    #[must_use]
    pub fn get(&self, class_id: &str) -> Option<Arc<dyn DeviceClass>> {
        self.classes.read().get(class_id).cloned()
    }

    #[must_use]
    pub fn contains(&self, class_id: &str) -> bool {
        self.classes.read().contains_key(class_id)
    }

    /// Registered class ids, sorted.
    #[must_use]
    pub fn class_ids(&self) -> Vec<String> {
        self.classes.read().keys().cloned().collect()
    }

    /// Forget every class not in `class_ids`.
    pub fn retain(&self, class_ids: &[String]) {
        self.classes
            .write()
            .retain(|id, _| class_ids.iter().any(|keep| keep == id));
    }

    /// Full static schema of `class_id`.
    pub fn class_schema(&self, class_id: &str) -> Result<Schema> {
        let class = self
            .get(class_id)
            .ok_or_else(|| KaraboError::NotFound(format!("device class {class_id}")))?;
        class_schema(class.as_ref())
    }
}
