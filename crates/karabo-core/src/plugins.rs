//! # Plugin Manifests
//!
//! A plugin directory holds one JSON manifest per installed device class:
//!
//! ```json
//! { "classId": "PropertyTest", "version": "2.1.0", "entry": "property-test" }
//! ```
//!
//! `entry` names a device class factory compiled into the server (see
//! [`DeviceRegistry::register_factory`]). Loading a manifest instantiates
//! that class and registers it.

use std::path::{Path, PathBuf};

use karabo_data::{KaraboError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::registry::DeviceRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub class_id: String,
    pub version: String,
    pub entry: String,
}

impl PluginManifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| KaraboError::Plugin(format!("{}: {e}", path.display())))
    }
}

/// Manifests of `dir`, in file-name order. A missing directory has none.
pub fn scan(dir: &Path) -> Result<Vec<PluginManifest>> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "Plugin directory does not exist");
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files.iter().map(|path| PluginManifest::from_file(path)).collect()
}

/// Scan `dir` and register every class it names. Returns their ids.
pub fn load(registry: &DeviceRegistry, dir: &Path) -> Result<Vec<String>> {
    let mut loaded = Vec::new();
    for manifest in scan(dir)? {
        let class = registry.load_entry(&manifest.entry)?;
        if class.class_id() != manifest.class_id {
            return Err(KaraboError::Plugin(format!(
                "entry '{}' provides {}, manifest declares {}",
                manifest.entry,
                class.class_id(),
                manifest.class_id
            )));
        }
        info!(class_id = %manifest.class_id, version = %manifest.version, "Plugin loaded");
        registry.register(class);
        loaded.push(manifest.class_id);
    }
    Ok(loaded)
}
