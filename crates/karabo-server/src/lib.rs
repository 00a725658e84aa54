//! # Karabo Server
//!
//! Pieces shared by the `karabo-server` and `karabo-broker` executables:
//! subscriber setup and the device classes compiled into the server.


use std::sync::Arc;

use karabo_core::DeviceRegistry;
use tracing_subscriber::EnvFilter;

/// Registry holding every compiled-in class, each also loadable by its
/// plugin entry.
#[must_use]
pub fn builtin_registry() -> Arc<DeviceRegistry> {
    let registry = DeviceRegistry::new();
    registry.register_factory(property_test::ENTRY, property_test::factory);
    registry.register(property_test::factory());
    Arc::new(registry)
}

/// Filter directive for a `Logger.priority` value.
#[must_use]
pub fn filter_directive(priority: &str) -> &'static str {
    match priority.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
}

/// Install the fmt subscriber. `RUST_LOG` wins over `priority`.
pub fn init_logging(priority: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(priority)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing the log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive("DEBUG"), "debug");
        assert_eq!(filter_directive("warn"), "warn");
        assert_eq!(filter_directive("ERROR"), "error");
        assert_eq!(filter_directive("INFO"), "info");
        assert_eq!(filter_directive("anything"), "info");
    }

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry();
        assert!(registry.contains(property_test::CLASS_ID));
        let class = registry.load_entry(property_test::ENTRY).unwrap();
        assert_eq!(class.class_id(), property_test::CLASS_ID);
    }
}
