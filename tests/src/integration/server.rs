//! # Device Server over the Broker
//!
//! A server with the built-in classes, driven entirely through its slots
//! the way a GUI or CLI client would.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use karabo_bus::{Broker, BrokerHub, SignalSlotable, TcpBroker};
    use karabo_core::{DeviceRegistry, DeviceServer, ServerConfig};
    use karabo_data::{AccessLevel, Hash, KaraboError, Schema, State};
    use karabo_server::{builtin_registry, property_test};

    use crate::integration::support::{eventually, quick, WAIT};

    const TOPIC: &str = "server";

    async fn connect(hub: &BrokerHub) -> Arc<dyn Broker> {
        Arc::new(
            TcpBroker::connect(&[hub.local_addr().to_string()], TOPIC)
                .await
                .unwrap(),
        )
    }

    async fn server(hub: &BrokerHub, config: ServerConfig, registry: Arc<DeviceRegistry>) -> DeviceServer {
        let server = DeviceServer::with_bus_config(config, registry, connect(hub).await, quick());
        server.start().await.unwrap();
        server
    }

    async fn client(hub: &BrokerHub) -> SignalSlotable {
        let client = SignalSlotable::new("gui", connect(hub).await, quick());
        client.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        client
    }

    fn config(args: &[&str]) -> ServerConfig {
        let mut all = vec!["serverId=srv", "scanPlugins=false"];
        all.extend_from_slice(args);
        ServerConfig::from_args(all).unwrap()
    }

    #[tokio::test]
    async fn test_device_lifecycle_through_server_slots() {
        let hub = BrokerHub::bind("127.0.0.1:0").await.unwrap();
        let server = server(&hub, config(&[]), builtin_registry()).await;
        let gui = client(&hub).await;

        let (ok, id) = gui
            .request(
                "srv",
                "slotStartDevice",
                (
                    property_test::CLASS_ID.to_string(),
                    "pt1".to_string(),
                    Hash::new().with("int32Property", 7i32),
                ),
            )
            .receive::<(bool, String)>()
            .await
            .unwrap();
        assert!(ok, "{id}");
        assert_eq!(server.device_ids(), vec!["pt1"]);
        let watcher = &gui;
        assert!(eventually(move || async move { watcher.topology().contains("pt1") }).await);
        assert_eq!(
            gui.topology().info("pt1").unwrap().get::<String>("serverId").unwrap(),
            "srv"
        );

        let (configuration, _) = gui
            .request("pt1", "slotGetConfiguration", ())
            .receive::<(Hash, String)>()
            .await
            .unwrap();
        assert_eq!(configuration.get::<i32>("int32Property").unwrap(), 7);
        assert_eq!(configuration.get::<String>("state").unwrap(), State::Normal.name());

        gui.request("pt1", "startWritingOutput", ())
            .receive_hash()
            .await
            .unwrap();
        let (schema, _) = gui
            .request("pt1", "slotGetSchema", (true,))
            .receive::<(Schema, String)>()
            .await
            .unwrap();
        assert!(schema.has("stopWritingOutput"));
        assert!(!schema.has("startWritingOutput"));

        gui.request("srv", "slotKillDevice", ("pt1".to_string(),))
            .receive_hash()
            .await
            .unwrap();
        assert!(eventually(move || async move { !watcher.topology().contains("pt1") }).await);
        assert!(server.device_ids().is_empty());
    }

    #[tokio::test]
    async fn test_class_schema_and_refusals() {
        let hub = BrokerHub::bind("127.0.0.1:0").await.unwrap();
        let _server = server(&hub, config(&["visibility=2"]), builtin_registry()).await;
        let gui = client(&hub).await;

        let (schema, class_id, server_id) = gui
            .request("srv", "slotGetClassSchema", (property_test::CLASS_ID.to_string(),))
            .receive::<(Schema, String, String)>()
            .await
            .unwrap();
        assert_eq!(class_id, property_test::CLASS_ID);
        assert_eq!(server_id, "srv");
        assert!(schema.has("output.port"));
        assert!(schema.has("lockedBy"));

        let err = gui
            .request(
                "srv",
                "slotStartDevice",
                (property_test::CLASS_ID.to_string(), "pt2".to_string(), Hash::new()),
            )
            .access_level(AccessLevel::User)
            .receive_hash()
            .await
            .unwrap_err();
        assert!(matches!(err, KaraboError::DisallowedState(_)));

        let (ok, message) = gui
            .request("srv", "slotStartDevice", ("Unknown".to_string(), String::new(), Hash::new()))
            .access_level(AccessLevel::Operator)
            .receive::<(bool, String)>()
            .await
            .unwrap();
        assert!(!ok);
        assert!(message.contains("Unknown"));
    }

    #[tokio::test]
    async fn test_plugins_and_auto_start_then_remote_kill() {
        let hub = BrokerHub::bind("127.0.0.1:0").await.unwrap();
        let plugins = tempfile::tempdir().unwrap();
        std::fs::write(
            plugins.path().join("property-test.json"),
            r#"{"classId": "PropertyTest", "version": "1.0.0", "entry": "property-test"}"#,
        )
        .unwrap();

        let registry = Arc::new(DeviceRegistry::new());
        registry.register_factory(property_test::ENTRY, property_test::factory);
        let plugin_arg = format!("pluginDirectory={}", plugins.path().display());
        let config = ServerConfig::from_args([
            "serverId=srv",
            plugin_arg.as_str(),
            r#"init={"auto1": {"classId": "PropertyTest", "stringProperty": "from init"}}"#,
        ])
        .unwrap();
        let server = server(&hub, config, registry).await;
        assert_eq!(server.registry().class_ids(), vec![property_test::CLASS_ID]);
        assert_eq!(server.device_ids(), vec!["auto1"]);
        let auto = server.device("auto1").unwrap();
        assert_eq!(auto.get::<String>("stringProperty").unwrap(), "from init");

        let gui = client(&hub).await;
        gui.request("srv", "slotKillServer", ())
            .receive_hash()
            .await
            .unwrap();
        tokio::time::timeout(WAIT, server.wait_for_shutdown())
            .await
            .unwrap();
        assert!(!auto.is_alive());
        assert!(!server.signal_slotable().is_running());
    }
}
