//! # Messaging over the TCP Hub
//!
//! Request/reply, signals and device tracking between instances that each
//! hold their own connection to a `BrokerHub`.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use karabo_bus::{reply, Broker, BrokerHub, InstanceEvent, SignalSlotable, TcpBroker};
    use karabo_core::Device;
    use karabo_data::{Hash, KaraboError};
    use karabo_server::property_test::PropertyTest;
    use tokio::sync::mpsc;

    use crate::integration::support::{eventually, quick, WAIT};

    const TOPIC: &str = "messaging";

    async fn connect(hub: &BrokerHub) -> Arc<dyn Broker> {
        Arc::new(
            TcpBroker::connect(&[hub.local_addr().to_string()], TOPIC)
                .await
                .unwrap(),
        )
    }

    async fn instance(hub: &BrokerHub, id: &str) -> SignalSlotable {
        let ss = SignalSlotable::new(id, connect(hub).await, quick());
        ss.start().await.unwrap();
        ss
    }

    /// Lets the hub register subscriptions made on other connections.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_request_reply_across_connections() {
        let hub = BrokerHub::bind("127.0.0.1:0").await.unwrap();
        let calc = SignalSlotable::new("calc", connect(&hub).await, quick());
        calc.register_slot("slotAdd", |call| async move {
            let (a, b) = call.args::<(i32, i32)>()?;
            reply((a + b,))
        });
        calc.start().await.unwrap();
        let client = instance(&hub, "client").await;
        settle().await;

        let (sum,) = client
            .request("calc", "slotAdd", (20i32, 22i32))
            .receive::<(i32,)>()
            .await
            .unwrap();
        assert_eq!(sum, 42);
        assert_eq!(client.pending_replies().pending_count(), 0);

        let err = client
            .request("calc", "slotMissing", ())
            .receive_hash()
            .await
            .unwrap_err();
        assert!(matches!(err, KaraboError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_request_to_nobody_times_out() {
        let hub = BrokerHub::bind("127.0.0.1:0").await.unwrap();
        let client = instance(&hub, "client").await;

        let started = tokio::time::Instant::now();
        let err = client
            .request("noone", "slotX", ())
            .timeout(Duration::from_millis(200))
            .receive::<(i32,)>()
            .await
            .unwrap_err();
        assert!(matches!(err, KaraboError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(client.pending_replies().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_signal_fans_out_to_every_subscriber() {
        let hub = BrokerHub::bind("127.0.0.1:0").await.unwrap();
        let emitter = instance(&hub, "emitter").await;
        emitter.register_signal("signalValue");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listeners = Vec::new();
        for id in ["l1", "l2"] {
            let listener = SignalSlotable::new(id, connect(&hub).await, quick());
            let tx = tx.clone();
            let me = id.to_string();
            listener.register_slot("slotValue", move |call| {
                let tx = tx.clone();
                let me = me.clone();
                async move {
                    let (v,) = call.args::<(i32,)>()?;
                    let _ = tx.send((me, v));
                    Ok(Hash::new())
                }
            });
            listener.start().await.unwrap();
            assert!(listener
                .connect("emitter", "signalValue", id, "slotValue")
                .await
                .unwrap());
            listeners.push(listener);
        }
        settle().await;

        emitter.emit("signalValue", (7i32,)).await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec![("l1".to_string(), 7), ("l2".to_string(), 7)]);
    }

    #[tokio::test]
    async fn test_tracked_device_updates_until_gone() {
        let hub = BrokerHub::bind("127.0.0.1:0").await.unwrap();
        let observer = instance(&hub, "observer").await;
        let mut events = observer.subscribe_events();

        let device = Device::with_bus_config(
            &PropertyTest,
            Hash::new().with("deviceId", "pt"),
            connect(&hub).await,
            quick(),
        )
        .unwrap();
        device.start().await.unwrap();
        settle().await;

        let configuration = observer.track_device("pt").await.unwrap();
        assert_eq!(configuration.get::<i32>("int32Property").unwrap(), 32_000_000);

        let (accepted, _) = observer
            .request("pt", "slotReconfigure", (Hash::new().with("int32Property", 5i32),))
            .receive::<(Vec<String>, Vec<Hash>)>()
            .await
            .unwrap();
        assert_eq!(accepted, vec!["int32Property"]);
        let watcher = &observer;
        assert!(
            eventually(move || async move {
                watcher
                    .topology()
                    .configuration("pt")
                    .and_then(|c| c.get::<i32>("int32Property").ok())
                    == Some(5)
            })
            .await
        );

        device.kill().await;
        let gone = tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(InstanceEvent::Gone { instance_id, .. }) if instance_id == "pt" => break,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream failed: {e}"),
                }
            }
        })
        .await;
        assert!(gone.is_ok());
        assert!(!observer.topology().contains("pt"));
        assert!(observer.topology().configuration("pt").is_none());
    }
}
