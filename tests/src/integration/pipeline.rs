//! # Device to Device Pipelines
//!
//! Output channels of one device feeding input channels of another,
//! resolved through `slotGetOutputChannelInformation` on the broker.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use karabo_bus::{Broker, InMemoryBroker, SignalSlotable};
    use karabo_core::Device;
    use karabo_data::Hash;
    use karabo_pipeline::{InputChannel, InputChannelConfig, InputEvent, OnSlowness};
    use karabo_server::property_test::PropertyTest;

    use crate::integration::support::{eventually, quick, WAIT};

    struct Rig {
        broker: Arc<dyn Broker>,
        writer: Device,
        client: SignalSlotable,
    }

    async fn rig(topic: &str) -> Rig {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(topic));
        let writer = Device::with_bus_config(
            &PropertyTest,
            Hash::new()
                .with("deviceId", "writer")
                .with("output.hostname", "127.0.0.1"),
            Arc::clone(&broker),
            quick(),
        )
        .unwrap();
        writer.start().await.unwrap();
        let client = SignalSlotable::new("client", Arc::clone(&broker), quick());
        client.start().await.unwrap();
        Rig {
            broker,
            writer,
            client,
        }
    }

    async fn reader(rig: &Rig) -> Device {
        let reader = Device::with_bus_config(
            &PropertyTest,
            Hash::new()
                .with("deviceId", "reader")
                .with("input.connectedOutputChannels", vec!["writer:output"])
                .with("input.onSlowness", "wait"),
            Arc::clone(&rig.broker),
            quick(),
        )
        .unwrap();
        reader.start().await.unwrap();
        reader
    }

    async fn counter(device: &Device, key: &str, expected: i32) -> bool {
        let device = device.clone();
        let key = key.to_string();
        eventually(move || {
            let device = device.clone();
            let key = key.clone();
            async move { device.get::<i32>(&key).ok() == Some(expected) }
        })
        .await
    }

    #[tokio::test]
    async fn test_reader_counts_chunks_and_end_of_stream() {
        let rig = rig("pipeline-count").await;
        let reader = reader(&rig).await;
        rig.writer
            .output("output")
            .unwrap()
            .wait_for_inputs(1, WAIT)
            .await
            .unwrap();

        for _ in 0..5 {
            rig.client
                .request("writer", "writeOutput", ())
                .receive_hash()
                .await
                .unwrap();
        }
        assert!(counter(&reader, "inputCounter", 5).await);
        assert_eq!(reader.get::<i32>("inputCounterAtEos").unwrap(), 0);

        rig.client
            .request("writer", "eosOutput", ())
            .receive_hash()
            .await
            .unwrap();
        assert!(counter(&reader, "inputCounterAtEos", 5).await);
        assert!(reader
            .get::<Vec<String>>("input.missingConnections")
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_write_order() {
        let rig = rig("pipeline-order").await;
        let input = InputChannel::open(
            "client:input",
            InputChannelConfig {
                connected_output_channels: vec!["writer:output".to_string()],
                on_slowness: OnSlowness::Wait,
                ..InputChannelConfig::default()
            },
            Arc::new(rig.client.downgrade()),
        );
        input.wait_connected(WAIT).await.unwrap();
        rig.writer
            .output("output")
            .unwrap()
            .wait_for_inputs(1, WAIT)
            .await
            .unwrap();

        let writer = rig.writer.clone();
        let producer = tokio::spawn(async move {
            for n in 0..8i32 {
                writer
                    .write_channel("output", Hash::new().with("int32", n))
                    .await
                    .unwrap();
            }
            writer.signal_end_of_stream("output").await.unwrap();
        });

        let mut received = Vec::new();
        loop {
            match tokio::time::timeout(WAIT, input.read()).await.unwrap() {
                Some(InputEvent::Data { items, .. }) => {
                    for (payload, meta) in items {
                        assert_eq!(meta.source, "writer:output");
                        received.push(payload.as_hash().unwrap().get::<i32>("int32").unwrap());
                    }
                }
                Some(InputEvent::EndOfStream) | None => break,
            }
        }
        producer.await.unwrap();

        assert_eq!(received, (0..8).collect::<Vec<_>>());
        input.close();
    }

    #[tokio::test]
    async fn test_killed_writer_shows_as_missing_connection() {
        let rig = rig("pipeline-missing").await;
        let reader = reader(&rig).await;
        rig.writer
            .output("output")
            .unwrap()
            .wait_for_inputs(1, WAIT)
            .await
            .unwrap();

        rig.writer.kill().await;
        let watched = reader.clone();
        assert!(
            eventually(move || {
                let reader = watched.clone();
                async move {
                    reader
                        .get::<Vec<String>>("input.missingConnections")
                        .map(|missing| missing == vec!["writer:output".to_string()])
                        .unwrap_or(false)
                }
            })
            .await
        );
    }
}
