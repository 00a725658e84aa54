//! # Validation and Schema Injection
//!
//! Validator idempotence over a real device class schema, and repeated
//! schema injection on a running device.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use karabo_bus::{Broker, InMemoryBroker};
    use karabo_core::{class_schema, Device};
    use karabo_data::schema::elements::{Int32Element, NodeElement, StringElement};
    use karabo_data::{Hash, Schema, ValidationRules, Validator};
    use karabo_server::property_test::PropertyTest;
    use proptest::prelude::*;

    use crate::integration::support::quick;

    fn rules() -> ValidationRules {
        ValidationRules {
            inject_timestamps: false,
            ..ValidationRules::initialization()
        }
    }

    fn candidate() -> impl Strategy<Value = Hash> {
        (
            -32_000_000i32..=32_000_000,
            -1000.0f64..1000.0,
            prop::sample::select(vec!["first", "second", "third"]),
            prop::option::of(prop::collection::vec(any::<i32>(), 1..=10)),
        )
            .prop_map(|(int32, double, option, vector)| {
                let mut h = Hash::new()
                    .with("deviceId", "pt")
                    .with("int32Property", int32)
                    .with("doubleProperty", double)
                    .with("stringOption", option);
                if let Some(vector) = vector {
                    h.set("vectors.int32Property", vector);
                }
                h
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn validating_validated_output_changes_nothing(config in candidate()) {
            let schema = class_schema(&PropertyTest).unwrap();
            let first = Validator::new(rules()).validate(&schema, &config);
            let second = Validator::new(rules()).validate(&schema, &first.validated);
            prop_assert!(first.violations.is_empty(), "{:?}", first.violations);
            prop_assert!(second.violations.is_empty(), "{:?}", second.violations);
            prop_assert_eq!(second.validated, first.validated);
        }
    }

    fn injected() -> Schema {
        let mut s = Schema::new("PropertyTest");
        NodeElement::new(&mut s).key("extra").commit().unwrap();
        Int32Element::new(&mut s)
            .key("extra.gain")
            .assignment_optional()
            .default_value(4)
            .min_inc(1)
            .reconfigurable()
            .commit()
            .unwrap();
        StringElement::new(&mut s)
            .key("extra.label")
            .assignment_optional()
            .default_value("gain".to_string())
            .read_only()
            .commit()
            .unwrap();
        s
    }

    async fn device() -> Device {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new("validation"));
        let device = Device::with_bus_config(
            &PropertyTest,
            Hash::new().with("deviceId", "pt"),
            broker,
            quick(),
        )
        .unwrap();
        device.start().await.unwrap();
        device
    }

    #[tokio::test]
    async fn test_appending_twice_equals_appending_once() {
        let device = device().await;
        device.append_schema(&injected()).await.unwrap();
        let once = device.full_schema();
        assert_eq!(device.get::<i32>("extra.gain").unwrap(), 4);

        device.set("extra.gain", 9i32).await.unwrap();
        device.append_schema(&injected()).await.unwrap();
        assert_eq!(device.full_schema(), once);
        assert_eq!(device.get::<i32>("extra.gain").unwrap(), 9);
    }

    #[tokio::test]
    async fn test_update_schema_drops_previous_injection() {
        let device = device().await;
        device.append_schema(&injected()).await.unwrap();
        assert!(device.full_schema().has("extra.label"));

        let mut replacement = Schema::new("PropertyTest");
        NodeElement::new(&mut replacement).key("extra").commit().unwrap();
        Int32Element::new(&mut replacement)
            .key("extra.gain")
            .assignment_optional()
            .default_value(2)
            .min_inc(1)
            .max_inc(8)
            .reconfigurable()
            .commit()
            .unwrap();
        device.update_schema(&replacement).await.unwrap();

        let schema = device.full_schema();
        assert!(schema.has("extra.gain"));
        assert!(!schema.has("extra.label"));
        assert!(!device.configuration().has("extra.label"));
        assert!(schema.has("int32Property"));

        let (_, rejected) = device
            .reconfigure("test", Hash::new().with("extra.gain", 9i32))
            .await
            .unwrap();
        assert_eq!(rejected[0].get::<String>("kind").unwrap(), "OutOfRange");
    }
}
