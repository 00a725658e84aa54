//! # Hash and Codec Properties
//!
//! Insertion order, lossless round trips through both codecs, canonical
//! binary form, and the file formats picked by extension.

#[cfg(test)]
mod tests {
    use karabo_data::io::{
        decode_hash, encode_hash, load_from_file, save_to_file, BinarySerializer, HashSerializer,
        XmlSerializer,
    };
    use karabo_data::{Complex, Hash, ReferenceType, Schema, Value};
    use proptest::prelude::*;

    // =========================================================================
    // Generators
    // =========================================================================

    /// Every double except NaN, which never equals itself.
    fn double() -> impl Strategy<Value = f64> {
        use proptest::num::f64 as f;
        prop_oneof![
            f::POSITIVE | f::NEGATIVE | f::NORMAL | f::SUBNORMAL | f::ZERO | f::INFINITE,
            prop::sample::select(vec![
                f64::MAX,
                f64::MIN,
                f64::MIN_POSITIVE,
                f64::EPSILON,
                5e-324,
                -0.0,
                0.1,
                1e22,
            ]),
        ]
    }

    fn float() -> impl Strategy<Value = f32> {
        use proptest::num::f32 as f;
        prop_oneof![
            f::POSITIVE | f::NEGATIVE | f::NORMAL | f::SUBNORMAL | f::ZERO | f::INFINITE,
            prop::sample::select(vec![f32::MAX, f32::MIN, f32::MIN_POSITIVE, f32::EPSILON, -0.0, 0.1]),
        ]
    }

    fn text() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_]{0,12}"
    }

    fn printable() -> impl Strategy<Value = u8> {
        0x21u8..=0x7e
    }

    fn integers() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::from),
            printable().prop_map(Value::Char),
            any::<i8>().prop_map(Value::from),
            any::<u8>().prop_map(Value::from),
            any::<i16>().prop_map(Value::from),
            any::<u16>().prop_map(Value::from),
            any::<i32>().prop_map(Value::from),
            any::<u32>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            any::<u64>().prop_map(Value::from),
        ]
    }

    fn others() -> impl Strategy<Value = Value> {
        prop_oneof![
            float().prop_map(Value::from),
            double().prop_map(Value::from),
            (float(), float()).prop_map(|(re, im)| Value::from(Complex::new(re, im))),
            (double(), double()).prop_map(|(re, im)| Value::from(Complex::new(re, im))),
            text().prop_map(Value::from),
            prop::collection::vec(any::<u8>(), 0..6).prop_map(|b| Value::from(bytes::Bytes::from(b))),
            Just(Value::None),
        ]
    }

    fn vec_of<T: std::fmt::Debug>(element: impl Strategy<Value = T>) -> impl Strategy<Value = Vec<T>> {
        prop::collection::vec(element, 0..4)
    }

    fn integer_vectors() -> impl Strategy<Value = Value> {
        prop_oneof![
            vec_of(any::<bool>()).prop_map(Value::from),
            vec_of(any::<u8>()).prop_map(Value::VectorChar),
            vec_of(any::<i8>()).prop_map(Value::from),
            vec_of(any::<u8>()).prop_map(Value::from),
            vec_of(any::<i16>()).prop_map(Value::from),
            vec_of(any::<u16>()).prop_map(Value::from),
            vec_of(any::<i32>()).prop_map(Value::from),
            vec_of(any::<u32>()).prop_map(Value::from),
            vec_of(any::<i64>()).prop_map(Value::from),
            vec_of(any::<u64>()).prop_map(Value::from),
        ]
    }

    fn other_vectors() -> impl Strategy<Value = Value> {
        prop_oneof![
            vec_of(float()).prop_map(Value::from),
            vec_of(double()).prop_map(Value::from),
            vec_of((float(), float()).prop_map(|(re, im)| Complex::new(re, im))).prop_map(Value::from),
            vec_of((double(), double()).prop_map(|(re, im)| Complex::new(re, im))).prop_map(Value::from),
            // items are comma-joined in XML, so no commas and no empty items
            vec_of("[a-zA-Z0-9_]{1,8}").prop_map(Value::from),
        ]
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![integers(), others(), integer_vectors(), other_vectors()]
    }

    type Entry = (String, Value, Vec<(String, Value)>);

    fn build(entries: Vec<Entry>) -> Hash {
        let mut h = Hash::new();
        for (key, value, attributes) in entries {
            let node = h.set_key(&key, value);
            for (name, attribute) in attributes {
                node.attributes_mut().set(&name, attribute);
            }
        }
        h
    }

    /// Leaves, nested Hashes, vectors of Hash and Schemas, with attributes
    /// of any of those types. Attribute names stay short of `xmlns`, which
    /// the XML reader skips.
    fn value() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 32, 4, |inner| {
            let entries = prop::collection::vec(
                ("[a-z]{1,6}", inner.clone(), prop::collection::vec(("[a-z]{1,4}", inner), 0..3)),
                0..4,
            );
            prop_oneof![
                entries.clone().prop_map(|e| Value::Hash(build(e))),
                prop::collection::vec(entries.clone().prop_map(build), 0..3).prop_map(Value::VectorHash),
                ("[A-Z][a-z]{0,6}", entries.prop_map(build))
                    .prop_map(|(root, parameters)| Value::Schema(Schema::from_parameters(&root, parameters))),
            ]
        })
    }

    fn hash() -> impl Strategy<Value = Hash> {
        prop::collection::vec(
            ("[a-z]{1,6}", value(), prop::collection::vec(("[a-z]{1,4}", value()), 0..3)),
            1..8,
        )
        .prop_map(build)
    }

    fn first_occurrences(keys: &[String]) -> Vec<String> {
        let mut seen = Vec::new();
        for key in keys {
            if !seen.contains(key) {
                seen.push(key.clone());
            }
        }
        seen
    }

    proptest! {
        #[test]
        fn iteration_follows_insertion_order(keys in prop::collection::vec("[a-z]{1,4}", 1..20)) {
            let mut h = Hash::new();
            for (i, key) in keys.iter().enumerate() {
                h.set(key, i32::try_from(i).unwrap());
            }
            let expected = first_occurrences(&keys);
            prop_assert_eq!(h.keys().collect::<Vec<_>>(), expected.iter().map(String::as_str).collect::<Vec<_>>());

            // overwriting keeps the position, erasing removes only that key
            h.set(&expected[0], "changed");
            h.erase(expected.last().unwrap());
            let remaining: Vec<&str> = expected[..expected.len() - 1].iter().map(String::as_str).collect();
            if expected.len() > 1 {
                prop_assert_eq!(h.keys().collect::<Vec<_>>(), remaining);
            } else {
                prop_assert!(h.is_empty());
            }
        }

        #[test]
        fn binary_round_trip_is_lossless(h in hash()) {
            let decoded = decode_hash(&encode_hash(&h).unwrap()).unwrap();
            prop_assert_eq!(decoded, h);
        }

        #[test]
        fn binary_encoding_is_canonical(h in hash()) {
            let first = encode_hash(&h).unwrap();
            let again = encode_hash(&decode_hash(&first).unwrap()).unwrap();
            prop_assert_eq!(first, again);
        }

        #[test]
        fn xml_round_trip_is_lossless(h in hash()) {
            let xml = XmlSerializer::new();
            let text = xml.to_xml(&h).unwrap();
            prop_assert_eq!(xml.from_xml(&text).unwrap(), h);
        }

        #[test]
        fn merging_with_itself_is_identity(h in hash()) {
            let mut merged = h.clone();
            merged.merge(&h, karabo_data::MergePolicy::ReplaceAttributes);
            prop_assert_eq!(merged, h);
        }
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    #[test]
    fn test_int16_survives_a_binary_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("width.bin");
        save_to_file(&Hash::new().with("n", 12345i16), &path).unwrap();

        let h = load_from_file(&path).unwrap();
        assert_eq!(h.get_type("n").unwrap(), ReferenceType::Int16);
        assert_eq!(h.get::<i16>("n").unwrap(), 12345);
    }

    #[test]
    fn test_xml_sequence_file_yields_vector_of_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.xml");
        std::fs::write(
            &path,
            r#"<KRB_Sequence KRB_Type="VECTOR_HASH"><KRB_Item><v KRB_Type="INT32">7</v></KRB_Item></KRB_Sequence>"#,
        )
        .unwrap();

        let h = load_from_file(&path).unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h.get_type("KRB_Sequence").unwrap(), ReferenceType::VectorHash);
        let rows = h.get_vector_hash("KRB_Sequence").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<i32>("v").unwrap(), 7);
    }

    #[test]
    fn test_codecs_agree_on_sequences() {
        let rows = vec![
            Hash::new().with("a", 1i32),
            Hash::new().with("b", "two").with("c.d", 3.5f64),
        ];
        let binary = BinarySerializer::new();
        let xml = XmlSerializer::new();
        let from_binary = binary.load_sequence(&binary.save_sequence(&rows).unwrap()).unwrap();
        let from_xml = xml.load_sequence(&xml.save_sequence(&rows).unwrap()).unwrap();
        assert_eq!(from_binary, rows);
        assert_eq!(from_xml, rows);
    }

    #[test]
    fn test_xml_and_binary_files_hold_the_same_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Hash::new()
            .with("motor.position", 12.25f64)
            .with("motor.limits", vec![-5i32, 5])
            .with("name", "stage");
        h.set_attribute("motor.position", "unit", "mm").unwrap();

        save_to_file(&h, dir.path().join("config.xml")).unwrap();
        save_to_file(&h, dir.path().join("config.bin")).unwrap();
        let from_xml = load_from_file(dir.path().join("config.xml")).unwrap();
        let from_bin = load_from_file(dir.path().join("config.bin")).unwrap();
        assert_eq!(from_xml, h);
        assert_eq!(from_bin, h);
        assert_eq!(
            from_xml.get_attributes("motor.position").unwrap().get::<String>("unit").unwrap(),
            "mm"
        );
    }
}
