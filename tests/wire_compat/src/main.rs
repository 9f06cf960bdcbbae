fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use beamdrop_protocol::{Role, TransferMessage, TransferStatus};
    use beamdrop_snapshot::Snapshot;
    use beamdrop_transfer::Transfer;

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON numbers so that `100` and `100.0` compare equal.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture, re-serializes it, and compares the JSON values
    /// (order-independent, float-normalized). Returns the parsed value.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
        parsed
    }

    // --- Channel messages ---

    #[test]
    fn fixture_message_metadata() {
        let msg: TransferMessage = roundtrip_test("message_metadata.json");
        match msg {
            TransferMessage::Metadata {
                metadata,
                total_chunks,
                ..
            } => {
                assert_eq!(metadata.size, 150 * 1024);
                assert_eq!(total_chunks, 3);
            }
            other => panic!("expected metadata, got {other:?}"),
        }
    }

    #[test]
    fn fixture_message_chunk() {
        let msg: TransferMessage = roundtrip_test("message_chunk.json");
        match msg {
            TransferMessage::Chunk {
                chunk_index, data, ..
            } => {
                assert_eq!(chunk_index, 2);
                assert_eq!(data, b"hello, beamdrop");
            }
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn fixture_message_complete() {
        let msg: TransferMessage = roundtrip_test("message_complete.json");
        assert_eq!(msg.kind(), "complete");
        assert_eq!(msg.transfer_id(), "5f0c2a4e-9a41-4c55-8d0e-2b7f6f1c9e01");
    }

    #[test]
    fn fixtures_decode_from_raw_frames() {
        for name in [
            "message_metadata.json",
            "message_chunk.json",
            "message_complete.json",
        ] {
            let bytes = fs::read(fixtures_dir().join(name)).unwrap();
            let msg = TransferMessage::decode(&bytes)
                .unwrap_or_else(|e| panic!("failed to decode {name}: {e}"));
            assert_eq!(TransferMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
        }
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let frame = br#"{"type":"ack","transferId":"t1"}"#;
        assert!(TransferMessage::decode(frame).is_err());
    }

    // --- Persisted records ---

    #[test]
    fn fixture_transfer_record() {
        let transfer: Transfer = roundtrip_test("transfer_record.json");
        assert_eq!(transfer.status, TransferStatus::Failed);
        assert_eq!(transfer.error, "interrupted by restart");
    }

    #[test]
    fn fixture_session_snapshot() {
        let snapshot: Snapshot = roundtrip_test("session_snapshot.json");
        assert_eq!(snapshot.role, Some(Role::Host));
        assert_eq!(snapshot.transfers.len(), 1);
        assert_eq!(snapshot.logs[0].id, 7);
        assert_eq!(snapshot.preferences["theme"], "dark");
    }
}
