//! Canonical serialization for hashing and signatures.
//!
//! Payloads are serialized with a stable field ordering before hashing so
//! that content and chain hashes are deterministic across implementations:
//! object keys are emitted in lexicographic order at every nesting level,
//! with no insignificant whitespace.

use serde::Serialize;
use serde_json::Value;

/// Chain-hash seed for the first event of a stream.
pub const GENESIS_CHAIN_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Serialize a value to canonical JSON bytes: sorted object keys, compact
/// separators, array order preserved.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    let mut out = Vec::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            out.push(b'{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(&map[*key], out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        leaf => serde_json::to_writer(&mut *out, leaf)?,
    }
    Ok(())
}

/// Hex blake3 hash over the canonical bytes of a payload.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = canonical_bytes(value)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Chain hash linking a record to its predecessor:
/// `blake3(prev_chain_hash ‖ content_hash)` over the hex strings.
pub fn chain_hash(prev_chain_hash: &str, content_hash: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev_chain_hash.as_bytes());
    hasher.update(content_hash.as_bytes());
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_keys_are_sorted_at_every_level() {
        let a = json!({"zebra": 1, "apple": {"y": 2, "x": 3}});
        let b = json!({"apple": {"x": 3, "y": 2}, "zebra": 1});

        let ca = canonical_bytes(&a).unwrap();
        let cb = canonical_bytes(&b).unwrap();
        assert_eq!(ca, cb);
        assert_eq!(
            String::from_utf8(ca).unwrap(),
            r#"{"apple":{"x":3,"y":2},"zebra":1}"#
        );
    }

    #[test]
    fn array_order_is_preserved() {
        let v = json!([3, 1, 2]);
        assert_eq!(String::from_utf8(canonical_bytes(&v).unwrap()).unwrap(), "[3,1,2]");
    }

    #[test]
    fn content_hash_ignores_field_declaration_order() {
        let a = json!({"b": "two", "a": "one"});
        let b = json!({"a": "one", "b": "two"});
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn chain_hash_cascades() {
        let c1 = content_hash(&json!({"n": 1})).unwrap();
        let c2 = content_hash(&json!({"n": 2})).unwrap();

        let h1 = chain_hash(GENESIS_CHAIN_HASH, &c1);
        let h2 = chain_hash(&h1, &c2);

        // Any change to the first record changes every later chain hash.
        let c1_tampered = content_hash(&json!({"n": 9})).unwrap();
        let h1_tampered = chain_hash(GENESIS_CHAIN_HASH, &c1_tampered);
        assert_ne!(h1, h1_tampered);
        assert_ne!(h2, chain_hash(&h1_tampered, &c2));
    }
}
