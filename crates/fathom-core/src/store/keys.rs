//! Persisted key layout.
//!
//! All engine state lives in one byte-keyed namespace:
//!
//! - `$CM_{name}` -> collection meta JSON
//! - `$CS_{name}` -> next seq id (decimal string)
//! - `{collection_id}_S_{serialized_uint32(seq_id)}` -> stored document JSON
//! - `{collection_id}_D_{doc_id}` -> seq id (decimal string)
//! - `$CO_{collection}_{id}` -> override JSON
//! - `$AR_{rule_name}` -> analytics rule JSON
//! - `{user_id}%{event_name}%{serialized_uint64(ts)}` -> analytics event JSON
//!
//! Sequence keys embed the seq id big-endian so that byte order matches
//! numeric order and prefix scans walk documents in insertion order.

/// Collection meta JSON.
pub const COLLECTION_META_PREFIX: &str = "$CM_";
/// Next sequence id per collection.
pub const COLLECTION_NEXT_SEQ_PREFIX: &str = "$CS_";
/// Curation overrides.
pub const COLLECTION_OVERRIDE_PREFIX: &str = "$CO_";
/// Analytics rules.
pub const ANALYTICS_RULE_PREFIX: &str = "$AR_";

/// Big-endian serialization of a u32; preserves numeric order under
/// lexicographic byte comparison.
pub fn serialize_uint32(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Big-endian serialization of a u64 (analytics event timestamps).
pub fn serialize_uint64(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

/// Inverse of [`serialize_uint32`]. Returns `None` on short input.
pub fn deserialize_uint32(bytes: &[u8]) -> Option<u32> {
    let arr: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(arr))
}

/// Key of a stored document: `{collection_id}_S_{serialized_uint32(seq_id)}`.
pub fn doc_key(collection_id: u32, seq_id: u32) -> Vec<u8> {
    let mut key = format!("{}_S_", collection_id).into_bytes();
    key.extend_from_slice(&serialize_uint32(seq_id));
    key
}

/// Prefix under which all of a collection's documents sort in seq order.
pub fn doc_key_prefix(collection_id: u32) -> Vec<u8> {
    format!("{}_S_", collection_id).into_bytes()
}

/// Key of the doc-id -> seq-id mapping: `{collection_id}_D_{doc_id}`.
pub fn doc_id_key(collection_id: u32, doc_id: &str) -> Vec<u8> {
    format!("{}_D_{}", collection_id, doc_id).into_bytes()
}

/// Extracts the seq id from a document key produced by [`doc_key`].
pub fn seq_id_from_doc_key(key: &[u8], collection_id: u32) -> Option<u32> {
    let prefix = doc_key_prefix(collection_id);
    key.strip_prefix(prefix.as_slice())
        .and_then(deserialize_uint32)
}

/// Key of a persisted override.
pub fn override_key(collection: &str, id: &str) -> Vec<u8> {
    format!("{}{}_{}", COLLECTION_OVERRIDE_PREFIX, collection, id).into_bytes()
}

/// Key of a persisted analytics rule.
pub fn analytics_rule_key(name: &str) -> Vec<u8> {
    format!("{}{}", ANALYTICS_RULE_PREFIX, name).into_bytes()
}

/// Key of a logged analytics event: `userid%event_name%serialized_uint64(ts)`.
///
/// The `%` separators are load-bearing for prefix scans, so `%` is stripped
/// from user ids before they are embedded.
pub fn analytics_event_key(user_id: &str, event_name: &str, timestamp_us: u64) -> Vec<u8> {
    let clean_user: String = user_id.chars().filter(|&c| c != '%').collect();
    let mut key = format!("{}%{}%", clean_user, event_name).into_bytes();
    key.extend_from_slice(&serialize_uint64(timestamp_us));
    key
}

/// Prefix matching every event logged for a user.
pub fn analytics_event_user_prefix(user_id: &str) -> Vec<u8> {
    let clean_user: String = user_id.chars().filter(|&c| c != '%').collect();
    format!("{}%", clean_user).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_uint32_preserves_order() {
        // For any a < b, bytes(a) < bytes(b) lexicographically.
        let samples = [0u32, 1, 2, 255, 256, 65_535, 65_536, 1 << 24, u32::MAX - 1, u32::MAX];
        for pair in samples.windows(2) {
            assert!(serialize_uint32(pair[0]) < serialize_uint32(pair[1]));
        }
    }

    #[test]
    fn test_doc_key_roundtrip() {
        let key = doc_key(7, 42);
        assert_eq!(seq_id_from_doc_key(&key, 7), Some(42));
        assert!(key.starts_with(doc_key_prefix(7).as_slice()));
    }

    #[test]
    fn test_event_key_strips_percent_from_user() {
        let key = analytics_event_key("us%er", "click", 123);
        let s = String::from_utf8_lossy(&key[..key.len() - 8]).to_string();
        assert_eq!(s, "user%click%");
    }
}
