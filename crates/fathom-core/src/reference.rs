//! Reference edges between collections.
//!
//! A reference field `F -> other.G` stores the user-facing value in `F` and
//! the resolved seq id of the referenced document in the hidden helper
//! field `F_sequence_id`. Synchronous references resolve at index time and
//! fail the document when the target is missing; async references store a
//! sentinel until the target appears. Deleting a referenced document
//! cascades back through the helper fields.
//!
//! This module holds the document-level mechanics; the registry drives the
//! cross-collection orchestration.

use crate::config::UNRESOLVED_REFERENCE;
use crate::error::{Error, Result};
use crate::schema::{reference_helper_name, Field};
use crate::SeqId;
use serde_json::{Map, Value};

/// What the cascade did to a referencing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeAction {
    /// Nothing referenced the removed document.
    Untouched,
    /// The referencing document must be deleted.
    DeleteDocument,
    /// The reference field was nulled (optional singular reference).
    NullifyField,
    /// One or more array elements were removed, correspondence preserved.
    ElementsRemoved,
}

/// Writes the helper value(s) for a reference field into the document.
/// `resolved` is parallel to the field's values; singular fields get one
/// entry. Unresolved async references carry the sentinel.
pub fn write_helper(doc: &mut Map<String, Value>, field: &Field, resolved: &[SeqId]) -> Result<()> {
    let helper = reference_helper_name(&field.name);
    if field.field_type.is_array() {
        let len = doc
            .get(&field.name)
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        if resolved.len() != len {
            return Err(Error::internal(format!(
                "Reference helper for `{}` must match the value count ({} != {}).",
                field.name,
                resolved.len(),
                len
            )));
        }
        doc.insert(
            helper,
            Value::Array(resolved.iter().map(|s| Value::from(*s as i64)).collect()),
        );
    } else {
        let seq = resolved.first().copied().unwrap_or(UNRESOLVED_REFERENCE);
        doc.insert(helper, Value::from(seq as i64));
    }
    Ok(())
}

/// Reads the helper values of a reference field, sentinel included.
pub fn read_helper(doc: &Map<String, Value>, field: &Field) -> Vec<SeqId> {
    let helper = reference_helper_name(&field.name);
    match doc.get(&helper) {
        Some(Value::Number(n)) => n.as_i64().map(|v| v as SeqId).into_iter().collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_i64().map(|v| v as SeqId))
            .collect(),
        _ => Vec::new(),
    }
}

/// Applies the delete cascade to one referencing document after
/// `removed_ref_seq` disappeared from the referenced collection.
///
/// - Singular references delete the owning document, unless the field is
///   optional, in which case it is nulled.
/// - Array references remove the matching element and its helper entry,
///   preserving index correspondence; an emptied array falls back to the
///   singular rule.
pub fn cascade_remove(
    doc: &mut Map<String, Value>,
    field: &Field,
    removed_ref_seq: SeqId,
) -> CascadeAction {
    let helper_name = reference_helper_name(&field.name);

    if !field.field_type.is_array() {
        let current = read_helper(doc, field);
        if current.first().copied() != Some(removed_ref_seq) {
            return CascadeAction::Untouched;
        }
        if field.optional {
            doc.insert(field.name.clone(), Value::Null);
            doc.insert(helper_name, Value::Null);
            return CascadeAction::NullifyField;
        }
        return CascadeAction::DeleteDocument;
    }

    let helper_values = read_helper(doc, field);
    let keep: Vec<bool> = helper_values
        .iter()
        .map(|seq| *seq != removed_ref_seq)
        .collect();
    if keep.iter().all(|k| *k) {
        return CascadeAction::Untouched;
    }

    let retain_parallel = |value: &mut Value| {
        if let Value::Array(items) = value {
            let mut kept = Vec::with_capacity(items.len());
            for (i, item) in items.drain(..).enumerate() {
                if keep.get(i).copied().unwrap_or(true) {
                    kept.push(item);
                }
            }
            *items = kept;
        }
    };
    if let Some(values) = doc.get_mut(&field.name) {
        retain_parallel(values);
    }
    if let Some(helpers) = doc.get_mut(&helper_name) {
        retain_parallel(helpers);
    }

    let now_empty = doc
        .get(&field.name)
        .and_then(|v| v.as_array())
        .map(|a| a.is_empty())
        .unwrap_or(false);
    if now_empty {
        if field.optional {
            doc.insert(field.name.clone(), Value::Null);
            doc.insert(helper_name, Value::Null);
            return CascadeAction::NullifyField;
        }
        return CascadeAction::DeleteDocument;
    }
    CascadeAction::ElementsRemoved
}

/// Checks an async back-fill: a referencing document may only move from the
/// sentinel to a concrete target, never from one target to another.
pub fn backfill_allowed(current: SeqId, proposed: SeqId) -> bool {
    current == UNRESOLVED_REFERENCE || current == proposed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use serde_json::json;

    fn doc(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn array_ref_field() -> Field {
        let mut f = Field::new("cats", FieldType::StringArray);
        f.reference = Some("categories.id".to_string());
        f
    }

    #[test]
    fn test_write_and_read_helper_singular() {
        let mut f = Field::new("brand_id", FieldType::String);
        f.reference = Some("brands.id".to_string());
        let mut d = doc(json!({"id": "1", "brand_id": "b1"}));
        write_helper(&mut d, &f, &[42]).unwrap();
        assert_eq!(d["brand_id_sequence_id"], json!(42));
        assert_eq!(read_helper(&d, &f), vec![42]);

        // Unresolved async reference carries the sentinel.
        write_helper(&mut d, &f, &[]).unwrap();
        assert_eq!(read_helper(&d, &f), vec![UNRESOLVED_REFERENCE]);
    }

    #[test]
    fn test_write_helper_array_must_match_len() {
        let f = array_ref_field();
        let mut d = doc(json!({"id": "1", "cats": ["c1", "c2"]}));
        assert!(write_helper(&mut d, &f, &[1]).is_err());
        write_helper(&mut d, &f, &[1, 2]).unwrap();
        assert_eq!(d["cats_sequence_id"], json!([1, 2]));
    }

    #[test]
    fn test_cascade_array_removes_matching_element() {
        // Scenario S4: deleting c1 leaves cats=[c2], helper=[seq(c2)].
        let f = array_ref_field();
        let mut d = doc(json!({
            "id": "prod",
            "cats": ["c1", "c2"],
            "cats_sequence_id": [10, 20]
        }));
        let action = cascade_remove(&mut d, &f, 10);
        assert_eq!(action, CascadeAction::ElementsRemoved);
        assert_eq!(d["cats"], json!(["c2"]));
        assert_eq!(d["cats_sequence_id"], json!([20]));
    }

    #[test]
    fn test_cascade_array_emptied_deletes_required_doc() {
        let f = array_ref_field();
        let mut d = doc(json!({
            "id": "prod",
            "cats": ["c1"],
            "cats_sequence_id": [10]
        }));
        assert_eq!(cascade_remove(&mut d, &f, 10), CascadeAction::DeleteDocument);
    }

    #[test]
    fn test_cascade_array_emptied_nullifies_optional_doc() {
        let mut f = array_ref_field();
        f.optional = true;
        let mut d = doc(json!({
            "id": "prod",
            "cats": ["c1"],
            "cats_sequence_id": [10]
        }));
        assert_eq!(cascade_remove(&mut d, &f, 10), CascadeAction::NullifyField);
        assert_eq!(d["cats"], json!(null));
    }

    #[test]
    fn test_cascade_singular_required_deletes() {
        let mut f = Field::new("brand_id", FieldType::String);
        f.reference = Some("brands.id".to_string());
        let mut d = doc(json!({"id": "1", "brand_id": "b1", "brand_id_sequence_id": 7}));
        assert_eq!(cascade_remove(&mut d, &f, 7), CascadeAction::DeleteDocument);

        // A different removed target leaves the doc alone.
        let mut d2 = doc(json!({"id": "1", "brand_id": "b1", "brand_id_sequence_id": 7}));
        assert_eq!(cascade_remove(&mut d2, &f, 9), CascadeAction::Untouched);
    }

    #[test]
    fn test_backfill_rules() {
        assert!(backfill_allowed(UNRESOLVED_REFERENCE, 5));
        assert!(backfill_allowed(5, 5));
        // Re-targeting an already resolved reference is rejected.
        assert!(!backfill_allowed(5, 6));
    }
}
