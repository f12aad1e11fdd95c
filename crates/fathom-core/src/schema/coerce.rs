//! Document validation and coercion against a schema.
//!
//! Ingest and schema alteration both funnel documents through
//! [`validate_document`]. The dirty-values mode decides what happens when a
//! value does not match its declared type: coerce it, drop the field, or
//! reject the document.

use super::{Field, FieldType, FLAT_FIELDS_KEY};
use crate::error::{Error, Result};
use serde_json::{Map, Value};

/// What to do with values that do not match the declared field type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirtyValues {
    /// Try to coerce; reject the document if coercion fails.
    #[default]
    CoerceOrReject,
    /// Try to coerce; drop the offending field if coercion fails.
    CoerceOrDrop,
    /// Drop the offending field without attempting coercion.
    Drop,
    /// Reject the document without attempting coercion.
    Reject,
}

/// Validates `doc` against the declared `fields`, coercing values in place
/// per `mode`. `fallback` is the collection's `fallback_field_type`, applied
/// to fields matched only by a `.*` declaration of type `auto`.
pub fn validate_document(
    doc: &mut Map<String, Value>,
    fields: &[Field],
    fallback: Option<FieldType>,
    mode: DirtyValues,
) -> Result<()> {
    if let Some(id) = doc.get("id") {
        if !id.is_string() {
            return Err(Error::invalid("Document `id` must be a string."));
        }
    }
    if doc.contains_key(FLAT_FIELDS_KEY) {
        return Err(Error::invalid(format!(
            "`{}` is a reserved key and cannot appear in documents.",
            FLAT_FIELDS_KEY
        )));
    }

    // Required-field pass over concrete declarations.
    for field in fields.iter().filter(|f| !f.is_dynamic()) {
        let present = doc.contains_key(&field.name) || contains_nested_path(doc, &field.name);
        if !present {
            if field.optional || !field.index || field.is_auto_embedding() {
                continue;
            }
            return Err(Error::invalid(format!(
                "Field `{}` has been declared in the schema, but is not found in the document.",
                field.name
            )));
        }
    }

    // Type pass over document keys that resolve to a declaration.
    let keys: Vec<String> = doc.keys().cloned().collect();
    for key in keys {
        if key == "id" {
            continue;
        }
        let Some(declared) = Field::resolve(fields, &key) else {
            continue; // undeclared keys are stored but not indexed
        };
        let mut target_type = declared.field_type;
        if target_type == FieldType::Auto {
            match fallback {
                Some(fb) if fb != FieldType::Auto => target_type = fb,
                _ => {
                    // Keep whatever shape the value has.
                    continue;
                }
            }
        }
        if target_type.is_object() {
            // Object shapes are checked during flattening.
            continue;
        }

        let value = doc.get(&key).cloned().unwrap_or(Value::Null);
        if value.is_null() {
            if declared.optional {
                continue;
            }
            return Err(Error::invalid(format!(
                "Field `{}` must not be null.",
                key
            )));
        }

        match coerce_value(&value, target_type, mode) {
            Ok(coerced) => {
                doc.insert(key, coerced);
            }
            Err(e) => match mode {
                DirtyValues::CoerceOrDrop | DirtyValues::Drop => {
                    doc.remove(&key);
                }
                DirtyValues::CoerceOrReject | DirtyValues::Reject => return Err(e),
            },
        }
    }

    Ok(())
}

fn contains_nested_path(doc: &Map<String, Value>, path: &str) -> bool {
    let mut current: &Value = &Value::Null;
    for (i, part) in path.split('.').enumerate() {
        current = if i == 0 {
            match doc.get(part) {
                Some(v) => v,
                None => return false,
            }
        } else {
            match current.get(part) {
                Some(v) => v,
                None => return false,
            }
        };
    }
    true
}

/// Coerces a single value to `target`. In the non-coercing modes this only
/// verifies the type.
pub fn coerce_value(value: &Value, target: FieldType, mode: DirtyValues) -> Result<Value> {
    let coercing = matches!(mode, DirtyValues::CoerceOrReject | DirtyValues::CoerceOrDrop);

    if target.is_array() {
        let Value::Array(items) = value else {
            return Err(type_error(value, target));
        };
        let element = target.element();
        if target == FieldType::GeopointArray {
            // geopoint[] is either one [lat, lng] pair or an array of pairs
            if items.len() == 2 && items.iter().all(|v| v.is_number()) {
                coerce_geopoint(value)?;
                return Ok(value.clone());
            }
        }
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(coerce_scalar(item, element, coercing)?);
        }
        return Ok(Value::Array(out));
    }

    coerce_scalar(value, target, coercing)
}

fn coerce_scalar(value: &Value, target: FieldType, coercing: bool) -> Result<Value> {
    match target {
        FieldType::Int32 | FieldType::Int64 => {
            if let Some(n) = value.as_i64() {
                if target == FieldType::Int32 && (n > i32::MAX as i64 || n < i32::MIN as i64) {
                    return Err(Error::invalid(format!("{} is out of int32 range.", n)));
                }
                return Ok(Value::from(n));
            }
            if coercing {
                if let Some(f) = value.as_f64() {
                    return Ok(Value::from(f as i64));
                }
                if let Some(s) = value.as_str() {
                    if let Ok(n) = s.trim().parse::<i64>() {
                        return Ok(Value::from(n));
                    }
                }
                if let Some(b) = value.as_bool() {
                    return Ok(Value::from(b as i64));
                }
            }
            Err(type_error(value, target))
        }
        FieldType::Float => {
            if let Some(f) = value.as_f64() {
                return Ok(Value::from(f));
            }
            if coercing {
                if let Some(s) = value.as_str() {
                    if let Ok(f) = s.trim().parse::<f64>() {
                        return Ok(Value::from(f));
                    }
                }
            }
            Err(type_error(value, target))
        }
        FieldType::Bool => {
            if value.is_boolean() {
                return Ok(value.clone());
            }
            if coercing {
                if let Some(s) = value.as_str() {
                    match s.to_ascii_lowercase().as_str() {
                        "true" => return Ok(Value::Bool(true)),
                        "false" => return Ok(Value::Bool(false)),
                        _ => {}
                    }
                }
                if let Some(n) = value.as_i64() {
                    return Ok(Value::Bool(n != 0));
                }
            }
            Err(type_error(value, target))
        }
        FieldType::String => {
            if value.is_string() {
                return Ok(value.clone());
            }
            if coercing {
                if value.is_number() || value.is_boolean() {
                    return Ok(Value::String(value.to_string()));
                }
            }
            Err(type_error(value, target))
        }
        FieldType::Geopoint => coerce_geopoint(value),
        FieldType::Object | FieldType::ObjectArray | FieldType::Auto => Ok(value.clone()),
        array => {
            // Scalar slot declared with an array type: not coercible.
            Err(type_error(value, array))
        }
    }
}

fn coerce_geopoint(value: &Value) -> Result<Value> {
    let Value::Array(pair) = value else {
        return Err(type_error(value, FieldType::Geopoint));
    };
    if pair.len() != 2 || !pair.iter().all(|v| v.is_number()) {
        return Err(Error::invalid(
            "A geopoint must be a [lat, lng] array of two numbers.",
        ));
    }
    let lat = pair[0].as_f64().unwrap_or(f64::NAN);
    let lng = pair[1].as_f64().unwrap_or(f64::NAN);
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return Err(Error::invalid(format!(
            "Geopoint ({}, {}) is out of range.",
            lat, lng
        )));
    }
    Ok(value.clone())
}

fn type_error(value: &Value, target: FieldType) -> Error {
    Error::invalid(format!(
        "Value `{}` cannot be coerced to {}.",
        truncate_for_error(value),
        target.as_str()
    ))
}

fn truncate_for_error(value: &Value) -> String {
    let mut s = value.to_string();
    if s.len() > 64 {
        s.truncate(64);
        s.push('…');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let fields = vec![Field::new("title", FieldType::String)];
        let mut d = doc(json!({"id": "1"}));
        let err = validate_document(&mut d, &fields, None, DirtyValues::CoerceOrReject);
        assert!(err.is_err());
    }

    #[test]
    fn test_missing_optional_field_ok() {
        let fields = vec![Field::new("title", FieldType::String).optional()];
        let mut d = doc(json!({"id": "1"}));
        validate_document(&mut d, &fields, None, DirtyValues::CoerceOrReject).unwrap();
    }

    #[test]
    fn test_number_coerced_to_string() {
        let fields = vec![Field::new("sku", FieldType::String)];
        let mut d = doc(json!({"id": "1", "sku": 123}));
        validate_document(&mut d, &fields, None, DirtyValues::CoerceOrReject).unwrap();
        assert_eq!(d["sku"], json!("123"));
    }

    #[test]
    fn test_string_coerced_to_int() {
        let fields = vec![Field::new("count", FieldType::Int32)];
        let mut d = doc(json!({"id": "1", "count": "42"}));
        validate_document(&mut d, &fields, None, DirtyValues::CoerceOrReject).unwrap();
        assert_eq!(d["count"], json!(42));
    }

    #[test]
    fn test_reject_mode_does_not_coerce() {
        let fields = vec![Field::new("count", FieldType::Int32)];
        let mut d = doc(json!({"id": "1", "count": "42"}));
        assert!(validate_document(&mut d, &fields, None, DirtyValues::Reject).is_err());
    }

    #[test]
    fn test_drop_mode_removes_bad_field() {
        let fields = vec![Field::new("count", FieldType::Int32).optional()];
        let mut d = doc(json!({"id": "1", "count": {"not": "a number"}}));
        validate_document(&mut d, &fields, None, DirtyValues::CoerceOrDrop).unwrap();
        assert!(!d.contains_key("count"));
    }

    #[test]
    fn test_int32_range_enforced() {
        let fields = vec![Field::new("n", FieldType::Int32)];
        let mut d = doc(json!({"id": "1", "n": 3_000_000_000i64}));
        assert!(validate_document(&mut d, &fields, None, DirtyValues::CoerceOrReject).is_err());
    }

    #[test]
    fn test_geopoint_bounds() {
        let fields = vec![Field::new("loc", FieldType::Geopoint)];
        let mut ok = doc(json!({"id": "1", "loc": [48.86, 2.35]}));
        validate_document(&mut ok, &fields, None, DirtyValues::CoerceOrReject).unwrap();

        let mut bad = doc(json!({"id": "1", "loc": [148.86, 2.35]}));
        assert!(validate_document(&mut bad, &fields, None, DirtyValues::CoerceOrReject).is_err());
    }

    #[test]
    fn test_array_elements_coerced() {
        let fields = vec![Field::new("tags", FieldType::StringArray)];
        let mut d = doc(json!({"id": "1", "tags": ["a", 2, true]}));
        validate_document(&mut d, &fields, None, DirtyValues::CoerceOrReject).unwrap();
        assert_eq!(d["tags"], json!(["a", "2", "true"]));
    }

    #[test]
    fn test_fallback_type_applies_to_wildcard() {
        let fields = vec![Field::new(".*", FieldType::Auto)];
        let mut d = doc(json!({"id": "1", "anything": 7}));
        validate_document(
            &mut d,
            &fields,
            Some(FieldType::String),
            DirtyValues::CoerceOrReject,
        )
        .unwrap();
        assert_eq!(d["anything"], json!("7"));
    }

    #[test]
    fn test_flat_key_rejected() {
        let fields = vec![];
        let mut d = doc(json!({"id": "1", ".flat": []}));
        assert!(validate_document(&mut d, &fields, None, DirtyValues::CoerceOrReject).is_err());
    }

    #[test]
    fn test_non_string_id_rejected() {
        let fields = vec![];
        let mut d = doc(json!({"id": 5}));
        assert!(validate_document(&mut d, &fields, None, DirtyValues::CoerceOrReject).is_err());
    }
}
