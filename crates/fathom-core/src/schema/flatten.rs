//! Nested field flattening.
//!
//! When nested fields are enabled, object and object-array fields are
//! flattened into auxiliary primitive-typed dot-path fields so the index
//! only ever sees primitives. The names of the flattened children are kept
//! inside the stored document under the hidden [`FLAT_FIELDS_KEY`] list and
//! stripped before documents are returned to clients.

use super::{Field, FieldType, FLAT_FIELDS_KEY};
use crate::error::{Error, Result};
use serde_json::{Map, Value};

/// Flattens every nested object field of `doc` in place. Returns the
/// discovered child fields (marked `nested`) so the caller can index them.
pub fn flatten_document(doc: &mut Map<String, Value>, fields: &[Field]) -> Result<Vec<Field>> {
    let mut flat_fields: Vec<Field> = Vec::new();
    let mut flat_values: Map<String, Value> = Map::new();

    for field in fields.iter().filter(|f| f.field_type.is_object()) {
        let Some(value) = doc.get(&field.name) else {
            continue;
        };
        match (&field.field_type, value) {
            (FieldType::Object, Value::Object(inner)) => {
                flatten_object(&field.name, inner, &mut flat_values, false)?;
            }
            (FieldType::ObjectArray, Value::Array(items)) => {
                for item in items {
                    let Value::Object(inner) = item else {
                        return Err(Error::invalid(format!(
                            "Field `{}` must contain objects.",
                            field.name
                        )));
                    };
                    flatten_object(&field.name, inner, &mut flat_values, true)?;
                }
            }
            _ => {
                return Err(Error::invalid(format!(
                    "Field `{}` must be of type {}.",
                    field.name,
                    field.field_type.as_str()
                )));
            }
        }
    }

    if flat_values.is_empty() {
        return Ok(flat_fields);
    }

    let mut names: Vec<Value> = Vec::with_capacity(flat_values.len());
    for (name, value) in flat_values {
        let Some(child_type) = infer_type(&value) else {
            continue;
        };
        let mut child = Field::new(name.clone(), child_type);
        child.nested = true;
        child.optional = true;
        // Flattened values are index-only copies; the nested original is
        // what gets stored and returned.
        child.store = false;
        names.push(Value::String(name.clone()));
        doc.insert(name, value);
        flat_fields.push(child);
    }
    doc.insert(FLAT_FIELDS_KEY.to_string(), Value::Array(names));

    Ok(flat_fields)
}

/// Removes flattened children and the hidden list from a stored document,
/// producing the client-visible form.
pub fn strip_flattened(doc: &mut Map<String, Value>) {
    let Some(Value::Array(names)) = doc.remove(FLAT_FIELDS_KEY) else {
        return;
    };
    for name in names {
        if let Value::String(name) = name {
            doc.remove(&name);
        }
    }
}

fn flatten_object(
    prefix: &str,
    obj: &Map<String, Value>,
    out: &mut Map<String, Value>,
    array_context: bool,
) -> Result<()> {
    for (key, value) in obj {
        let path = format!("{}.{}", prefix, key);
        match value {
            Value::Object(inner) => flatten_object(&path, inner, out, array_context)?,
            Value::Array(items) if items.iter().all(|v| v.is_object()) && !items.is_empty() => {
                for item in items {
                    if let Value::Object(inner) = item {
                        flatten_object(&path, inner, out, true)?;
                    }
                }
            }
            leaf => {
                if array_context {
                    // Leaves under an array parent accumulate into an array
                    // to preserve element correspondence.
                    match out.get_mut(&path) {
                        Some(Value::Array(existing)) => existing.push(leaf.clone()),
                        _ => {
                            out.insert(path, Value::Array(vec![leaf.clone()]));
                        }
                    }
                } else {
                    out.insert(path, leaf.clone());
                }
            }
        }
    }
    Ok(())
}

fn infer_type(value: &Value) -> Option<FieldType> {
    match value {
        Value::String(_) => Some(FieldType::String),
        Value::Bool(_) => Some(FieldType::Bool),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Some(FieldType::Int64)
            } else {
                Some(FieldType::Float)
            }
        }
        Value::Array(items) => {
            let first = items.first()?;
            match infer_type(first)? {
                FieldType::String => Some(FieldType::StringArray),
                FieldType::Bool => Some(FieldType::BoolArray),
                FieldType::Int64 => Some(FieldType::Int64Array),
                FieldType::Float => Some(FieldType::FloatArray),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_flatten_simple_object() {
        let fields = vec![Field::new("author", FieldType::Object)];
        let mut d = doc(json!({
            "id": "1",
            "author": {"name": "Ada", "age": 36}
        }));
        let children = flatten_document(&mut d, &fields).unwrap();

        assert_eq!(d["author.name"], json!("Ada"));
        assert_eq!(d["author.age"], json!(36));
        let names: Vec<&str> = d[FLAT_FIELDS_KEY]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(names.contains(&"author.name"));
        assert!(children.iter().all(|f| f.nested && f.optional));
    }

    #[test]
    fn test_flatten_object_array_preserves_correspondence() {
        let fields = vec![Field::new("variants", FieldType::ObjectArray)];
        let mut d = doc(json!({
            "id": "1",
            "variants": [{"color": "red", "stock": 1}, {"color": "blue", "stock": 0}]
        }));
        flatten_document(&mut d, &fields).unwrap();

        assert_eq!(d["variants.color"], json!(["red", "blue"]));
        assert_eq!(d["variants.stock"], json!([1, 0]));
    }

    #[test]
    fn test_flatten_deeply_nested() {
        let fields = vec![Field::new("meta", FieldType::Object)];
        let mut d = doc(json!({
            "id": "1",
            "meta": {"geo": {"city": "Paris"}}
        }));
        flatten_document(&mut d, &fields).unwrap();
        assert_eq!(d["meta.geo.city"], json!("Paris"));
    }

    #[test]
    fn test_strip_flattened_restores_client_shape() {
        let fields = vec![Field::new("author", FieldType::Object)];
        let original = json!({"id": "1", "author": {"name": "Ada"}});
        let mut d = doc(original.clone());
        flatten_document(&mut d, &fields).unwrap();
        assert!(d.contains_key("author.name"));

        strip_flattened(&mut d);
        assert_eq!(Value::Object(d), original);
    }

    #[test]
    fn test_non_object_value_rejected() {
        let fields = vec![Field::new("author", FieldType::Object)];
        let mut d = doc(json!({"id": "1", "author": "Ada"}));
        assert!(flatten_document(&mut d, &fields).is_err());
    }
}
