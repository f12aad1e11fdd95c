//! Field model: types, flags, dynamic fields, references and embeddings.
//!
//! A collection declares an ordered list of [`Field`]s. Dot-paths denote
//! nesting; `.*`-style names declare dynamic fields whose concrete names are
//! discovered from incoming documents. Reference fields create join edges to
//! other collections and get a hidden helper field carrying the resolved
//! seq id of the referenced document.

pub mod alter;
pub mod coerce;
pub mod flatten;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Hidden key inside stored documents listing flattened child field names.
/// No user field may carry this name.
pub const FLAT_FIELDS_KEY: &str = ".flat";

/// Suffix of the hidden helper field that stores a resolved reference seq id.
pub const REFERENCE_HELPER_SUFFIX: &str = "_sequence_id";

/// Returns the helper field name for a reference field.
pub fn reference_helper_name(field: &str) -> String {
    format!("{}{}", field, REFERENCE_HELPER_SUFFIX)
}

/// Concrete field types. Arrays are distinct types; a `float[]` with a
/// dimensionality (`num_dim > 0`) is a dense vector field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "int32")]
    Int32,
    #[serde(rename = "int64")]
    Int64,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "geopoint")]
    Geopoint,
    #[serde(rename = "object")]
    Object,
    #[serde(rename = "int32[]")]
    Int32Array,
    #[serde(rename = "int64[]")]
    Int64Array,
    #[serde(rename = "float[]")]
    FloatArray,
    #[serde(rename = "bool[]")]
    BoolArray,
    #[serde(rename = "string[]")]
    StringArray,
    #[serde(rename = "geopoint[]")]
    GeopointArray,
    #[serde(rename = "object[]")]
    ObjectArray,
    #[serde(rename = "auto")]
    Auto,
}

impl FieldType {
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            FieldType::Int32Array
                | FieldType::Int64Array
                | FieldType::FloatArray
                | FieldType::BoolArray
                | FieldType::StringArray
                | FieldType::GeopointArray
                | FieldType::ObjectArray
        )
    }

    /// Element type of an array type; scalars return themselves.
    pub fn element(&self) -> FieldType {
        match self {
            FieldType::Int32Array => FieldType::Int32,
            FieldType::Int64Array => FieldType::Int64,
            FieldType::FloatArray => FieldType::Float,
            FieldType::BoolArray => FieldType::Bool,
            FieldType::StringArray => FieldType::String,
            FieldType::GeopointArray => FieldType::Geopoint,
            FieldType::ObjectArray => FieldType::Object,
            other => *other,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self.element(),
            FieldType::Int32 | FieldType::Int64 | FieldType::Float
        )
    }

    pub fn is_string(&self) -> bool {
        matches!(self.element(), FieldType::String)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, FieldType::Object | FieldType::ObjectArray)
    }

    pub fn is_geopoint(&self) -> bool {
        matches!(self, FieldType::Geopoint | FieldType::GeopointArray)
    }

    /// Display name identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::String => "string",
            FieldType::Geopoint => "geopoint",
            FieldType::Object => "object",
            FieldType::Int32Array => "int32[]",
            FieldType::Int64Array => "int64[]",
            FieldType::FloatArray => "float[]",
            FieldType::BoolArray => "bool[]",
            FieldType::StringArray => "string[]",
            FieldType::GeopointArray => "geopoint[]",
            FieldType::ObjectArray => "object[]",
            FieldType::Auto => "auto",
        }
    }
}

/// Distance metric for vector fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorDistanceMetric {
    #[default]
    Cosine,
    /// Inner product.
    Ip,
    /// Euclidean.
    L2,
}

/// Auto-embedding configuration: which fields feed the embedding and which
/// model produces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSpec {
    /// Source fields concatenated into the embedding input.
    pub from: Vec<String>,
    /// Model configuration, dispatched by the embedding module.
    pub model_config: crate::embedding::ModelConfig,
}

/// A declared collection field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub facet: bool,
    #[serde(default)]
    pub sort: bool,
    #[serde(default = "default_true")]
    pub index: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "default_true")]
    pub store: bool,
    #[serde(default)]
    pub infix: bool,
    #[serde(default)]
    pub stem: bool,
    #[serde(default)]
    pub range_index: bool,
    /// Set on flattened children of nested object fields.
    #[serde(default)]
    pub nested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// Per-field overrides of the collection-level character sets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols_to_index: Vec<char>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_separators: Vec<char>,
    /// Dimensionality for vector fields (`float[]` only); 0 means not a vector.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub num_dim: usize,
    #[serde(default)]
    pub vec_dist: VectorDistanceMetric,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<EmbeddingSpec>,
    /// Reference target in `collection.field` form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default)]
    pub async_reference: bool,
}

fn default_true() -> bool {
    true
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl Field {
    /// Plain indexed field with defaults for everything else.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            facet: false,
            sort: false,
            index: true,
            optional: false,
            store: true,
            infix: false,
            stem: false,
            range_index: false,
            nested: false,
            locale: None,
            symbols_to_index: Vec::new(),
            token_separators: Vec::new(),
            num_dim: 0,
            vec_dist: VectorDistanceMetric::default(),
            embed: None,
            reference: None,
            async_reference: false,
        }
    }

    pub fn sortable(mut self) -> Self {
        self.sort = true;
        self
    }

    pub fn faceted(mut self) -> Self {
        self.facet = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Whether this declaration is a pattern (`.*`, `price_.*`, …) rather
    /// than a concrete field name.
    pub fn is_dynamic(&self) -> bool {
        self.name == ".*" || self.name.contains(".*")
    }

    /// Whether `name` matches this dynamic declaration.
    pub fn matches_dynamic(&self, name: &str) -> bool {
        if !self.is_dynamic() {
            return false;
        }
        if self.name == ".*" {
            return true;
        }
        regex::Regex::new(&format!("^{}$", self.name))
            .map(|re| re.is_match(name))
            .unwrap_or(false)
    }

    pub fn is_vector(&self) -> bool {
        self.field_type == FieldType::FloatArray && self.num_dim > 0
    }

    pub fn is_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub fn is_auto_embedding(&self) -> bool {
        self.is_vector() && self.embed.is_some()
    }

    /// Splits a `collection.field` reference target. Errors if this is not a
    /// reference field or the target is malformed.
    pub fn reference_target(&self) -> Result<(String, String)> {
        let raw = self
            .reference
            .as_deref()
            .ok_or_else(|| Error::invalid(format!("Field `{}` is not a reference.", self.name)))?;
        match raw.split_once('.') {
            Some((coll, fname)) if !coll.is_empty() && !fname.is_empty() => {
                Ok((coll.to_string(), fname.to_string()))
            }
            _ => Err(Error::invalid(format!(
                "Invalid reference `{}`: expected `collection.field`.",
                raw
            ))),
        }
    }

    /// Validates a single field declaration.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid("Field name cannot be empty."));
        }
        if self.name == FLAT_FIELDS_KEY {
            return Err(Error::invalid(format!(
                "`{}` is a reserved field name.",
                FLAT_FIELDS_KEY
            )));
        }
        if self.name == "id" {
            return Err(Error::invalid(
                "The `id` field is implicit and cannot be declared.",
            ));
        }
        if self.num_dim > 0 && self.field_type != FieldType::FloatArray {
            return Err(Error::invalid(format!(
                "Field `{}`: only float[] fields can declare num_dim.",
                self.name
            )));
        }
        if let Some(spec) = &self.embed {
            if !self.is_vector() {
                return Err(Error::invalid(format!(
                    "Field `{}`: embed requires a float[] type with num_dim.",
                    self.name
                )));
            }
            if spec.from.is_empty() {
                return Err(Error::invalid(format!(
                    "Field `{}`: embed.from cannot be empty.",
                    self.name
                )));
            }
        }
        if self.is_reference() {
            self.reference_target()?;
            if self.field_type.is_object() {
                return Err(Error::invalid(format!(
                    "Field `{}`: object fields cannot be references.",
                    self.name
                )));
            }
        }
        if self.range_index && !self.field_type.is_numeric() {
            return Err(Error::invalid(format!(
                "Field `{}`: range_index applies to numeric fields only.",
                self.name
            )));
        }
        Ok(())
    }

    /// Finds the declared field (concrete name first, then dynamic patterns,
    /// in declaration order) that governs `name`.
    pub fn resolve<'a>(fields: &'a [Field], name: &str) -> Option<&'a Field> {
        fields
            .iter()
            .find(|f| f.name == name)
            .or_else(|| fields.iter().find(|f| f.matches_dynamic(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_type_serde_names() {
        let ft: FieldType = serde_json::from_str("\"string[]\"").unwrap();
        assert_eq!(ft, FieldType::StringArray);
        assert_eq!(serde_json::to_string(&FieldType::Int32).unwrap(), "\"int32\"");
        assert_eq!(FieldType::GeopointArray.element(), FieldType::Geopoint);
        assert!(FieldType::Int64Array.is_array());
        assert!(FieldType::FloatArray.is_numeric());
    }

    #[test]
    fn test_field_json_defaults() {
        let f: Field = serde_json::from_str(r#"{"name":"title","type":"string"}"#).unwrap();
        assert!(f.index);
        assert!(f.store);
        assert!(!f.facet);
        assert!(!f.optional);
        assert_eq!(f.num_dim, 0);
    }

    #[test]
    fn test_dynamic_field_matching() {
        let wild = Field::new(".*", FieldType::Auto);
        assert!(wild.is_dynamic());
        assert!(wild.matches_dynamic("anything"));

        let prefixed = Field::new("price_.*", FieldType::Float);
        assert!(prefixed.matches_dynamic("price_usd"));
        assert!(!prefixed.matches_dynamic("cost_usd"));

        let concrete = Field::new("title", FieldType::String);
        assert!(!concrete.is_dynamic());
    }

    #[test]
    fn test_resolve_prefers_concrete_over_dynamic() {
        let fields = vec![
            Field::new(".*", FieldType::Auto),
            Field::new("title", FieldType::String),
        ];
        assert_eq!(Field::resolve(&fields, "title").unwrap().name, "title");
        assert_eq!(Field::resolve(&fields, "other").unwrap().name, ".*");
    }

    #[test]
    fn test_vector_field_validation() {
        let mut f = Field::new("emb", FieldType::FloatArray);
        f.num_dim = 4;
        assert!(f.is_vector());
        f.validate().unwrap();

        let mut bad = Field::new("emb", FieldType::Int32Array);
        bad.num_dim = 4;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_reference_target_parse() {
        let mut f = Field::new("product_id", FieldType::String);
        f.reference = Some("products.id".to_string());
        assert_eq!(
            f.reference_target().unwrap(),
            ("products".to_string(), "id".to_string())
        );

        f.reference = Some("malformed".to_string());
        assert!(f.reference_target().is_err());
    }

    #[test]
    fn test_reserved_names_rejected() {
        assert!(Field::new(".flat", FieldType::String).validate().is_err());
        assert!(Field::new("id", FieldType::String).validate().is_err());
    }
}
