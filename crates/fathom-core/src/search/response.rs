//! Search response assembly.
//!
//! Turns ranked hits plus stored documents into the wire shape: pruned
//! documents, nested highlights, decoded text-match info, vector and geo
//! metadata, and the `curated` marker. Hidden internals (`.flat` children,
//! reference helper fields) never leave the engine.

use super::facet::FacetCounts;
use super::highlight::highlight_document;
use super::params::MatchType;
use super::plan::SearchPlan;
use super::sort::{SortBy, SortValue};
use crate::index::RankedHit;
use crate::schema::{flatten::strip_flattened, Field, REFERENCE_HELPER_SUFFIX};
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Decoded view of the packed 64-bit text match score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextMatchInfo {
    pub score: String,
    pub tokens_matched: u8,
    pub best_field_score: String,
    pub best_field_weight: u8,
    pub fields_matched: u8,
    pub typo_prefix_score: u8,
}

/// Decodes a packed text match integer under the given layout.
///
/// `max_score`:  `[sign 1 | tokens_matched 4 | best_field_score 48 | best_field_weight 8 | num_matching_fields 3]`
/// `max_weight`: `[sign 1 | tokens_matched 4 | best_field_weight 8 | best_field_score 48 | num_matching_fields 3]`
pub fn decode_text_match_info(score: u64, match_type: MatchType) -> TextMatchInfo {
    let tokens_matched = ((score >> 59) & 0x0F) as u8;
    let fields_matched = (score & 0x07) as u8;
    let (best_field_score, best_field_weight) = match match_type {
        MatchType::MaxScore => (
            (score >> 11) & 0xFFFF_FFFF_FFFF,
            ((score >> 3) & 0xFF) as u8,
        ),
        MatchType::MaxWeight => (
            (score >> 3) & 0xFFFF_FFFF_FFFF,
            ((score >> 51) & 0xFF) as u8,
        ),
    };
    // The top byte of the field score encodes match quality.
    let typo_prefix_score = 255 - ((best_field_score >> 40) & 0xFF) as u8;
    TextMatchInfo {
        score: score.to_string(),
        tokens_matched,
        best_field_score: best_field_score.to_string(),
        best_field_weight,
        fields_matched,
        typo_prefix_score,
    }
}

/// One search hit.
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub document: Value,
    pub highlight: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlights: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_match: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_match_info: Option<TextMatchInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hybrid_search_info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_distance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_distance_meters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub curated: Option<bool>,
    /// Union searches tag each hit with its source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

/// Hits coalesced under one group key.
#[derive(Debug, Clone, Serialize)]
pub struct GroupedHit {
    pub group_key: Vec<Value>,
    pub found: u64,
    pub hits: Vec<Hit>,
}

/// The search response shape.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub found: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_docs: Option<u32>,
    pub out_of: u32,
    pub page: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hits: Option<Vec<Hit>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grouped_hits: Option<Vec<GroupedHit>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub facet_counts: Vec<FacetCounts>,
    pub search_cutoff: bool,
    pub request_params: Value,
}

/// Prunes a stored document into its client-visible form: flattened
/// children and reference helpers are stripped, then include/exclude field
/// selections are applied.
pub fn prune_document(
    doc: &Map<String, Value>,
    include_fields: &[String],
    exclude_fields: &[String],
) -> Value {
    let mut doc = doc.clone();
    strip_flattened(&mut doc);
    let helper_keys: Vec<String> = doc
        .keys()
        .filter(|k| k.ends_with(REFERENCE_HELPER_SUFFIX))
        .cloned()
        .collect();
    for key in helper_keys {
        doc.remove(&key);
    }

    if !include_fields.is_empty() {
        doc.retain(|key, _| key == "id" || include_fields.iter().any(|f| f == key));
    }
    for field in exclude_fields {
        doc.remove(field);
    }
    Value::Object(doc)
}

/// Builds one response hit from a ranked hit and its stored document.
#[allow(clippy::too_many_arguments)]
pub fn assemble_hit(
    ranked: &RankedHit,
    doc: &Map<String, Value>,
    plan: &SearchPlan,
    fields: &[Field],
    collection_symbols: &[char],
    collection_separators: &[char],
    curated: bool,
) -> Hit {
    let document = prune_document(doc, &plan.include_fields, &plan.exclude_fields);
    let (highlight, highlights_v1) = highlight_document(
        doc,
        fields,
        &plan.highlight,
        &plan.query_tokens,
        collection_symbols,
        collection_separators,
    );

    let text_match = (!plan.is_wildcard).then_some(ranked.text_match);
    let text_match_info = text_match
        .filter(|_| ranked.rank_fusion_score.is_none())
        .map(|score| decode_text_match_info(score, plan.match_type));

    let geo_distance_meters = geo_distances(ranked, plan);

    Hit {
        document,
        highlight,
        highlights: plan.highlight.v1.then_some(highlights_v1),
        text_match,
        text_match_info,
        hybrid_search_info: ranked
            .rank_fusion_score
            .map(|score| json!({ "rank_fusion_score": score })),
        vector_distance: ranked.vector_distance,
        geo_distance_meters,
        curated: curated.then_some(true),
        search_index: plan.is_union.then_some(plan.union_search_index),
        collection: None,
    }
}

/// Distances per geo sort clause: `{field: meters}`.
fn geo_distances(ranked: &RankedHit, plan: &SearchPlan) -> Option<Value> {
    let mut out = Map::new();
    for (i, clause) in plan.sort.iter().enumerate() {
        if let SortBy::GeoDistance { field, .. } = &clause.by {
            if let Some(SortValue::Int(meters)) = ranked.keys.get(i) {
                out.insert(field.clone(), json!(meters));
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(Value::Object(out))
    }
}

/// Echo of the request parameters included in every response.
pub fn request_params_echo(
    collection: &str,
    query: &str,
    per_page: usize,
) -> Value {
    json!({
        "collection_name": collection,
        "q": query,
        "per_page": per_page,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::params::MatchType;

    #[test]
    fn test_text_match_roundtrip_max_score() {
        let field_score = (250u64 << 40) | 12;
        let packed = crate::index::pack_text_match(MatchType::MaxScore, 3, field_score, 14, 2);
        let info = decode_text_match_info(packed, MatchType::MaxScore);
        assert_eq!(info.tokens_matched, 3);
        assert_eq!(info.best_field_weight, 14);
        assert_eq!(info.fields_matched, 2);
        assert_eq!(info.best_field_score, field_score.to_string());
        assert_eq!(info.typo_prefix_score, 5);
    }

    #[test]
    fn test_text_match_roundtrip_max_weight() {
        let field_score = (255u64 << 40) | 7;
        let packed = crate::index::pack_text_match(MatchType::MaxWeight, 2, field_score, 9, 1);
        let info = decode_text_match_info(packed, MatchType::MaxWeight);
        assert_eq!(info.tokens_matched, 2);
        assert_eq!(info.best_field_weight, 9);
        assert_eq!(info.fields_matched, 1);
        assert_eq!(info.typo_prefix_score, 0);
    }

    #[test]
    fn test_prune_strips_hidden_internals() {
        let doc = serde_json::json!({
            "id": "1",
            "title": "Red",
            "author": {"name": "Ada"},
            "author.name": "Ada",
            ".flat": ["author.name"],
            "brand_id": "b1",
            "brand_id_sequence_id": 42
        });
        let pruned = prune_document(doc.as_object().unwrap(), &[], &[]);
        let obj = pruned.as_object().unwrap();
        assert!(!obj.contains_key(".flat"));
        assert!(!obj.contains_key("author.name"));
        assert!(!obj.contains_key("brand_id_sequence_id"));
        assert!(obj.contains_key("brand_id"));
        assert!(obj.contains_key("author"));
    }

    #[test]
    fn test_prune_include_exclude() {
        let doc = serde_json::json!({"id": "1", "a": 1, "b": 2, "c": 3});
        let included = prune_document(
            doc.as_object().unwrap(),
            &["a".to_string()],
            &[],
        );
        let obj = included.as_object().unwrap();
        assert!(obj.contains_key("id") && obj.contains_key("a"));
        assert!(!obj.contains_key("b"));

        let excluded = prune_document(doc.as_object().unwrap(), &[], &["b".to_string()]);
        let obj = excluded.as_object().unwrap();
        assert!(obj.contains_key("a") && obj.contains_key("c"));
        assert!(!obj.contains_key("b"));
    }
}
