//! In-memory field index.
//!
//! [`MemoryIndex`] is the engine's opaque ranking collaborator. The public
//! surface is the contract the search pipeline consumes: `run_search` over a
//! plan-shaped request plus a filter id set, per-atom filter matching, sort
//! value access, geo distances, reference helper lookups, vector search and
//! batch (re)indexing. Everything below that surface - posting layout,
//! match expansion, facet counting - is internal and deliberately simple.

mod vector;

pub use vector::VectorStore;

use crate::error::{Error, Result};
use crate::schema::{Field, FieldType};
use crate::search::facet::{FacetCount, FacetCounts, FacetSpec, FacetStats};
use crate::search::filter::{intersect_sorted, Comparator, FilterAtom, GeoFilter};
use crate::search::params::{DropTokensMode, MatchType};
use crate::search::sort::{compare_keys, SortRuntime, SortValue};
use crate::tokenizer::Tokenizer;
use crate::SeqId;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;
use tracing::debug;

/// Reciprocal-rank-fusion constant for hybrid (text + vector) ranking.
const RRF_K: f32 = 60.0;

/// Match quality bytes packed into the top of the 48-bit field score.
const QUALITY_EXACT: u8 = 255;
const QUALITY_PREFIX: u8 = 254;
const QUALITY_INFIX: u8 = 253;

/// One ranked candidate coming out of [`MemoryIndex::run_search`].
#[derive(Debug, Clone)]
pub struct RankedHit {
    pub seq_id: SeqId,
    pub keys: Vec<SortValue>,
    pub text_match: u64,
    pub vector_distance: Option<f32>,
    pub rank_fusion_score: Option<f32>,
    /// For group queries: the group key and its members (leader first).
    pub group_key: Option<String>,
    pub group_members: Vec<SeqId>,
    pub group_found: u64,
}

/// What the index needs from the plan to rank.
pub struct IndexSearchRequest<'a> {
    pub tokens: Vec<String>,
    pub exclude_tokens: Vec<String>,
    /// `(field, weight)` pairs, descending weight.
    pub weighted_fields: Vec<(String, u8)>,
    /// Parallel to `weighted_fields`.
    pub field_prefix: Vec<bool>,
    pub field_infix: Vec<bool>,
    pub match_type: MatchType,
    pub is_wildcard: bool,
    /// Sorted filter result, `None` when no filter was given.
    pub filter_ids: Option<Vec<SeqId>>,
    pub excluded_ids: &'a HashSet<SeqId>,
    pub included_ids: &'a [SeqId],
    pub sort: &'a SortRuntime,
    pub fetch_size: usize,
    pub group_by: &'a [String],
    pub group_limit: usize,
    pub group_missing_values: bool,
    pub facets: &'a [FacetSpec],
    pub facet_query: Option<(String, String)>,
    pub facet_sample_percent: u32,
    pub facet_sample_threshold: usize,
    pub max_facet_values: usize,
    /// `(field, query vector, k)` for vector and hybrid queries.
    pub vector: Option<(String, Vec<f32>, usize)>,
    pub drop_tokens_threshold: usize,
    pub drop_tokens_mode: DropTokensMode,
    pub deadline: Option<Instant>,
}

/// Output of one ranking pass.
#[derive(Default)]
pub struct IndexSearchOutput {
    pub raw_hits: Vec<RankedHit>,
    pub override_hits: Vec<RankedHit>,
    /// Groups (or documents, without group_by) that matched.
    pub found: u32,
    /// Documents that matched, group members included.
    pub found_docs: u32,
    pub groups_processed: u32,
    pub all_result_ids_len: usize,
    pub facet_counts: Vec<FacetCounts>,
    pub search_cutoff: bool,
}

enum FieldStore {
    Text {
        /// token -> sorted seq ids
        postings: HashMap<String, Vec<SeqId>>,
        /// doc -> normalized token stream (duplicates kept, in order)
        tokens: HashMap<SeqId, Vec<String>>,
        /// doc -> original full values (facet display, string sorting)
        values: HashMap<SeqId, Vec<String>>,
    },
    I64 {
        values: HashMap<SeqId, Vec<i64>>,
    },
    F64 {
        values: HashMap<SeqId, Vec<f64>>,
    },
    Bool {
        values: HashMap<SeqId, Vec<bool>>,
    },
    Geo {
        points: HashMap<SeqId, Vec<(f64, f64)>>,
    },
    Vector(VectorStore),
}

impl FieldStore {
    fn remove(&mut self, seq_id: SeqId) {
        match self {
            FieldStore::Text {
                postings,
                tokens,
                values,
            } => {
                if let Some(doc_tokens) = tokens.remove(&seq_id) {
                    for token in doc_tokens {
                        if let Some(ids) = postings.get_mut(&token) {
                            ids.retain(|id| *id != seq_id);
                            if ids.is_empty() {
                                postings.remove(&token);
                            }
                        }
                    }
                }
                values.remove(&seq_id);
            }
            FieldStore::I64 { values } => {
                values.remove(&seq_id);
            }
            FieldStore::F64 { values } => {
                values.remove(&seq_id);
            }
            FieldStore::Bool { values } => {
                values.remove(&seq_id);
            }
            FieldStore::Geo { points } => {
                points.remove(&seq_id);
            }
            FieldStore::Vector(store) => store.remove(seq_id),
        }
    }

    fn doc_ids(&self) -> Vec<SeqId> {
        let mut ids: Vec<SeqId> = match self {
            FieldStore::Text { tokens, .. } => tokens.keys().copied().collect(),
            FieldStore::I64 { values } => values.keys().copied().collect(),
            FieldStore::F64 { values } => values.keys().copied().collect(),
            FieldStore::Bool { values } => values.keys().copied().collect(),
            FieldStore::Geo { points } => points.keys().copied().collect(),
            FieldStore::Vector(_) => Vec::new(),
        };
        ids.sort_unstable();
        ids
    }
}

/// The per-collection in-memory index.
pub struct MemoryIndex {
    fields: HashMap<String, FieldStore>,
    all_ids: BTreeSet<SeqId>,
    symbols_to_index: Vec<char>,
    token_separators: Vec<char>,
}

impl MemoryIndex {
    pub fn new(symbols_to_index: &[char], token_separators: &[char]) -> Self {
        Self {
            fields: HashMap::new(),
            all_ids: BTreeSet::new(),
            symbols_to_index: symbols_to_index.to_vec(),
            token_separators: token_separators.to_vec(),
        }
    }

    pub fn num_docs(&self) -> usize {
        self.all_ids.len()
    }

    pub fn all_seq_ids(&self) -> Vec<SeqId> {
        self.all_ids.iter().copied().collect()
    }

    fn tokenizer_for(&self, field: &Field) -> Tokenizer {
        let symbols = if field.symbols_to_index.is_empty() {
            &self.symbols_to_index
        } else {
            &field.symbols_to_index
        };
        let separators = if field.token_separators.is_empty() {
            &self.token_separators
        } else {
            &field.token_separators
        };
        Tokenizer::new(symbols, separators, field.locale.as_deref())
    }

    // =========================================================================
    // Indexing
    // =========================================================================

    /// Indexes a batch of `(seq_id, document)` records for the given fields.
    /// Called in ingest batches and by schema alteration with the changed
    /// field subset.
    pub fn batch_memory_index(
        &mut self,
        records: &[(SeqId, &Map<String, Value>)],
        fields: &[Field],
    ) -> Result<()> {
        for (seq_id, doc) in records {
            self.index_document(*seq_id, doc, fields)?;
        }
        Ok(())
    }

    fn index_document(
        &mut self,
        seq_id: SeqId,
        doc: &Map<String, Value>,
        fields: &[Field],
    ) -> Result<()> {
        self.all_ids.insert(seq_id);
        for field in fields {
            if field.is_dynamic() || !field.index {
                continue;
            }
            let Some(value) = doc.get(&field.name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            self.index_field(seq_id, field, value)?;
        }
        // Dynamic declarations index whatever document keys they match.
        for field in fields.iter().filter(|f| f.is_dynamic() && f.index) {
            for (key, value) in doc {
                if key == "id" || value.is_null() || !field.matches_dynamic(key) {
                    continue;
                }
                if fields.iter().any(|f| !f.is_dynamic() && f.name == *key) {
                    continue;
                }
                let mut concrete = field.clone();
                concrete.name = key.clone();
                self.index_field(seq_id, &concrete, value)?;
            }
        }
        Ok(())
    }

    fn index_field(&mut self, seq_id: SeqId, field: &Field, value: &Value) -> Result<()> {
        if field.is_vector() {
            let store = self
                .fields
                .entry(field.name.clone())
                .or_insert_with(|| {
                    FieldStore::Vector(VectorStore::new(field.num_dim, field.vec_dist))
                });
            let FieldStore::Vector(vs) = store else {
                return Err(store_type_error(&field.name));
            };
            let embedding = value_to_f32_vec(value).ok_or_else(|| {
                Error::invalid(format!("Field `{}` must be a float array.", field.name))
            })?;
            return vs.add(seq_id, embedding);
        }

        let target = if field.field_type == FieldType::Auto {
            infer_index_type(value)
        } else {
            field.field_type.element()
        };

        match target {
            FieldType::String => {
                let tokenizer = self.tokenizer_for(field);
                let store = self.fields.entry(field.name.clone()).or_insert_with(|| {
                    FieldStore::Text {
                        postings: HashMap::new(),
                        tokens: HashMap::new(),
                        values: HashMap::new(),
                    }
                });
                let FieldStore::Text {
                    postings,
                    tokens,
                    values,
                } = store
                else {
                    return Err(store_type_error(&field.name));
                };
                let mut doc_tokens = Vec::new();
                let mut doc_values = Vec::new();
                for raw in string_values(value) {
                    for token in tokenizer.tokenize(&raw) {
                        doc_tokens.push(token.text);
                    }
                    doc_values.push(raw);
                }
                for token in doc_tokens.iter() {
                    let ids = postings.entry(token.clone()).or_default();
                    if ids.last() != Some(&seq_id) && !ids.contains(&seq_id) {
                        ids.push(seq_id);
                        ids.sort_unstable();
                    }
                }
                tokens.insert(seq_id, doc_tokens);
                values.insert(seq_id, doc_values);
            }
            FieldType::Int32 | FieldType::Int64 => {
                let store = self
                    .fields
                    .entry(field.name.clone())
                    .or_insert_with(|| FieldStore::I64 {
                        values: HashMap::new(),
                    });
                let FieldStore::I64 { values } = store else {
                    return Err(store_type_error(&field.name));
                };
                values.insert(seq_id, i64_values(value));
            }
            FieldType::Float => {
                let store = self
                    .fields
                    .entry(field.name.clone())
                    .or_insert_with(|| FieldStore::F64 {
                        values: HashMap::new(),
                    });
                let FieldStore::F64 { values } = store else {
                    return Err(store_type_error(&field.name));
                };
                values.insert(seq_id, f64_values(value));
            }
            FieldType::Bool => {
                let store = self
                    .fields
                    .entry(field.name.clone())
                    .or_insert_with(|| FieldStore::Bool {
                        values: HashMap::new(),
                    });
                let FieldStore::Bool { values } = store else {
                    return Err(store_type_error(&field.name));
                };
                values.insert(seq_id, bool_values(value));
            }
            FieldType::Geopoint => {
                let store = self
                    .fields
                    .entry(field.name.clone())
                    .or_insert_with(|| FieldStore::Geo {
                        points: HashMap::new(),
                    });
                let FieldStore::Geo { points } = store else {
                    return Err(store_type_error(&field.name));
                };
                points.insert(seq_id, geo_values(value));
            }
            _ => {}
        }
        Ok(())
    }

    /// Removes a document from every field store.
    pub fn remove(&mut self, seq_id: SeqId, _doc: &Map<String, Value>, _fields: &[Field]) {
        self.all_ids.remove(&seq_id);
        for store in self.fields.values_mut() {
            store.remove(seq_id);
        }
    }

    /// Drops an entire field's store (schema alteration).
    pub fn drop_field(&mut self, name: &str) {
        self.fields.remove(name);
    }

    /// Rebuilds vector graphs that accumulated tombstones.
    pub fn repair_hnsw_index(&mut self) {
        for store in self.fields.values_mut() {
            if let FieldStore::Vector(vs) = store {
                vs.repair();
            }
        }
    }

    // =========================================================================
    // Accessors used by filters, sorting and references
    // =========================================================================

    /// Sorted ids of documents carrying `field`.
    pub fn field_universe(&self, field: &str) -> Vec<SeqId> {
        self.fields
            .get(field)
            .map(|store| store.doc_ids())
            .unwrap_or_default()
    }

    /// Sort key of `field` for one document (first value wins for arrays).
    pub fn sort_value(&self, field: &str, ty: FieldType, seq_id: SeqId) -> SortValue {
        match self.fields.get(field) {
            Some(FieldStore::I64 { values }) => values
                .get(&seq_id)
                .and_then(|v| v.first())
                .map(|v| SortValue::Int(*v))
                .unwrap_or(SortValue::Null),
            Some(FieldStore::F64 { values }) => values
                .get(&seq_id)
                .and_then(|v| v.first())
                .map(|v| SortValue::Float(*v))
                .unwrap_or(SortValue::Null),
            Some(FieldStore::Bool { values }) => values
                .get(&seq_id)
                .and_then(|v| v.first())
                .map(|v| SortValue::Int(*v as i64))
                .unwrap_or(SortValue::Null),
            Some(FieldStore::Text { values, .. }) => values
                .get(&seq_id)
                .and_then(|v| v.first())
                .map(|v| SortValue::Str(v.to_lowercase()))
                .unwrap_or(SortValue::Null),
            _ => {
                let _ = ty;
                SortValue::Null
            }
        }
    }

    /// Haversine distance in meters from `(lat, lng)` to the nearest point
    /// of `field` in the document.
    pub fn geo_distance(&self, field: &str, seq_id: SeqId, lat: f64, lng: f64) -> Option<f64> {
        let Some(FieldStore::Geo { points }) = self.fields.get(field) else {
            return None;
        };
        points.get(&seq_id).and_then(|pts| {
            pts.iter()
                .map(|(plat, plng)| haversine_m(lat, lng, *plat, *plng))
                .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        })
    }

    /// Referenced seq ids stored in a document's helper field.
    pub fn get_related_ids(&self, helper_field: &str, seq_id: SeqId) -> Vec<SeqId> {
        match self.fields.get(helper_field) {
            Some(FieldStore::I64 { values }) => values
                .get(&seq_id)
                .map(|v| {
                    v.iter()
                        .filter(|id| **id >= 0 && (**id as u64) < crate::config::UNRESOLVED_REFERENCE as u64)
                        .map(|id| *id as SeqId)
                        .collect()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Sorted ids of documents whose helper field holds any of `ref_ids`.
    pub fn ids_with_helper_in(&self, helper_field: &str, ref_ids: &HashSet<SeqId>) -> Vec<SeqId> {
        let Some(FieldStore::I64 { values }) = self.fields.get(helper_field) else {
            return Vec::new();
        };
        let mut out: Vec<SeqId> = values
            .iter()
            .filter(|(_, vals)| {
                vals.iter()
                    .any(|v| *v >= 0 && ref_ids.contains(&(*v as SeqId)))
            })
            .map(|(id, _)| *id)
            .collect();
        out.sort_unstable();
        out
    }

    /// Ids ranked below the top `k` by `field` descending (analytics top-K
    /// truncation support).
    pub fn seq_ids_outside_top_k(&self, field: &str, k: usize) -> Vec<SeqId> {
        let Some(FieldStore::I64 { values }) = self.fields.get(field) else {
            return Vec::new();
        };
        let mut ranked: Vec<(i64, SeqId)> = values
            .iter()
            .map(|(id, vals)| (vals.first().copied().unwrap_or(i64::MIN), *id))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let mut out: Vec<SeqId> = ranked.into_iter().skip(k).map(|(_, id)| id).collect();
        out.sort_unstable();
        out
    }

    /// k-NN over a vector field.
    pub fn vector_search(&self, field: &str, query: &[f32], k: usize) -> Result<Vec<(SeqId, f32)>> {
        match self.fields.get(field) {
            Some(FieldStore::Vector(vs)) => vs.search(query, k),
            _ => Err(Error::not_found(format!(
                "Field `{}` is not a vector field.",
                field
            ))),
        }
    }

    /// Stored embedding of one document.
    pub fn stored_vector(&self, field: &str, seq_id: SeqId) -> Option<Vec<f32>> {
        match self.fields.get(field) {
            Some(FieldStore::Vector(vs)) => vs.get(seq_id).cloned(),
            _ => None,
        }
    }

    // =========================================================================
    // Filtering
    // =========================================================================

    /// Sorted ids matching a single filter atom. `!=` complements are the
    /// evaluator's job; this returns the positively matching set.
    pub fn filter_atom_ids(&self, atom: &FilterAtom, field: &Field) -> Result<Vec<SeqId>> {
        if let Some(geo) = &atom.geo {
            return self.geo_filter_ids(&atom.field, geo, field);
        }

        let Some(store) = self.fields.get(&atom.field) else {
            return Ok(Vec::new());
        };

        let mut matched: BTreeSet<SeqId> = BTreeSet::new();
        match store {
            FieldStore::Text {
                postings,
                tokens: _,
                values,
            } => {
                let tokenizer = self.tokenizer_for(field);
                for (value, comparator) in atom.values.iter().zip(&atom.comparators) {
                    match comparator {
                        Comparator::Eq | Comparator::NotEq => {
                            let needle = value.to_lowercase();
                            for (id, vals) in values {
                                if vals.iter().any(|v| v.to_lowercase() == needle) {
                                    matched.insert(*id);
                                }
                            }
                        }
                        Comparator::Contains => {
                            // Every token of the filter value must appear.
                            let needle_tokens: Vec<String> = tokenizer
                                .tokenize(value)
                                .into_iter()
                                .map(|t| t.text)
                                .collect();
                            if needle_tokens.is_empty() {
                                continue;
                            }
                            let mut ids: Option<Vec<SeqId>> = None;
                            for token in &needle_tokens {
                                let token_ids =
                                    postings.get(token).cloned().unwrap_or_default();
                                ids = Some(match ids {
                                    None => token_ids,
                                    Some(acc) => intersect_sorted(&acc, &token_ids),
                                });
                            }
                            matched.extend(ids.unwrap_or_default());
                        }
                        _ => {
                            return Err(Error::invalid(format!(
                                "Field `{}` is a string field: ordering comparisons are not \
                                 supported.",
                                atom.field
                            )))
                        }
                    }
                }
            }
            FieldStore::I64 { values } => {
                collect_numeric_matches(values, atom, |raw| {
                    raw.parse::<i64>().map(|v| v as f64).map_err(|_| {
                        Error::invalid(format!(
                            "Value `{}` is not an integer (field `{}`).",
                            raw, atom.field
                        ))
                    })
                }, |v| *v as f64, &mut matched)?;
            }
            FieldStore::F64 { values } => {
                collect_numeric_matches(values, atom, |raw| {
                    raw.parse::<f64>().map_err(|_| {
                        Error::invalid(format!(
                            "Value `{}` is not a number (field `{}`).",
                            raw, atom.field
                        ))
                    })
                }, |v| *v, &mut matched)?;
            }
            FieldStore::Bool { values } => {
                for (value, comparator) in atom.values.iter().zip(&atom.comparators) {
                    let want = match value.to_lowercase().as_str() {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(Error::invalid(format!(
                                "Value `{}` is not a boolean (field `{}`).",
                                other, atom.field
                            )))
                        }
                    };
                    if !matches!(
                        comparator,
                        Comparator::Eq | Comparator::NotEq | Comparator::Contains
                    ) {
                        return Err(Error::invalid(format!(
                            "Boolean field `{}` only supports equality.",
                            atom.field
                        )));
                    }
                    for (id, vals) in values {
                        if vals.contains(&want) {
                            matched.insert(*id);
                        }
                    }
                }
            }
            FieldStore::Geo { .. } => {
                return Err(Error::invalid(format!(
                    "Geopoint field `{}` needs a geo filter: `(lat, lng, radius)`.",
                    atom.field
                )))
            }
            FieldStore::Vector(_) => {
                return Err(Error::invalid(format!(
                    "Vector field `{}` cannot be filtered.",
                    atom.field
                )))
            }
        }
        Ok(matched.into_iter().collect())
    }

    fn geo_filter_ids(
        &self,
        field_name: &str,
        geo: &GeoFilter,
        _field: &Field,
    ) -> Result<Vec<SeqId>> {
        let Some(FieldStore::Geo { points }) = self.fields.get(field_name) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<SeqId> = Vec::new();
        match geo {
            GeoFilter::Radius {
                lat,
                lng,
                radius_m,
                exact_radius_m,
            } => {
                for (id, pts) in points {
                    let hit = pts.iter().any(|(plat, plng)| {
                        if *radius_m <= *exact_radius_m {
                            haversine_m(*lat, *lng, *plat, *plng) <= *radius_m
                        } else {
                            // Cheap cover: bounding-box approximation.
                            bounding_box_contains(*lat, *lng, *radius_m, *plat, *plng)
                        }
                    });
                    if hit {
                        matched.push(*id);
                    }
                }
            }
            GeoFilter::Polygon { points: polygon } => {
                for (id, pts) in points {
                    if pts
                        .iter()
                        .any(|(plat, plng)| point_in_polygon(*plat, *plng, polygon))
                    {
                        matched.push(*id);
                    }
                }
            }
        }
        matched.sort_unstable();
        Ok(matched)
    }

    // =========================================================================
    // Ranking
    // =========================================================================

    /// Runs one ranking pass over the filtered candidate set. Pure over the
    /// request: all mutation happens at indexing time.
    pub fn run_search(&self, req: &IndexSearchRequest<'_>) -> Result<IndexSearchOutput> {
        let mut out = IndexSearchOutput::default();

        if deadline_exceeded(req.deadline) {
            out.search_cutoff = true;
            return Ok(out);
        }

        // -- candidate gathering ---------------------------------------------
        let mut text_scores: HashMap<SeqId, u64> = HashMap::new();
        let mut candidates: Vec<SeqId> = if req.is_wildcard {
            match &req.filter_ids {
                Some(ids) => ids.clone(),
                None => self.all_seq_ids(),
            }
        } else {
            let ids = self.text_candidates(req, &mut text_scores);
            match &req.filter_ids {
                Some(filter) => intersect_sorted(&ids, filter),
                None => ids,
            }
        };

        // Exclude-token and curation-drop pruning.
        if !req.exclude_tokens.is_empty() {
            let banned = self.ids_with_any_token(&req.exclude_tokens, &req.weighted_fields);
            candidates.retain(|id| !banned.contains(id));
        }
        if !req.excluded_ids.is_empty() {
            candidates.retain(|id| !req.excluded_ids.contains(id));
        }

        // -- vector / hybrid -------------------------------------------------
        let mut vector_distances: HashMap<SeqId, f32> = HashMap::new();
        let mut fusion_scores: HashMap<SeqId, f32> = HashMap::new();
        if let Some((field, query_vec, k)) = &req.vector {
            let k = (*k).max(req.fetch_size).max(1);
            let mut neighbors = self.vector_search(field, query_vec, k + req.excluded_ids.len())?;
            neighbors.retain(|(id, _)| !req.excluded_ids.contains(id));
            if let Some(filter) = &req.filter_ids {
                let filter_set: HashSet<SeqId> = filter.iter().copied().collect();
                neighbors.retain(|(id, _)| filter_set.contains(id));
            }
            neighbors.truncate(k);
            for (id, dist) in &neighbors {
                vector_distances.insert(*id, *dist);
            }

            if req.is_wildcard {
                // Pure vector search: candidate order comes from the graph.
                candidates = neighbors.iter().map(|(id, _)| *id).collect();
                candidates.sort_unstable();
            } else {
                // Hybrid: fuse text and vector rankings reciprocally.
                let mut text_ranked: Vec<SeqId> = candidates.clone();
                text_ranked
                    .sort_by_key(|id| std::cmp::Reverse(text_scores.get(id).copied().unwrap_or(0)));
                for (rank, id) in text_ranked.iter().enumerate() {
                    *fusion_scores.entry(*id).or_insert(0.0) += 1.0 / (RRF_K + rank as f32 + 1.0);
                }
                for (rank, (id, _)) in neighbors.iter().enumerate() {
                    *fusion_scores.entry(*id).or_insert(0.0) += 1.0 / (RRF_K + rank as f32 + 1.0);
                }
                let mut merged: BTreeSet<SeqId> = candidates.iter().copied().collect();
                merged.extend(neighbors.iter().map(|(id, _)| *id));
                candidates = merged.into_iter().collect();
                // Fusion drives the primary (text-match) sort key in hybrid
                // searches; the packed layout is only decoded for pure text.
                for id in &candidates {
                    let fused = fusion_scores.get(id).copied().unwrap_or(0.0);
                    text_scores.insert(*id, (fused * 1e9) as u64);
                }
            }
        }

        out.all_result_ids_len = candidates.len();

        if deadline_exceeded(req.deadline) {
            out.search_cutoff = true;
            return Ok(out);
        }

        // -- facets ----------------------------------------------------------
        out.facet_counts = self.facet_counts(req, &candidates);

        // -- ranking ---------------------------------------------------------
        let hit_of = |seq_id: SeqId| -> RankedHit {
            let text_match = text_scores.get(&seq_id).copied().unwrap_or(0);
            let vector_distance = vector_distances.get(&seq_id).copied();
            RankedHit {
                seq_id,
                keys: Vec::new(),
                text_match,
                vector_distance,
                rank_fusion_score: fusion_scores.get(&seq_id).copied(),
                group_key: None,
                group_members: vec![seq_id],
                group_found: 0,
            }
        };

        let mut hits: Vec<RankedHit> = if req.group_by.is_empty() {
            out.found = candidates.len() as u32;
            out.found_docs = candidates.len() as u32;
            candidates.iter().map(|id| hit_of(*id)).collect()
        } else {
            let grouped = self.group_candidates(req, &candidates);
            out.groups_processed = grouped.len() as u32;
            out.found = grouped.len() as u32;
            out.found_docs = candidates.len() as u32;
            grouped
                .into_iter()
                .map(|(key, members)| {
                    let mut hit = hit_of(members[0]);
                    hit.group_found = members.len() as u64;
                    hit.group_key = Some(key);
                    hit.group_members = members;
                    hit
                })
                .collect()
        };

        for hit in &mut hits {
            hit.keys = req.sort.keys(
                self,
                hit.seq_id,
                hit.text_match,
                hit.vector_distance,
                Some(hit.group_found),
            );
        }
        hits.sort_by(|a, b| compare_keys(&a.keys, &b.keys, &req.sort.sorts));

        // Rank group members under the same key chain so leaders are stable.
        if !req.group_by.is_empty() {
            for hit in &mut hits {
                hit.group_members.truncate(req.group_limit);
            }
        }

        hits.truncate(req.fetch_size);
        out.raw_hits = hits;

        // -- curated includes ------------------------------------------------
        for seq_id in req.included_ids {
            let mut hit = hit_of(*seq_id);
            hit.keys = req.sort.keys(self, *seq_id, hit.text_match, hit.vector_distance, None);
            out.override_hits.push(hit);
        }

        out.search_cutoff = deadline_exceeded(req.deadline);
        debug!(
            found = out.found,
            candidates = out.all_result_ids_len,
            cutoff = out.search_cutoff,
            "Index ranking pass complete"
        );
        Ok(out)
    }

    /// Candidate ids matching the query, with text match scores filled in.
    ///
    /// Candidates are the union of per-token matches. Documents matching
    /// every token outrank partial matches through the `tokens_matched`
    /// bits of the packed score, which is the progressive token-drop
    /// relaxation collapsed into one pass; the drop ordering knobs only
    /// matter to indexes that expand candidates incrementally.
    fn text_candidates(
        &self,
        req: &IndexSearchRequest<'_>,
        text_scores: &mut HashMap<SeqId, u64>,
    ) -> Vec<SeqId> {
        let mut ids: BTreeSet<SeqId> = BTreeSet::new();
        for (i, token) in req.tokens.iter().enumerate() {
            let prefix_ok = i == req.tokens.len() - 1; // last token matches as prefix
            for (fidx, (field, _)) in req.weighted_fields.iter().enumerate() {
                let allow_prefix = prefix_ok && req.field_prefix.get(fidx).copied().unwrap_or(true);
                let allow_infix = req.field_infix.get(fidx).copied().unwrap_or(false);
                ids.extend(self.field_token_ids(field, token, allow_prefix, allow_infix));
            }
        }
        let ids: Vec<SeqId> = ids.into_iter().collect();
        for id in &ids {
            let score = self.text_match_score(*id, &req.tokens, req);
            text_scores.insert(*id, score);
        }
        ids
    }

    fn field_token_ids(
        &self,
        field: &str,
        token: &str,
        allow_prefix: bool,
        allow_infix: bool,
    ) -> Vec<SeqId> {
        let Some(FieldStore::Text { postings, .. }) = self.fields.get(field) else {
            return Vec::new();
        };
        let mut ids: BTreeSet<SeqId> = BTreeSet::new();
        if let Some(exact) = postings.get(token) {
            ids.extend(exact.iter().copied());
        }
        if allow_prefix || allow_infix {
            for (indexed, posting) in postings {
                if indexed.len() <= token.len() {
                    continue;
                }
                let prefix_hit = allow_prefix && indexed.starts_with(token);
                let infix_hit = allow_infix && indexed.contains(token);
                if prefix_hit || infix_hit {
                    ids.extend(posting.iter().copied());
                }
            }
        }
        ids.into_iter().collect()
    }

    fn ids_with_any_token(
        &self,
        tokens: &[String],
        weighted_fields: &[(String, u8)],
    ) -> HashSet<SeqId> {
        let mut banned = HashSet::new();
        for token in tokens {
            for (field, _) in weighted_fields {
                if let Some(FieldStore::Text { postings, .. }) = self.fields.get(field) {
                    if let Some(ids) = postings.get(token) {
                        banned.extend(ids.iter().copied());
                    }
                }
            }
        }
        banned
    }

    /// Packs the 64-bit text-match score for one document.
    fn text_match_score(
        &self,
        seq_id: SeqId,
        tokens: &[String],
        req: &IndexSearchRequest<'_>,
    ) -> u64 {
        let mut best_field_score: u64 = 0;
        let mut best_field_weight: u8 = 0;
        let mut num_matching_fields: u8 = 0;
        let mut tokens_matched: u8 = 0;

        for (fidx, (field, weight)) in req.weighted_fields.iter().enumerate() {
            let Some(FieldStore::Text {
                tokens: doc_tokens, ..
            }) = self.fields.get(field)
            else {
                continue;
            };
            let Some(stream) = doc_tokens.get(&seq_id) else {
                continue;
            };
            let allow_prefix = req.field_prefix.get(fidx).copied().unwrap_or(true);
            let allow_infix = req.field_infix.get(fidx).copied().unwrap_or(false);

            let mut matched_here: u8 = 0;
            let mut freq_sum: u64 = 0;
            let mut quality: u8 = QUALITY_EXACT;
            for (i, token) in tokens.iter().enumerate() {
                let last = i == tokens.len() - 1;
                let exact = stream.iter().filter(|t| *t == token).count() as u64;
                if exact > 0 {
                    matched_here += 1;
                    freq_sum += exact;
                    continue;
                }
                if last && allow_prefix {
                    let prefixed = stream.iter().filter(|t| t.starts_with(token.as_str())).count() as u64;
                    if prefixed > 0 {
                        matched_here += 1;
                        freq_sum += prefixed;
                        quality = quality.min(QUALITY_PREFIX);
                        continue;
                    }
                }
                if allow_infix {
                    let inside = stream.iter().filter(|t| t.contains(token.as_str())).count() as u64;
                    if inside > 0 {
                        matched_here += 1;
                        freq_sum += inside;
                        quality = quality.min(QUALITY_INFIX);
                    }
                }
            }
            if matched_here == 0 {
                continue;
            }
            num_matching_fields = num_matching_fields.saturating_add(1);
            tokens_matched = tokens_matched.max(matched_here);
            let field_score = ((quality as u64) << 40) | freq_sum.min((1 << 40) - 1);
            if field_score > best_field_score
                || (field_score == best_field_score && *weight > best_field_weight)
            {
                best_field_score = field_score;
                best_field_weight = *weight;
            }
        }

        pack_text_match(
            req.match_type,
            tokens_matched.min(15),
            best_field_score,
            best_field_weight,
            num_matching_fields.min(7),
        )
    }

    fn group_candidates(
        &self,
        req: &IndexSearchRequest<'_>,
        candidates: &[SeqId],
    ) -> Vec<(String, Vec<SeqId>)> {
        let mut groups: Vec<(String, Vec<SeqId>)> = Vec::new();
        let mut index_of: HashMap<String, usize> = HashMap::new();
        for id in candidates {
            let mut parts: Vec<String> = Vec::with_capacity(req.group_by.len());
            let mut missing = false;
            for field in req.group_by {
                match self.facet_value_string(field, *id) {
                    Some(v) => parts.push(v),
                    None => {
                        missing = true;
                        parts.push(String::new());
                    }
                }
            }
            let key = if missing && !req.group_missing_values {
                // Each doc missing a group value forms its own group.
                format!("\u{0}{}", id)
            } else {
                parts.join("|")
            };
            match index_of.get(&key) {
                Some(i) => groups[*i].1.push(*id),
                None => {
                    index_of.insert(key.clone(), groups.len());
                    groups.push((key, vec![*id]));
                }
            }
        }
        groups
    }

    fn facet_value_string(&self, field: &str, seq_id: SeqId) -> Option<String> {
        match self.fields.get(field)? {
            FieldStore::Text { values, .. } => values.get(&seq_id)?.first().cloned(),
            FieldStore::I64 { values } => values.get(&seq_id)?.first().map(|v| v.to_string()),
            FieldStore::F64 { values } => values.get(&seq_id)?.first().map(|v| v.to_string()),
            FieldStore::Bool { values } => values.get(&seq_id)?.first().map(|v| v.to_string()),
            _ => None,
        }
    }

    fn facet_counts(&self, req: &IndexSearchRequest<'_>, candidates: &[SeqId]) -> Vec<FacetCounts> {
        let mut results = Vec::with_capacity(req.facets.len());

        // Sampling: count every n-th candidate and scale back up.
        let sample_step = if req.facet_sample_percent < 100
            && candidates.len() > req.facet_sample_threshold
            && req.facet_sample_percent > 0
        {
            (100 / req.facet_sample_percent).max(1) as usize
        } else {
            1
        };

        for spec in req.facets {
            let mut counts: HashMap<String, u32> = HashMap::new();
            let mut numeric: Vec<f64> = Vec::new();

            for id in candidates.iter().step_by(sample_step) {
                match self.fields.get(&spec.field) {
                    Some(FieldStore::Text { values, .. }) => {
                        if let Some(vals) = values.get(id) {
                            for v in vals {
                                *counts.entry(v.clone()).or_insert(0) += 1;
                            }
                        }
                    }
                    Some(FieldStore::I64 { values }) => {
                        if let Some(vals) = values.get(id) {
                            for v in vals {
                                numeric.push(*v as f64);
                                let label = facet_bucket_label(&spec.ranges, *v as f64)
                                    .unwrap_or_else(|| v.to_string());
                                *counts.entry(label).or_insert(0) += 1;
                            }
                        }
                    }
                    Some(FieldStore::F64 { values }) => {
                        if let Some(vals) = values.get(id) {
                            for v in vals {
                                numeric.push(*v);
                                let label = facet_bucket_label(&spec.ranges, *v)
                                    .unwrap_or_else(|| v.to_string());
                                *counts.entry(label).or_insert(0) += 1;
                            }
                        }
                    }
                    Some(FieldStore::Bool { values }) => {
                        if let Some(vals) = values.get(id) {
                            for v in vals {
                                *counts.entry(v.to_string()).or_insert(0) += 1;
                            }
                        }
                    }
                    _ => {}
                }
            }

            let mut entries: Vec<FacetCount> = counts
                .into_iter()
                .map(|(value, count)| FacetCount {
                    value,
                    count: count * sample_step as u32,
                    highlighted: None,
                })
                .collect();

            // Facet query narrows and highlights values by prefix.
            if let Some((fq_field, fq_prefix)) = &req.facet_query {
                if fq_field == &spec.field {
                    entries.retain(|e| e.value.to_lowercase().contains(fq_prefix.as_str()));
                    for entry in &mut entries {
                        let lower = entry.value.to_lowercase();
                        if let Some(pos) = lower.find(fq_prefix.as_str()) {
                            let end = pos + fq_prefix.len();
                            entry.highlighted = Some(format!(
                                "{}<mark>{}</mark>{}",
                                &entry.value[..pos],
                                &entry.value[pos..end],
                                &entry.value[end..]
                            ));
                        }
                    }
                }
            }

            use crate::search::facet::FacetSort;
            use crate::search::sort::SortOrder;
            match &spec.sort {
                FacetSort::CountDesc => {
                    entries.sort_by(|a, b| b.count.cmp(&a.count).then(a.value.cmp(&b.value)))
                }
                FacetSort::Alpha(order) => {
                    entries.sort_by(|a, b| a.value.cmp(&b.value));
                    if *order == SortOrder::Desc {
                        entries.reverse();
                    }
                }
                FacetSort::ByField { name, order } => {
                    // Per facet value, sort by the first co-occurring value of
                    // the named field among candidates carrying it.
                    let mut rank: HashMap<String, f64> = HashMap::new();
                    for id in candidates {
                        if let Some(facet_val) = self.facet_value_string(&spec.field, *id) {
                            if rank.contains_key(&facet_val) {
                                continue;
                            }
                            let key = match self.sort_value(name, FieldType::Float, *id) {
                                SortValue::Float(v) => Some(v),
                                SortValue::Int(v) => Some(v as f64),
                                _ => None,
                            };
                            if let Some(v) = key {
                                rank.insert(facet_val, v);
                            }
                        }
                    }
                    entries.sort_by(|a, b| {
                        let ra = rank.get(&a.value).copied().unwrap_or(f64::MIN);
                        let rb = rank.get(&b.value).copied().unwrap_or(f64::MIN);
                        ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
                    });
                    if *order == SortOrder::Desc {
                        entries.reverse();
                    }
                }
            }
            entries.truncate(req.max_facet_values);

            let stats = if numeric.is_empty() {
                None
            } else {
                let sum: f64 = numeric.iter().sum();
                Some(FacetStats {
                    min: numeric.iter().copied().fold(f64::INFINITY, f64::min),
                    max: numeric.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    sum,
                    avg: sum / numeric.len() as f64,
                    total_values: numeric.len(),
                })
            };

            results.push(FacetCounts {
                field_name: spec.field.clone(),
                counts: entries,
                stats,
            });
        }
        results
    }
}

// =============================================================================
// Text match packing
// =============================================================================

/// Packs the 64-bit text match integer.
///
/// `max_score`:  `[sign 1 | tokens_matched 4 | best_field_score 48 | best_field_weight 8 | num_matching_fields 3]`
/// `max_weight`: `[sign 1 | tokens_matched 4 | best_field_weight 8 | best_field_score 48 | num_matching_fields 3]`
pub fn pack_text_match(
    match_type: MatchType,
    tokens_matched: u8,
    best_field_score: u64,
    best_field_weight: u8,
    num_matching_fields: u8,
) -> u64 {
    let t = (tokens_matched & 0x0F) as u64;
    let s = best_field_score & 0xFFFF_FFFF_FFFF;
    let w = best_field_weight as u64;
    let f = (num_matching_fields & 0x07) as u64;
    match match_type {
        MatchType::MaxScore => (t << 59) | (s << 11) | (w << 3) | f,
        MatchType::MaxWeight => (t << 59) | (w << 51) | (s << 3) | f,
    }
}

// =============================================================================
// Value extraction helpers
// =============================================================================

fn store_type_error(field: &str) -> Error {
    Error::internal(format!(
        "Field `{}` was previously indexed with a different type.",
        field
    ))
}

fn infer_index_type(value: &Value) -> FieldType {
    match value {
        Value::String(_) => FieldType::String,
        Value::Bool(_) => FieldType::Bool,
        Value::Number(n) if n.is_f64() => FieldType::Float,
        Value::Number(_) => FieldType::Int64,
        Value::Array(items) => items.first().map(infer_index_type).unwrap_or(FieldType::Auto),
        _ => FieldType::Auto,
    }
}

fn string_values(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        other => vec![other.to_string()],
    }
}

fn i64_values(value: &Value) -> Vec<i64> {
    match value {
        Value::Number(n) => n.as_i64().into_iter().collect(),
        Value::Array(items) => items.iter().filter_map(|v| v.as_i64()).collect(),
        _ => Vec::new(),
    }
}

fn f64_values(value: &Value) -> Vec<f64> {
    match value {
        Value::Number(n) => n.as_f64().into_iter().collect(),
        Value::Array(items) => items.iter().filter_map(|v| v.as_f64()).collect(),
        _ => Vec::new(),
    }
}

fn bool_values(value: &Value) -> Vec<bool> {
    match value {
        Value::Bool(b) => vec![*b],
        Value::Array(items) => items.iter().filter_map(|v| v.as_bool()).collect(),
        _ => Vec::new(),
    }
}

fn geo_values(value: &Value) -> Vec<(f64, f64)> {
    let as_pair = |v: &Value| -> Option<(f64, f64)> {
        let arr = v.as_array()?;
        if arr.len() == 2 {
            Some((arr[0].as_f64()?, arr[1].as_f64()?))
        } else {
            None
        }
    };
    match value {
        Value::Array(items) => {
            if let Some(pair) = as_pair(value) {
                return vec![pair];
            }
            items.iter().filter_map(as_pair).collect()
        }
        _ => Vec::new(),
    }
}

fn value_to_f32_vec(value: &Value) -> Option<Vec<f32>> {
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect()
    })
}

fn collect_numeric_matches<T: Copy>(
    values: &HashMap<SeqId, Vec<T>>,
    atom: &FilterAtom,
    parse: impl Fn(&str) -> Result<f64>,
    to_f64: impl Fn(&T) -> f64,
    matched: &mut BTreeSet<SeqId>,
) -> Result<()> {
    let mut i = 0;
    while i < atom.values.len() {
        let comparator = atom.comparators[i];
        if comparator == Comparator::Range {
            let low = parse(&atom.values[i])?;
            let high = parse(&atom.values[i + 1])?;
            for (id, vals) in values {
                if vals.iter().any(|v| {
                    let v = to_f64(v);
                    v >= low && v <= high
                }) {
                    matched.insert(*id);
                }
            }
            i += 2;
            continue;
        }
        let needle = parse(&atom.values[i])?;
        for (id, vals) in values {
            let hit = vals.iter().any(|v| {
                let v = to_f64(v);
                match comparator {
                    Comparator::Eq | Comparator::NotEq | Comparator::Contains => v == needle,
                    Comparator::Lt => v < needle,
                    Comparator::Lte => v <= needle,
                    Comparator::Gt => v > needle,
                    Comparator::Gte => v >= needle,
                    Comparator::Range => unreachable!(),
                }
            });
            if hit {
                matched.insert(*id);
            }
        }
        i += 1;
    }
    Ok(())
}

fn facet_bucket_label(ranges: &[crate::search::facet::FacetRange], v: f64) -> Option<String> {
    ranges
        .iter()
        .find(|r| v >= r.low && v < r.high)
        .map(|r| r.label.clone())
}

fn deadline_exceeded(deadline: Option<Instant>) -> bool {
    deadline.map(|d| Instant::now() >= d).unwrap_or(false)
}

/// Haversine great-circle distance in meters.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

fn bounding_box_contains(lat: f64, lng: f64, radius_m: f64, plat: f64, plng: f64) -> bool {
    let lat_delta = radius_m / 111_320.0;
    let lng_delta = radius_m / (111_320.0 * lat.to_radians().cos().abs().max(1e-9));
    (plat - lat).abs() <= lat_delta && (plng - lng).abs() <= lng_delta
}

fn point_in_polygon(lat: f64, lng: f64, polygon: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let n = polygon.len();
    let mut j = n - 1;
    for i in 0..n {
        let (lat_i, lng_i) = polygon[i];
        let (lat_j, lng_j) = polygon[j];
        if ((lng_i > lng) != (lng_j > lng))
            && (lat < (lat_j - lat_i) * (lng - lng_i) / (lng_j - lng_i) + lat_i)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::sort::{ResolvedSort, SortBy, SortOrder};
    use serde_json::json;

    fn fields() -> Vec<Field> {
        vec![
            Field::new("title", FieldType::String),
            Field::new("brand", FieldType::String).faceted(),
            Field::new("price", FieldType::Float).sortable(),
            Field::new("rank", FieldType::Int32).sortable(),
            Field::new("loc", FieldType::Geopoint),
        ]
    }

    fn build_index(docs: &[Value]) -> MemoryIndex {
        let mut index = MemoryIndex::new(&[], &[]);
        let fields = fields();
        let records: Vec<(SeqId, &Map<String, Value>)> = docs
            .iter()
            .enumerate()
            .map(|(i, d)| (i as SeqId, d.as_object().unwrap()))
            .collect();
        index.batch_memory_index(&records, &fields).unwrap();
        index
    }

    fn sample_docs() -> Vec<Value> {
        vec![
            json!({"title": "red running shoes", "brand": "Acme", "price": 120.0, "rank": 5, "loc": [48.86, 2.35]}),
            json!({"title": "blue walking shoes", "brand": "Widgets", "price": 80.0, "rank": 3, "loc": [40.71, -74.00]}),
            json!({"title": "red hat", "brand": "Acme", "price": 20.0, "rank": 9, "loc": [48.85, 2.34]}),
        ]
    }

    fn basic_sort() -> SortRuntime {
        SortRuntime::new(vec![
            ResolvedSort {
                by: SortBy::TextMatch {
                    bucketing: Default::default(),
                },
                order: SortOrder::Desc,
            },
            ResolvedSort {
                by: SortBy::SeqId,
                order: SortOrder::Desc,
            },
        ])
    }

    fn request<'a>(
        tokens: &[&str],
        sort: &'a SortRuntime,
        excluded: &'a HashSet<SeqId>,
    ) -> IndexSearchRequest<'a> {
        IndexSearchRequest {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            exclude_tokens: Vec::new(),
            weighted_fields: vec![("title".to_string(), 15)],
            field_prefix: vec![true],
            field_infix: vec![false],
            match_type: MatchType::MaxScore,
            is_wildcard: tokens.is_empty(),
            filter_ids: None,
            excluded_ids: excluded,
            included_ids: &[],
            sort,
            fetch_size: 10,
            group_by: &[],
            group_limit: 3,
            group_missing_values: true,
            facets: &[],
            facet_query: None,
            facet_sample_percent: 100,
            facet_sample_threshold: 0,
            max_facet_values: 10,
            vector: None,
            drop_tokens_threshold: 1,
            drop_tokens_mode: DropTokensMode::RightToLeft,
            deadline: None,
        }
    }

    #[test]
    fn test_text_search_ranks_better_match_first() {
        let index = build_index(&sample_docs());
        let sort = basic_sort();
        let excluded = HashSet::new();
        let out = index
            .run_search(&request(&["red", "shoes"], &sort, &excluded))
            .unwrap();
        // Doc 0 matches both tokens and leads; docs 1 and 2 match one token
        // each and follow.
        assert_eq!(out.found, 3);
        assert_eq!(out.raw_hits[0].seq_id, 0);
    }

    #[test]
    fn test_wildcard_returns_all() {
        let index = build_index(&sample_docs());
        let sort = basic_sort();
        let excluded = HashSet::new();
        let out = index.run_search(&request(&[], &sort, &excluded)).unwrap();
        assert_eq!(out.found, 3);
        // Wildcard text match is zero, seq id desc breaks the tie.
        assert_eq!(out.raw_hits[0].seq_id, 2);
    }

    #[test]
    fn test_filter_ids_intersect_candidates() {
        let index = build_index(&sample_docs());
        let sort = basic_sort();
        let excluded = HashSet::new();
        let mut req = request(&["shoes"], &sort, &excluded);
        req.filter_ids = Some(vec![1]);
        let out = index.run_search(&req).unwrap();
        assert_eq!(out.found, 1);
        assert_eq!(out.raw_hits[0].seq_id, 1);
    }

    #[test]
    fn test_excluded_ids_dropped() {
        let index = build_index(&sample_docs());
        let sort = basic_sort();
        let excluded: HashSet<SeqId> = [0].into_iter().collect();
        let out = index
            .run_search(&request(&["shoes"], &sort, &excluded))
            .unwrap();
        assert!(out.raw_hits.iter().all(|h| h.seq_id != 0));
    }

    #[test]
    fn test_filter_atom_numeric() {
        let index = build_index(&sample_docs());
        let field = Field::new("price", FieldType::Float);
        let mut atom = FilterAtom::new("price");
        atom.values.push("100".into());
        atom.comparators.push(Comparator::Gt);
        assert_eq!(index.filter_atom_ids(&atom, &field).unwrap(), vec![0]);

        let mut range = FilterAtom::new("price");
        range.values.push("20".into());
        range.values.push("90".into());
        range.comparators.push(Comparator::Range);
        range.comparators.push(Comparator::Range);
        assert_eq!(index.filter_atom_ids(&range, &field).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_filter_atom_string_eq_and_contains() {
        let index = build_index(&sample_docs());
        let field = Field::new("brand", FieldType::String);
        let mut atom = FilterAtom::new("brand");
        atom.values.push("acme".into());
        atom.comparators.push(Comparator::Eq);
        assert_eq!(index.filter_atom_ids(&atom, &field).unwrap(), vec![0, 2]);

        let title = Field::new("title", FieldType::String);
        let mut contains = FilterAtom::new("title");
        contains.values.push("red".into());
        contains.comparators.push(Comparator::Contains);
        assert_eq!(index.filter_atom_ids(&contains, &title).unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_geo_radius_filter() {
        let index = build_index(&sample_docs());
        let field = Field::new("loc", FieldType::Geopoint);
        let mut atom = FilterAtom::new("loc");
        atom.geo = Some(GeoFilter::Radius {
            lat: 48.86,
            lng: 2.35,
            radius_m: 5_000.0,
            exact_radius_m: 10_000.0,
        });
        // Paris docs (0, 2) are within 5km; New York is not.
        assert_eq!(index.filter_atom_ids(&atom, &field).unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_grouping_caps_members_and_counts_groups() {
        let index = build_index(&sample_docs());
        let sort = basic_sort();
        let excluded = HashSet::new();
        let mut req = request(&[], &sort, &excluded);
        let group_by = vec!["brand".to_string()];
        req.group_by = &group_by;
        req.group_limit = 1;
        let out = index.run_search(&req).unwrap();
        assert_eq!(out.found, 2); // Acme, Widgets
        assert_eq!(out.found_docs, 3);
        assert!(out.raw_hits.iter().all(|h| h.group_members.len() <= 1));
    }

    #[test]
    fn test_facet_counts() {
        let index = build_index(&sample_docs());
        let sort = basic_sort();
        let excluded = HashSet::new();
        let mut req = request(&[], &sort, &excluded);
        let facets = vec![crate::search::facet::FacetSpec {
            field: "brand".to_string(),
            sort: Default::default(),
            top_k: false,
            ranges: Vec::new(),
        }];
        req.facets = &facets;
        let out = index.run_search(&req).unwrap();
        let brand = &out.facet_counts[0];
        assert_eq!(brand.field_name, "brand");
        assert_eq!(brand.counts[0].value, "Acme");
        assert_eq!(brand.counts[0].count, 2);
    }

    #[test]
    fn test_vector_hybrid_search() {
        let mut index = MemoryIndex::new(&[], &[]);
        let mut emb = Field::new("emb", FieldType::FloatArray);
        emb.num_dim = 2;
        let fields = vec![Field::new("title", FieldType::String), emb];
        let docs = vec![
            json!({"title": "alpha", "emb": [1.0, 0.0]}),
            json!({"title": "beta", "emb": [0.0, 1.0]}),
        ];
        let records: Vec<(SeqId, &Map<String, Value>)> = docs
            .iter()
            .enumerate()
            .map(|(i, d)| (i as SeqId, d.as_object().unwrap()))
            .collect();
        index.batch_memory_index(&records, &fields).unwrap();

        let sort = SortRuntime::new(vec![ResolvedSort {
            by: SortBy::VectorDistance {
                bucketing: Default::default(),
            },
            order: SortOrder::Asc,
        }]);
        let excluded = HashSet::new();
        let mut req = request(&[], &sort, &excluded);
        req.is_wildcard = true;
        req.vector = Some(("emb".to_string(), vec![1.0, 0.0], 2));
        let out = index.run_search(&req).unwrap();
        assert_eq!(out.raw_hits[0].seq_id, 0);
        assert!(out.raw_hits[0].vector_distance.unwrap() < 1e-6);
    }

    #[test]
    fn test_text_match_pack_layouts() {
        let score = pack_text_match(MatchType::MaxScore, 2, (255u64 << 40) | 7, 14, 1);
        // tokens_matched in bits 59..63
        assert_eq!((score >> 59) & 0x0F, 2);
        assert_eq!((score >> 3) & 0xFF, 14);
        assert_eq!(score & 0x07, 1);

        let by_weight = pack_text_match(MatchType::MaxWeight, 2, (255u64 << 40) | 7, 14, 1);
        assert_eq!((by_weight >> 51) & 0xFF, 14);
        // More tokens matched always dominates either layout.
        let more_tokens = pack_text_match(MatchType::MaxScore, 3, 0, 0, 0);
        assert!(more_tokens > score);
    }

    #[test]
    fn test_seq_ids_outside_top_k() {
        let index = build_index(&sample_docs());
        // rank values: doc0=5, doc1=3, doc2=9 -> top 1 by rank is doc2.
        let outside = index.seq_ids_outside_top_k("rank", 1);
        assert_eq!(outside, vec![0, 1]);
    }

    #[test]
    fn test_remove_purges_everywhere() {
        let mut index = build_index(&sample_docs());
        let doc = sample_docs()[0].as_object().unwrap().clone();
        index.remove(0, &doc, &fields());
        assert_eq!(index.num_docs(), 2);
        assert!(index.field_universe("title").iter().all(|id| *id != 0));

        let sort = basic_sort();
        let excluded = HashSet::new();
        let out = index
            .run_search(&request(&["red"], &sort, &excluded))
            .unwrap();
        assert!(out.raw_hits.iter().all(|h| h.seq_id != 0));
    }

    #[test]
    fn test_related_ids_skip_unresolved_sentinel() {
        let mut index = MemoryIndex::new(&[], &[]);
        let helper = Field::new("cats_sequence_id", FieldType::Int64Array);
        let doc = json!({
            "cats_sequence_id": [3, crate::config::UNRESOLVED_REFERENCE as i64, 9]
        });
        index
            .batch_memory_index(&[(0, doc.as_object().unwrap())], &[helper])
            .unwrap();
        assert_eq!(index.get_related_ids("cats_sequence_id", 0), vec![3, 9]);
        assert!(index.get_related_ids("cats_sequence_id", 5).is_empty());
    }

    #[test]
    fn test_haversine_sanity() {
        // Paris to London is roughly 344 km.
        let d = haversine_m(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((d - 344_000.0).abs() < 10_000.0);
    }
}
