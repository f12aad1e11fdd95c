//! Sort clause parsing, validation and key evaluation.
//!
//! A `sort_by` string is a comma list of clauses, each `name:order` with an
//! optional parenthesized parameter suffix. Besides plain sortable fields,
//! the recognized pseudo-fields are `_text_match`, `_vector_distance`,
//! `_vector_query`, `_eval`, `_random_order`, `_seq_id`, `_group_found` and
//! `_union_search_index`; geopoint fields take `(lat, lng, ...)` parameters
//! and numeric fields accept a decay-function suffix.

use super::filter::{parse_filter, FilterNode};
use crate::config::MAX_SORT_CLAUSES;
use crate::error::{Error, Result};
use crate::index::MemoryIndex;
use crate::schema::{Field, FieldType};
use crate::SeqId;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(Error::invalid(format!(
                "`{}` is not a valid sort order: use asc or desc.",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Where documents without a sortable value land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingValues {
    First,
    #[default]
    Last,
}

/// Bucketed rescoring parameters for `_text_match` / `_vector_distance`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bucketing {
    pub buckets: Option<usize>,
    pub bucket_size: Option<usize>,
}

impl Bucketing {
    pub fn is_set(&self) -> bool {
        self.buckets.is_some() || self.bucket_size.is_some()
    }
}

/// Decay function applied to a numeric/date sort field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayFunction {
    Gauss,
    Exp,
    Linear,
    Diff,
}

impl DecayFunction {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "gauss" => Ok(DecayFunction::Gauss),
            "exp" => Ok(DecayFunction::Exp),
            "linear" => Ok(DecayFunction::Linear),
            "diff" => Ok(DecayFunction::Diff),
            other => Err(Error::invalid(format!(
                "`{}` is not a decay function: use gauss, exp, linear or diff.",
                other
            ))),
        }
    }
}

/// Inline k-NN query, used by `_vector_query` sorting and the top-level
/// `vector_query` parameter. `values`, `doc_id` and `queries` are the three
/// resolution paths; the plan builder turns whichever is present into the
/// final dense vector.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VectorQuerySpec {
    pub field: String,
    pub values: Vec<f32>,
    pub doc_id: Option<String>,
    pub queries: Vec<String>,
    pub query_weights: Vec<f32>,
    pub k: usize,
}

/// A fully resolved sort clause.
#[derive(Debug, Clone, PartialEq)]
pub enum SortBy {
    Field {
        name: String,
        ty: FieldType,
    },
    TextMatch {
        bucketing: Bucketing,
    },
    VectorDistance {
        bucketing: Bucketing,
    },
    VectorQuery {
        spec: VectorQuerySpec,
        /// Filled by the plan builder after embedding/lookup.
        vector: Vec<f32>,
    },
    Eval {
        exprs: Vec<(FilterNode, i64)>,
    },
    RandomOrder {
        seed: u64,
    },
    SeqId,
    GroupFound,
    UnionSearchIndex,
    GeoDistance {
        field: String,
        lat: f64,
        lng: f64,
        exclude_radius_m: Option<f64>,
        precision_m: Option<f64>,
    },
    Decay {
        field: String,
        func: DecayFunction,
        origin: f64,
        scale: f64,
        offset: f64,
        decay: f64,
        missing_values: MissingValues,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSort {
    pub by: SortBy,
    pub order: SortOrder,
}

impl ResolvedSort {
    /// Declared sort *type*, compared positionally across union sub-searches.
    pub fn type_name(&self) -> &'static str {
        match &self.by {
            SortBy::Field { ty, .. } => ty.as_str(),
            SortBy::TextMatch { .. } => "text_match",
            SortBy::VectorDistance { .. } => "vector_distance",
            SortBy::VectorQuery { .. } => "vector_query",
            SortBy::Eval { .. } => "eval",
            SortBy::RandomOrder { .. } => "random",
            SortBy::SeqId => "seq_id",
            SortBy::GroupFound => "group_found",
            SortBy::UnionSearchIndex => "union_search_index",
            SortBy::GeoDistance { .. } => "geopoint",
            SortBy::Decay { .. } => "decay",
        }
    }

    pub fn bucketing(&self) -> Option<Bucketing> {
        match &self.by {
            SortBy::TextMatch { bucketing } | SortBy::VectorDistance { bucketing } => {
                Some(*bucketing)
            }
            _ => None,
        }
    }
}

/// A single computed sort key.
#[derive(Debug, Clone, PartialEq)]
pub enum SortValue {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

/// Total order over sort values: `Null` sorts below everything, numbers
/// cross-compare as floats, NaN collapses to equal.
pub fn compare_values(a: &SortValue, b: &SortValue) -> Ordering {
    use SortValue::*;
    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Int(x), Int(y)) => x.cmp(y),
        (Float(x), Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Int(x), Float(y)) => (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal),
        (Float(x), Int(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal),
        (Str(x), Str(y)) => x.cmp(y),
        (Str(_), _) => Ordering::Greater,
        (_, Str(_)) => Ordering::Less,
    }
}

/// Lexicographic comparison over key vectors under the clause orders.
/// Returns the ordering of `a` relative to `b` in final result order
/// (`Less` = `a` ranks earlier).
pub fn compare_keys(a: &[SortValue], b: &[SortValue], sorts: &[ResolvedSort]) -> Ordering {
    for (i, sort) in sorts.iter().enumerate() {
        let (ka, kb) = match (a.get(i), b.get(i)) {
            (Some(ka), Some(kb)) => (ka, kb),
            _ => break,
        };
        let ord = compare_values(ka, kb);
        let ord = match sort.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Query properties that drive the default sort chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortQueryInfo {
    pub is_wildcard: bool,
    pub has_vector_query: bool,
    pub is_union: bool,
}

/// Splits a `sort_by` string into clause strings, respecting parens and
/// brackets.
pub fn split_sort_clauses(raw: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in raw.chars() {
        match c {
            '(' | '[' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                if !current.trim().is_empty() {
                    clauses.push(current.trim().to_string());
                }
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        clauses.push(current.trim().to_string());
    }
    clauses
}

/// Splits one clause into `(name, params, order)`. The order suffix is the
/// text after the last top-level `:`.
fn split_clause(raw: &str) -> Result<(String, Option<String>, SortOrder)> {
    let raw = raw.trim();
    let mut depth = 0i32;
    let mut last_colon: Option<usize> = None;
    for (i, c) in raw.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ':' if depth == 0 => last_colon = Some(i),
            _ => {}
        }
    }
    let Some(colon) = last_colon else {
        return Err(Error::invalid(format!(
            "Sort clause `{}` is missing its order (`:asc` or `:desc`).",
            raw
        )));
    };
    let order = SortOrder::parse(&raw[colon + 1..])?;
    let head = raw[..colon].trim();
    match head.find('(') {
        Some(open) if head.ends_with(')') => {
            let name = head[..open].trim().to_string();
            let params = head[open + 1..head.len() - 1].to_string();
            Ok((name, Some(params), order))
        }
        _ => Ok((head.to_string(), None, order)),
    }
}

/// Parses `key: value` parameter lists (used by bucketing, geo and decay
/// suffixes).
fn parse_kv_params(raw: &str) -> Vec<(String, String)> {
    split_sort_clauses(raw)
        .into_iter()
        .filter_map(|part| {
            part.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

fn parse_bucketing(params: Option<&str>) -> Result<Bucketing> {
    let mut bucketing = Bucketing::default();
    let Some(params) = params else {
        return Ok(bucketing);
    };
    for (key, value) in parse_kv_params(params) {
        let parsed: usize = value
            .parse()
            .map_err(|_| Error::invalid(format!("`{}` must be a positive integer.", key)))?;
        if parsed == 0 {
            return Err(Error::invalid(format!("`{}` must be greater than zero.", key)));
        }
        match key.as_str() {
            "buckets" => bucketing.buckets = Some(parsed),
            "bucket_size" => bucketing.bucket_size = Some(parsed),
            other => {
                return Err(Error::invalid(format!(
                    "`{}` is not a valid bucketing parameter.",
                    other
                )))
            }
        }
    }
    Ok(bucketing)
}

/// Parses a vector query expression: `field:([0.1, 0.2], k:10, id: docid)`.
pub fn parse_vector_query(raw: &str) -> Result<VectorQuerySpec> {
    let raw = raw.trim();
    let (field, rest) = raw
        .split_once(':')
        .ok_or_else(|| Error::invalid("A vector query must look like `field:([...])`."))?;
    let rest = rest.trim();
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| Error::invalid("A vector query must wrap its parameters in parens."))?;

    let mut spec = VectorQuerySpec {
        field: field.trim().to_string(),
        k: 0,
        ..Default::default()
    };

    for part in split_sort_clauses(inner) {
        if let Some(values) = part.strip_prefix('[') {
            let values = values.strip_suffix(']').unwrap_or(values);
            for v in values.split(',') {
                let v = v.trim();
                if v.is_empty() {
                    continue;
                }
                spec.values.push(v.parse::<f32>().map_err(|_| {
                    Error::invalid(format!("`{}` is not a valid vector component.", v))
                })?);
            }
            continue;
        }
        let Some((key, value)) = part.split_once(':') else {
            return Err(Error::invalid(format!(
                "`{}` is not a valid vector query parameter.",
                part
            )));
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "k" => {
                spec.k = value
                    .parse()
                    .map_err(|_| Error::invalid("`k` must be a positive integer."))?
            }
            "id" => spec.doc_id = Some(value.to_string()),
            "queries" => {
                let list = value
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .split(',');
                spec.queries = list
                    .map(|q| q.trim().trim_matches('`').to_string())
                    .filter(|q| !q.is_empty())
                    .collect();
            }
            "query_weights" => {
                let list = value
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .split(',');
                for w in list {
                    let w = w.trim();
                    if w.is_empty() {
                        continue;
                    }
                    spec.query_weights.push(w.parse::<f32>().map_err(|_| {
                        Error::invalid(format!("`{}` is not a valid query weight.", w))
                    })?);
                }
            }
            other => {
                return Err(Error::invalid(format!(
                    "`{}` is not a valid vector query parameter.",
                    other
                )))
            }
        }
    }
    Ok(spec)
}

/// Parses `_eval(...)` bodies: either a single filter expression (score 1)
/// or `[(expr):score, (expr):score, ...]`.
fn parse_eval(params: &str) -> Result<Vec<(FilterNode, i64)>> {
    let params = params.trim();
    if !params.starts_with('[') {
        return Ok(vec![(parse_filter(params)?, 1)]);
    }
    let inner = params
        .strip_prefix('[')
        .and_then(|p| p.strip_suffix(']'))
        .ok_or_else(|| Error::invalid("Malformed `_eval` expression list."))?;

    let mut exprs = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    let mut parts: Vec<String> = Vec::new();
    for c in inner.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }

    for part in parts {
        let (expr_raw, score_raw) = part
            .rsplit_once("):")
            .ok_or_else(|| Error::invalid(format!("`{}` must look like `(expr): score`.", part)))?;
        let expr_raw = expr_raw
            .strip_prefix('(')
            .ok_or_else(|| Error::invalid(format!("`{}` must start with `(`.", part)))?;
        let score: i64 = score_raw
            .trim()
            .parse()
            .map_err(|_| Error::invalid(format!("`{}` is not a valid _eval score.", score_raw)))?;
        exprs.push((parse_filter(expr_raw)?, score));
    }
    if exprs.is_empty() {
        return Err(Error::invalid("`_eval` needs at least one expression."));
    }
    Ok(exprs)
}

/// Parses and validates the user's sort clauses, then appends the default
/// chain. At most [`MAX_SORT_CLAUSES`] user clauses and one `_eval` are
/// allowed.
pub fn resolve_sort_clauses(
    raw_clauses: &[String],
    fields: &[Field],
    default_sorting_field: Option<&str>,
    info: SortQueryInfo,
) -> Result<Vec<ResolvedSort>> {
    if raw_clauses.len() > MAX_SORT_CLAUSES {
        return Err(Error::invalid(format!(
            "Only up to {} sort fields are allowed.",
            MAX_SORT_CLAUSES
        )));
    }

    let mut sorts: Vec<ResolvedSort> = Vec::new();
    let mut eval_seen = false;

    for raw in raw_clauses {
        let (name, params, order) = split_clause(raw)?;
        let by = match name.as_str() {
            "_text_match" => SortBy::TextMatch {
                bucketing: parse_bucketing(params.as_deref())?,
            },
            "_vector_distance" => SortBy::VectorDistance {
                bucketing: parse_bucketing(params.as_deref())?,
            },
            "_vector_query" => {
                let params = params.ok_or_else(|| {
                    Error::invalid("`_vector_query` needs a `field:([...])` parameter.")
                })?;
                SortBy::VectorQuery {
                    spec: parse_vector_query(&params)?,
                    vector: Vec::new(),
                }
            }
            "_eval" => {
                if eval_seen {
                    return Err(Error::invalid("Only one `_eval` sort clause is allowed."));
                }
                eval_seen = true;
                let params = params
                    .ok_or_else(|| Error::invalid("`_eval` needs a filter expression."))?;
                SortBy::Eval {
                    exprs: parse_eval(&params)?,
                }
            }
            "_random_order" => {
                let seed = match params {
                    Some(p) => p
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| Error::invalid("`_random_order` seed must be an integer."))?,
                    None => 0,
                };
                SortBy::RandomOrder { seed }
            }
            "_seq_id" => SortBy::SeqId,
            "_group_found" => SortBy::GroupFound,
            "_union_search_index" => SortBy::UnionSearchIndex,
            field_name => resolve_field_sort(field_name, params.as_deref(), fields)?,
        };
        sorts.push(ResolvedSort { by, order });
    }

    apply_default_sorts(&mut sorts, default_sorting_field, info);
    Ok(sorts)
}

fn resolve_field_sort(name: &str, params: Option<&str>, fields: &[Field]) -> Result<SortBy> {
    let field = Field::resolve(fields, name).ok_or_else(|| {
        Error::not_found(format!("Could not find a sort field named `{}`.", name))
    })?;
    if !field.sort {
        return Err(Error::invalid(format!(
            "Field `{}` is not declared sortable (set sort: true).",
            name
        )));
    }

    if field.field_type.is_geopoint() {
        let params = params.ok_or_else(|| {
            Error::invalid(format!("Geopoint sorting on `{}` needs `(lat, lng)`.", name))
        })?;
        return parse_geo_sort(name, params);
    }

    if let Some(params) = params {
        let kvs = parse_kv_params(params);
        if kvs.iter().any(|(k, _)| k == "func") {
            if !field.field_type.is_numeric() {
                return Err(Error::invalid(format!(
                    "Decay sorting applies to numeric fields only, `{}` is {}.",
                    name,
                    field.field_type.as_str()
                )));
            }
            return parse_decay_sort(name, &kvs);
        }
        return Err(Error::invalid(format!(
            "Field `{}` does not accept sort parameters `{}`.",
            name, params
        )));
    }

    Ok(SortBy::Field {
        name: name.to_string(),
        ty: field.field_type,
    })
}

fn parse_geo_sort(name: &str, params: &str) -> Result<SortBy> {
    let parts = split_sort_clauses(params);
    let mut coords: Vec<f64> = Vec::new();
    let mut exclude_radius_m = None;
    let mut precision_m = None;
    for part in parts {
        if let Some((key, value)) = part.split_once(':') {
            let meters = super::filter::parse_distance_meters(value.trim())?;
            match key.trim() {
                "exclude_radius" => exclude_radius_m = Some(meters),
                "precision" => precision_m = Some(meters),
                other => {
                    return Err(Error::invalid(format!(
                        "`{}` is not a valid geo sort parameter.",
                        other
                    )))
                }
            }
        } else {
            coords.push(part.trim().parse::<f64>().map_err(|_| {
                Error::invalid(format!("`{}` is not a valid geo coordinate.", part))
            })?);
        }
    }
    if coords.len() != 2 {
        return Err(Error::invalid(format!(
            "Geopoint sorting on `{}` needs exactly `(lat, lng)`.",
            name
        )));
    }
    Ok(SortBy::GeoDistance {
        field: name.to_string(),
        lat: coords[0],
        lng: coords[1],
        exclude_radius_m,
        precision_m,
    })
}

fn parse_decay_sort(name: &str, kvs: &[(String, String)]) -> Result<SortBy> {
    let mut func = None;
    let mut origin = None;
    let mut scale = None;
    let mut offset = 0.0;
    let mut decay = 0.5;
    let mut missing_values = MissingValues::default();
    for (key, value) in kvs {
        match key.as_str() {
            "func" => func = Some(DecayFunction::parse(value)?),
            "origin" => origin = Some(parse_f64(value, "origin")?),
            "scale" => scale = Some(parse_f64(value, "scale")?),
            "offset" => offset = parse_f64(value, "offset")?,
            "decay" => decay = parse_f64(value, "decay")?,
            "missing_values" => {
                missing_values = match value.as_str() {
                    "first" => MissingValues::First,
                    "last" => MissingValues::Last,
                    other => {
                        return Err(Error::invalid(format!(
                            "`{}` is not valid for missing_values: use first or last.",
                            other
                        )))
                    }
                }
            }
            other => {
                return Err(Error::invalid(format!(
                    "`{}` is not a valid decay parameter.",
                    other
                )))
            }
        }
    }
    if !(0.0..=1.0).contains(&decay) {
        return Err(Error::invalid("`decay` must be between 0 and 1."));
    }
    let func = func.ok_or_else(|| Error::invalid("Decay sorting needs a `func`."))?;
    let origin = origin.ok_or_else(|| Error::invalid("Decay sorting needs an `origin`."))?;
    let scale = match func {
        DecayFunction::Diff => scale.unwrap_or(1.0),
        _ => scale.ok_or_else(|| Error::invalid("Decay sorting needs a `scale`."))?,
    };
    if scale == 0.0 && func != DecayFunction::Diff {
        return Err(Error::invalid("`scale` must be non-zero."));
    }
    Ok(SortBy::Decay {
        field: name.to_string(),
        func,
        origin,
        scale,
        offset,
        decay,
        missing_values,
    })
}

fn parse_f64(raw: &str, what: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| Error::invalid(format!("`{}` must be a number, got `{}`.", what, raw)))
}

/// Appends the default sort chain per the query shape.
fn apply_default_sorts(
    sorts: &mut Vec<ResolvedSort>,
    default_sorting_field: Option<&str>,
    info: SortQueryInfo,
) {
    if sorts.is_empty() {
        if !info.is_wildcard {
            sorts.push(ResolvedSort {
                by: SortBy::TextMatch {
                    bucketing: Bucketing::default(),
                },
                order: SortOrder::Desc,
            });
        } else if info.has_vector_query {
            sorts.push(ResolvedSort {
                by: SortBy::VectorDistance {
                    bucketing: Bucketing::default(),
                },
                order: SortOrder::Asc,
            });
        }
        match default_sorting_field {
            Some(field) if !field.is_empty() => sorts.push(ResolvedSort {
                by: SortBy::Field {
                    name: field.to_string(),
                    // The default sorting field is numeric by construction.
                    ty: FieldType::Int64,
                },
                order: SortOrder::Desc,
            }),
            _ => sorts.push(ResolvedSort {
                by: SortBy::SeqId,
                order: SortOrder::Desc,
            }),
        }
    }

    if info.is_union && sorts.len() < 2 {
        sorts.push(ResolvedSort {
            by: SortBy::UnionSearchIndex,
            order: SortOrder::Asc,
        });
        sorts.push(ResolvedSort {
            by: SortBy::SeqId,
            order: SortOrder::Desc,
        });
    }
}

/// Per-search state needed to evaluate keys: `_eval` sets, `_vector_query`
/// distances and the union slot index, parallel to the clause list.
pub struct SortRuntime {
    pub sorts: Vec<ResolvedSort>,
    /// For each clause: `(matching ids, score)` pairs for `_eval`, empty
    /// otherwise.
    pub eval_sets: Vec<Vec<(HashSet<SeqId>, i64)>>,
    /// For each clause: per-doc distances for `_vector_query`, `None`
    /// otherwise.
    pub vector_sort: Vec<Option<std::collections::HashMap<SeqId, f32>>>,
    pub union_search_index: u32,
}

impl SortRuntime {
    pub fn new(sorts: Vec<ResolvedSort>) -> Self {
        let n = sorts.len();
        Self {
            sorts,
            eval_sets: vec![Vec::new(); n],
            vector_sort: std::iter::repeat_with(|| None).take(n).collect(),
            union_search_index: 0,
        }
    }

    /// Computes the key vector for one document.
    pub fn keys(
        &self,
        index: &MemoryIndex,
        seq_id: SeqId,
        text_match: u64,
        vector_distance: Option<f32>,
        group_found: Option<u64>,
    ) -> Vec<SortValue> {
        self.sorts
            .iter()
            .enumerate()
            .map(|(i, sort)| {
                self.key_for(index, sort, i, seq_id, text_match, vector_distance, group_found)
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn key_for(
        &self,
        index: &MemoryIndex,
        sort: &ResolvedSort,
        clause_idx: usize,
        seq_id: SeqId,
        text_match: u64,
        vector_distance: Option<f32>,
        group_found: Option<u64>,
    ) -> SortValue {
        match &sort.by {
            SortBy::Field { name, ty } => index.sort_value(name, *ty, seq_id),
            SortBy::TextMatch { .. } => SortValue::Int(text_match as i64),
            SortBy::VectorDistance { .. } => match vector_distance {
                Some(d) => SortValue::Float(d as f64),
                None => SortValue::Float(f64::MAX),
            },
            SortBy::VectorQuery { .. } => match self.vector_sort[clause_idx]
                .as_ref()
                .and_then(|m| m.get(&seq_id))
            {
                Some(d) => SortValue::Float(*d as f64),
                None => SortValue::Float(f64::MAX),
            },
            SortBy::Eval { .. } => {
                let score = self.eval_sets[clause_idx]
                    .iter()
                    .find(|(ids, _)| ids.contains(&seq_id))
                    .map(|(_, score)| *score)
                    .unwrap_or(0);
                SortValue::Int(score)
            }
            SortBy::RandomOrder { seed } => {
                let mut hasher = DefaultHasher::new();
                seed.hash(&mut hasher);
                seq_id.hash(&mut hasher);
                SortValue::Int((hasher.finish() >> 1) as i64)
            }
            SortBy::SeqId => SortValue::Int(seq_id as i64),
            SortBy::GroupFound => SortValue::Int(group_found.unwrap_or(0) as i64),
            SortBy::UnionSearchIndex => SortValue::Int(self.union_search_index as i64),
            SortBy::GeoDistance {
                field,
                lat,
                lng,
                exclude_radius_m,
                precision_m,
            } => match index.geo_distance(field, seq_id, *lat, *lng) {
                Some(meters) => {
                    let mut meters = meters;
                    if let Some(radius) = exclude_radius_m {
                        if meters <= *radius {
                            meters = 0.0;
                        }
                    }
                    if let Some(precision) = precision_m {
                        meters = (meters / precision).floor() * precision;
                    }
                    SortValue::Int(meters.round() as i64)
                }
                None => SortValue::Null,
            },
            SortBy::Decay {
                field,
                func,
                origin,
                scale,
                offset,
                decay,
                missing_values,
            } => {
                let value = match index.sort_value(field, FieldType::Float, seq_id) {
                    SortValue::Float(v) => Some(v),
                    SortValue::Int(v) => Some(v as f64),
                    _ => None,
                };
                match value {
                    Some(v) => SortValue::Float(decay_score(
                        v, *func, *origin, *scale, *offset, *decay,
                    )),
                    None => {
                        // `first` means the doc leads the result order under
                        // this clause's direction.
                        let first = *missing_values == MissingValues::First;
                        let leading = match sort.order {
                            SortOrder::Desc => f64::INFINITY,
                            SortOrder::Asc => f64::NEG_INFINITY,
                        };
                        SortValue::Float(if first { leading } else { -leading })
                    }
                }
            }
        }
    }
}

fn decay_score(
    value: f64,
    func: DecayFunction,
    origin: f64,
    scale: f64,
    offset: f64,
    decay: f64,
) -> f64 {
    let distance = ((value - origin).abs() - offset).max(0.0);
    match func {
        DecayFunction::Diff => -(value - origin).abs(),
        DecayFunction::Gauss => {
            let sigma_sq = -scale.powi(2) / (2.0 * decay.ln());
            (-(distance.powi(2)) / (2.0 * sigma_sq)).exp()
        }
        DecayFunction::Exp => {
            let lambda = decay.ln() / scale;
            (lambda * distance).exp()
        }
        DecayFunction::Linear => {
            let s = scale / (1.0 - decay);
            (1.0 - distance / s).max(0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<Field> {
        vec![
            Field::new("price", FieldType::Float).sortable(),
            Field::new("rank", FieldType::Int32).sortable(),
            Field::new("title", FieldType::String),
            Field::new("loc", FieldType::Geopoint).sortable(),
        ]
    }

    fn resolve(raw: &str, info: SortQueryInfo) -> Result<Vec<ResolvedSort>> {
        resolve_sort_clauses(&split_sort_clauses(raw), &fields(), None, info)
    }

    #[test]
    fn test_plain_field_sort() {
        let sorts = resolve("price:asc", SortQueryInfo::default()).unwrap();
        assert_eq!(
            sorts[0],
            ResolvedSort {
                by: SortBy::Field {
                    name: "price".into(),
                    ty: FieldType::Float
                },
                order: SortOrder::Asc
            }
        );
    }

    #[test]
    fn test_unsortable_field_rejected() {
        let err = resolve("title:asc", SortQueryInfo::default()).unwrap_err();
        assert!(err.to_string().contains("not declared sortable"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(resolve("ghost:asc", SortQueryInfo::default()).is_err());
    }

    #[test]
    fn test_text_match_bucketing() {
        let sorts = resolve("_text_match(buckets:2):desc, _seq_id:desc", SortQueryInfo::default())
            .unwrap();
        assert_eq!(
            sorts[0].bucketing().unwrap(),
            Bucketing {
                buckets: Some(2),
                bucket_size: None
            }
        );
        assert_eq!(sorts[1].by, SortBy::SeqId);
    }

    #[test]
    fn test_max_three_clauses() {
        let err = resolve(
            "price:asc, rank:asc, _seq_id:desc, _random_order:asc",
            SortQueryInfo::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("up to 3"));
    }

    #[test]
    fn test_only_one_eval() {
        let err = resolve(
            "_eval(rank:=1):desc, _eval(rank:=2):desc",
            SortQueryInfo::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("one `_eval`"));
    }

    #[test]
    fn test_eval_scored_list() {
        let sorts = resolve(
            "_eval([(rank:=1):3, (rank:=2):2]):desc",
            SortQueryInfo::default(),
        )
        .unwrap();
        match &sorts[0].by {
            SortBy::Eval { exprs } => {
                assert_eq!(exprs.len(), 2);
                assert_eq!(exprs[0].1, 3);
                assert_eq!(exprs[1].1, 2);
            }
            other => panic!("expected eval, got {:?}", other),
        }
    }

    #[test]
    fn test_geo_sort_params() {
        let sorts = resolve("loc(48.85, 2.33, precision: 2 km):asc", SortQueryInfo::default())
            .unwrap();
        match &sorts[0].by {
            SortBy::GeoDistance {
                lat, precision_m, ..
            } => {
                assert!((lat - 48.85).abs() < 1e-9);
                assert_eq!(*precision_m, Some(2_000.0));
            }
            other => panic!("expected geo, got {:?}", other),
        }
    }

    #[test]
    fn test_decay_validation() {
        let err = resolve(
            "price(func:gauss, origin:0, scale:10, decay:1.5):desc",
            SortQueryInfo::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("between 0 and 1"));
    }

    #[test]
    fn test_defaults_text_query() {
        let sorts = resolve_sort_clauses(&[], &fields(), None, SortQueryInfo::default()).unwrap();
        assert!(matches!(sorts[0].by, SortBy::TextMatch { .. }));
        assert_eq!(sorts[0].order, SortOrder::Desc);
        assert_eq!(sorts[1].by, SortBy::SeqId);
    }

    #[test]
    fn test_defaults_wildcard_with_vector() {
        let info = SortQueryInfo {
            is_wildcard: true,
            has_vector_query: true,
            is_union: false,
        };
        let sorts = resolve_sort_clauses(&[], &fields(), None, info).unwrap();
        assert!(matches!(sorts[0].by, SortBy::VectorDistance { .. }));
        assert_eq!(sorts[0].order, SortOrder::Asc);
    }

    #[test]
    fn test_defaults_use_default_sorting_field() {
        let sorts =
            resolve_sort_clauses(&[], &fields(), Some("rank"), SortQueryInfo::default()).unwrap();
        assert!(matches!(&sorts[1].by, SortBy::Field { name, .. } if name == "rank"));
    }

    #[test]
    fn test_union_appends_tiebreak_pair() {
        let info = SortQueryInfo {
            is_wildcard: true,
            has_vector_query: false,
            is_union: true,
        };
        let sorts = resolve_sort_clauses(
            &split_sort_clauses("price:asc"),
            &fields(),
            None,
            info,
        )
        .unwrap();
        assert_eq!(sorts.len(), 3);
        assert_eq!(sorts[1].by, SortBy::UnionSearchIndex);
        assert_eq!(sorts[2].by, SortBy::SeqId);
    }

    #[test]
    fn test_compare_values_null_smallest() {
        assert_eq!(
            compare_values(&SortValue::Null, &SortValue::Int(-5)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&SortValue::Int(2), &SortValue::Float(2.5)),
            Ordering::Less
        );
    }

    #[test]
    fn test_compare_keys_respects_order_and_tiebreak() {
        let sorts = vec![
            ResolvedSort {
                by: SortBy::TextMatch {
                    bucketing: Bucketing::default(),
                },
                order: SortOrder::Desc,
            },
            ResolvedSort {
                by: SortBy::SeqId,
                order: SortOrder::Desc,
            },
        ];
        let a = vec![SortValue::Int(10), SortValue::Int(1)];
        let b = vec![SortValue::Int(10), SortValue::Int(5)];
        // Same score; higher seq id ranks earlier under desc.
        assert_eq!(compare_keys(&b, &a, &sorts), Ordering::Less);
        let c = vec![SortValue::Int(20), SortValue::Int(0)];
        assert_eq!(compare_keys(&c, &a, &sorts), Ordering::Less);
    }

    #[test]
    fn test_vector_query_parse() {
        let spec = parse_vector_query("emb:([0.1, 0.2], k:10)").unwrap();
        assert_eq!(spec.field, "emb");
        assert_eq!(spec.values, vec![0.1, 0.2]);
        assert_eq!(spec.k, 10);

        let by_id = parse_vector_query("emb:([], id: doc-1)").unwrap();
        assert!(by_id.values.is_empty());
        assert_eq!(by_id.doc_id.as_deref(), Some("doc-1"));

        assert!(parse_vector_query("emb:[0.1]").is_err());
    }

    #[test]
    fn test_decay_score_shapes() {
        // Gauss decays to `decay` exactly at `scale` distance from origin.
        let at_scale = decay_score(10.0, DecayFunction::Gauss, 0.0, 10.0, 0.0, 0.5);
        assert!((at_scale - 0.5).abs() < 1e-9);
        let at_origin = decay_score(0.0, DecayFunction::Gauss, 0.0, 10.0, 0.0, 0.5);
        assert!((at_origin - 1.0).abs() < 1e-9);
        // Linear hits zero at scale/(1-decay).
        let linear_zero = decay_score(20.0, DecayFunction::Linear, 0.0, 10.0, 0.0, 0.5);
        assert!(linear_zero.abs() < 1e-9);
        // Diff is the negated absolute difference.
        assert!((decay_score(7.0, DecayFunction::Diff, 10.0, 1.0, 0.0, 0.5) + 3.0).abs() < 1e-9);
    }
}
