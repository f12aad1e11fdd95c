//! Search plan assembly.
//!
//! [`build_plan`] validates and normalizes every request parameter against
//! the collection, applies curation, parses the filter and sort clauses,
//! resolves embeddings for vector/hybrid queries and freezes the result
//! into an immutable [`SearchPlan`] consumed by the executor, the index and
//! the response assembler.

use super::curation::{apply_overrides, find_matching_overrides, Override};
use super::facet::{parse_facet_fields, parse_facet_query, FacetSpec};
use super::filter::{parse_filter, FilterNode};
use super::params::{DropTokensMode, MatchType, SearchParams, SplitJoinTokens, TokenOrder};
use super::sort::{
    parse_vector_query, resolve_sort_clauses, split_sort_clauses, ResolvedSort, SortBy,
    SortQueryInfo, VectorQuerySpec,
};
use crate::config::{FIELD_MAX_WEIGHT, GROUP_LIMIT_MAX};
use crate::embedding::{average_embeddings, weighted_sum, Embedder, RemoteEmbeddingParams};
use crate::error::{Error, Result};
use crate::index::MemoryIndex;
use crate::schema::Field;
use crate::tokenizer::Tokenizer;
use crate::SeqId;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Highlighting directives carried by the plan.
#[derive(Debug, Clone)]
pub struct HighlightPlan {
    pub fields: Vec<String>,
    pub full_fields: Vec<String>,
    pub start_tag: String,
    pub end_tag: String,
    pub snippet_threshold: usize,
    pub affix_tokens: usize,
    pub v1: bool,
}

/// The immutable output of plan assembly.
#[derive(Debug, Clone)]
pub struct SearchPlan {
    pub query_tokens: Vec<String>,
    pub exclude_tokens: Vec<String>,
    pub phrases: Vec<Vec<String>>,
    pub normalized_query: String,
    pub is_wildcard: bool,

    /// `(field, weight)` pairs, descending weight.
    pub weighted_fields: Vec<(String, u8)>,
    pub field_prefix: Vec<bool>,
    pub field_infix: Vec<bool>,

    pub filter: Option<FilterNode>,
    pub sort: Vec<ResolvedSort>,

    /// Curated hits resolved to seq ids, ascending by position.
    pub included: Vec<(SeqId, usize)>,
    pub excluded: HashSet<SeqId>,
    pub filter_curated_hits: bool,

    pub facets: Vec<FacetSpec>,
    pub facet_query: Option<(String, String)>,
    pub facet_sample_percent: u32,
    pub facet_sample_threshold: usize,
    pub max_facet_values: usize,

    pub offset: usize,
    pub per_page: usize,
    pub fetch_size: usize,
    pub limit_hits: usize,

    pub group_by: Vec<String>,
    pub group_limit: usize,
    pub group_missing_values: bool,

    pub highlight: HighlightPlan,
    pub include_fields: Vec<String>,
    pub exclude_fields: Vec<String>,

    /// `(field, query vector, k)` driving vector or hybrid retrieval.
    pub vector: Option<(String, Vec<f32>, usize)>,

    pub match_type: MatchType,
    pub token_order: TokenOrder,
    pub drop_tokens_threshold: usize,
    pub drop_tokens_mode: DropTokensMode,
    pub split_join_tokens: SplitJoinTokens,
    pub prioritize_exact_match: bool,
    pub prioritize_token_position: bool,
    pub prioritize_num_matching_fields: bool,
    pub exhaustive_search: bool,
    pub rerank_hybrid_matches: bool,
    pub validate_field_names: bool,
    pub enable_lazy_filter: bool,
    pub stopwords: String,

    pub search_begin: Instant,
    pub deadline: Option<Instant>,
    pub search_cutoff_ms: Option<u64>,

    pub is_union: bool,
    pub union_search_index: u32,
}

/// Collection-side inputs to plan assembly.
pub struct PlanContext<'a> {
    pub fields: &'a [Field],
    pub default_sorting_field: Option<&'a str>,
    pub symbols_to_index: &'a [char],
    pub token_separators: &'a [char],
    pub overrides: &'a [Override],
    /// Live doc-id to seq-id map for pin/hide/vector-by-id resolution.
    pub doc_seq: &'a HashMap<String, SeqId>,
    pub index: &'a MemoryIndex,
    pub embedder: &'a Embedder,
    pub max_per_page: usize,
    pub now_ts: i64,
    pub is_union: bool,
    pub union_search_index: u32,
}

/// Builds the immutable search plan. Fails fast with `InvalidArgument` /
/// `NotFound` on any malformed input; performs embedding calls for vector
/// clauses under the request deadline.
pub async fn build_plan(params: &SearchParams, ctx: &PlanContext<'_>) -> Result<SearchPlan> {
    let search_begin = Instant::now();

    // -- query shape ---------------------------------------------------------
    let mut raw_query = params.query.clone();
    if raw_query.is_empty() && !params.voice_query.is_empty() {
        // Voice transcription backends are configured per collection; none
        // being registered is a request error, not a crash.
        return Err(Error::invalid(
            "This collection has no voice query model configured.",
        ));
    }
    if params.conversation {
        if params.conversation_model_id.is_empty() {
            return Err(Error::invalid(
                "A conversation search needs a `conversation_model_id`.",
            ));
        }
    }
    if params.synonym_num_typos > 2 {
        return Err(Error::invalid("synonym_num_typos must be 0, 1 or 2."));
    }
    if params.facet_sample_percent > 100 {
        return Err(Error::invalid("facet_sample_percent must be 0-100."));
    }

    let tokenizer = Tokenizer::new(ctx.symbols_to_index, ctx.token_separators, None);

    // -- curation ------------------------------------------------------------
    let mut normalized_query = tokenizer.normalize(&raw_query);
    let mut extra_filters: Vec<String> = Vec::new();
    let mut sort_by = params.sort_by.clone();
    let mut remove_tokens: Vec<String> = Vec::new();
    let mut included_raw: Vec<(String, usize)> = Vec::new();
    let mut excluded_raw: Vec<String> = Vec::new();
    let mut filter_curated_hits = false;

    for raw in &params.pinned_hits {
        included_raw.push(SearchParams::parse_pinned_hit(raw)?);
    }
    excluded_raw.extend(params.hidden_hits.iter().cloned());

    if params.enable_overrides {
        let matched = find_matching_overrides(
            ctx.overrides,
            &normalized_query,
            &params.filter_by,
            &params.override_tags,
            ctx.now_ts,
        );
        let outcome = apply_overrides(&matched, &normalized_query);
        excluded_raw.extend(outcome.excluded);
        included_raw.extend(outcome.included);
        extra_filters.extend(outcome.filter_by);
        filter_curated_hits = outcome.filter_curated_hits;
        if let Some(replacement) = outcome.replace_query {
            raw_query = replacement;
            normalized_query = tokenizer.normalize(&raw_query);
        }
        if let Some(curated_sort) = outcome.sort_by {
            sort_by = curated_sort;
        }
        remove_tokens = outcome.remove_matched_tokens;
    }

    // -- tokenization --------------------------------------------------------
    let (mut query_tokens, exclude_tokens, phrases) = tokenize_query(&raw_query, &tokenizer);
    if !remove_tokens.is_empty() {
        query_tokens.retain(|t| !remove_tokens.contains(t));
    }
    let is_wildcard = raw_query.trim().is_empty() || raw_query.trim() == "*" || query_tokens.is_empty();

    // -- fields and weights --------------------------------------------------
    let mut search_fields: Vec<String> = Vec::new();
    let mut embedding_fields: Vec<String> = Vec::new();
    for name in &params.query_by {
        let Some(field) = Field::resolve(ctx.fields, name) else {
            if params.validate_field_names {
                return Err(Error::not_found(format!(
                    "Could not find a field named `{}` in the schema.",
                    name
                )));
            }
            continue;
        };
        if field.is_auto_embedding() {
            embedding_fields.push(name.clone());
            continue;
        }
        if !field.index {
            return Err(Error::invalid(format!(
                "Field `{}` is not an indexed field.",
                name
            )));
        }
        search_fields.push(name.clone());
    }

    if !is_wildcard && search_fields.is_empty() && embedding_fields.is_empty() {
        return Err(Error::invalid(
            "No fields given to search: set `query_by` or use a wildcard query.",
        ));
    }

    let weighted_fields = resolve_weights(&search_fields, &params.query_by_weights)?;
    let field_prefix = broadcast_flag(&params.prefix, search_fields.len(), true, "prefix")?;
    let infix_flags: Vec<bool> = {
        let raw: Vec<bool> = params
            .infix
            .iter()
            .map(|v| v != "off" && !v.is_empty())
            .collect();
        broadcast_flag(&raw, search_fields.len(), false, "infix")?
    };
    broadcast_len_check(params.num_typos.len(), search_fields.len(), "num_typos")?;

    // -- pagination ----------------------------------------------------------
    if params.per_page > ctx.max_per_page {
        return Err(Error::invalid(format!(
            "Only up to {} hits can be fetched per page.",
            ctx.max_per_page
        )));
    }
    let page = params.page.unwrap_or(1);
    if page == 0 {
        return Err(Error::invalid("Page numbers start at 1."));
    }
    let offset = params.offset.unwrap_or((page - 1) * params.per_page);
    let fetch_size = offset
        .saturating_add(params.per_page)
        .min(params.limit_hits);

    // -- grouping ------------------------------------------------------------
    let group_limit = if params.group_by.is_empty() {
        0
    } else {
        if params.group_limit == 0 || params.group_limit > GROUP_LIMIT_MAX {
            return Err(Error::invalid(format!(
                "group_limit must be between 1 and {}.",
                GROUP_LIMIT_MAX
            )));
        }
        for field in &params.group_by {
            if Field::resolve(ctx.fields, field).is_none() && params.validate_field_names {
                return Err(Error::not_found(format!(
                    "Could not find a group_by field named `{}`.",
                    field
                )));
            }
        }
        params.group_limit
    };

    // -- facets --------------------------------------------------------------
    let facets = parse_facet_fields(&params.facet_by)?;
    for spec in &facets {
        match Field::resolve(ctx.fields, &spec.field) {
            Some(field) if field.facet => {}
            Some(field) => {
                return Err(Error::invalid(format!(
                    "Field `{}` is not a facet field.",
                    field.name
                )))
            }
            None if params.validate_field_names => {
                return Err(Error::not_found(format!(
                    "Could not find a facet field named `{}`.",
                    spec.field
                )))
            }
            None => {}
        }
    }
    let facet_query = parse_facet_query(&params.facet_query)?;

    // -- filter --------------------------------------------------------------
    let mut filter: Option<FilterNode> = if params.filter_by.trim().is_empty() {
        None
    } else {
        Some(parse_filter(&params.filter_by)?)
    };
    for extra in &extra_filters {
        let node = parse_filter(extra)?;
        filter = Some(match filter {
            // Override filters are or-ed into the runtime tree.
            Some(existing) => existing.or(node),
            None => node,
        });
    }

    // -- deadline ------------------------------------------------------------
    let deadline = params
        .search_cutoff_ms
        .map(|ms| search_begin + Duration::from_millis(ms));

    let remote = RemoteEmbeddingParams {
        timeout_ms: params
            .remote_embedding_timeout_ms
            .unwrap_or(crate::config::DEFAULT_REMOTE_EMBEDDING_TIMEOUT_MS),
        num_tries: params
            .remote_embedding_num_tries
            .unwrap_or(crate::config::DEFAULT_REMOTE_EMBEDDING_NUM_TRIES),
    };

    // -- vector query --------------------------------------------------------
    let mut vector_spec: Option<VectorQuerySpec> = if params.vector_query.trim().is_empty() {
        None
    } else {
        Some(parse_vector_query(&params.vector_query)?)
    };

    // A hybrid search names an auto-embedding field in query_by.
    if let Some(embed_field) = embedding_fields.first() {
        if embedding_fields.len() > 1
            || vector_spec
                .as_ref()
                .map(|v| v.field != *embed_field)
                .unwrap_or(false)
        {
            return Err(Error::invalid(
                "Only one embedding field may be used per search.",
            ));
        }
        if vector_spec.is_none() {
            vector_spec = Some(VectorQuerySpec {
                field: embed_field.clone(),
                k: fetch_size.max(1),
                ..Default::default()
            });
        }
    }

    let vector = match vector_spec {
        None => None,
        Some(spec) => Some(resolve_vector_spec(spec, &raw_query, is_wildcard, ctx, &remote, deadline).await?),
    };

    // -- sort ----------------------------------------------------------------
    let info = SortQueryInfo {
        is_wildcard,
        has_vector_query: vector.is_some(),
        is_union: ctx.is_union,
    };
    let raw_clauses = split_sort_clauses(&sort_by);
    let mut sort = resolve_sort_clauses(&raw_clauses, ctx.fields, ctx.default_sorting_field, info)?;
    // `_vector_query` sort clauses resolve their own vectors.
    for clause in &mut sort {
        if let SortBy::VectorQuery { spec, vector } = &mut clause.by {
            let resolved = resolve_vector_spec(
                spec.clone(),
                &raw_query,
                is_wildcard,
                ctx,
                &remote,
                deadline,
            )
            .await?;
            *vector = resolved.1;
        }
    }

    // -- curated hit resolution ----------------------------------------------
    let mut included: Vec<(SeqId, usize)> = Vec::new();
    for (doc_id, position) in included_raw {
        // Unresolvable pinned ids are skipped silently.
        if let Some(seq_id) = ctx.doc_seq.get(&doc_id) {
            if !included.iter().any(|(s, _)| s == seq_id) {
                included.push((*seq_id, position));
            }
        }
    }
    included.sort_by_key(|(_, pos)| *pos);
    let excluded: HashSet<SeqId> = excluded_raw
        .iter()
        .filter_map(|doc_id| ctx.doc_seq.get(doc_id).copied())
        .collect();

    // -- highlighting --------------------------------------------------------
    let highlight = HighlightPlan {
        fields: if params.highlight_fields.is_empty() {
            search_fields.clone()
        } else {
            params.highlight_fields.clone()
        },
        full_fields: params.highlight_full_fields.clone(),
        start_tag: params.highlight_start_tag.clone(),
        end_tag: params.highlight_end_tag.clone(),
        snippet_threshold: params.snippet_threshold,
        affix_tokens: params.highlight_affix_num_tokens,
        v1: params.enable_highlight_v1,
    };

    let drop_tokens_mode = if params.drop_tokens_mode.is_empty() {
        DropTokensMode::default()
    } else {
        DropTokensMode::parse(&params.drop_tokens_mode)?
    };

    Ok(SearchPlan {
        query_tokens,
        exclude_tokens,
        phrases,
        normalized_query,
        is_wildcard,
        weighted_fields,
        field_prefix,
        field_infix: infix_flags,
        filter,
        sort,
        included,
        excluded,
        filter_curated_hits,
        facets,
        facet_query,
        facet_sample_percent: params.facet_sample_percent,
        facet_sample_threshold: params.facet_sample_threshold,
        max_facet_values: params.max_facet_values,
        offset,
        per_page: params.per_page,
        fetch_size,
        limit_hits: params.limit_hits,
        group_by: params.group_by.clone(),
        group_limit,
        group_missing_values: params.group_missing_values,
        highlight,
        include_fields: params.include_fields.clone(),
        exclude_fields: params.exclude_fields.clone(),
        vector,
        match_type: params.match_type,
        token_order: params.token_order,
        drop_tokens_threshold: params.drop_tokens_threshold,
        drop_tokens_mode,
        split_join_tokens: params.split_join_tokens,
        prioritize_exact_match: params.prioritize_exact_match,
        prioritize_token_position: params.prioritize_token_position,
        prioritize_num_matching_fields: params.prioritize_num_matching_fields,
        exhaustive_search: params.exhaustive_search,
        rerank_hybrid_matches: params.rerank_hybrid_matches,
        validate_field_names: params.validate_field_names,
        enable_lazy_filter: params.enable_lazy_filter,
        stopwords: params.stopwords.clone(),
        search_begin,
        deadline,
        search_cutoff_ms: params.search_cutoff_ms,
        is_union: ctx.is_union,
        union_search_index: ctx.union_search_index,
    })
}

/// Splits the raw query into include tokens, `-`-prefixed exclude tokens
/// and quoted phrases.
fn tokenize_query(
    raw_query: &str,
    tokenizer: &Tokenizer,
) -> (Vec<String>, Vec<String>, Vec<Vec<String>>) {
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    let mut phrases = Vec::new();

    let mut rest = raw_query.trim();
    while let Some(open) = rest.find('"') {
        let before = &rest[..open];
        collect_words(before, tokenizer, &mut include, &mut exclude);
        match rest[open + 1..].find('"') {
            Some(close) => {
                let phrase = &rest[open + 1..open + 1 + close];
                let tokens: Vec<String> = tokenizer
                    .tokenize(phrase)
                    .into_iter()
                    .map(|t| t.text)
                    .collect();
                if !tokens.is_empty() {
                    include.extend(tokens.clone());
                    phrases.push(tokens);
                }
                rest = &rest[open + close + 2..];
            }
            None => {
                rest = &rest[open + 1..];
            }
        }
    }
    collect_words(rest, tokenizer, &mut include, &mut exclude);
    (include, exclude, phrases)
}

fn collect_words(
    raw: &str,
    tokenizer: &Tokenizer,
    include: &mut Vec<String>,
    exclude: &mut Vec<String>,
) {
    for word in raw.split_whitespace() {
        if word == "*" {
            continue;
        }
        if let Some(negated) = word.strip_prefix('-') {
            exclude.extend(tokenizer.tokenize(negated).into_iter().map(|t| t.text));
        } else {
            include.extend(tokenizer.tokenize(word).into_iter().map(|t| t.text));
        }
    }
}

/// Sorts fields by descending weight and normalizes user weights into
/// `[0, FIELD_MAX_WEIGHT]` preserving ties; without explicit weights,
/// fields count down from the maximum in declaration order.
fn resolve_weights(fields: &[String], user_weights: &[u32]) -> Result<Vec<(String, u8)>> {
    if user_weights.is_empty() {
        return Ok(fields
            .iter()
            .enumerate()
            .map(|(i, f)| {
                (
                    f.clone(),
                    FIELD_MAX_WEIGHT.saturating_sub(i.min(FIELD_MAX_WEIGHT as usize) as u8),
                )
            })
            .collect());
    }
    if user_weights.len() != fields.len() {
        return Err(Error::invalid(
            "Number of weights in query_by_weights does not match number of query_by fields.",
        ));
    }
    let mut pairs: Vec<(String, u32)> = fields
        .iter()
        .cloned()
        .zip(user_weights.iter().copied())
        .collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1));

    // Distinct weights map onto descending values from the maximum.
    let mut normalized: Vec<(String, u8)> = Vec::with_capacity(pairs.len());
    let mut last_raw: Option<u32> = None;
    let mut current = FIELD_MAX_WEIGHT;
    for (field, raw) in pairs {
        if let Some(prev) = last_raw {
            if raw < prev {
                current = current.saturating_sub(1);
            }
        }
        last_raw = Some(raw);
        normalized.push((field, current));
    }
    Ok(normalized)
}

fn broadcast_flag(raw: &[bool], len: usize, default: bool, what: &str) -> Result<Vec<bool>> {
    match raw.len() {
        0 => Ok(vec![default; len]),
        1 => Ok(vec![raw[0]; len]),
        n if n == len => Ok(raw.to_vec()),
        n => Err(Error::invalid(format!(
            "`{}` has {} values but {} fields are searched: give one value or one per field.",
            what, n, len
        ))),
    }
}

fn broadcast_len_check(given: usize, len: usize, what: &str) -> Result<()> {
    if given == 0 || given == 1 || given == len {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "`{}` has {} values but {} fields are searched: give one value or one per field.",
            what, given, len
        )))
    }
}

/// Resolves a vector query spec into `(field, vector, k)`: explicit values
/// win, then a stored document's vector, then embedding the query text (or
/// `queries`) through the field's model.
async fn resolve_vector_spec(
    spec: VectorQuerySpec,
    raw_query: &str,
    is_wildcard: bool,
    ctx: &PlanContext<'_>,
    remote: &RemoteEmbeddingParams,
    deadline: Option<Instant>,
) -> Result<(String, Vec<f32>, usize)> {
    let field = Field::resolve(ctx.fields, &spec.field).ok_or_else(|| {
        Error::not_found(format!(
            "Could not find a vector field named `{}`.",
            spec.field
        ))
    })?;
    if !field.is_vector() {
        return Err(Error::invalid(format!(
            "Field `{}` is not a vector field.",
            spec.field
        )));
    }
    let k = if spec.k == 0 { 10 } else { spec.k };

    if !spec.values.is_empty() {
        if spec.values.len() != field.num_dim {
            return Err(Error::invalid(format!(
                "Query vector for `{}` must have {} dimensions, got {}.",
                spec.field,
                field.num_dim,
                spec.values.len()
            )));
        }
        return Ok((spec.field, spec.values, k));
    }

    if let Some(doc_id) = &spec.doc_id {
        let seq_id = ctx.doc_seq.get(doc_id).ok_or_else(|| {
            Error::not_found(format!("Document `{}` not found in the collection.", doc_id))
        })?;
        let stored = ctx.index.stored_vector(&spec.field, *seq_id).ok_or_else(|| {
            Error::not_found(format!(
                "Document `{}` has no `{}` vector.",
                doc_id, spec.field
            ))
        })?;
        return Ok((spec.field, stored, k));
    }

    // Embedding path: the field must be an auto-embedding field.
    let embed = field.embed.as_ref().ok_or_else(|| {
        Error::invalid(format!(
            "Field `{}` has no embedding model: give the query vector explicitly.",
            spec.field
        ))
    })?;

    if !spec.queries.is_empty() {
        let mut embeddings = Vec::with_capacity(spec.queries.len());
        for q in &spec.queries {
            embeddings.push(
                ctx.embedder
                    .embed_query(&embed.model_config, q, field.num_dim, remote, deadline)
                    .await?,
            );
        }
        let combined = if spec.query_weights.is_empty() {
            average_embeddings(&embeddings)?
        } else {
            weighted_sum(&embeddings, &spec.query_weights)?
        };
        return Ok((spec.field, combined, k));
    }

    if is_wildcard {
        return Err(Error::invalid(format!(
            "Vector field `{}` needs query values, a document id or a text query.",
            spec.field
        )));
    }
    let embedding = ctx
        .embedder
        .embed_query(&embed.model_config, raw_query, field.num_dim, remote, deadline)
        .await?;
    Ok((spec.field, embedding, k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;

    fn fields() -> Vec<Field> {
        let mut emb = Field::new("emb", FieldType::FloatArray);
        emb.num_dim = 4;
        emb.embed = Some(crate::schema::EmbeddingSpec {
            from: vec!["title".to_string()],
            model_config: crate::embedding::ModelConfig {
                model_name: "dev-hash".to_string(),
                api_key: None,
                url: None,
                query_prefix: None,
                indexing_prefix: None,
            },
        });
        vec![
            Field::new("title", FieldType::String),
            Field::new("brand", FieldType::String).faceted(),
            Field::new("price", FieldType::Float).sortable(),
            emb,
        ]
    }

    struct Ctx {
        fields: Vec<Field>,
        overrides: Vec<Override>,
        doc_seq: HashMap<String, SeqId>,
        index: MemoryIndex,
        embedder: Embedder,
    }

    impl Ctx {
        fn new() -> Self {
            Self {
                fields: fields(),
                overrides: Vec::new(),
                doc_seq: HashMap::new(),
                index: MemoryIndex::new(&[], &[]),
                embedder: Embedder::new(),
            }
        }

        fn plan_ctx(&self) -> PlanContext<'_> {
            PlanContext {
                fields: &self.fields,
                default_sorting_field: None,
                symbols_to_index: &[],
                token_separators: &[],
                overrides: &self.overrides,
                doc_seq: &self.doc_seq,
                index: &self.index,
                embedder: &self.embedder,
                max_per_page: crate::config::MAX_PER_PAGE,
                now_ts: 0,
                is_union: false,
                union_search_index: 0,
            }
        }
    }

    #[tokio::test]
    async fn test_basic_plan() {
        let ctx = Ctx::new();
        let params = SearchParams::query("Red Shoes", &["title"]);
        let plan = build_plan(&params, &ctx.plan_ctx()).await.unwrap();
        assert_eq!(plan.query_tokens, vec!["red", "shoes"]);
        assert!(!plan.is_wildcard);
        assert_eq!(plan.weighted_fields, vec![("title".to_string(), 15)]);
        assert_eq!(plan.fetch_size, 10);
        // Non-wildcard text query defaults to text match + seq id.
        assert_eq!(plan.sort.len(), 2);
    }

    #[tokio::test]
    async fn test_wildcard_plan() {
        let ctx = Ctx::new();
        let mut params = SearchParams::query("*", &[]);
        params.per_page = 20;
        let plan = build_plan(&params, &ctx.plan_ctx()).await.unwrap();
        assert!(plan.is_wildcard);
        assert_eq!(plan.fetch_size, 20);
    }

    #[tokio::test]
    async fn test_non_wildcard_without_fields_fails() {
        let ctx = Ctx::new();
        let params = SearchParams::query("shoes", &[]);
        assert!(build_plan(&params, &ctx.plan_ctx()).await.is_err());
    }

    #[tokio::test]
    async fn test_per_page_bound() {
        let ctx = Ctx::new();
        let mut params = SearchParams::query("*", &[]);
        params.per_page = 1000;
        let err = build_plan(&params, &ctx.plan_ctx()).await.unwrap_err();
        assert!(err.to_string().contains("per page"));
    }

    #[tokio::test]
    async fn test_pagination_window() {
        let ctx = Ctx::new();
        let mut params = SearchParams::query("*", &[]);
        params.page = Some(3);
        params.per_page = 10;
        params.limit_hits = 25;
        let plan = build_plan(&params, &ctx.plan_ctx()).await.unwrap();
        assert_eq!(plan.offset, 20);
        // fetch_size = min(offset + per_page, limit_hits)
        assert_eq!(plan.fetch_size, 25);
    }

    #[tokio::test]
    async fn test_group_limit_bounds() {
        let ctx = Ctx::new();
        let mut params = SearchParams::query("*", &[]);
        params.group_by = vec!["brand".to_string()];
        params.group_limit = 2000;
        assert!(build_plan(&params, &ctx.plan_ctx()).await.is_err());

        params.group_limit = 5;
        let plan = build_plan(&params, &ctx.plan_ctx()).await.unwrap();
        assert_eq!(plan.group_limit, 5);

        params.group_by.clear();
        let plan = build_plan(&params, &ctx.plan_ctx()).await.unwrap();
        assert_eq!(plan.group_limit, 0);
    }

    #[tokio::test]
    async fn test_weight_normalization_preserves_ties() {
        let ctx = Ctx::new();
        let mut params = SearchParams::query("q", &["title", "brand"]);
        params.query_by_weights = vec![7, 7];
        let plan = build_plan(&params, &ctx.plan_ctx()).await.unwrap();
        assert_eq!(plan.weighted_fields[0].1, FIELD_MAX_WEIGHT);
        assert_eq!(plan.weighted_fields[1].1, FIELD_MAX_WEIGHT);

        params.query_by_weights = vec![3, 9];
        let plan = build_plan(&params, &ctx.plan_ctx()).await.unwrap();
        // Sorted descending by weight: brand first now.
        assert_eq!(plan.weighted_fields[0].0, "brand");
        assert!(plan.weighted_fields[0].1 > plan.weighted_fields[1].1);
    }

    #[tokio::test]
    async fn test_exclude_tokens_and_phrases() {
        let ctx = Ctx::new();
        let params = SearchParams::query("\"red shoes\" -cheap", &["title"]);
        let plan = build_plan(&params, &ctx.plan_ctx()).await.unwrap();
        assert_eq!(plan.query_tokens, vec!["red", "shoes"]);
        assert_eq!(plan.exclude_tokens, vec!["cheap"]);
        assert_eq!(plan.phrases, vec![vec!["red".to_string(), "shoes".to_string()]]);
    }

    #[tokio::test]
    async fn test_hidden_and_pinned_resolution_skips_unknown() {
        let mut ctx = Ctx::new();
        ctx.doc_seq.insert("known".to_string(), 7);
        let mut params = SearchParams::query("*", &[]);
        params.pinned_hits = vec!["known:1".to_string(), "ghost:2".to_string()];
        params.hidden_hits = vec!["known".to_string(), "ghost".to_string()];
        let plan = build_plan(&params, &ctx.plan_ctx()).await.unwrap();
        assert_eq!(plan.included, vec![(7, 1)]);
        assert!(plan.excluded.contains(&7));
        assert_eq!(plan.excluded.len(), 1);
    }

    #[tokio::test]
    async fn test_hybrid_embedding_field_resolves_vector() {
        let ctx = Ctx::new();
        let params = SearchParams::query("red shoes", &["title", "emb"]);
        let plan = build_plan(&params, &ctx.plan_ctx()).await.unwrap();
        let (field, vec, _) = plan.vector.as_ref().unwrap();
        assert_eq!(field, "emb");
        assert_eq!(vec.len(), 4);
    }

    #[tokio::test]
    async fn test_explicit_vector_query_dimension_checked() {
        let ctx = Ctx::new();
        let mut params = SearchParams::query("*", &[]);
        params.vector_query = "emb:([0.1, 0.2], k:5)".to_string();
        let err = build_plan(&params, &ctx.plan_ctx()).await.unwrap_err();
        assert!(err.to_string().contains("4 dimensions"));

        params.vector_query = "emb:([0.1, 0.2, 0.3, 0.4], k:5)".to_string();
        let plan = build_plan(&params, &ctx.plan_ctx()).await.unwrap();
        assert_eq!(plan.vector.as_ref().unwrap().2, 5);
    }

    #[tokio::test]
    async fn test_override_filter_ored_into_tree() {
        let mut ctx = Ctx::new();
        ctx.overrides.push(Override {
            id: "o1".to_string(),
            rule: super::super::curation::OverrideRule {
                query: "red".to_string(),
                match_type: Some(super::super::curation::OverrideMatch::Exact),
                filter_by: String::new(),
                tags: Vec::new(),
            },
            includes: Vec::new(),
            excludes: Vec::new(),
            filter_by: "brand:=Acme".to_string(),
            sort_by: String::new(),
            replace_query: String::new(),
            remove_matched_tokens: false,
            filter_curated_hits: false,
            stop_processing: true,
            effective_from_ts: None,
            effective_to_ts: None,
        });
        let mut params = SearchParams::query("red", &["title"]);
        params.filter_by = "price:>10".to_string();
        let plan = build_plan(&params, &ctx.plan_ctx()).await.unwrap();
        assert!(matches!(plan.filter, Some(FilterNode::Or(_, _))));
    }

    #[tokio::test]
    async fn test_unknown_query_field() {
        let ctx = Ctx::new();
        let params = SearchParams::query("q", &["ghost"]);
        assert!(build_plan(&params, &ctx.plan_ctx()).await.is_err());

        let mut lax = SearchParams::query("*", &["ghost"]);
        lax.validate_field_names = false;
        assert!(build_plan(&lax, &ctx.plan_ctx()).await.is_ok());
    }
}
