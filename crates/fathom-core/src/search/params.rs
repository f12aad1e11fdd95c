//! Raw search request parameters.
//!
//! Every knob of the search surface, all optional unless noted. The plan
//! builder validates and normalizes these into an immutable
//! [`SearchPlan`](super::plan::SearchPlan); nothing here is trusted yet.

use serde::{Deserialize, Serialize};

/// Token ordering strategy during candidate expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOrder {
    #[default]
    Frequency,
    MaxScore,
}

/// Which 64-bit text-match layout the scorer packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    #[default]
    MaxScore,
    MaxWeight,
}

/// Behavior when a query token yields nothing: drop tokens and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropTokensMode {
    #[default]
    RightToLeft,
    LeftToRight,
    /// Alternate sides, at most N drops total.
    BothSides(usize),
}

impl DropTokensMode {
    /// Parses `left_to_right`, `right_to_left` or `both_sides:3`.
    pub fn parse(raw: &str) -> Result<Self, crate::error::Error> {
        match raw {
            "left_to_right" => Ok(DropTokensMode::LeftToRight),
            "right_to_left" => Ok(DropTokensMode::RightToLeft),
            other => {
                if let Some(n) = other.strip_prefix("both_sides:") {
                    let n: usize = n.parse().map_err(|_| {
                        crate::error::Error::invalid("both_sides expects a number of drops.")
                    })?;
                    return Ok(DropTokensMode::BothSides(n));
                }
                Err(crate::error::Error::invalid(format!(
                    "`{}` is not a valid drop_tokens_mode.",
                    other
                )))
            }
        }
    }
}

/// Split-join token handling for queries like `nonstick` vs `non stick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitJoinTokens {
    Off,
    #[default]
    Fallback,
    Always,
}

/// Facet counting strategy hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetStrategy {
    #[default]
    Automatic,
    Hash,
    Value,
}

fn default_per_page() -> usize {
    crate::config::DEFAULT_PER_PAGE
}

fn default_limit_hits() -> usize {
    usize::MAX
}

fn default_true() -> bool {
    true
}

fn default_snippet_threshold() -> usize {
    30
}

fn default_affix_tokens() -> usize {
    4
}

fn default_highlight_start() -> String {
    "<mark>".to_string()
}

fn default_highlight_end() -> String {
    "</mark>".to_string()
}

fn default_drop_tokens_threshold() -> usize {
    1
}

fn default_typo_tokens_threshold() -> usize {
    1
}

fn default_facet_sample_percent() -> u32 {
    100
}

fn default_facet_sample_threshold() -> usize {
    0
}

fn default_max_candidates() -> usize {
    4
}

fn default_group_limit() -> usize {
    3
}

/// The raw request. Field names match the wire parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// The query string. Required unless `voice_query` is given; empty or
    /// `*` means wildcard.
    #[serde(rename = "q")]
    pub query: String,
    /// Fields to search, `query_by` on the wire.
    pub query_by: Vec<String>,
    pub query_by_weights: Vec<u32>,
    pub filter_by: String,
    pub sort_by: String,
    pub facet_by: Vec<String>,
    pub facet_query: String,
    pub facet_query_num_typos: u32,
    #[serde(default = "default_facet_sample_percent")]
    pub facet_sample_percent: u32,
    #[serde(default = "default_facet_sample_threshold")]
    pub facet_sample_threshold: usize,
    pub facet_strategy: FacetStrategy,
    pub max_facet_values: usize,

    pub page: Option<usize>,
    pub offset: Option<usize>,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
    #[serde(default = "default_limit_hits")]
    pub limit_hits: usize,

    pub num_typos: Vec<u32>,
    pub prefix: Vec<bool>,
    pub infix: Vec<String>,
    pub token_order: TokenOrder,
    #[serde(default = "default_drop_tokens_threshold")]
    pub drop_tokens_threshold: usize,
    pub drop_tokens_mode: String,
    #[serde(default = "default_typo_tokens_threshold")]
    pub typo_tokens_threshold: usize,
    pub min_len_1typo: usize,
    pub min_len_2typo: usize,
    pub split_join_tokens: SplitJoinTokens,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    pub max_extra_prefix: usize,
    pub max_extra_suffix: usize,
    pub enable_typos_for_numerical_tokens: bool,
    pub enable_typos_for_alpha_numerical_tokens: bool,

    pub include_fields: Vec<String>,
    pub exclude_fields: Vec<String>,

    pub highlight_fields: Vec<String>,
    pub highlight_full_fields: Vec<String>,
    #[serde(default = "default_highlight_start")]
    pub highlight_start_tag: String,
    #[serde(default = "default_highlight_end")]
    pub highlight_end_tag: String,
    #[serde(default = "default_snippet_threshold")]
    pub snippet_threshold: usize,
    #[serde(default = "default_affix_tokens")]
    pub highlight_affix_num_tokens: usize,
    pub enable_highlight_v1: bool,

    /// `{"doc_id": position}` map of pinned hits.
    pub pinned_hits: Vec<String>,
    pub hidden_hits: Vec<String>,
    pub override_tags: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_overrides: bool,

    pub group_by: Vec<String>,
    #[serde(default = "default_group_limit")]
    pub group_limit: usize,
    pub group_missing_values: bool,

    pub prioritize_exact_match: bool,
    pub prioritize_token_position: bool,
    pub prioritize_num_matching_fields: bool,
    pub exhaustive_search: bool,
    pub search_cutoff_ms: Option<u64>,
    pub match_type: MatchType,

    pub vector_query: String,
    pub remote_embedding_timeout_ms: Option<u64>,
    pub remote_embedding_num_tries: Option<u32>,
    pub rerank_hybrid_matches: bool,

    pub voice_query: String,
    pub conversation: bool,
    pub conversation_model_id: String,
    pub conversation_id: String,

    pub stopwords: String,
    #[serde(default = "default_true")]
    pub enable_synonyms: bool,
    pub synonym_prefix: bool,
    pub synonym_num_typos: u32,

    pub personalization_user_id: String,
    pub personalization_model_id: String,

    #[serde(default = "default_true")]
    pub validate_field_names: bool,
    pub enable_lazy_filter: bool,
    pub max_filter_by_candidates: Option<usize>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            query: String::new(),
            query_by: Vec::new(),
            query_by_weights: Vec::new(),
            filter_by: String::new(),
            sort_by: String::new(),
            facet_by: Vec::new(),
            facet_query: String::new(),
            facet_query_num_typos: 2,
            facet_sample_percent: default_facet_sample_percent(),
            facet_sample_threshold: default_facet_sample_threshold(),
            facet_strategy: FacetStrategy::default(),
            max_facet_values: 10,
            page: None,
            offset: None,
            per_page: default_per_page(),
            limit_hits: default_limit_hits(),
            num_typos: Vec::new(),
            prefix: Vec::new(),
            infix: Vec::new(),
            token_order: TokenOrder::default(),
            drop_tokens_threshold: default_drop_tokens_threshold(),
            drop_tokens_mode: String::new(),
            typo_tokens_threshold: default_typo_tokens_threshold(),
            min_len_1typo: 4,
            min_len_2typo: 7,
            split_join_tokens: SplitJoinTokens::default(),
            max_candidates: default_max_candidates(),
            max_extra_prefix: usize::MAX,
            max_extra_suffix: usize::MAX,
            enable_typos_for_numerical_tokens: true,
            enable_typos_for_alpha_numerical_tokens: true,
            include_fields: Vec::new(),
            exclude_fields: Vec::new(),
            highlight_fields: Vec::new(),
            highlight_full_fields: Vec::new(),
            highlight_start_tag: default_highlight_start(),
            highlight_end_tag: default_highlight_end(),
            snippet_threshold: default_snippet_threshold(),
            highlight_affix_num_tokens: default_affix_tokens(),
            enable_highlight_v1: false,
            pinned_hits: Vec::new(),
            hidden_hits: Vec::new(),
            override_tags: Vec::new(),
            enable_overrides: true,
            group_by: Vec::new(),
            group_limit: default_group_limit(),
            group_missing_values: true,
            prioritize_exact_match: true,
            prioritize_token_position: false,
            prioritize_num_matching_fields: true,
            exhaustive_search: false,
            search_cutoff_ms: None,
            match_type: MatchType::default(),
            vector_query: String::new(),
            remote_embedding_timeout_ms: None,
            remote_embedding_num_tries: None,
            rerank_hybrid_matches: false,
            voice_query: String::new(),
            conversation: false,
            conversation_model_id: String::new(),
            conversation_id: String::new(),
            stopwords: String::new(),
            enable_synonyms: true,
            synonym_prefix: false,
            synonym_num_typos: 0,
            personalization_user_id: String::new(),
            personalization_model_id: String::new(),
            validate_field_names: true,
            enable_lazy_filter: false,
            max_filter_by_candidates: None,
        }
    }
}

impl SearchParams {
    /// Convenience constructor for the common query/fields pair.
    pub fn query(q: impl Into<String>, query_by: &[&str]) -> Self {
        Self {
            query: q.into(),
            query_by: query_by.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Parses a `pinned_hits` entry of the form `doc_id:position`.
    pub fn parse_pinned_hit(raw: &str) -> Result<(String, usize), crate::error::Error> {
        let (id, pos) = raw.rsplit_once(':').ok_or_else(|| {
            crate::error::Error::invalid(format!(
                "Pinned hit `{}` must look like `doc_id:position`.",
                raw
            ))
        })?;
        let pos: usize = pos.parse().map_err(|_| {
            crate::error::Error::invalid(format!("Pinned hit position `{}` is not a number.", pos))
        })?;
        if pos == 0 {
            return Err(crate::error::Error::invalid(
                "Pinned hit positions start at 1.",
            ));
        }
        Ok((id.to_string(), pos))
    }
}
