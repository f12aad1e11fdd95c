//! Plan execution against a collection's index.
//!
//! The executor resolves filter references, evaluates the filter tree,
//! prepares the per-search sort runtime (`_eval` sets, `_vector_query`
//! distances), asks the index to rank, then merges curated hits and applies
//! bucketed rescoring. Document hydration and response shaping stay with
//! the collection, which owns the store.

use super::filter::{evaluate, resolve_references, EvalContext, FilterNode, JoinSource};
use super::merge::{apply_bucket_rescoring, cutoff_reached, merge_hits};
use super::plan::SearchPlan;
use super::sort::{SortBy, SortRuntime};
use crate::error::{Error, Result};
use crate::index::{IndexSearchRequest, MemoryIndex, RankedHit};
use crate::schema::Field;
use crate::SeqId;
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};

/// Collection-side inputs to execution.
pub struct ExecutorContext<'a> {
    pub collection_name: &'a str,
    pub fields: &'a [Field],
    pub index: &'a MemoryIndex,
    /// Local reference field per referenced collection, for join atoms.
    pub ref_local_fields: &'a HashMap<String, String>,
}

/// Ranked output of one executed plan, pre-pagination.
pub struct ExecutedSearch {
    /// Merged and rescored hits, at most `fetch_size` raw plus curated.
    pub hits: Vec<RankedHit>,
    pub found: u32,
    pub found_docs: u32,
    pub out_of: u32,
    pub facet_counts: Vec<super::facet::FacetCounts>,
    pub search_cutoff: bool,
    /// Seq ids that entered through curation, for the `curated` marker.
    pub curated_ids: HashSet<SeqId>,
}

/// Executes a plan end to end against one collection's index.
#[instrument(skip_all, fields(collection = ctx.collection_name))]
pub async fn execute_plan(
    plan: &SearchPlan,
    ctx: &ExecutorContext<'_>,
    joins: Option<&dyn JoinSource>,
) -> Result<ExecutedSearch> {
    // -- filter --------------------------------------------------------------
    let filter_ids: Option<Vec<SeqId>> = match &plan.filter {
        None => None,
        Some(tree) => {
            let mut tree: FilterNode = tree.clone();
            if let Some(joins) = joins {
                resolve_references(&mut tree, joins).await?;
            }
            let eval_ctx = EvalContext {
                index: ctx.index,
                fields: ctx.fields,
                validate_field_names: plan.validate_field_names,
                ref_local_fields: ctx.ref_local_fields,
            };
            let result = evaluate(&tree, &eval_ctx)?;
            Some(result.into_ids())
        }
    };

    if cutoff_reached(plan.deadline) {
        return Ok(empty_result(ctx, true));
    }

    // -- sort runtime --------------------------------------------------------
    let mut sort = SortRuntime::new(plan.sort.clone());
    sort.union_search_index = plan.union_search_index;
    for (i, clause) in plan.sort.iter().enumerate() {
        match &clause.by {
            SortBy::Eval { exprs } => {
                let mut sets = Vec::with_capacity(exprs.len());
                for (expr, score) in exprs {
                    let mut tree = expr.clone();
                    if let Some(joins) = joins {
                        resolve_references(&mut tree, joins).await?;
                    }
                    let eval_ctx = EvalContext {
                        index: ctx.index,
                        fields: ctx.fields,
                        validate_field_names: plan.validate_field_names,
                        ref_local_fields: ctx.ref_local_fields,
                    };
                    let ids: HashSet<SeqId> =
                        evaluate(&tree, &eval_ctx)?.into_ids().into_iter().collect();
                    sets.push((ids, *score));
                }
                sort.eval_sets[i] = sets;
            }
            SortBy::VectorQuery { spec, vector } => {
                if vector.is_empty() {
                    return Err(Error::invalid(format!(
                        "The `_vector_query` sort on `{}` did not resolve to a vector.",
                        spec.field
                    )));
                }
                let neighbors =
                    ctx.index
                        .vector_search(&spec.field, vector, ctx.index.num_docs().max(1))?;
                sort.vector_sort[i] = Some(neighbors.into_iter().collect());
            }
            _ => {}
        }
    }

    // -- curated include set -------------------------------------------------
    let mut included = plan.included.clone();
    if plan.filter_curated_hits {
        if let Some(filter) = &filter_ids {
            let filter_set: HashSet<SeqId> = filter.iter().copied().collect();
            included.retain(|(seq_id, _)| filter_set.contains(seq_id));
        }
    }
    let included_ids: Vec<SeqId> = included.iter().map(|(id, _)| *id).collect();
    let curated_ids: HashSet<SeqId> = included_ids.iter().copied().collect();

    // -- index ranking -------------------------------------------------------
    let request = IndexSearchRequest {
        tokens: plan.query_tokens.clone(),
        exclude_tokens: plan.exclude_tokens.clone(),
        weighted_fields: plan.weighted_fields.clone(),
        field_prefix: plan.field_prefix.clone(),
        field_infix: plan.field_infix.clone(),
        match_type: plan.match_type,
        is_wildcard: plan.is_wildcard,
        filter_ids,
        excluded_ids: &plan.excluded,
        included_ids: &included_ids,
        sort: &sort,
        fetch_size: plan.fetch_size,
        group_by: &plan.group_by,
        group_limit: plan.group_limit,
        group_missing_values: plan.group_missing_values,
        facets: &plan.facets,
        facet_query: plan.facet_query.clone(),
        facet_sample_percent: plan.facet_sample_percent,
        facet_sample_threshold: plan.facet_sample_threshold,
        max_facet_values: plan.max_facet_values,
        vector: plan.vector.clone(),
        drop_tokens_threshold: plan.drop_tokens_threshold,
        drop_tokens_mode: plan.drop_tokens_mode,
        deadline: plan.deadline,
    };
    let output = ctx.index.run_search(&request)?;

    // -- merge + bucketing ---------------------------------------------------
    let curated: Vec<(RankedHit, usize)> = output
        .override_hits
        .into_iter()
        .zip(included.iter().map(|(_, pos)| *pos))
        .collect();
    let extra_found = curated
        .iter()
        .filter(|(hit, _)| !output.raw_hits.iter().any(|r| r.seq_id == hit.seq_id))
        .count() as u32;
    let mut hits = merge_hits(output.raw_hits, curated);
    apply_bucket_rescoring(&mut hits, &plan.sort);

    let search_cutoff = output.search_cutoff || cutoff_reached(plan.deadline);
    debug!(
        found = output.found + extra_found,
        cutoff = search_cutoff,
        "Search execution complete"
    );

    Ok(ExecutedSearch {
        hits,
        found: output.found + extra_found,
        found_docs: output.found_docs + extra_found,
        out_of: ctx.index.num_docs() as u32,
        facet_counts: output.facet_counts,
        search_cutoff,
        curated_ids,
    })
}

fn empty_result(ctx: &ExecutorContext<'_>, cutoff: bool) -> ExecutedSearch {
    ExecutedSearch {
        hits: Vec::new(),
        found: 0,
        found_docs: 0,
        out_of: ctx.index.num_docs() as u32,
        facet_counts: Vec::new(),
        search_cutoff: cutoff,
        curated_ids: HashSet::new(),
    }
}
