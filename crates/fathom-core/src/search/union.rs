//! Union search: one merged ranking over several collections.
//!
//! Each sub-search runs the ordinary pipeline with `is_union` set and its
//! `union_search_index` fixed. Before execution the declared sort *types*
//! and directions must match positionally across all sub-searches; after
//! execution the per-collection rankings fold into a single tournament
//! keyed by the shared sort order, tie-broken by sub-search index and seq
//! id. Each winning hit is hydrated and highlighted by its owning
//! collection.

use super::params::SearchParams;
use super::plan::SearchPlan;
use super::response::assemble_hit;
use super::sort::compare_keys;
use crate::collection::Registry;
use crate::error::{Error, Result};
use crate::index::RankedHit;
use serde_json::{json, Value};

/// Pagination of the merged ranking.
#[derive(Debug, Clone)]
pub struct UnionParams {
    pub page: Option<usize>,
    pub per_page: usize,
    pub offset: Option<usize>,
    pub limit_hits: usize,
}

impl Default for UnionParams {
    fn default() -> Self {
        Self {
            page: None,
            per_page: crate::config::DEFAULT_PER_PAGE,
            offset: None,
            limit_hits: usize::MAX,
        }
    }
}

struct UnionHit {
    hit: RankedHit,
    search_index: usize,
}

/// Executes a union search across `(collection, params)` pairs.
pub async fn union_search(
    registry: &Registry,
    searches: Vec<(String, SearchParams)>,
    union_params: UnionParams,
) -> Result<Value> {
    if searches.is_empty() {
        return Err(Error::invalid("A union search needs at least one search."));
    }

    // -- plan every sub-search ----------------------------------------------
    let mut plans: Vec<(String, SearchParams, SearchPlan)> = Vec::with_capacity(searches.len());
    for (i, (collection_name, params)) in searches.into_iter().enumerate() {
        let arc = registry.get(&collection_name).await?;
        let collection = arc.read().await;
        let plan = collection
            .build_search_plan(&params, true, i as u32)
            .await?;
        plans.push((collection_name, params, plan));
    }

    check_sort_contract(registry, &plans).await?;

    // -- execute -------------------------------------------------------------
    let page = union_params.page.unwrap_or(1);
    if page == 0 {
        return Err(Error::invalid("Page numbers start at 1."));
    }
    let offset = union_params
        .offset
        .unwrap_or((page - 1) * union_params.per_page);
    let fetch_size = offset
        .saturating_add(union_params.per_page)
        .min(union_params.limit_hits);

    let mut merged: Vec<UnionHit> = Vec::new();
    let mut found: u32 = 0;
    let mut out_of: u32 = 0;
    let mut search_cutoff = false;

    for (i, (collection_name, _, plan)) in plans.iter().enumerate() {
        let arc = registry.get(collection_name).await?;
        let collection = arc.read().await;
        let executed = collection.execute(plan, Some(registry)).await?;
        found += executed.found;
        out_of += executed.out_of;
        search_cutoff |= executed.search_cutoff;
        for hit in executed.hits {
            merged.push(UnionHit {
                hit,
                search_index: i,
            });
        }
    }

    // -- tournament ----------------------------------------------------------
    let shared_sorts = &plans[0].2.sort;
    merged.sort_by(|a, b| {
        compare_keys(&a.hit.keys, &b.hit.keys, shared_sorts)
            .then_with(|| a.search_index.cmp(&b.search_index))
            .then_with(|| b.hit.seq_id.cmp(&a.hit.seq_id))
    });
    merged.truncate(fetch_size);

    if search_cutoff && merged.is_empty() && found == 0 {
        return Err(Error::Timeout(
            "Request timed out before it could be completed.".to_string(),
        ));
    }

    // -- response assembly ---------------------------------------------------
    let mut hits: Vec<Value> = Vec::new();
    for union_hit in merged.iter().skip(offset).take(union_params.per_page) {
        let (collection_name, _, plan) = &plans[union_hit.search_index];
        let arc = registry.get(collection_name).await?;
        let collection = arc.read().await;
        let doc = collection.fetch_document(union_hit.hit.seq_id).await?;
        let fields = collection.meta().fields.clone();
        let mut hit = assemble_hit(
            &union_hit.hit,
            &doc,
            plan,
            &fields,
            &collection.meta().symbols_to_index,
            &collection.meta().token_separators,
            false,
        );
        hit.search_index = Some(union_hit.search_index as u32);
        hit.collection = Some(collection_name.clone());
        hits.push(serde_json::to_value(hit)?);
    }

    Ok(json!({
        "found": found,
        "out_of": out_of,
        "page": page,
        "hits": hits,
        "search_cutoff": search_cutoff,
        "union_request_params": plans
            .iter()
            .map(|(name, params, plan)| json!({
                "collection": name,
                "q": params.query,
                "per_page": plan.per_page,
            }))
            .collect::<Vec<_>>(),
    }))
}

/// Validates that every sub-search declares the same sort types and
/// directions, position by position. The error carries a precise diff and,
/// when a default sorting field is in play, a hint to remove it.
async fn check_sort_contract(
    registry: &Registry,
    plans: &[(String, SearchParams, SearchPlan)],
) -> Result<()> {
    let (first_name, _, first_plan) = &plans[0];
    for (name, _, plan) in plans.iter().skip(1) {
        let mismatch = first_plan.sort.len() != plan.sort.len()
            || first_plan
                .sort
                .iter()
                .zip(&plan.sort)
                .any(|(a, b)| a.type_name() != b.type_name() || a.order != b.order);
        if !mismatch {
            continue;
        }

        let describe = |plan: &SearchPlan| -> String {
            plan.sort
                .iter()
                .map(|s| format!("{}:{}", s.type_name(), s.order.as_str()))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut message = format!(
            "Union searches must sort by the same types: `{}` sorts by [{}] while `{}` sorts \
             by [{}].",
            first_name,
            describe(first_plan),
            name,
            describe(plan)
        );

        // Name the collections whose default sorting field leaked into the
        // contract and suggest removing it.
        let mut defaulted: Vec<String> = Vec::new();
        for (candidate_name, params, _) in plans {
            if !params.sort_by.is_empty() {
                continue;
            }
            let arc = registry.get(candidate_name).await?;
            let collection = arc.read().await;
            if !collection.meta().default_sorting_field.is_empty() {
                defaulted.push(candidate_name.clone());
            }
        }
        if !defaulted.is_empty() {
            message.push_str(&format!(
                " Collection(s) {} contributed their default sorting field; consider removing \
                 the default or giving an explicit sort_by.",
                defaulted.join(", ")
            ));
        }
        return Err(Error::invalid(message));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::IndexAction;
    use crate::schema::coerce::DirtyValues;
    use crate::store::InMemoryKvStore;
    use std::sync::Arc;

    async fn registry_with_two_collections() -> Registry {
        let registry = Registry::new(Arc::new(InMemoryKvStore::new()));
        registry
            .create_collection(json!({
                "name": "books",
                "fields": [
                    {"name": "title", "type": "string"},
                    {"name": "price", "type": "float", "sort": true}
                ]
            }))
            .await
            .unwrap();
        registry
            .create_collection(json!({
                "name": "games",
                "fields": [
                    {"name": "title", "type": "string"},
                    {"name": "price", "type": "float", "sort": true},
                    {"name": "rank", "type": "int32", "sort": true}
                ]
            }))
            .await
            .unwrap();

        for (i, price) in [10.0, 30.0].iter().enumerate() {
            registry
                .add_document(
                    "books",
                    json!({"id": format!("b{}", i), "title": "alpha book", "price": price}),
                    IndexAction::Create,
                    DirtyValues::CoerceOrReject,
                )
                .await
                .unwrap();
        }
        for (i, price) in [20.0, 5.0].iter().enumerate() {
            registry
                .add_document(
                    "games",
                    json!({"id": format!("g{}", i), "title": "alpha game",
                           "price": price, "rank": i}),
                    IndexAction::Create,
                    DirtyValues::CoerceOrReject,
                )
                .await
                .unwrap();
        }
        registry
    }

    fn sorted_params(sort_by: &str) -> SearchParams {
        let mut params = SearchParams::query("*", &[]);
        params.sort_by = sort_by.to_string();
        params
    }

    #[tokio::test]
    async fn test_union_merges_under_shared_sort() {
        let registry = registry_with_two_collections().await;
        let result = registry
            .union_search(
                vec![
                    ("books".to_string(), sorted_params("price:asc")),
                    ("games".to_string(), sorted_params("price:asc")),
                ],
                UnionParams::default(),
            )
            .await
            .unwrap();

        assert_eq!(result["found"], json!(4));
        let hits = result["hits"].as_array().unwrap();
        let prices: Vec<f64> = hits
            .iter()
            .map(|h| h["document"]["price"].as_f64().unwrap())
            .collect();
        assert_eq!(prices, vec![5.0, 10.0, 20.0, 30.0]);
        // Source tagging.
        assert_eq!(hits[0]["collection"], json!("games"));
        assert_eq!(hits[1]["collection"], json!("books"));
        assert_eq!(hits[0]["search_index"], json!(1));
    }

    #[tokio::test]
    async fn test_union_sort_type_mismatch() {
        // Scenario S5: float vs int32 sort in the same position.
        let registry = registry_with_two_collections().await;
        let err = registry
            .union_search(
                vec![
                    ("books".to_string(), sorted_params("price:asc")),
                    ("games".to_string(), sorted_params("rank:asc")),
                ],
                UnionParams::default(),
            )
            .await
            .unwrap_err();
        let message = err.to_string();
        assert_eq!(err.code(), 400);
        assert!(message.contains("books"));
        assert!(message.contains("games"));
        assert!(message.contains("float"));
        assert!(message.contains("int32"));
    }

    #[tokio::test]
    async fn test_union_of_single_search() {
        let registry = registry_with_two_collections().await;
        let result = registry
            .union_search(
                vec![("books".to_string(), sorted_params("price:desc"))],
                UnionParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(result["found"], json!(2));
        let hits = result["hits"].as_array().unwrap();
        assert_eq!(hits[0]["document"]["price"], json!(30.0));
    }

    #[tokio::test]
    async fn test_union_pagination() {
        let registry = registry_with_two_collections().await;
        let result = registry
            .union_search(
                vec![
                    ("books".to_string(), sorted_params("price:asc")),
                    ("games".to_string(), sorted_params("price:asc")),
                ],
                UnionParams {
                    page: Some(2),
                    per_page: 2,
                    offset: None,
                    limit_hits: usize::MAX,
                },
            )
            .await
            .unwrap();
        let hits = result["hits"].as_array().unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0]["document"]["price"], json!(20.0));
    }
}
