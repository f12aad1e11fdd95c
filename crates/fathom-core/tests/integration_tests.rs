//! End-to-end tests over the public engine surface: registry, ingest,
//! search pipeline, curation, grouping, vectors and persistence.

use fathom_core::collection::IndexAction;
use fathom_core::schema::coerce::DirtyValues;
use fathom_core::search::union::UnionParams;
use fathom_core::search::SearchParams;
use fathom_core::store::{InMemoryKvStore, RedbKvStore};
use fathom_core::Registry;
use serde_json::{json, Value};
use std::sync::Arc;

async fn registry() -> Registry {
    Registry::new(Arc::new(InMemoryKvStore::new()))
}

async fn products_registry() -> Registry {
    let r = registry().await;
    r.create_collection(json!({
        "name": "products",
        "fields": [
            {"name": "title", "type": "string"},
            {"name": "brand", "type": "string", "facet": true},
            {"name": "price", "type": "float", "sort": true},
            {"name": "points", "type": "int32", "sort": true}
        ]
    }))
    .await
    .unwrap();
    r
}

async fn seed(r: &Registry, docs: Vec<Value>) {
    let results = r
        .add_many("products", docs, IndexAction::Create, DirtyValues::CoerceOrReject)
        .await
        .unwrap();
    for result in results {
        result.unwrap();
    }
}

#[tokio::test]
async fn test_bucketed_text_match_scenario() {
    // Scenario S1: 50 strong matches ("foo bar") and 50 weak ones ("foo");
    // two buckets make the secondary seq-id sort dominate within a class.
    let r = products_registry().await;
    let mut docs = Vec::new();
    for i in 0..100 {
        let title = if i % 2 == 0 { "foo bar" } else { "foo" };
        docs.push(json!({
            "id": format!("d{}", i),
            "title": title,
            "brand": "b",
            "price": 1.0,
            "points": i
        }));
    }
    seed(&r, docs).await;

    let mut params = SearchParams::query("foo bar", &["title"]);
    params.sort_by = "_text_match(buckets:2):desc, _seq_id:desc".to_string();
    params.per_page = 100;
    let response = r.search("products", &params).await.unwrap();
    let hits = response.hits.unwrap();
    assert_eq!(hits.len(), 100);

    let ids: Vec<u32> = hits
        .iter()
        .map(|h| {
            h.document["id"]
                .as_str()
                .unwrap()
                .trim_start_matches('d')
                .parse()
                .unwrap()
        })
        .collect();
    // Hits 0-49: the strong class (even seq ids) in descending seq order.
    let mut expected_strong: Vec<u32> = (0..100).filter(|i| i % 2 == 0).collect();
    expected_strong.reverse();
    assert_eq!(&ids[..50], expected_strong.as_slice());
    // Hits 50-99: the weak class likewise.
    let mut expected_weak: Vec<u32> = (0..100).filter(|i| i % 2 == 1).collect();
    expected_weak.reverse();
    assert_eq!(&ids[50..], expected_weak.as_slice());

    // The packed score (not the bucket ordinal) survives in the payload.
    assert!(hits[0].text_match.unwrap() > hits[99].text_match.unwrap());
}

#[tokio::test]
async fn test_multi_value_filter_equivalence() {
    // Filter law: field:=[a,b] is equivalent to (field:=a || field:=b).
    let r = products_registry().await;
    seed(
        &r,
        vec![
            json!({"id": "1", "title": "x", "brand": "Acme", "price": 1.0, "points": 0}),
            json!({"id": "2", "title": "x", "brand": "Widgets", "price": 1.0, "points": 0}),
            json!({"id": "3", "title": "x", "brand": "Other", "price": 1.0, "points": 0}),
        ],
    )
    .await;

    let mut list_params = SearchParams::query("*", &[]);
    list_params.filter_by = "brand:=[Acme, Widgets]".to_string();
    let listed = r.search("products", &list_params).await.unwrap();

    let mut or_params = SearchParams::query("*", &[]);
    or_params.filter_by = "(brand:=Acme || brand:=Widgets)".to_string();
    let ored = r.search("products", &or_params).await.unwrap();

    assert_eq!(listed.found, 2);
    assert_eq!(listed.found, ored.found);
}

#[tokio::test]
async fn test_grouping_with_duplicates_beyond_group_limit() {
    let r = products_registry().await;
    let mut docs = Vec::new();
    for i in 0..9 {
        docs.push(json!({
            "id": format!("g{}", i),
            "title": "thing",
            "brand": if i < 6 { "Acme" } else { "Widgets" },
            "price": i as f64,
            "points": i
        }));
    }
    seed(&r, docs).await;

    let mut params = SearchParams::query("*", &[]);
    params.group_by = vec!["brand".to_string()];
    params.group_limit = 2;
    let response = r.search("products", &params).await.unwrap();
    assert_eq!(response.found, 2);
    assert_eq!(response.found_docs, Some(9));
    let groups = response.grouped_hits.unwrap();
    for group in &groups {
        assert!(group.hits.len() <= 2);
    }
    // The Acme group saw 6 members even though only 2 are returned.
    let acme = groups
        .iter()
        .find(|g| g.group_key.contains(&json!("Acme")))
        .unwrap();
    assert_eq!(acme.found, 6);
}

#[tokio::test]
async fn test_facets_with_facet_query() {
    let r = products_registry().await;
    seed(
        &r,
        vec![
            json!({"id": "1", "title": "a", "brand": "Nike", "price": 10.0, "points": 1}),
            json!({"id": "2", "title": "a", "brand": "Nike", "price": 20.0, "points": 2}),
            json!({"id": "3", "title": "a", "brand": "Puma", "price": 30.0, "points": 3}),
        ],
    )
    .await;

    let mut params = SearchParams::query("*", &[]);
    params.facet_by = vec!["brand".to_string()];
    params.facet_query = "brand:ni".to_string();
    let response = r.search("products", &params).await.unwrap();
    let brand = &response.facet_counts[0];
    assert_eq!(brand.field_name, "brand");
    assert_eq!(brand.counts.len(), 1);
    assert_eq!(brand.counts[0].value, "Nike");
    assert_eq!(brand.counts[0].count, 2);
    assert_eq!(
        brand.counts[0].highlighted.as_deref(),
        Some("<mark>Ni</mark>ke")
    );
}

#[tokio::test]
async fn test_vector_and_hybrid_search_with_local_embeddings() {
    let r = registry().await;
    r.create_collection(json!({
        "name": "articles",
        "fields": [
            {"name": "body", "type": "string"},
            {"name": "embedding", "type": "float[]", "num_dim": 16,
             "embed": {"from": ["body"], "model_config": {"model_name": "dev-hash"}}}
        ]
    }))
    .await
    .unwrap();

    for (id, body) in [
        ("a", "rust memory safety"),
        ("b", "gardening in spring"),
        ("c", "rust borrow checker"),
    ] {
        r.add_document(
            "articles",
            json!({"id": id, "body": body}),
            IndexAction::Create,
            DirtyValues::CoerceOrReject,
        )
        .await
        .unwrap();
    }

    // Hybrid: querying by the embedding field fuses text and vector ranks.
    let params = SearchParams::query("rust memory safety", &["body", "embedding"]);
    let response = r.search("articles", &params).await.unwrap();
    let hits = response.hits.unwrap();
    assert_eq!(hits[0].document["id"], json!("a"));
    assert!(hits[0].vector_distance.is_some());
    assert!(hits[0].hybrid_search_info.is_some());

    // Pure vector search referencing a stored document.
    let mut by_id = SearchParams::query("*", &[]);
    by_id.vector_query = "embedding:([], id: a)".to_string();
    let response = r.search("articles", &by_id).await.unwrap();
    let hits = response.hits.unwrap();
    assert_eq!(hits[0].document["id"], json!("a"));
    assert!(hits[0].vector_distance.unwrap() < 1e-6);
}

#[tokio::test]
async fn test_nested_fields_highlight_and_prune() {
    let r = registry().await;
    r.create_collection(json!({
        "name": "books",
        "enable_nested_fields": true,
        "fields": [
            {"name": "title", "type": "string"},
            {"name": "author", "type": "object"}
        ]
    }))
    .await
    .unwrap();
    r.add_document(
        "books",
        json!({"id": "b1", "title": "compilers", "author": {"name": "Grace Redmond", "age": 50}}),
        IndexAction::Create,
        DirtyValues::CoerceOrReject,
    )
    .await
    .unwrap();

    // The flattened child path is searchable...
    let mut params = SearchParams::query("grace", &["author.name"]);
    params.highlight_fields = vec!["author".to_string()];
    let response = r.search("books", &params).await.unwrap();
    let hits = response.hits.unwrap();
    assert_eq!(response.found, 1);
    // ...but the stored document comes back in its nested client shape.
    let doc = &hits[0].document;
    assert!(doc.get("author.name").is_none());
    assert!(doc.get(".flat").is_none());
    assert_eq!(doc["author"]["name"], json!("Grace Redmond"));
    // And the highlight doc mirrors the nesting.
    assert_eq!(
        hits[0].highlight["author"]["name"]["snippet"],
        json!("<mark>Grace</mark> Redmond")
    );
}

#[tokio::test]
async fn test_union_across_collections() {
    let r = products_registry().await;
    r.create_collection(json!({
        "name": "services",
        "fields": [
            {"name": "title", "type": "string"},
            {"name": "price", "type": "float", "sort": true}
        ]
    }))
    .await
    .unwrap();
    seed(
        &r,
        vec![json!({"id": "p1", "title": "widget", "brand": "b", "price": 15.0, "points": 1})],
    )
    .await;
    r.add_document(
        "services",
        json!({"id": "s1", "title": "installation", "price": 5.0}),
        IndexAction::Create,
        DirtyValues::CoerceOrReject,
    )
    .await
    .unwrap();

    let sorted = |collection: &str| {
        let mut params = SearchParams::query("*", &[]);
        params.sort_by = "price:asc".to_string();
        (collection.to_string(), params)
    };
    let result = r
        .union_search(
            vec![sorted("products"), sorted("services")],
            UnionParams::default(),
        )
        .await
        .unwrap();
    assert_eq!(result["found"], json!(2));
    let hits = result["hits"].as_array().unwrap();
    assert_eq!(hits[0]["collection"], json!("services"));
    assert_eq!(hits[1]["collection"], json!("products"));
}

#[tokio::test]
async fn test_schema_alter_end_to_end() {
    let r = products_registry().await;
    seed(
        &r,
        vec![
            json!({"id": "1", "title": "a", "brand": "x", "price": 1.0, "points": 1,
                   "stock": "7"}),
        ],
    )
    .await;

    let arc = r.get("products").await.unwrap();
    let mut collection = arc.write().await;
    // "7" coerces to int32, so the alter validates and applies.
    collection
        .alter(&json!({"fields": [{"name": "stock", "type": "int32"}]}))
        .await
        .unwrap();
    drop(collection);

    let mut params = SearchParams::query("*", &[]);
    params.filter_by = "stock:=7".to_string();
    let response = r.search("products", &params).await.unwrap();
    assert_eq!(response.found, 1);
}

#[tokio::test]
async fn test_search_cutoff_surfaces_as_timeout() {
    let r = products_registry().await;
    seed(
        &r,
        vec![json!({"id": "1", "title": "a", "brand": "x", "price": 1.0, "points": 1})],
    )
    .await;

    let mut params = SearchParams::query("*", &[]);
    params.search_cutoff_ms = Some(0);
    let err = r.search("products", &params).await.unwrap_err();
    assert_eq!(err.code(), 408);
}

#[tokio::test]
async fn test_persistence_with_redb() {
    let temp = tempfile::TempDir::new().unwrap();
    let path = temp.path().join("fathom.redb");

    {
        let store = RedbKvStore::open(&path).unwrap();
        let r = Registry::new(Arc::new(store));
        r.create_collection(json!({
            "name": "notes",
            "fields": [{"name": "text", "type": "string"}]
        }))
        .await
        .unwrap();
        r.add_document(
            "notes",
            json!({"id": "n1", "text": "persistent search"}),
            IndexAction::Create,
            DirtyValues::CoerceOrReject,
        )
        .await
        .unwrap();
    }

    let store = RedbKvStore::open(&path).unwrap();
    let r = Registry::new(Arc::new(store));
    r.load().await.unwrap();
    let response = r
        .search("notes", &SearchParams::query("persistent", &["text"]))
        .await
        .unwrap();
    assert_eq!(response.found, 1);
    let hits = response.hits.unwrap();
    assert_eq!(hits[0].document["id"], json!("n1"));
}

#[tokio::test]
async fn test_document_roundtrip_after_coercion() {
    // Round-trip law: a document inserted then fetched keeps its field
    // values after coercion.
    let r = products_registry().await;
    r.add_document(
        "products",
        json!({"id": "1", "title": "a", "brand": "x", "price": "19.5", "points": true}),
        IndexAction::Create,
        DirtyValues::CoerceOrReject,
    )
    .await
    .unwrap();

    let arc = r.get("products").await.unwrap();
    let collection = arc.read().await;
    let doc = collection.get_document("1").await.unwrap();
    assert_eq!(doc["price"], json!(19.5));
    assert_eq!(doc["points"], json!(1));
}
