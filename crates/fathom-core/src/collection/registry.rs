//! The collection registry.
//!
//! Owns every collection behind a per-collection reader-writer lock, plus a
//! lifecycle lock (the map itself) so a drop cannot race in-flight
//! requests. Cross-collection concerns route through here: reference
//! lookups at index time, join filters at search time, the delete cascade
//! and async reference back-fill. Back-references are weak-by-name: a
//! collection only stores collection *names*; resolution always goes
//! through the registry.

use super::{Collection, CollectionMeta, IndexAction};
use crate::error::{Error, Result};
use crate::reference::{backfill_allowed, cascade_remove, read_helper, CascadeAction};
use crate::schema::coerce::DirtyValues;
use crate::schema::{reference_helper_name, Field};
use crate::search::filter::{
    resolve_references, Comparator, FilterAtom, FilterNode, JoinSource,
};
use crate::search::params::SearchParams;
use crate::search::response::SearchResponse;
use crate::store::{keys, KvStore};
use crate::SeqId;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Registry of all collections over one shared store.
pub struct Registry {
    store: Arc<dyn KvStore>,
    collections: RwLock<HashMap<String, Arc<RwLock<Collection>>>>,
    next_collection_id: AtomicU32,
}

impl Registry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            collections: RwLock::new(HashMap::new()),
            next_collection_id: AtomicU32::new(0),
        }
    }

    pub fn store(&self) -> Arc<dyn KvStore> {
        self.store.clone()
    }

    /// Loads every persisted collection, then wires up back-references.
    pub async fn load(&self) -> Result<()> {
        let metas = self
            .store
            .scan_prefix(keys::COLLECTION_META_PREFIX.as_bytes())
            .await?;
        let mut max_id = 0;
        for (_, bytes) in metas {
            let meta: CollectionMeta = serde_json::from_slice(&bytes)?;
            max_id = max_id.max(meta.id + 1);
            let name = meta.name.clone();
            let collection = Collection::load(meta, self.store.clone()).await?;
            self.collections
                .write()
                .await
                .insert(name, Arc::new(RwLock::new(collection)));
        }
        self.next_collection_id.store(max_id, Ordering::SeqCst);
        self.rebuild_back_edges().await?;
        info!(
            collections = self.collections.read().await.len(),
            "Registry loaded"
        );
        Ok(())
    }

    async fn rebuild_back_edges(&self) -> Result<()> {
        let map = self.collections.read().await;
        let mut edges: Vec<(String, String, String, bool)> = Vec::new();
        for (name, arc) in map.iter() {
            let collection = arc.read().await;
            for field in collection.meta().fields.iter().filter(|f| f.is_reference()) {
                let (target, _) = field.reference_target()?;
                edges.push((
                    target,
                    name.clone(),
                    field.name.clone(),
                    field.async_reference,
                ));
            }
        }
        for (target, source, field, is_async) in edges {
            let Some(arc) = map.get(&target) else {
                warn!(
                    target = %target,
                    source = %source,
                    "Reference target collection is missing"
                );
                continue;
            };
            let mut collection = arc.write().await;
            if is_async {
                collection.async_referenced_ins.insert(source, field);
            } else {
                collection.referenced_in.insert(source, field);
            }
        }
        Ok(())
    }

    /// Creates a collection from a schema payload.
    pub async fn create_collection(&self, schema: Value) -> Result<Value> {
        let name = schema
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| Error::invalid("A collection schema needs a `name`."))?
            .to_string();
        if self.collections.read().await.contains_key(&name) {
            return Err(Error::Conflict(format!(
                "A collection with name `{}` already exists.",
                name
            )));
        }

        let fields: Vec<Field> = serde_json::from_value(
            schema
                .get("fields")
                .cloned()
                .ok_or_else(|| Error::invalid("A collection schema needs `fields`."))?,
        )
        .map_err(|e| Error::invalid(format!("Invalid field list: {}", e)))?;

        let meta = CollectionMeta {
            name: name.clone(),
            id: self.next_collection_id.fetch_add(1, Ordering::SeqCst),
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            fields,
            default_sorting_field: schema
                .get("default_sorting_field")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            fallback_field_type: schema
                .get("fallback_field_type")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            symbols_to_index: schema
                .get("symbols_to_index")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            token_separators: schema
                .get("token_separators")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            enable_nested_fields: schema
                .get("enable_nested_fields")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        };

        // Reference targets must exist before the edge is created.
        for field in meta.fields.iter().filter(|f| f.is_reference()) {
            let (target, _) = field.reference_target()?;
            if !self.collections.read().await.contains_key(&target) {
                return Err(Error::not_found(format!(
                    "Referenced collection `{}` not found.",
                    target
                )));
            }
        }

        let collection = Collection::create(meta, self.store.clone()).await?;
        let schema_json = collection.schema_json();

        // Register backward edges with the referenced collections.
        let back_edges: Vec<(String, String, bool)> = collection
            .meta()
            .fields
            .iter()
            .filter(|f| f.is_reference())
            .filter_map(|f| {
                f.reference_target()
                    .ok()
                    .map(|(t, _)| (t, f.name.clone(), f.async_reference))
            })
            .collect();

        let mut map = self.collections.write().await;
        for (target, field, is_async) in back_edges {
            if let Some(arc) = map.get(&target) {
                let mut referenced = arc.write().await;
                if is_async {
                    referenced.async_referenced_ins.insert(name.clone(), field);
                } else {
                    referenced.referenced_in.insert(name.clone(), field);
                }
            }
        }
        map.insert(name, Arc::new(RwLock::new(collection)));
        Ok(schema_json)
    }

    /// Fetches a collection handle.
    pub async fn get(&self, name: &str) -> Result<Arc<RwLock<Collection>>> {
        self.collections
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(format!("Collection `{}` not found.", name))
            })
    }

    pub async fn list_collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drops a collection. Taking the map's writer side first means no new
    /// request can race the destruction.
    pub async fn drop_collection(&self, name: &str) -> Result<()> {
        let arc = {
            let mut map = self.collections.write().await;
            map.remove(name).ok_or_else(|| {
                Error::not_found(format!("Collection `{}` not found.", name))
            })?
        };
        // Waits out in-flight readers before purging.
        let collection = arc.write().await;
        collection.purge_store().await?;

        // Remove dangling back-edges pointing at the dropped collection.
        let map = self.collections.read().await;
        for other in map.values() {
            let mut other = other.write().await;
            other.referenced_in.remove(name);
            other.async_referenced_ins.remove(name);
        }
        Ok(())
    }

    // =========================================================================
    // Documents
    // =========================================================================

    /// Adds one document, then back-fills async references that point at
    /// the collection.
    pub async fn add_document(
        &self,
        collection_name: &str,
        body: Value,
        action: IndexAction,
        dirty_values: DirtyValues,
    ) -> Result<Value> {
        let arc = self.get(collection_name).await?;
        let stored = {
            let mut collection = arc.write().await;
            collection
                .add_document(body, action, dirty_values, Some(self))
                .await?
        };
        self.backfill_async_references(collection_name, &stored)
            .await?;
        Ok(stored)
    }

    /// Batch ingest with per-record outcomes.
    pub async fn add_many(
        &self,
        collection_name: &str,
        docs: Vec<Value>,
        action: IndexAction,
        dirty_values: DirtyValues,
    ) -> Result<Vec<Result<Value>>> {
        let arc = self.get(collection_name).await?;
        let results = {
            let mut collection = arc.write().await;
            collection
                .add_many(docs, action, dirty_values, Some(self))
                .await
        };
        for stored in results.iter().flatten() {
            self.backfill_async_references(collection_name, stored)
                .await?;
        }
        Ok(results)
    }

    /// Deletes one document and cascades through backward reference edges.
    pub async fn delete_document(&self, collection_name: &str, doc_id: &str) -> Result<Value> {
        let arc = self.get(collection_name).await?;
        let (seq_id, doc) = {
            let mut collection = arc.write().await;
            collection.delete_document(doc_id).await?
        };
        self.cascade_delete(collection_name, seq_id).await?;
        Ok(Value::Object(doc))
    }

    /// Iterative cascade: each removed document seeds further removals in
    /// collections holding references to it.
    async fn cascade_delete(&self, collection_name: &str, seq_id: SeqId) -> Result<()> {
        let mut worklist: Vec<(String, SeqId)> = vec![(collection_name.to_string(), seq_id)];
        while let Some((lost_collection, lost_seq)) = worklist.pop() {
            let edges: Vec<(String, String)> = {
                let arc = self.get(&lost_collection).await?;
                let collection = arc.read().await;
                collection
                    .referenced_in
                    .iter()
                    .chain(collection.async_referenced_ins.iter())
                    .map(|(c, f)| (c.clone(), f.clone()))
                    .collect()
            };
            for (referencing_name, field_name) in edges {
                let Ok(arc) = self.get(&referencing_name).await else {
                    continue;
                };
                let mut referencing = arc.write().await;
                let Some(field) = referencing
                    .meta()
                    .fields
                    .iter()
                    .find(|f| f.name == field_name)
                    .cloned()
                else {
                    continue;
                };
                let helper = reference_helper_name(&field_name);
                let lost_set: HashSet<SeqId> = [lost_seq].into_iter().collect();
                let affected = referencing.index().ids_with_helper_in(&helper, &lost_set);
                for affected_seq in affected {
                    let mut doc = referencing.fetch_document(affected_seq).await?;
                    match cascade_remove(&mut doc, &field, lost_seq) {
                        CascadeAction::DeleteDocument => {
                            if let Some(id) = doc.get("id").and_then(|v| v.as_str()) {
                                let id = id.to_string();
                                referencing.delete_document(&id).await?;
                                worklist.push((referencing_name.clone(), affected_seq));
                            }
                        }
                        CascadeAction::NullifyField | CascadeAction::ElementsRemoved => {
                            referencing.reapply_document(affected_seq, doc).await?;
                        }
                        CascadeAction::Untouched => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// After an insert into `collection_name`, repairs unresolved async
    /// references in collections pointing at it.
    async fn backfill_async_references(
        &self,
        collection_name: &str,
        inserted: &Value,
    ) -> Result<()> {
        let edges: Vec<(String, String)> = {
            let arc = self.get(collection_name).await?;
            let collection = arc.read().await;
            collection
                .async_referenced_ins
                .iter()
                .map(|(c, f)| (c.clone(), f.clone()))
                .collect()
        };
        if edges.is_empty() {
            return Ok(());
        }
        let inserted_seq = {
            let arc = self.get(collection_name).await?;
            let collection = arc.read().await;
            let id = inserted
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            collection.seq_id_of(id)
        };
        let Some(inserted_seq) = inserted_seq else {
            return Ok(());
        };

        for (referencing_name, field_name) in edges {
            let Ok(arc) = self.get(&referencing_name).await else {
                continue;
            };
            let mut referencing = arc.write().await;
            let Some(field) = referencing
                .meta()
                .fields
                .iter()
                .find(|f| f.name == field_name)
                .cloned()
            else {
                continue;
            };
            let (_, target_field) = field.reference_target()?;
            let Some(target_value) = inserted.get(&target_field) else {
                continue;
            };
            let target_value = match target_value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };

            // Find referencing docs whose field carries the new value.
            let mut atom = FilterAtom::new(field_name.clone());
            atom.values.push(target_value.clone());
            atom.comparators.push(Comparator::Eq);
            let candidates = referencing.index().filter_atom_ids(&atom, &field)?;

            for candidate_seq in candidates {
                let mut doc = referencing.fetch_document(candidate_seq).await?;
                let mut helpers = read_helper(&doc, &field);
                let mut changed = false;
                if field.field_type.is_array() {
                    let values = doc
                        .get(&field.name)
                        .and_then(|v| v.as_array())
                        .cloned()
                        .unwrap_or_default();
                    for (i, value) in values.iter().enumerate() {
                        let matches = value.as_str().map(|s| s == target_value).unwrap_or(false);
                        if !matches {
                            continue;
                        }
                        let current = helpers.get(i).copied().unwrap_or(u32::MAX);
                        if backfill_allowed(current, inserted_seq) {
                            if current != inserted_seq {
                                helpers[i] = inserted_seq;
                                changed = true;
                            }
                        } else {
                            warn!(
                                collection = %referencing_name,
                                field = %field.name,
                                "Rejecting async back-fill that would re-target a resolved reference"
                            );
                        }
                    }
                } else {
                    let current = helpers.first().copied().unwrap_or(u32::MAX);
                    if backfill_allowed(current, inserted_seq) {
                        if current != inserted_seq {
                            helpers = vec![inserted_seq];
                            changed = true;
                        }
                    } else {
                        warn!(
                            collection = %referencing_name,
                            field = %field.name,
                            "Rejecting async back-fill that would re-target a resolved reference"
                        );
                    }
                }
                if changed {
                    crate::reference::write_helper(&mut doc, &field, &helpers)?;
                    referencing.reapply_document(candidate_seq, doc).await?;
                }
            }
        }
        Ok(())
    }

    /// Resolves one reference value to a seq id in the target collection.
    /// Errors when the value matches more than one document.
    pub async fn lookup_reference(
        &self,
        collection_name: &str,
        field_name: &str,
        value: &str,
    ) -> Result<Option<SeqId>> {
        let arc = self.get(collection_name).await?;
        let collection = arc.read().await;
        if field_name == "id" {
            return Ok(collection.seq_id_of(value));
        }
        let Some(field) = collection
            .meta()
            .fields
            .iter()
            .find(|f| f.name == field_name)
            .cloned()
        else {
            return Err(Error::not_found(format!(
                "Field `{}` not found in collection `{}`.",
                field_name, collection_name
            )));
        };
        let mut atom = FilterAtom::new(field_name.to_string());
        atom.values.push(value.to_string());
        atom.comparators.push(Comparator::Eq);
        let ids = collection.index().filter_atom_ids(&atom, &field)?;
        match ids.len() {
            0 => Ok(None),
            1 => Ok(Some(ids[0])),
            n => Err(Error::invalid(format!(
                "Reference value `{}` matches {} documents in `{}`; it must be unique.",
                value, n, collection_name
            ))),
        }
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Runs a search against one collection, with joins enabled.
    pub async fn search(
        &self,
        collection_name: &str,
        params: &SearchParams,
    ) -> Result<SearchResponse> {
        let arc = self.get(collection_name).await?;
        let collection = arc.read().await;
        collection.search(params, Some(self)).await
    }

    /// Runs a union search across collections (see the union module).
    pub async fn union_search(
        &self,
        searches: Vec<(String, SearchParams)>,
        union_params: crate::search::union::UnionParams,
    ) -> Result<Value> {
        crate::search::union::union_search(self, searches, union_params).await
    }
}

#[async_trait::async_trait]
impl JoinSource for Registry {
    async fn filter_ref_ids(&self, collection: &str, inner: &FilterNode) -> Result<Vec<SeqId>> {
        let arc = self.get(collection).await?;
        let guard = arc.read().await;
        let mut tree = inner.clone();
        // Nested joins resolve recursively through the registry.
        resolve_references(&mut tree, self).await?;
        guard.eval_filter(&tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKvStore;
    use serde_json::json;

    async fn registry() -> Registry {
        Registry::new(Arc::new(InMemoryKvStore::new()))
    }

    fn categories_schema() -> Value {
        json!({
            "name": "categories",
            "fields": [
                {"name": "title", "type": "string"}
            ]
        })
    }

    fn products_schema(async_ref: bool) -> Value {
        json!({
            "name": "products",
            "fields": [
                {"name": "title", "type": "string"},
                {"name": "cats", "type": "string[]",
                 "reference": "categories.id", "async_reference": async_ref}
            ]
        })
    }

    #[tokio::test]
    async fn test_create_list_drop() {
        let r = registry().await;
        r.create_collection(categories_schema()).await.unwrap();
        assert_eq!(r.list_collection_names().await, vec!["categories"]);

        let conflict = r.create_collection(categories_schema()).await.unwrap_err();
        assert_eq!(conflict.code(), 409);

        r.drop_collection("categories").await.unwrap();
        assert!(r.list_collection_names().await.is_empty());
        assert!(r.drop_collection("categories").await.is_err());
    }

    #[tokio::test]
    async fn test_reference_target_must_exist() {
        let r = registry().await;
        let err = r.create_collection(products_schema(false)).await.unwrap_err();
        assert_eq!(err.code(), 404);
    }

    #[tokio::test]
    async fn test_sync_reference_resolution_and_join() {
        let r = registry().await;
        r.create_collection(categories_schema()).await.unwrap();
        r.create_collection(products_schema(false)).await.unwrap();

        r.add_document(
            "categories",
            json!({"id": "c1", "title": "Footwear"}),
            IndexAction::Create,
            DirtyValues::CoerceOrReject,
        )
        .await
        .unwrap();
        r.add_document(
            "categories",
            json!({"id": "c2", "title": "Hats"}),
            IndexAction::Create,
            DirtyValues::CoerceOrReject,
        )
        .await
        .unwrap();

        let stored = r
            .add_document(
                "products",
                json!({"id": "p1", "title": "red shoes", "cats": ["c1", "c2"]}),
                IndexAction::Create,
                DirtyValues::CoerceOrReject,
            )
            .await
            .unwrap();
        assert_eq!(stored["cats_sequence_id"], json!([0, 1]));

        // Unknown reference value fails the document.
        let err = r
            .add_document(
                "products",
                json!({"id": "p2", "title": "x", "cats": ["ghost"]}),
                IndexAction::Create,
                DirtyValues::CoerceOrReject,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), 404);

        // Join filter: products referencing categories titled Footwear.
        let mut params = SearchParams::query("*", &[]);
        params.filter_by = "$categories(title:=Footwear)".to_string();
        let response = r.search("products", &params).await.unwrap();
        assert_eq!(response.found, 1);

        // Negate-join: no product lacks a Footwear reference.
        params.filter_by = "$categories(!= title:=Footwear)".to_string();
        let response = r.search("products", &params).await.unwrap();
        assert_eq!(response.found, 0);
    }

    #[tokio::test]
    async fn test_cascade_delete_array_reference() {
        // Scenario S4: deleting c1 trims the product's array reference.
        let r = registry().await;
        r.create_collection(categories_schema()).await.unwrap();
        r.create_collection(products_schema(false)).await.unwrap();
        for (id, title) in [("c1", "Footwear"), ("c2", "Hats")] {
            r.add_document(
                "categories",
                json!({"id": id, "title": title}),
                IndexAction::Create,
                DirtyValues::CoerceOrReject,
            )
            .await
            .unwrap();
        }
        r.add_document(
            "products",
            json!({"id": "p1", "title": "combo", "cats": ["c1", "c2"]}),
            IndexAction::Create,
            DirtyValues::CoerceOrReject,
        )
        .await
        .unwrap();

        r.delete_document("categories", "c1").await.unwrap();

        let arc = r.get("products").await.unwrap();
        let products = arc.read().await;
        let doc = products.get_document("p1").await.unwrap();
        assert_eq!(doc["cats"], json!(["c2"]));
        assert_eq!(doc["cats_sequence_id"], json!([1]));
    }

    #[tokio::test]
    async fn test_cascade_delete_removes_required_singular_ref() {
        let r = registry().await;
        r.create_collection(categories_schema()).await.unwrap();
        r.create_collection(json!({
            "name": "reviews",
            "fields": [
                {"name": "body", "type": "string"},
                {"name": "category", "type": "string", "reference": "categories.id"}
            ]
        }))
        .await
        .unwrap();
        r.add_document(
            "categories",
            json!({"id": "c1", "title": "Footwear"}),
            IndexAction::Create,
            DirtyValues::CoerceOrReject,
        )
        .await
        .unwrap();
        r.add_document(
            "reviews",
            json!({"id": "r1", "body": "great", "category": "c1"}),
            IndexAction::Create,
            DirtyValues::CoerceOrReject,
        )
        .await
        .unwrap();

        r.delete_document("categories", "c1").await.unwrap();

        let arc = r.get("reviews").await.unwrap();
        let reviews = arc.read().await;
        assert_eq!(reviews.num_documents(), 0);
    }

    #[tokio::test]
    async fn test_async_reference_backfill() {
        let r = registry().await;
        r.create_collection(categories_schema()).await.unwrap();
        r.create_collection(products_schema(true)).await.unwrap();

        // The category does not exist yet: sentinel is stored.
        let stored = r
            .add_document(
                "products",
                json!({"id": "p1", "title": "pending", "cats": ["c9"]}),
                IndexAction::Create,
                DirtyValues::CoerceOrReject,
            )
            .await
            .unwrap();
        assert_eq!(
            stored["cats_sequence_id"],
            json!([crate::config::UNRESOLVED_REFERENCE as i64])
        );

        // Inserting the referenced doc back-fills the helper.
        r.add_document(
            "categories",
            json!({"id": "c9", "title": "Late"}),
            IndexAction::Create,
            DirtyValues::CoerceOrReject,
        )
        .await
        .unwrap();

        let arc = r.get("products").await.unwrap();
        let products = arc.read().await;
        let doc = products.get_document("p1").await.unwrap();
        assert_eq!(doc["cats_sequence_id"], json!([0]));
    }

    #[tokio::test]
    async fn test_registry_load_roundtrip() {
        let store: Arc<InMemoryKvStore> = Arc::new(InMemoryKvStore::new());
        {
            let r = Registry::new(store.clone());
            r.create_collection(categories_schema()).await.unwrap();
            r.add_document(
                "categories",
                json!({"id": "c1", "title": "Footwear"}),
                IndexAction::Create,
                DirtyValues::CoerceOrReject,
            )
            .await
            .unwrap();
        }
        let r = Registry::new(store);
        r.load().await.unwrap();
        assert_eq!(r.list_collection_names().await, vec!["categories"]);
        let response = r
            .search("categories", &SearchParams::query("footwear", &["title"]))
            .await
            .unwrap();
        assert_eq!(response.found, 1);
    }
}
