//! Collections: schema, documents, ingest and the search entry point.
//!
//! A [`Collection`] owns its meta, an in-memory [`MemoryIndex`], the live
//! doc-id to seq-id map and its curation overrides. All mutation happens
//! under the registry's per-collection writer lock; searches take the
//! reader side. Documents persist through the byte store under the key
//! layout in [`crate::store::keys`].

pub mod registry;

pub use registry::Registry;

use crate::config::{ALTER_PROGRESS_LOG_INTERVAL, INDEX_BATCH_SIZE};
use crate::embedding::{Embedder, RemoteEmbeddingParams};
use crate::error::{Error, Result};
use crate::index::MemoryIndex;
use crate::reference::write_helper;
use crate::schema::alter::{parse_schema_changes, AlterStatus, AlterStatusSnapshot};
use crate::schema::coerce::{validate_document, DirtyValues};
use crate::schema::flatten::flatten_document;
use crate::schema::{reference_helper_name, Field, FieldType};
use crate::search::curation::Override;
use crate::search::executor::{execute_plan, ExecutorContext};
use crate::search::filter::{evaluate, parse_filter, EvalContext, FilterNode, JoinSource};
use crate::search::params::SearchParams;
use crate::search::plan::{build_plan, PlanContext, SearchPlan};
use crate::search::response::{
    assemble_hit, request_params_echo, GroupedHit, Hit, SearchResponse,
};
use crate::store::{keys, KvStore};
use crate::SeqId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, instrument, warn};

/// Persisted collection metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub name: String,
    pub id: u32,
    pub created_at: u64,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub default_sorting_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_field_type: Option<FieldType>,
    #[serde(default)]
    pub symbols_to_index: Vec<char>,
    #[serde(default)]
    pub token_separators: Vec<char>,
    #[serde(default)]
    pub enable_nested_fields: bool,
}

impl CollectionMeta {
    /// Validates a new collection's schema.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid("Collection name cannot be empty."));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            field.validate()?;
            if !seen.insert(field.name.clone()) {
                return Err(Error::invalid(format!(
                    "Field `{}` is declared more than once.",
                    field.name
                )));
            }
        }
        if !self.default_sorting_field.is_empty() {
            let field = self
                .fields
                .iter()
                .find(|f| f.name == self.default_sorting_field)
                .ok_or_else(|| {
                    Error::invalid(format!(
                        "default_sorting_field `{}` is not part of the schema.",
                        self.default_sorting_field
                    ))
                })?;
            if !field.field_type.is_numeric() {
                return Err(Error::invalid(
                    "default_sorting_field must be a numeric field.",
                ));
            }
        }
        let has_wildcard = self.fields.iter().any(|f| f.name == ".*");
        if self.fallback_field_type.is_some() && !has_wildcard {
            return Err(Error::invalid(
                "fallback_field_type needs a `.*` field declaration.",
            ));
        }
        Ok(())
    }
}

/// Write actions for document ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexAction {
    Create,
    Upsert,
    Update,
    Emplace,
}

impl IndexAction {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "create" => Ok(IndexAction::Create),
            "upsert" => Ok(IndexAction::Upsert),
            "update" => Ok(IndexAction::Update),
            "emplace" => Ok(IndexAction::Emplace),
            other => Err(Error::invalid(format!(
                "`{}` is not a valid index action.",
                other
            ))),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn now_ts() -> i64 {
    now_secs() as i64
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("meta", &self.meta)
            .field("num_documents", &self.num_documents)
            .finish()
    }
}

/// A collection of JSON documents with its index and curation state.
pub struct Collection {
    meta: CollectionMeta,
    store: Arc<dyn KvStore>,
    index: MemoryIndex,
    embedder: Embedder,
    next_seq_id: SeqId,
    num_documents: u64,
    doc_seq: HashMap<String, SeqId>,
    overrides: BTreeMap<String, Override>,
    /// Flattened child declarations discovered from documents.
    nested_children: Vec<Field>,
    /// Backward edges: collection name -> field name over there referencing us.
    pub(crate) referenced_in: HashMap<String, String>,
    pub(crate) async_referenced_ins: HashMap<String, String>,
    /// Forward map: referenced collection -> our reference field.
    ref_local_fields: HashMap<String, String>,
    alter_status: AlterStatus,
    max_per_page: usize,
}

impl Collection {
    /// Creates a fresh collection and persists its meta.
    pub async fn create(meta: CollectionMeta, store: Arc<dyn KvStore>) -> Result<Self> {
        meta.validate()?;
        let mut collection = Self::empty(meta, store);
        collection.persist_meta().await?;
        collection
            .store
            .put(
                format!(
                    "{}{}",
                    keys::COLLECTION_NEXT_SEQ_PREFIX,
                    collection.meta.name
                )
                .as_bytes(),
                b"0",
            )
            .await?;
        Ok(collection)
    }

    fn empty(meta: CollectionMeta, store: Arc<dyn KvStore>) -> Self {
        let index = MemoryIndex::new(&meta.symbols_to_index, &meta.token_separators);
        let mut ref_local_fields = HashMap::new();
        for field in meta.fields.iter().filter(|f| f.is_reference()) {
            if let Ok((target, _)) = field.reference_target() {
                ref_local_fields.insert(target, field.name.clone());
            }
        }
        Self {
            meta,
            store,
            index,
            embedder: Embedder::new(),
            next_seq_id: 0,
            num_documents: 0,
            doc_seq: HashMap::new(),
            overrides: BTreeMap::new(),
            nested_children: Vec::new(),
            referenced_in: HashMap::new(),
            async_referenced_ins: HashMap::new(),
            ref_local_fields,
            alter_status: AlterStatus::default(),
            max_per_page: crate::config::MAX_PER_PAGE,
        }
    }

    /// Loads a collection from the store, replaying documents into the
    /// in-memory index.
    pub async fn load(meta: CollectionMeta, store: Arc<dyn KvStore>) -> Result<Self> {
        let mut collection = Self::empty(meta, store);

        let next_seq_key = format!(
            "{}{}",
            keys::COLLECTION_NEXT_SEQ_PREFIX,
            collection.meta.name
        );
        if let Some(bytes) = collection.store.get(next_seq_key.as_bytes()).await? {
            let raw = String::from_utf8_lossy(&bytes);
            collection.next_seq_id = raw.trim().parse().unwrap_or(0);
        }

        let start = Instant::now();
        let entries = collection
            .store
            .scan_prefix(&keys::doc_key_prefix(collection.meta.id))
            .await?;
        let mut batch: Vec<(SeqId, Map<String, Value>)> = Vec::with_capacity(INDEX_BATCH_SIZE);
        for (key, value) in entries {
            let Some(seq_id) = keys::seq_id_from_doc_key(&key, collection.meta.id) else {
                continue;
            };
            let doc: Map<String, Value> = serde_json::from_slice(&value)?;
            if let Some(id) = doc.get("id").and_then(|v| v.as_str()) {
                collection.doc_seq.insert(id.to_string(), seq_id);
            }
            batch.push((seq_id, doc));
            if batch.len() == INDEX_BATCH_SIZE {
                collection.index_batch(&batch)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            collection.index_batch(&batch)?;
        }
        collection.num_documents = collection.doc_seq.len() as u64;

        // Overrides persist independently and load at startup.
        let override_prefix = format!(
            "{}{}_",
            keys::COLLECTION_OVERRIDE_PREFIX,
            collection.meta.name
        );
        for (_, value) in collection
            .store
            .scan_prefix(override_prefix.as_bytes())
            .await?
        {
            match serde_json::from_slice::<Override>(&value) {
                Ok(o) => {
                    collection.overrides.insert(o.id.clone(), o);
                }
                Err(e) => warn!(
                    collection = %collection.meta.name,
                    error = %e,
                    "Skipping unparseable override"
                ),
            }
        }

        info!(
            collection = %collection.meta.name,
            documents = collection.num_documents,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Loaded collection"
        );
        Ok(collection)
    }

    fn index_batch(&mut self, batch: &[(SeqId, Map<String, Value>)]) -> Result<()> {
        let refs: Vec<(SeqId, &Map<String, Value>)> =
            batch.iter().map(|(s, d)| (*s, d)).collect();
        let fields = self.indexable_fields();
        self.index.batch_memory_index(&refs, &fields)
    }

    /// Declared fields plus discovered nested children and reference
    /// helpers, the set the index actually works with.
    fn indexable_fields(&self) -> Vec<Field> {
        let mut fields = self.meta.fields.clone();
        fields.extend(self.nested_children.iter().cloned());
        for field in &self.meta.fields {
            if field.is_reference() {
                let mut helper = Field::new(
                    reference_helper_name(&field.name),
                    if field.field_type.is_array() {
                        FieldType::Int64Array
                    } else {
                        FieldType::Int64
                    },
                );
                helper.optional = true;
                helper.store = false;
                fields.push(helper);
            }
        }
        fields
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn meta(&self) -> &CollectionMeta {
        &self.meta
    }

    pub fn schema_json(&self) -> Value {
        serde_json::to_value(&self.meta).unwrap_or(Value::Null)
    }

    pub fn num_documents(&self) -> u64 {
        self.num_documents
    }

    pub fn seq_id_of(&self, doc_id: &str) -> Option<SeqId> {
        self.doc_seq.get(doc_id).copied()
    }

    pub fn alter_status(&self) -> AlterStatusSnapshot {
        self.alter_status.snapshot()
    }

    pub(crate) fn index(&self) -> &MemoryIndex {
        &self.index
    }

    /// Evaluates an already reference-resolved filter tree locally.
    pub(crate) fn eval_filter(&self, node: &FilterNode) -> Result<Vec<SeqId>> {
        let fields = self.indexable_fields();
        let ctx = EvalContext {
            index: &self.index,
            fields: &fields,
            validate_field_names: true,
            ref_local_fields: &self.ref_local_fields,
        };
        Ok(evaluate(node, &ctx)?.into_ids())
    }

    // =========================================================================
    // Document ingest
    // =========================================================================

    /// Adds one document. `registry` is needed when the schema declares
    /// references. Returns the stored document.
    #[instrument(skip_all, fields(collection = %self.meta.name))]
    pub async fn add_document(
        &mut self,
        body: Value,
        action: IndexAction,
        dirty_values: DirtyValues,
        registry: Option<&Registry>,
    ) -> Result<Value> {
        let Value::Object(mut doc) = body else {
            return Err(Error::invalid("A document must be a JSON object."));
        };

        // Assign or validate the id.
        let doc_id = match doc.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(_) => return Err(Error::invalid("Document `id` must be a string.")),
            None => {
                let id = self.next_seq_id.to_string();
                doc.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        let existing_seq = self.doc_seq.get(&doc_id).copied();
        match (action, existing_seq) {
            (IndexAction::Create, Some(_)) => {
                return Err(Error::Conflict(format!(
                    "A document with id {} already exists.",
                    doc_id
                )));
            }
            (IndexAction::Update, None) => {
                return Err(Error::not_found(format!(
                    "Could not find a document with id: {}",
                    doc_id
                )));
            }
            _ => {}
        }

        // Update/emplace on an existing doc merge into the stored version.
        let is_merge = matches!(action, IndexAction::Update)
            || (matches!(action, IndexAction::Emplace) && existing_seq.is_some());
        if is_merge {
            let seq_id = existing_seq.expect("merge requires an existing doc");
            let mut stored = self.fetch_document(seq_id).await?;
            for (key, value) in doc {
                stored.insert(key, value);
            }
            doc = stored;
        }

        validate_document(
            &mut doc,
            &self.meta.fields,
            self.meta.fallback_field_type,
            dirty_values,
        )?;

        if self.meta.enable_nested_fields {
            let children = flatten_document(&mut doc, &self.meta.fields)?;
            for child in children {
                // Parent insertion removes child paths and vice versa.
                if !self.nested_children.iter().any(|f| f.name == child.name)
                    && !self.meta.fields.iter().any(|f| f.name == child.name)
                {
                    self.nested_children.push(child);
                }
            }
        }

        self.resolve_references(&mut doc, registry).await?;
        self.embed_document(&mut doc).await?;

        // Only a fully validated document displaces the previous version.
        if let Some(seq_id) = existing_seq {
            self.remove_from_index(seq_id).await?;
        }

        let seq_id = match existing_seq {
            Some(seq) => seq,
            None => {
                let seq = self.next_seq_id;
                self.next_seq_id += 1;
                self.num_documents += 1;
                seq
            }
        };

        // Persist first, then index; both mappings live or die together.
        let bytes = serde_json::to_vec(&doc)?;
        self.store
            .put(&keys::doc_key(self.meta.id, seq_id), &bytes)
            .await?;
        self.store
            .put(
                &keys::doc_id_key(self.meta.id, &doc_id),
                seq_id.to_string().as_bytes(),
            )
            .await?;
        self.store
            .put(
                format!("{}{}", keys::COLLECTION_NEXT_SEQ_PREFIX, self.meta.name).as_bytes(),
                self.next_seq_id.to_string().as_bytes(),
            )
            .await?;
        self.doc_seq.insert(doc_id, seq_id);

        let fields = self.indexable_fields();
        self.index.batch_memory_index(&[(seq_id, &doc)], &fields)?;

        Ok(Value::Object(doc))
    }

    /// Adds a batch of documents, collecting per-record outcomes instead of
    /// aborting on the first failure. Yields to the index after every
    /// [`INDEX_BATCH_SIZE`] records.
    pub async fn add_many(
        &mut self,
        docs: Vec<Value>,
        action: IndexAction,
        dirty_values: DirtyValues,
        registry: Option<&Registry>,
    ) -> Vec<Result<Value>> {
        let mut results = Vec::with_capacity(docs.len());
        for (i, doc) in docs.into_iter().enumerate() {
            results.push(self.add_document(doc, action, dirty_values, registry).await);
            if (i + 1) % INDEX_BATCH_SIZE == 0 {
                tokio::task::yield_now().await;
            }
        }
        results
    }

    /// Resolves every reference field to its helper seq id.
    async fn resolve_references(
        &self,
        doc: &mut Map<String, Value>,
        registry: Option<&Registry>,
    ) -> Result<()> {
        for field in self.meta.fields.iter().filter(|f| f.is_reference()) {
            let Some(value) = doc.get(&field.name).cloned() else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let (target_collection, target_field) = field.reference_target()?;

            let raw_values: Vec<String> = match &value {
                Value::Array(items) => items
                    .iter()
                    .map(|v| json_scalar_string(v))
                    .collect::<Result<_>>()?,
                scalar => vec![json_scalar_string(scalar)?],
            };

            if field.async_reference {
                // Async targets may not exist yet: store the sentinel and
                // let the referenced collection's inserts back-fill it.
                let mut resolved = Vec::with_capacity(raw_values.len());
                if let Some(registry) = registry {
                    for raw in &raw_values {
                        let seq = registry
                            .lookup_reference(&target_collection, &target_field, raw)
                            .await
                            .ok()
                            .flatten();
                        resolved.push(seq.unwrap_or(crate::config::UNRESOLVED_REFERENCE));
                    }
                } else {
                    resolved = vec![crate::config::UNRESOLVED_REFERENCE; raw_values.len()];
                }
                write_helper(doc, field, &resolved)?;
                continue;
            }

            let registry = registry.ok_or_else(|| {
                Error::invalid(format!(
                    "Field `{}` references collection `{}`, which is not available.",
                    field.name, target_collection
                ))
            })?;
            let mut resolved = Vec::with_capacity(raw_values.len());
            for raw in &raw_values {
                let seq = registry
                    .lookup_reference(&target_collection, &target_field, raw)
                    .await?
                    .ok_or_else(|| {
                        Error::not_found(format!(
                            "Reference document having `{} = {}` not found in collection `{}`.",
                            target_field, raw, target_collection
                        ))
                    })?;
                resolved.push(seq);
            }
            write_helper(doc, field, &resolved)?;
        }
        Ok(())
    }

    /// Fills auto-embedding fields from their source fields.
    async fn embed_document(&self, doc: &mut Map<String, Value>) -> Result<()> {
        for field in self.meta.fields.iter().filter(|f| f.is_auto_embedding()) {
            if doc.get(&field.name).map(|v| !v.is_null()).unwrap_or(false) {
                continue; // explicit vector provided
            }
            let spec = field.embed.as_ref().expect("auto-embedding field");
            let mut parts: Vec<String> = Vec::new();
            for source in &spec.from {
                if let Some(value) = doc.get(source) {
                    match value {
                        Value::String(s) => parts.push(s.clone()),
                        Value::Array(items) => parts.extend(
                            items
                                .iter()
                                .filter_map(|v| v.as_str().map(|s| s.to_string())),
                        ),
                        other => parts.push(other.to_string()),
                    }
                }
            }
            if parts.is_empty() {
                if field.optional {
                    continue;
                }
                return Err(Error::invalid(format!(
                    "No source field values to embed for `{}`.",
                    field.name
                )));
            }
            let embedding = self
                .embedder
                .embed_for_indexing(
                    &spec.model_config,
                    &parts.join(" "),
                    field.num_dim,
                    &RemoteEmbeddingParams::default(),
                )
                .await?;
            doc.insert(
                field.name.clone(),
                Value::Array(embedding.into_iter().map(|f| json!(f)).collect()),
            );
        }
        Ok(())
    }

    /// Fetches a stored document by seq id.
    pub async fn fetch_document(&self, seq_id: SeqId) -> Result<Map<String, Value>> {
        let bytes = self
            .store
            .get(&keys::doc_key(self.meta.id, seq_id))
            .await?
            .ok_or_else(|| {
                Error::internal(format!(
                    "Document with seq id {} is missing from the store.",
                    seq_id
                ))
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Fetches a document by its user-facing id.
    pub async fn get_document(&self, doc_id: &str) -> Result<Map<String, Value>> {
        let seq_id = self.doc_seq.get(doc_id).ok_or_else(|| {
            Error::not_found(format!("Could not find a document with id: {}", doc_id))
        })?;
        self.fetch_document(*seq_id).await
    }

    async fn remove_from_index(&mut self, seq_id: SeqId) -> Result<()> {
        let doc = self.fetch_document(seq_id).await?;
        let fields = self.indexable_fields();
        self.index.remove(seq_id, &doc, &fields);
        Ok(())
    }

    /// Rewrites a stored document in place after a cascade or back-fill
    /// touched it: reindex, persist, keep the same seq id.
    pub(crate) async fn reapply_document(
        &mut self,
        seq_id: SeqId,
        doc: Map<String, Value>,
    ) -> Result<()> {
        self.remove_from_index(seq_id).await?;
        let bytes = serde_json::to_vec(&doc)?;
        self.store
            .put(&keys::doc_key(self.meta.id, seq_id), &bytes)
            .await?;
        let fields = self.indexable_fields();
        self.index.batch_memory_index(&[(seq_id, &doc)], &fields)?;
        Ok(())
    }

    /// Deletes one document by id, returning `(seq_id, document)` so the
    /// registry can run the reference cascade.
    pub async fn delete_document(&mut self, doc_id: &str) -> Result<(SeqId, Map<String, Value>)> {
        let seq_id = *self.doc_seq.get(doc_id).ok_or_else(|| {
            Error::not_found(format!("Could not find a document with id: {}", doc_id))
        })?;
        let doc = self.fetch_document(seq_id).await?;

        let fields = self.indexable_fields();
        self.index.remove(seq_id, &doc, &fields);
        self.store
            .delete(&keys::doc_key(self.meta.id, seq_id))
            .await?;
        self.store
            .delete(&keys::doc_id_key(self.meta.id, doc_id))
            .await?;
        self.doc_seq.remove(doc_id);
        self.num_documents = self.num_documents.saturating_sub(1);
        // Deleted seq ids are never reused; the counter only moves forward.
        Ok((seq_id, doc))
    }

    /// Deletes every document matching a filter. Returns the deleted ids.
    pub async fn delete_by_filter(&mut self, filter_by: &str) -> Result<Vec<String>> {
        let node = parse_filter(filter_by)?;
        let seq_ids = self.eval_filter(&node)?;
        let mut deleted = Vec::with_capacity(seq_ids.len());
        for seq_id in seq_ids {
            let doc = self.fetch_document(seq_id).await?;
            if let Some(id) = doc.get("id").and_then(|v| v.as_str()) {
                let id = id.to_string();
                self.delete_document(&id).await?;
                deleted.push(id);
            }
        }
        Ok(deleted)
    }

    /// Retains only the top `k` documents by an integer field, deleting the
    /// rest (the `?top_k_by=field:K` delete).
    pub async fn retain_top_k(&mut self, field: &str, k: usize) -> Result<usize> {
        let outside = self.index.seq_ids_outside_top_k(field, k);
        let mut removed = 0;
        for seq_id in outside {
            let doc = self.fetch_document(seq_id).await?;
            if let Some(id) = doc.get("id").and_then(|v| v.as_str()) {
                let id = id.to_string();
                self.delete_document(&id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Streams every stored document in seq order (export).
    pub async fn export(&self) -> Result<Vec<Value>> {
        let entries = self
            .store
            .scan_prefix(&keys::doc_key_prefix(self.meta.id))
            .await?;
        let mut docs = Vec::with_capacity(entries.len());
        for (_, bytes) in entries {
            let mut doc: Map<String, Value> = serde_json::from_slice(&bytes)?;
            crate::schema::flatten::strip_flattened(&mut doc);
            docs.push(Value::Object(doc));
        }
        Ok(docs)
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Builds a plan for this collection. Union search builds plans first
    /// to check sort contracts before execution.
    pub async fn build_search_plan(
        &self,
        params: &SearchParams,
        is_union: bool,
        union_search_index: u32,
    ) -> Result<SearchPlan> {
        let fields = self.indexable_fields();
        let overrides: Vec<Override> = self.overrides.values().cloned().collect();
        let default_sorting_field = if self.meta.default_sorting_field.is_empty() {
            None
        } else {
            Some(self.meta.default_sorting_field.as_str())
        };
        let ctx = PlanContext {
            fields: &fields,
            default_sorting_field,
            symbols_to_index: &self.meta.symbols_to_index,
            token_separators: &self.meta.token_separators,
            overrides: &overrides,
            doc_seq: &self.doc_seq,
            index: &self.index,
            embedder: &self.embedder,
            max_per_page: self.max_per_page,
            now_ts: now_ts(),
            is_union,
            union_search_index,
        };
        build_plan(params, &ctx).await
    }

    /// Runs a full search: plan, execute, hydrate, respond.
    pub async fn search(
        &self,
        params: &SearchParams,
        joins: Option<&dyn JoinSource>,
    ) -> Result<SearchResponse> {
        let plan = self.build_search_plan(params, false, 0).await?;
        let executed = self.execute(&plan, joins).await?;
        self.respond(params, &plan, executed).await
    }

    /// Executes a prepared plan (shared with union search).
    pub async fn execute(
        &self,
        plan: &SearchPlan,
        joins: Option<&dyn JoinSource>,
    ) -> Result<crate::search::executor::ExecutedSearch> {
        let fields = self.indexable_fields();
        let ctx = ExecutorContext {
            collection_name: &self.meta.name,
            fields: &fields,
            index: &self.index,
            ref_local_fields: &self.ref_local_fields,
        };
        execute_plan(plan, &ctx, joins).await
    }

    /// Hydrates and pages an executed search into the response shape.
    async fn respond(
        &self,
        params: &SearchParams,
        plan: &SearchPlan,
        executed: crate::search::executor::ExecutedSearch,
    ) -> Result<SearchResponse> {
        let window_end = (plan.offset + plan.per_page).min(plan.fetch_size);
        let window = executed
            .hits
            .iter()
            .skip(plan.offset)
            .take(window_end.saturating_sub(plan.offset));

        let fields = self.indexable_fields();
        let mut hits: Vec<Hit> = Vec::new();
        let mut grouped: Vec<GroupedHit> = Vec::new();

        for ranked in window {
            if plan.group_by.is_empty() {
                let doc = self.fetch_document(ranked.seq_id).await?;
                hits.push(assemble_hit(
                    ranked,
                    &doc,
                    plan,
                    &fields,
                    &self.meta.symbols_to_index,
                    &self.meta.token_separators,
                    executed.curated_ids.contains(&ranked.seq_id),
                ));
            } else {
                let mut group_hits = Vec::with_capacity(ranked.group_members.len());
                for member in &ranked.group_members {
                    let doc = self.fetch_document(*member).await?;
                    group_hits.push(assemble_hit(
                        ranked,
                        &doc,
                        plan,
                        &fields,
                        &self.meta.symbols_to_index,
                        &self.meta.token_separators,
                        executed.curated_ids.contains(member),
                    ));
                }
                let group_key = ranked
                    .group_key
                    .as_deref()
                    .unwrap_or("")
                    .split('|')
                    .map(|s| json!(s))
                    .collect();
                grouped.push(GroupedHit {
                    group_key,
                    found: ranked.group_found,
                    hits: group_hits,
                });
            }
        }

        // An empty cut-off search surfaces as a timeout to the caller.
        if executed.search_cutoff && executed.found == 0 {
            return Err(Error::Timeout(
                "Request timed out before it could be completed.".to_string(),
            ));
        }

        Ok(SearchResponse {
            found: executed.found,
            found_docs: (!plan.group_by.is_empty()).then_some(executed.found_docs),
            out_of: executed.out_of,
            page: params.page.unwrap_or(1),
            hits: plan.group_by.is_empty().then_some(hits),
            grouped_hits: (!plan.group_by.is_empty()).then_some(grouped),
            facet_counts: executed.facet_counts,
            search_cutoff: executed.search_cutoff,
            request_params: request_params_echo(&self.meta.name, &params.query, plan.per_page),
        })
    }

    // =========================================================================
    // Overrides
    // =========================================================================

    pub async fn upsert_override(&mut self, o: Override) -> Result<()> {
        o.validate()?;
        let bytes = serde_json::to_vec(&o)?;
        self.store
            .put(&keys::override_key(&self.meta.name, &o.id), &bytes)
            .await?;
        self.overrides.insert(o.id.clone(), o);
        Ok(())
    }

    pub fn list_overrides(&self) -> Vec<&Override> {
        self.overrides.values().collect()
    }

    pub fn get_override(&self, id: &str) -> Option<&Override> {
        self.overrides.get(id)
    }

    pub async fn delete_override(&mut self, id: &str) -> Result<()> {
        if self.overrides.remove(id).is_none() {
            return Err(Error::not_found(format!(
                "Could not find an override with id `{}`.",
                id
            )));
        }
        self.store
            .delete(&keys::override_key(&self.meta.name, id))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Schema alteration
    // =========================================================================

    /// Alters the schema in two phases: validate every stored document
    /// against the proposed schema, then mutate. Validation failure leaves
    /// the schema byte-identical.
    #[instrument(skip_all, fields(collection = %self.meta.name))]
    pub async fn alter(&mut self, payload: &Value) -> Result<Value> {
        let changes = parse_schema_changes(payload, &self.meta.fields)?;
        self.alter_status.begin()?;
        let summary = format!(
            "{} dropped, {} added, {} reindexed",
            changes.drops.len(),
            changes.additions.len(),
            changes.reindexes.len()
        );
        match self.alter_inner(changes).await {
            Ok(schema) => {
                self.alter_status
                    .finish(format!("Schema change completed: {}.", summary));
                Ok(schema)
            }
            Err(e) => {
                self.alter_status.finish(e.to_string());
                Err(e)
            }
        }
    }

    async fn alter_inner(&mut self, changes: crate::schema::alter::SchemaChanges) -> Result<Value> {
        // Proposed schema: drops removed, additions and reindexes applied.
        let mut proposed: Vec<Field> = self
            .meta
            .fields
            .iter()
            .filter(|f| !changes.drops.contains(&f.name))
            .cloned()
            .collect();
        proposed.extend(changes.additions.iter().cloned());
        proposed.extend(changes.reindexes.iter().cloned());

        // -- validation phase -------------------------------------------------
        let entries = self
            .store
            .scan_prefix(&keys::doc_key_prefix(self.meta.id))
            .await?;
        let mut validated: u32 = 0;
        let mut last_log = Instant::now();
        for (_, bytes) in &entries {
            let mut doc: Map<String, Value> = serde_json::from_slice(bytes)?;
            if let Err(e) = validate_document(
                &mut doc,
                &proposed,
                self.meta.fallback_field_type,
                DirtyValues::CoerceOrReject,
            ) {
                return Err(Error::IncompatibleStoredData(format!(
                    "Schema change is incompatible with the documents already stored \
                     in this collection: {}",
                    e
                )));
            }
            validated += 1;
            self.alter_status.record_validated(1);
            if validated % ALTER_PROGRESS_LOG_INTERVAL == 0 || last_log.elapsed().as_secs() >= 30 {
                info!(validated, total = entries.len(), "Schema alter: validating");
                last_log = Instant::now();
            }
        }

        // -- mutation phase ----------------------------------------------------
        for name in &changes.drops {
            self.index.drop_field(name);
            self.meta.fields.retain(|f| f.name != *name);
            self.nested_children.retain(|f| f.name != *name);
        }
        let mut changed_fields: Vec<Field> = changes.additions.clone();
        for field in &changes.reindexes {
            self.index.drop_field(&field.name);
            changed_fields.push(field.clone());
        }
        self.meta.fields.extend(changes.additions.iter().cloned());
        self.meta.fields.extend(changes.reindexes.iter().cloned());

        let needs_embedding = changed_fields.iter().any(|f| f.is_auto_embedding());
        let mut altered: u32 = 0;
        let mut batch: Vec<(SeqId, Map<String, Value>)> = Vec::with_capacity(INDEX_BATCH_SIZE);
        let mut last_log = Instant::now();
        for (key, bytes) in &entries {
            let Some(seq_id) = keys::seq_id_from_doc_key(key, self.meta.id) else {
                continue;
            };
            let mut doc: Map<String, Value> = serde_json::from_slice(bytes)?;
            validate_document(
                &mut doc,
                &proposed,
                self.meta.fallback_field_type,
                DirtyValues::CoerceOrReject,
            )?;
            if needs_embedding {
                self.embed_document(&mut doc).await?;
                let bytes = serde_json::to_vec(&doc)?;
                self.store
                    .put(&keys::doc_key(self.meta.id, seq_id), &bytes)
                    .await?;
            }
            batch.push((seq_id, doc));
            if batch.len() == INDEX_BATCH_SIZE {
                let refs: Vec<(SeqId, &Map<String, Value>)> =
                    batch.iter().map(|(s, d)| (*s, d)).collect();
                self.index.batch_memory_index(&refs, &changed_fields)?;
                altered += batch.len() as u32;
                self.alter_status.record_altered(batch.len() as u32);
                batch.clear();
                tokio::task::yield_now().await;
            }
            if altered % ALTER_PROGRESS_LOG_INTERVAL == 0 && altered > 0
                || last_log.elapsed().as_secs() >= 30
            {
                info!(altered, total = entries.len(), "Schema alter: reindexing");
                last_log = Instant::now();
            }
        }
        if !batch.is_empty() {
            let refs: Vec<(SeqId, &Map<String, Value>)> =
                batch.iter().map(|(s, d)| (*s, d)).collect();
            self.index.batch_memory_index(&refs, &changed_fields)?;
            self.alter_status.record_altered(batch.len() as u32);
        }

        self.persist_meta().await?;
        Ok(self.schema_json())
    }

    async fn persist_meta(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.meta)?;
        self.store
            .put(
                format!("{}{}", keys::COLLECTION_META_PREFIX, self.meta.name).as_bytes(),
                &bytes,
            )
            .await
    }

    /// Purges every stored key of this collection (registry drop path).
    pub(crate) async fn purge_store(&self) -> Result<()> {
        self.store
            .delete_prefix(&keys::doc_key_prefix(self.meta.id))
            .await?;
        self.store
            .delete_prefix(format!("{}_D_", self.meta.id).as_bytes())
            .await?;
        self.store
            .delete_prefix(
                format!("{}{}_", keys::COLLECTION_OVERRIDE_PREFIX, self.meta.name).as_bytes(),
            )
            .await?;
        self.store
            .delete(format!("{}{}", keys::COLLECTION_META_PREFIX, self.meta.name).as_bytes())
            .await?;
        self.store
            .delete(format!("{}{}", keys::COLLECTION_NEXT_SEQ_PREFIX, self.meta.name).as_bytes())
            .await?;
        Ok(())
    }
}

fn json_scalar_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::invalid(format!(
            "`{}` cannot be used as a reference value.",
            other
        ))),
    }
}
