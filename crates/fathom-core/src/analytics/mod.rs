//! Query analytics: rules, buffered events and periodic flushing.
//!
//! One collection-wide mutex guards every map. Events are rate-limited per
//! client IP through a fixed-capacity LRU, buffered in arrival order, and a
//! single cooperative background task flushes three families on the
//! analytics interval: popular/no-hit query aggregations (imported with
//! `action=emplace`, then truncated to the top K on the leader), buffered
//! log events, and counter documents (`action=update`). Shutdown wakes the
//! loop, releases the aggregators and clears every map.

use crate::collection::{IndexAction, Registry};
use crate::config::{
    ANALYTICS_RATE_LRU_CAPACITY, DEFAULT_ANALYTICS_MINUTE_RATE_LIMIT,
    QUERY_COMPACTION_INTERVAL_S,
};
use crate::error::{Error, Result};
use crate::schema::coerce::DirtyValues;
use crate::store::{keys, KvStore};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

static HTTP: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

/// Provides the replication leader's URL; consumed at the boundary only.
pub trait LeaderProvider: Send + Sync {
    /// Base URL of the leader, `None` when unknown.
    fn leader_url(&self) -> Option<String>;
    /// Whether this node is the leader (writes apply locally).
    fn is_leader(&self) -> bool;
}

/// A single-node deployment: always the leader.
#[derive(Debug, Default)]
pub struct SingleNodeLeader;

impl LeaderProvider for SingleNodeLeader {
    fn leader_url(&self) -> Option<String> {
        None
    }
    fn is_leader(&self) -> bool {
        true
    }
}

/// Event classes bindable to analytics rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Search,
    Click,
    Conversion,
    Visit,
    Custom,
}

/// One event binding inside a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    #[serde(default)]
    pub log_to_store: bool,
}

/// Rule source: which collections and events feed the destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSource {
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub events: Vec<EventSpec>,
}

/// Rule destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleDestination {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_field: Option<String>,
}

/// Kinds of analytics rules.
pub const RULE_POPULAR_QUERIES: &str = "popular_queries";
pub const RULE_NOHITS_QUERIES: &str = "nohits_queries";
pub const RULE_COUNTER: &str = "counter";
pub const RULE_LOG: &str = "log";

/// A persisted analytics rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsRule {
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    pub source: RuleSource,
    pub destination: RuleDestination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl AnalyticsRule {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid("An analytics rule needs a name."));
        }
        match self.rule_type.as_str() {
            RULE_POPULAR_QUERIES | RULE_NOHITS_QUERIES => {
                if self.source.collections.is_empty() {
                    return Err(Error::invalid(
                        "Query analytics rules need source collections.",
                    ));
                }
            }
            RULE_COUNTER => {
                if self.destination.counter_field.is_none() {
                    return Err(Error::invalid("Counter rules need a counter_field."));
                }
                if self.source.events.is_empty() {
                    return Err(Error::invalid("Counter rules need source events."));
                }
            }
            RULE_LOG => {
                if self.source.events.is_empty() {
                    return Err(Error::invalid("Log rules need source events."));
                }
            }
            other => {
                return Err(Error::invalid(format!(
                    "`{}` is not a valid analytics rule type.",
                    other
                )))
            }
        }
        if self.destination.collection.is_empty() {
            return Err(Error::invalid("Analytics rules need a destination collection."));
        }
        Ok(())
    }
}

/// A buffered analytics event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_name: String,
    pub event_type: EventType,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub doc_id: String,
    pub timestamp_us: u64,
    #[serde(default)]
    pub log_to_store: bool,
}

/// Aggregated counter state for one destination collection.
#[derive(Debug, Clone, Default)]
pub struct CounterEvent {
    pub counter_field: String,
    pub doc_counts: HashMap<String, i64>,
    pub event_weights: HashMap<String, i64>,
}

/// Query frequency aggregator for popular / no-hit destinations.
#[derive(Debug, Default)]
struct QueryAggregator {
    counts: HashMap<String, u32>,
    limit: usize,
}

impl QueryAggregator {
    fn record(&mut self, query: &str) {
        *self.counts.entry(query.to_string()).or_insert(0) += 1;
    }

    /// Drains and compacts: top entries by count, capped at the rule limit.
    fn compact_user_queries(&mut self, _now_us: u64) -> Vec<(String, u32)> {
        let mut entries: Vec<(String, u32)> = self.counts.drain().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries.truncate(self.limit.max(1));
        entries
    }
}

/// Routing entry derived from rules, keyed by event name.
#[derive(Debug, Clone)]
struct EventRoute {
    destination: String,
    event_type: EventType,
    weight: i64,
    log_to_store: bool,
    is_counter: bool,
}

#[derive(Debug, Clone, Copy)]
struct RateBucket {
    last_update_s: u64,
    count: u32,
}

/// Fixed-capacity LRU of per-client-IP rate buckets.
struct RateLimiter {
    capacity: usize,
    buckets: HashMap<String, RateBucket>,
    order: VecDeque<String>,
}

impl RateLimiter {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buckets: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Enforces `count <= limit` within any 60-second window.
    fn check(&mut self, ip: &str, now_s: u64, limit: u32) -> bool {
        let bucket = self.buckets.entry(ip.to_string()).or_insert(RateBucket {
            last_update_s: now_s,
            count: 0,
        });
        if now_s.saturating_sub(bucket.last_update_s) >= 60 {
            bucket.last_update_s = now_s;
            bucket.count = 0;
        }
        if bucket.count >= limit {
            return false;
        }
        bucket.count += 1;

        // LRU upkeep.
        self.order.retain(|k| k != ip);
        self.order.push_back(ip.to_string());
        while self.buckets.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.buckets.remove(&evicted);
            } else {
                break;
            }
        }
        true
    }
}

#[derive(Default)]
struct AnalyticsState {
    suggestion_configs: HashMap<String, AnalyticsRule>,
    query_collection_mapping: HashMap<String, Vec<String>>,
    popular_queries: HashMap<String, QueryAggregator>,
    nohits_queries: HashMap<String, QueryAggregator>,
    counter_events: HashMap<String, CounterEvent>,
    query_collection_events: HashMap<String, Vec<EventRecord>>,
    event_collection_map: HashMap<String, EventRoute>,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Strictly increasing event timestamps: the persisted event key embeds the
/// timestamp, so two events in the same microsecond must not collide.
fn next_event_ts() -> u64 {
    use std::sync::atomic::AtomicU64;
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = now_us();
    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(prev + 1);
        match LAST.compare_exchange_weak(prev, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return candidate,
            Err(actual) => prev = actual,
        }
    }
}

/// The analytics aggregator.
pub struct AnalyticsManager {
    state: Mutex<AnalyticsState>,
    rate: Mutex<RateLimiter>,
    store: Arc<dyn KvStore>,
    registry: Option<Arc<Registry>>,
    leader: Arc<dyn LeaderProvider>,
    quit: AtomicBool,
    notify: Notify,
    flush_interval_s: u64,
    rate_limit_per_minute: u32,
}

impl AnalyticsManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        registry: Option<Arc<Registry>>,
        leader: Arc<dyn LeaderProvider>,
        flush_interval_s: u64,
    ) -> Self {
        Self {
            state: Mutex::new(AnalyticsState::default()),
            rate: Mutex::new(RateLimiter::new(ANALYTICS_RATE_LRU_CAPACITY)),
            store,
            registry,
            leader,
            quit: AtomicBool::new(false),
            notify: Notify::new(),
            flush_interval_s,
            rate_limit_per_minute: DEFAULT_ANALYTICS_MINUTE_RATE_LIMIT,
        }
    }

    pub fn set_rate_limit(&mut self, per_minute: u32) {
        self.rate_limit_per_minute = per_minute;
    }

    // =========================================================================
    // Rules
    // =========================================================================

    /// Creates (or replaces) a rule and persists it.
    pub async fn create_rule(&self, rule: AnalyticsRule) -> Result<()> {
        rule.validate()?;
        let bytes = serde_json::to_vec(&rule)?;
        self.store
            .put(&keys::analytics_rule_key(&rule.name), &bytes)
            .await?;
        self.register_rule(rule);
        Ok(())
    }

    fn register_rule(&self, rule: AnalyticsRule) {
        let mut state = self.state.lock();
        match rule.rule_type.as_str() {
            RULE_POPULAR_QUERIES | RULE_NOHITS_QUERIES => {
                for src in &rule.source.collections {
                    state
                        .query_collection_mapping
                        .entry(src.clone())
                        .or_default()
                        .push(rule.destination.collection.clone());
                }
                let aggregator = QueryAggregator {
                    counts: HashMap::new(),
                    limit: rule.limit.unwrap_or(100),
                };
                if rule.rule_type == RULE_POPULAR_QUERIES {
                    state
                        .popular_queries
                        .insert(rule.destination.collection.clone(), aggregator);
                } else {
                    state
                        .nohits_queries
                        .insert(rule.destination.collection.clone(), aggregator);
                }
            }
            _ => {
                let is_counter = rule.rule_type == RULE_COUNTER;
                if is_counter {
                    state
                        .counter_events
                        .entry(rule.destination.collection.clone())
                        .or_insert_with(|| CounterEvent {
                            counter_field: rule
                                .destination
                                .counter_field
                                .clone()
                                .unwrap_or_default(),
                            ..Default::default()
                        });
                }
                for event in &rule.source.events {
                    let weight = event.weight.unwrap_or(1);
                    if is_counter {
                        if let Some(counter) = state
                            .counter_events
                            .get_mut(&rule.destination.collection)
                        {
                            counter.event_weights.insert(event.name.clone(), weight);
                        }
                    }
                    state.event_collection_map.insert(
                        event.name.clone(),
                        EventRoute {
                            destination: rule.destination.collection.clone(),
                            event_type: event.event_type,
                            weight,
                            log_to_store: event.log_to_store,
                            is_counter,
                        },
                    );
                }
            }
        }
        state.suggestion_configs.insert(rule.name.clone(), rule);
    }

    /// Loads persisted rules at startup.
    pub async fn load_rules(&self) -> Result<()> {
        let entries = self
            .store
            .scan_prefix(keys::ANALYTICS_RULE_PREFIX.as_bytes())
            .await?;
        for (_, bytes) in entries {
            match serde_json::from_slice::<AnalyticsRule>(&bytes) {
                Ok(rule) => self.register_rule(rule),
                Err(e) => warn!(error = %e, "Skipping unparseable analytics rule"),
            }
        }
        Ok(())
    }

    pub fn list_rules(&self) -> Vec<AnalyticsRule> {
        let state = self.state.lock();
        let mut rules: Vec<AnalyticsRule> = state.suggestion_configs.values().cloned().collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        rules
    }

    pub async fn remove_rule(&self, name: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.suggestion_configs.remove(name).is_none() {
                return Err(Error::not_found(format!(
                    "Could not find an analytics rule named `{}`.",
                    name
                )));
            }
        }
        self.store.delete(&keys::analytics_rule_key(name)).await
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Records one client event, enforcing the per-IP rate limit.
    pub fn add_event(&self, client_ip: &str, event_name: &str, payload: &Value) -> Result<()> {
        let now_s = now_us() / 1_000_000;
        if !self
            .rate
            .lock()
            .check(client_ip, now_s, self.rate_limit_per_minute)
        {
            return Err(Error::RateLimited(format!(
                "Rate limit exceeded for events from {}.",
                client_ip
            )));
        }

        let mut state = self.state.lock();
        let Some(route) = state.event_collection_map.get(event_name).cloned() else {
            return Err(Error::not_found(format!(
                "No analytics rule is defined for event `{}`.",
                event_name
            )));
        };

        let record = EventRecord {
            event_name: event_name.to_string(),
            event_type: route.event_type,
            query: payload
                .get("q")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            user_id: payload
                .get("user_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            doc_id: payload
                .get("doc_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            timestamp_us: next_event_ts(),
            log_to_store: route.log_to_store,
        };

        if route.is_counter && !record.doc_id.is_empty() {
            if let Some(counter) = state.counter_events.get_mut(&route.destination) {
                let weight = counter
                    .event_weights
                    .get(event_name)
                    .copied()
                    .unwrap_or(route.weight);
                *counter.doc_counts.entry(record.doc_id.clone()).or_insert(0) += weight;
            }
        }
        state
            .query_collection_events
            .entry(route.destination.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    /// Feeds a search query into popular / no-hit aggregations.
    pub fn add_suggestion(&self, source_collection: &str, query: &str, hit_count: u64) {
        let query = query.trim();
        if query.is_empty() || query == "*" {
            return;
        }
        let mut state = self.state.lock();
        let Some(destinations) = state
            .query_collection_mapping
            .get(source_collection)
            .cloned()
        else {
            return;
        };
        for dest in destinations {
            if let Some(agg) = state.popular_queries.get_mut(&dest) {
                agg.record(query);
            }
            if hit_count == 0 {
                if let Some(agg) = state.nohits_queries.get_mut(&dest) {
                    agg.record(query);
                }
            }
        }
    }

    // =========================================================================
    // Background loop
    // =========================================================================

    /// Spawns the flush loop. The task waits on the notify handle with the
    /// compaction-interval timeout and flushes once per analytics interval;
    /// `stop` wakes it for a final clean shutdown.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut last_flush = Instant::now();
            loop {
                let wait = Duration::from_secs(QUERY_COMPACTION_INTERVAL_S);
                let _ = tokio::time::timeout(wait, manager.notify.notified()).await;
                if manager.quit.load(Ordering::SeqCst) {
                    break;
                }
                if last_flush.elapsed().as_secs() >= manager.flush_interval_s {
                    if let Err(e) = manager.flush_all().await {
                        warn!(error = %e, "Analytics flush failed");
                    }
                    last_flush = Instant::now();
                }
            }
            manager.clear_state();
            info!("Analytics loop stopped");
        })
    }

    /// Signals the loop to stop.
    pub fn stop(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn clear_state(&self) {
        let mut state = self.state.lock();
        state.popular_queries.clear();
        state.nohits_queries.clear();
        state.counter_events.clear();
        state.query_collection_events.clear();
        state.event_collection_map.clear();
        state.query_collection_mapping.clear();
        state.suggestion_configs.clear();
    }

    /// Flushes, in order: query aggregations, buffered events, counters.
    pub async fn flush_all(&self) -> Result<()> {
        self.flush_query_aggregations().await?;
        self.flush_events().await?;
        self.flush_counters().await?;
        Ok(())
    }

    async fn flush_query_aggregations(&self) -> Result<()> {
        let now = now_us();
        let drained: Vec<(String, usize, Vec<(String, u32)>)> = {
            let mut state = self.state.lock();
            let mut out = Vec::new();
            for (dest, agg) in state.popular_queries.iter_mut() {
                let limit = agg.limit;
                let compacted = agg.compact_user_queries(now);
                if !compacted.is_empty() {
                    out.push((dest.clone(), limit, compacted));
                }
            }
            for (dest, agg) in state.nohits_queries.iter_mut() {
                let limit = agg.limit;
                let compacted = agg.compact_user_queries(now);
                if !compacted.is_empty() {
                    out.push((dest.clone(), limit, compacted));
                }
            }
            out
        };

        for (dest, limit, entries) in drained {
            let docs: Vec<Value> = entries
                .iter()
                .map(|(q, count)| json!({"id": q, "q": q, "count": count}))
                .collect();
            if self.leader.is_leader() {
                let Some(registry) = &self.registry else {
                    continue;
                };
                let results = registry
                    .add_many(&dest, docs, IndexAction::Emplace, DirtyValues::CoerceOrReject)
                    .await?;
                for err in results.into_iter().filter_map(|r| r.err()) {
                    warn!(destination = %dest, error = %err, "Query aggregation emplace failed");
                }
                // Top-K truncation keeps the destination bounded.
                let arc = registry.get(&dest).await?;
                let mut collection = arc.write().await;
                collection.retain_top_k("count", limit).await?;
            } else if let Some(url) = self.leader.leader_url() {
                let payload: String = docs
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join("\n");
                let endpoint = format!(
                    "{}/collections/{}/documents/import?action=emplace",
                    url.trim_end_matches('/'),
                    dest
                );
                if let Err(e) = HTTP.post(&endpoint).body(payload).send().await {
                    warn!(destination = %dest, error = %e, "Forwarding query aggregation failed");
                }
            } else {
                // No leader known: the aggregation was already drained, so
                // re-buffer it for the next interval.
                warn!(destination = %dest, "No leader URL; retaining query aggregation");
                let mut state = self.state.lock();
                let agg = if state.popular_queries.contains_key(&dest) {
                    state.popular_queries.get_mut(&dest)
                } else {
                    state.nohits_queries.get_mut(&dest)
                };
                if let Some(agg) = agg {
                    for (q, count) in entries {
                        *agg.counts.entry(q).or_insert(0) += count;
                    }
                }
            }
        }
        Ok(())
    }

    async fn flush_events(&self) -> Result<()> {
        let drained: Vec<(String, Vec<EventRecord>)> = {
            let state = self.state.lock();
            state
                .query_collection_events
                .iter()
                .filter(|(_, events)| !events.is_empty())
                .map(|(dest, events)| (dest.clone(), events.clone()))
                .collect()
        };

        for (dest, events) in drained {
            let delivered = if self.leader.is_leader() {
                for event in events.iter().filter(|e| e.log_to_store) {
                    let key = keys::analytics_event_key(
                        &event.user_id,
                        &event.event_name,
                        event.timestamp_us,
                    );
                    self.store.put(&key, &serde_json::to_vec(event)?).await?;
                }
                true
            } else if let Some(url) = self.leader.leader_url() {
                let endpoint =
                    format!("{}/analytics/aggregate_events", url.trim_end_matches('/'));
                let body = json!({ "destination": dest, "events": events });
                match HTTP.post(&endpoint).json(&body).send().await {
                    Ok(response) if response.status().is_success() => true,
                    Ok(response) => {
                        warn!(status = %response.status(), "Event flush rejected by leader");
                        false
                    }
                    Err(e) => {
                        warn!(error = %e, "Event flush failed");
                        false
                    }
                }
            } else {
                // Retained for the next interval rather than dropped.
                warn!(destination = %dest, "No leader URL; retaining buffered events");
                false
            };

            if delivered {
                // The buffer is cleared only after a successful flush.
                let mut state = self.state.lock();
                if let Some(buffer) = state.query_collection_events.get_mut(&dest) {
                    buffer.retain(|e| e.timestamp_us > events.last().map(|l| l.timestamp_us).unwrap_or(0));
                }
            }
        }
        Ok(())
    }

    async fn flush_counters(&self) -> Result<()> {
        let drained: Vec<(String, String, HashMap<String, i64>)> = {
            let mut state = self.state.lock();
            state
                .counter_events
                .iter_mut()
                .filter(|(_, c)| !c.doc_counts.is_empty())
                .map(|(dest, c)| {
                    (
                        dest.clone(),
                        c.counter_field.clone(),
                        std::mem::take(&mut c.doc_counts),
                    )
                })
                .collect()
        };

        for (dest, counter_field, doc_counts) in drained {
            let docs: Vec<Value> = doc_counts
                .iter()
                .map(|(doc_id, count)| {
                    let mut obj = serde_json::Map::new();
                    obj.insert("id".to_string(), json!(doc_id));
                    obj.insert(counter_field.clone(), json!(count));
                    Value::Object(obj)
                })
                .collect();
            if self.leader.is_leader() {
                let Some(registry) = &self.registry else {
                    continue;
                };
                let results = registry
                    .add_many(&dest, docs, IndexAction::Update, DirtyValues::CoerceOrReject)
                    .await?;
                for err in results.into_iter().filter_map(|r| r.err()) {
                    warn!(destination = %dest, error = %err, "Counter update failed");
                }
            } else if let Some(url) = self.leader.leader_url() {
                let payload: String = docs
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join("\n");
                let endpoint = format!(
                    "{}/collections/{}/documents/import?action=update",
                    url.trim_end_matches('/'),
                    dest
                );
                if let Err(e) = HTTP.post(&endpoint).body(payload).send().await {
                    warn!(destination = %dest, error = %e, "Forwarding counters failed");
                }
            } else {
                warn!(destination = %dest, "No leader URL; retaining counters");
                let mut state = self.state.lock();
                if let Some(counter) = state.counter_events.get_mut(&dest) {
                    for (doc_id, count) in doc_counts {
                        *counter.doc_counts.entry(doc_id).or_insert(0) += count;
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Event log reads
    // =========================================================================

    /// Returns the most recent `n` logged events of a user, newest first.
    /// Events deduplicate on `(timestamp, user_id, event_name)`.
    pub async fn get_last_n_events(&self, user_id: &str, n: usize) -> Result<Vec<EventRecord>> {
        let prefix = keys::analytics_event_user_prefix(user_id);
        let entries = self.store.scan_prefix(&prefix).await?;
        let mut events: Vec<EventRecord> = Vec::with_capacity(entries.len());
        let mut seen: std::collections::HashSet<(u64, String, String)> =
            std::collections::HashSet::new();
        for (_, bytes) in entries {
            let Ok(event) = serde_json::from_slice::<EventRecord>(&bytes) else {
                continue;
            };
            let key = (
                event.timestamp_us,
                event.user_id.clone(),
                event.event_name.clone(),
            );
            if seen.insert(key) {
                events.push(event);
            }
        }
        events.sort_by(|a, b| b.timestamp_us.cmp(&a.timestamp_us));
        events.truncate(n);
        debug!(user = %user_id, count = events.len(), "Fetched recent events");
        Ok(events)
    }
}
