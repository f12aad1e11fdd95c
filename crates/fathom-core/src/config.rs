//! Engine configuration constants.
//!
//! These values define the production configuration for fathom and are used
//! throughout the codebase and in tests to ensure consistency.

/// Above this candidate count the filter evaluator hands back a lazy
/// iterator instead of a materialized id array.
pub const COMPUTE_FILTER_ITERATOR_THRESHOLD: usize = 25_000;

/// Maximum weight assignable to a search field. User-provided weights are
/// normalized into `[0, FIELD_MAX_WEIGHT]`; default weights count down
/// from this value in field order.
pub const FIELD_MAX_WEIGHT: u8 = 15;

/// Maximum number of effective sort clauses per search.
pub const MAX_SORT_CLAUSES: usize = 3;

/// Default and maximum page size.
pub const DEFAULT_PER_PAGE: usize = 10;
pub const MAX_PER_PAGE: usize = 250;

/// Upper bound for `group_limit`.
pub const GROUP_LIMIT_MAX: usize = 1_000;

/// Default exact-filter radius for geo atoms, in meters. Below this the
/// evaluator runs the exact haversine test; above it the cheap cell-cover
/// approximation is accepted as-is.
pub const DEFAULT_EXACT_FILTER_RADIUS_M: f64 = 10_000.0;

/// Ingest batches yield to the index after this many records.
pub const INDEX_BATCH_SIZE: usize = 1_000;

/// Schema alteration logs progress every this many documents.
pub const ALTER_PROGRESS_LOG_INTERVAL: u32 = 16_384;

/// Ring buffer size for schema-alter outcome history.
pub const ALTER_STATUS_MSG_COUNT: usize = 5;

/// The analytics background loop wakes at least this often (seconds).
pub const QUERY_COMPACTION_INTERVAL_S: u64 = 30;

/// Capacity of the per-client-IP rate limit LRU.
pub const ANALYTICS_RATE_LRU_CAPACITY: usize = 1_024;

/// Default per-IP events-per-minute budget for analytics ingestion.
pub const DEFAULT_ANALYTICS_MINUTE_RATE_LIMIT: u32 = 5;

/// Default remote embedding call budget.
pub const DEFAULT_REMOTE_EMBEDDING_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_REMOTE_EMBEDDING_NUM_TRIES: u32 = 2;

/// Sentinel stored in a reference helper field while the referenced
/// document does not exist yet (async references).
pub const UNRESOLVED_REFERENCE: u32 = u32::MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_bounds_are_consistent() {
        assert!(DEFAULT_PER_PAGE <= MAX_PER_PAGE);
    }

    #[test]
    fn test_field_weight_fits_text_match_layout() {
        // best_field_weight occupies 8 bits of the packed text-match score
        assert!((FIELD_MAX_WEIGHT as u16) < 256);
    }
}
