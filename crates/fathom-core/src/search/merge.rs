//! Raw/curated result merging and bucketed rescoring.
//!
//! The merger walks the raw ranked stream and, at each position, emits the
//! curated hit whose target position matches, otherwise the next raw item.
//! Bucketed rescoring then coarsens the text-match or vector-distance key
//! into bucket ordinals so secondary sort clauses dominate within a bucket;
//! original scores are restored afterwards so the response carries the real
//! values.

use super::sort::{compare_keys, ResolvedSort, SortBy, SortValue};
use crate::index::RankedHit;
use crate::SeqId;
use std::collections::HashSet;
use std::time::Instant;

/// Merges raw hits with curated hits. `curated` pairs each hit with its
/// 1-based target position; curated documents are removed from the raw
/// stream first so they only appear at their pinned slots.
pub fn merge_hits(raw: Vec<RankedHit>, curated: Vec<(RankedHit, usize)>) -> Vec<RankedHit> {
    if curated.is_empty() {
        return raw;
    }
    let pinned_ids: HashSet<SeqId> = curated.iter().map(|(hit, _)| hit.seq_id).collect();
    let mut raw_iter = raw
        .into_iter()
        .filter(|hit| !pinned_ids.contains(&hit.seq_id))
        .peekable();

    let mut out: Vec<RankedHit> = Vec::new();
    let mut remaining: Vec<(RankedHit, usize)> = curated;
    remaining.sort_by_key(|(_, pos)| *pos);
    let mut remaining = remaining.into_iter().peekable();

    let mut position = 1usize;
    loop {
        if let Some((_, target)) = remaining.peek() {
            if *target <= position {
                let (hit, _) = remaining.next().expect("peeked");
                out.push(hit);
                position += 1;
                continue;
            }
        }
        match raw_iter.next() {
            Some(hit) => {
                out.push(hit);
                position += 1;
            }
            None => {
                // Raw stream exhausted: append leftover curated hits in
                // position order.
                out.extend(remaining.map(|(hit, _)| hit));
                break;
            }
        }
    }
    out
}

/// Applies bucketed rescoring in place when a `_text_match` /
/// `_vector_distance` clause requests it and enough items are present.
/// Returns `true` when a rescoring pass ran.
pub fn apply_bucket_rescoring(hits: &mut [RankedHit], sorts: &[ResolvedSort]) -> bool {
    let Some((clause_idx, bucketing)) = sorts.iter().enumerate().find_map(|(i, s)| {
        let b = s.bucketing()?;
        if b.is_set() {
            Some((i, b))
        } else {
            None
        }
    }) else {
        return false;
    };
    let is_bucketable = matches!(
        sorts[clause_idx].by,
        SortBy::TextMatch { .. } | SortBy::VectorDistance { .. }
    );
    if !is_bucketable || hits.is_empty() {
        return false;
    }

    let n = hits.len();
    let bucket_size = if let Some(buckets) = bucketing.buckets {
        if n < buckets {
            return false;
        }
        n.div_ceil(buckets)
    } else if let Some(size) = bucketing.bucket_size {
        if n < size {
            return false;
        }
        size
    } else {
        return false;
    };

    // Swap the fine-grained key for its bucket ordinal, keeping the
    // originals in a side map keyed by seq id.
    let originals: std::collections::HashMap<SeqId, SortValue> = hits
        .iter()
        .map(|h| (h.seq_id, h.keys[clause_idx].clone()))
        .collect();
    for (rank, hit) in hits.iter_mut().enumerate() {
        let bucket = (rank / bucket_size) as i64;
        // Earlier ranks must stay ahead under either order, so the bucket
        // ordinal is negated for descending clauses.
        hit.keys[clause_idx] = match sorts[clause_idx].order {
            super::sort::SortOrder::Desc => SortValue::Int(-bucket),
            super::sort::SortOrder::Asc => SortValue::Int(bucket),
        };
    }
    hits.sort_by(|a, b| compare_keys(&a.keys, &b.keys, sorts));

    // Restore real scores for downstream consumers.
    for hit in hits.iter_mut() {
        if let Some(original) = originals.get(&hit.seq_id) {
            hit.keys[clause_idx] = original.clone();
        }
    }
    true
}

/// True when the wall clock has passed the plan deadline.
pub fn cutoff_reached(deadline: Option<Instant>) -> bool {
    deadline.map(|d| Instant::now() >= d).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::sort::{Bucketing, ResolvedSort, SortOrder};

    fn hit(seq_id: SeqId, keys: Vec<SortValue>) -> RankedHit {
        RankedHit {
            seq_id,
            keys,
            text_match: 0,
            vector_distance: None,
            rank_fusion_score: None,
            group_key: None,
            group_members: vec![seq_id],
            group_found: 0,
        }
    }

    #[test]
    fn test_merge_places_curated_at_target_positions() {
        let raw = vec![hit(10, vec![]), hit(11, vec![]), hit(12, vec![])];
        let curated = vec![(hit(99, vec![]), 2)];
        let merged = merge_hits(raw, curated);
        let ids: Vec<SeqId> = merged.iter().map(|h| h.seq_id).collect();
        assert_eq!(ids, vec![10, 99, 11, 12]);
    }

    #[test]
    fn test_merge_pinned_doc_removed_from_raw_stream() {
        let raw = vec![hit(10, vec![]), hit(99, vec![]), hit(12, vec![])];
        let curated = vec![(hit(99, vec![]), 1)];
        let merged = merge_hits(raw, curated);
        let ids: Vec<SeqId> = merged.iter().map(|h| h.seq_id).collect();
        assert_eq!(ids, vec![99, 10, 12]);
    }

    #[test]
    fn test_merge_curated_beyond_raw_appended() {
        let raw = vec![hit(10, vec![])];
        let curated = vec![(hit(98, vec![]), 5), (hit(99, vec![]), 9)];
        let merged = merge_hits(raw, curated);
        let ids: Vec<SeqId> = merged.iter().map(|h| h.seq_id).collect();
        assert_eq!(ids, vec![10, 98, 99]);
    }

    fn bucketed_sorts(buckets: usize) -> Vec<ResolvedSort> {
        vec![
            ResolvedSort {
                by: SortBy::TextMatch {
                    bucketing: Bucketing {
                        buckets: Some(buckets),
                        bucket_size: None,
                    },
                },
                order: SortOrder::Desc,
            },
            ResolvedSort {
                by: SortBy::SeqId,
                order: SortOrder::Desc,
            },
        ]
    }

    #[test]
    fn test_bucketed_rescoring_two_classes() {
        // Scenario S1 in miniature: 100 hits, two match classes, 2 buckets.
        // Strong matches score 100, weak ones 50; seq ids interleave so a
        // plain text-match sort would not order by seq id.
        let mut hits: Vec<RankedHit> = Vec::new();
        for seq in 0..100u32 {
            let strong = seq % 2 == 0;
            let score = if strong { 100 } else { 50 };
            hits.push(hit(seq, vec![SortValue::Int(score), SortValue::Int(seq as i64)]));
        }
        let sorts = bucketed_sorts(2);
        hits.sort_by(|a, b| compare_keys(&a.keys, &b.keys, &sorts));

        assert!(apply_bucket_rescoring(&mut hits, &sorts));

        // First 50 hits: the strong class, by descending seq id.
        let first: Vec<SeqId> = hits[..50].iter().map(|h| h.seq_id).collect();
        let mut expected_strong: Vec<SeqId> = (0..100).filter(|s| s % 2 == 0).collect();
        expected_strong.reverse();
        assert_eq!(first, expected_strong);

        // Last 50: the weak class, by descending seq id.
        let last: Vec<SeqId> = hits[50..].iter().map(|h| h.seq_id).collect();
        let mut expected_weak: Vec<SeqId> = (0..100).filter(|s| s % 2 == 1).collect();
        expected_weak.reverse();
        assert_eq!(last, expected_weak);

        // Original scores were restored after the bucket sort.
        assert_eq!(hits[0].keys[0], SortValue::Int(100));
        assert_eq!(hits[99].keys[0], SortValue::Int(50));
    }

    #[test]
    fn test_bucketing_skipped_below_threshold() {
        let mut hits = vec![hit(0, vec![SortValue::Int(5), SortValue::Int(0)])];
        let sorts = bucketed_sorts(2);
        // 1 item < 2 buckets: no rescoring.
        assert!(!apply_bucket_rescoring(&mut hits, &sorts));
    }

    #[test]
    fn test_bucketing_ignored_without_request() {
        let mut hits = vec![
            hit(0, vec![SortValue::Int(5), SortValue::Int(0)]),
            hit(1, vec![SortValue::Int(3), SortValue::Int(1)]),
        ];
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
        assert!(!apply_bucket_rescoring(&mut hits, &sorts));
    }
}
