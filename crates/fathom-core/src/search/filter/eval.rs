//! Filter tree evaluation.
//!
//! Evaluation produces sorted ascending seq-id sets. Per-atom matching is
//! delegated to the index; this module owns the boolean algebra, the
//! `!=` complement, reference (join) mapping through helper fields, and the
//! materialized/lazy result split.

use super::{FilterAtom, FilterNode, FilterResult};
use crate::config::COMPUTE_FILTER_ITERATOR_THRESHOLD;
use crate::error::{Error, Result};
use crate::index::MemoryIndex;
use crate::schema::{reference_helper_name, Field};
use crate::SeqId;
use std::collections::{HashMap, HashSet};

/// Everything leaf evaluation needs about the surrounding collection.
pub struct EvalContext<'a> {
    pub index: &'a MemoryIndex,
    pub fields: &'a [Field],
    /// When false, unknown filter fields mark their atom *ignored* (matching
    /// nothing) instead of failing the search.
    pub validate_field_names: bool,
    /// Local reference field per referenced collection name, for join
    /// atoms: `$customers(...)` maps back through the helper of this field.
    pub ref_local_fields: &'a HashMap<String, String>,
}

/// Source of referenced-collection filter results, implemented by the
/// collection registry. Used once per reference atom before evaluation.
#[async_trait::async_trait]
pub trait JoinSource: Sync {
    async fn filter_ref_ids(&self, collection: &str, inner: &FilterNode) -> Result<Vec<SeqId>>;
}

/// Resolves every reference atom in `node` by evaluating its inner
/// expression against the referenced collection.
pub async fn resolve_references(node: &mut FilterNode, joins: &dyn JoinSource) -> Result<()> {
    match node {
        FilterNode::Leaf(atom) => {
            if let Some(reference) = atom.reference.as_mut() {
                let ids = joins
                    .filter_ref_ids(&reference.collection, &reference.inner)
                    .await?;
                reference.resolved_ref_ids = Some(ids);
            }
            Ok(())
        }
        FilterNode::And(a, b) | FilterNode::Or(a, b) => {
            Box::pin(resolve_references(a, joins)).await?;
            Box::pin(resolve_references(b, joins)).await
        }
    }
}

/// Evaluates a filter tree to a sorted id set. Reference atoms must have
/// been resolved first (see [`resolve_references`]).
pub fn evaluate(node: &FilterNode, ctx: &EvalContext<'_>) -> Result<FilterResult> {
    let ids = eval_node(node, ctx)?;
    if ids.len() >= COMPUTE_FILTER_ITERATOR_THRESHOLD {
        Ok(FilterResult::Lazy(Box::new(ids.into_iter())))
    } else {
        Ok(FilterResult::Materialized(ids))
    }
}

fn eval_node(node: &FilterNode, ctx: &EvalContext<'_>) -> Result<Vec<SeqId>> {
    match node {
        FilterNode::Leaf(atom) => eval_leaf(atom, ctx),
        FilterNode::And(a, b) => Ok(intersect_sorted(
            &eval_node(a, ctx)?,
            &eval_node(b, ctx)?,
        )),
        FilterNode::Or(a, b) => Ok(union_sorted(&eval_node(a, ctx)?, &eval_node(b, ctx)?)),
    }
}

fn eval_leaf(atom: &FilterAtom, ctx: &EvalContext<'_>) -> Result<Vec<SeqId>> {
    if atom.ignored {
        return Ok(Vec::new());
    }

    if let Some(reference) = &atom.reference {
        let ref_ids = reference.resolved_ref_ids.as_ref().ok_or_else(|| {
            Error::internal(format!(
                "Reference filter on `{}` was not resolved before evaluation.",
                reference.collection
            ))
        })?;
        let local_field = ctx.ref_local_fields.get(&reference.collection).ok_or_else(|| {
            Error::invalid(format!(
                "Collection has no reference field pointing at `{}`.",
                reference.collection
            ))
        })?;
        let helper = reference_helper_name(local_field);
        let ref_set: HashSet<SeqId> = ref_ids.iter().copied().collect();
        let matched = ctx.index.ids_with_helper_in(&helper, &ref_set);
        if reference.negate {
            return Ok(difference_sorted(&ctx.index.all_seq_ids(), &matched));
        }
        return Ok(matched);
    }

    let Some(field) = Field::resolve(ctx.fields, &atom.field) else {
        if ctx.validate_field_names {
            return Err(Error::not_found(format!(
                "Could not find a filter field named `{}` in the schema.",
                atom.field
            )));
        }
        return Ok(Vec::new());
    };

    let matched = ctx.index.filter_atom_ids(atom, field)?;
    if atom.apply_not_equals {
        // `!=` is the complement within the field's partial universe.
        let universe = ctx.index.field_universe(&atom.field);
        return Ok(difference_sorted(&universe, &matched));
    }
    Ok(matched)
}

/// Intersection of two sorted ascending vectors.
pub fn intersect_sorted(a: &[SeqId], b: &[SeqId]) -> Vec<SeqId> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Union of two sorted ascending vectors.
pub fn union_sorted(a: &[SeqId], b: &[SeqId]) -> Vec<SeqId> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Elements of sorted `a` not present in sorted `b`.
pub fn difference_sorted(a: &[SeqId], b: &[SeqId]) -> Vec<SeqId> {
    let mut out = Vec::with_capacity(a.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() {
        if j >= b.len() || a[i] < b[j] {
            out.push(a[i]);
            i += 1;
        } else if a[i] == b[j] {
            i += 1;
            j += 1;
        } else {
            j += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_operations() {
        let a = vec![1, 3, 5, 7];
        let b = vec![3, 4, 5, 9];
        assert_eq!(intersect_sorted(&a, &b), vec![3, 5]);
        assert_eq!(union_sorted(&a, &b), vec![1, 3, 4, 5, 7, 9]);
        assert_eq!(difference_sorted(&a, &b), vec![1, 7]);
        assert_eq!(difference_sorted(&b, &a), vec![4, 9]);
    }

    #[test]
    fn test_set_operations_disjoint_and_empty() {
        let a = vec![1, 2];
        let b: Vec<SeqId> = vec![];
        assert_eq!(intersect_sorted(&a, &b), Vec::<SeqId>::new());
        assert_eq!(union_sorted(&a, &b), vec![1, 2]);
        assert_eq!(difference_sorted(&a, &b), vec![1, 2]);
    }

    #[test]
    fn test_filter_result_forms() {
        use super::super::FilterResult;

        let materialized = FilterResult::Materialized(vec![1, 2, 3]);
        assert!(!materialized.is_lazy());
        let (iter, count) = materialized.into_iter_and_count();
        assert_eq!(count, 3);
        assert_eq!(iter.collect::<Vec<_>>(), vec![1, 2, 3]);

        let lazy = FilterResult::Lazy(Box::new(vec![4u32, 5].into_iter()));
        assert!(lazy.is_lazy());
        assert_eq!(lazy.into_ids(), vec![4, 5]);
    }
}
