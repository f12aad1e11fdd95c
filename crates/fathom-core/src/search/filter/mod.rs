//! Filter expressions: parse tree, atoms, and evaluation results.
//!
//! The grammar (informally):
//!
//! ```text
//! expr   := term (('&&'|'||') term)*
//! term   := '(' expr ')' | atom
//! atom   := field ':' op value
//!        |  '$' refCollection '(' expr ')'
//! op     := '='|'!='|'<'|'<='|'>'|'>='|':'      (':' = contains for strings)
//! value  := literal | '[' literal (',' literal)* ']' | 'low..high' | geo-spec
//! ```
//!
//! `&&` binds tighter than `||`; parentheses override.

mod eval;
mod parser;

pub use eval::{
    difference_sorted, evaluate, intersect_sorted, resolve_references, union_sorted, EvalContext,
    JoinSource,
};
pub use parser::{parse_distance_meters, parse_filter};

use crate::SeqId;

/// Comparison operator attached to a single filter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Token containment for strings (the bare `:` operator).
    Contains,
    /// `low..high` inclusive numeric range.
    Range,
}

/// Geo filter payload of a leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum GeoFilter {
    /// Point + radius in meters. `exact_radius_m` selects between the cheap
    /// cover approximation and the exact haversine test.
    Radius {
        lat: f64,
        lng: f64,
        radius_m: f64,
        exact_radius_m: f64,
    },
    /// Closed polygon of `(lat, lng)` vertices.
    Polygon { points: Vec<(f64, f64)> },
}

/// A reference (join) atom: evaluate `inner` against `collection`, then map
/// the matching referenced seq ids back through the local helper field.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceFilter {
    pub collection: String,
    /// Negate-left-join: keep docs whose referenced set is empty or absent.
    pub negate: bool,
    pub inner: Box<FilterNode>,
    /// Filled in by [`resolve_references`]: the referenced seq ids matching
    /// `inner`, ready for helper-field mapping.
    pub resolved_ref_ids: Option<Vec<SeqId>>,
}

/// A single field predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterAtom {
    pub field: String,
    /// Literal values, parallel to `comparators`. Ranges store `low..high`
    /// as two values sharing one `Range` comparator slot.
    pub values: Vec<String>,
    pub comparators: Vec<Comparator>,
    /// Set for the common `field:!=X` pattern: matching ids are complemented
    /// against the field's universe after aggregation.
    pub apply_not_equals: bool,
    pub geo: Option<GeoFilter>,
    pub reference: Option<ReferenceFilter>,
    /// Set when field-name validation is disabled and the field is unknown:
    /// the atom contributes no documents instead of failing.
    pub ignored: bool,
}

impl FilterAtom {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            values: Vec::new(),
            comparators: Vec::new(),
            apply_not_equals: false,
            geo: None,
            reference: None,
            ignored: false,
        }
    }
}

/// Owned recursive filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Leaf(FilterAtom),
    And(Box<FilterNode>, Box<FilterNode>),
    Or(Box<FilterNode>, Box<FilterNode>),
}

impl FilterNode {
    /// Depth-first mutable walk over all leaves.
    pub fn for_each_leaf_mut<F: FnMut(&mut FilterAtom)>(&mut self, f: &mut F) {
        match self {
            FilterNode::Leaf(atom) => f(atom),
            FilterNode::And(a, b) | FilterNode::Or(a, b) => {
                a.for_each_leaf_mut(f);
                b.for_each_leaf_mut(f);
            }
        }
    }

    /// Ors this tree with `other`, consuming both.
    pub fn or(self, other: FilterNode) -> FilterNode {
        FilterNode::Or(Box::new(self), Box::new(other))
    }

    /// Ands this tree with `other`, consuming both.
    pub fn and(self, other: FilterNode) -> FilterNode {
        FilterNode::And(Box::new(self), Box::new(other))
    }
}

/// Evaluation output: a sorted ascending id set, materialized or lazy.
///
/// Above [`COMPUTE_FILTER_ITERATOR_THRESHOLD`](crate::config::COMPUTE_FILTER_ITERATOR_THRESHOLD)
/// the evaluator returns the lazy form; the ranking stage consumes either
/// through [`FilterResult::iter`] without caring which it got.
pub enum FilterResult {
    Materialized(Vec<SeqId>),
    Lazy(Box<dyn Iterator<Item = SeqId> + Send>),
}

impl FilterResult {
    /// Number of matching documents. Consumes a lazy result's backing count
    /// eagerly, so callers should use [`FilterResult::into_iter_and_count`]
    /// when they need both.
    pub fn into_iter_and_count(self) -> (Box<dyn Iterator<Item = SeqId> + Send>, usize) {
        match self {
            FilterResult::Materialized(ids) => {
                let count = ids.len();
                (Box::new(ids.into_iter()), count)
            }
            FilterResult::Lazy(iter) => {
                // The lazy form does not know its count up front; callers
                // that need an exact count force it here.
                let ids: Vec<SeqId> = iter.collect();
                let count = ids.len();
                (Box::new(ids.into_iter()), count)
            }
        }
    }

    /// Collects into a sorted id vector regardless of form.
    pub fn into_ids(self) -> Vec<SeqId> {
        match self {
            FilterResult::Materialized(ids) => ids,
            FilterResult::Lazy(iter) => iter.collect(),
        }
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self, FilterResult::Lazy(_))
    }
}
