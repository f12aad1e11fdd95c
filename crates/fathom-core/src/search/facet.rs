//! Facet field parsing and result shapes.
//!
//! A `facet_by` entry is a field name with an optional parameter suffix:
//! `category`, `category(top_k: true)`, `price(sort_by: _alpha:asc)`,
//! `price(economy:[0, 100], luxury:[100, 500])`. Counting itself happens in
//! the index over the filtered result set; this module owns the request and
//! response shapes.

use super::sort::{split_sort_clauses, SortOrder};
use crate::error::{Error, Result};
use serde::Serialize;

/// How facet values are ordered in the response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FacetSort {
    /// Descending count (the default).
    #[default]
    CountDesc,
    /// Alphabetical by value.
    Alpha(SortOrder),
    /// By another field's value (first value wins per facet bucket).
    ByField { name: String, order: SortOrder },
}

/// A named numeric range bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetRange {
    pub label: String,
    pub low: f64,
    pub high: f64,
}

/// A parsed facet request for one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetSpec {
    pub field: String,
    pub sort: FacetSort,
    pub top_k: bool,
    pub ranges: Vec<FacetRange>,
}

/// One counted facet value.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FacetCount {
    pub value: String,
    pub count: u32,
    /// Set when a `facet_query` matched this value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlighted: Option<String>,
}

/// Numeric stats over a faceted field.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FacetStats {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub avg: f64,
    pub total_values: usize,
}

/// Counts for one faceted field.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FacetCounts {
    pub field_name: String,
    pub counts: Vec<FacetCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<FacetStats>,
}

/// Parses all `facet_by` entries.
pub fn parse_facet_fields(raw: &[String]) -> Result<Vec<FacetSpec>> {
    raw.iter().map(|entry| parse_facet_field(entry)).collect()
}

fn parse_facet_field(raw: &str) -> Result<FacetSpec> {
    let raw = raw.trim();
    let (name, params) = match raw.find('(') {
        Some(open) if raw.ends_with(')') => {
            (raw[..open].trim(), Some(&raw[open + 1..raw.len() - 1]))
        }
        Some(_) => {
            return Err(Error::invalid(format!(
                "Malformed facet entry `{}`: unbalanced parens.",
                raw
            )))
        }
        None => (raw, None),
    };
    if name.is_empty() {
        return Err(Error::invalid("Facet field name cannot be empty."));
    }

    let mut spec = FacetSpec {
        field: name.to_string(),
        sort: FacetSort::default(),
        top_k: false,
        ranges: Vec::new(),
    };

    let Some(params) = params else {
        return Ok(spec);
    };

    for part in split_sort_clauses(params) {
        let Some((key, value)) = part.split_once(':') else {
            return Err(Error::invalid(format!(
                "Malformed facet parameter `{}`.",
                part
            )));
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "top_k" => {
                spec.top_k = value.parse().map_err(|_| {
                    Error::invalid(format!("`top_k` expects true or false, got `{}`.", value))
                })?;
            }
            "sort_by" => {
                let (target, order) = value.rsplit_once(':').ok_or_else(|| {
                    Error::invalid("facet sort_by expects `_alpha:asc` or `field:desc`.")
                })?;
                let order = match order.trim() {
                    "asc" => SortOrder::Asc,
                    "desc" => SortOrder::Desc,
                    other => {
                        return Err(Error::invalid(format!(
                            "`{}` is not a valid facet sort order.",
                            other
                        )))
                    }
                };
                spec.sort = match target.trim() {
                    "_alpha" => FacetSort::Alpha(order),
                    field => FacetSort::ByField {
                        name: field.to_string(),
                        order,
                    },
                };
            }
            label => {
                // `label:[low, high]` range bucket.
                let bounds = value
                    .strip_prefix('[')
                    .and_then(|v| v.strip_suffix(']'))
                    .ok_or_else(|| {
                        Error::invalid(format!("Facet range `{}` must use `[low, high]`.", part))
                    })?;
                let (low, high) = bounds.split_once(',').ok_or_else(|| {
                    Error::invalid(format!("Facet range `{}` needs two bounds.", part))
                })?;
                let low: f64 = low.trim().parse().map_err(|_| {
                    Error::invalid(format!("Facet range bound `{}` is not numeric.", low))
                })?;
                let high: f64 = high.trim().parse().map_err(|_| {
                    Error::invalid(format!("Facet range bound `{}` is not numeric.", high))
                })?;
                if low >= high {
                    return Err(Error::invalid(format!(
                        "Facet range `{}` must have low < high.",
                        label
                    )));
                }
                spec.ranges.push(FacetRange {
                    label: label.to_string(),
                    low,
                    high,
                });
            }
        }
    }
    Ok(spec)
}

/// Parses `facet_query` of the form `field:prefix`.
pub fn parse_facet_query(raw: &str) -> Result<Option<(String, String)>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let (field, prefix) = raw.split_once(':').ok_or_else(|| {
        Error::invalid("facet_query must look like `field:prefix`.")
    })?;
    Ok(Some((field.trim().to_string(), prefix.trim().to_lowercase())))
}
