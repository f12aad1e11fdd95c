//! Curation overrides: pinning, hiding and reshaping results for matching
//! queries.
//!
//! An override matches the *normalized* query (lowercased, tokenized,
//! rejoined) either exactly or by containment, by filter equality, or - when
//! its query and filter are both empty - by tag alone. Matching overrides
//! contribute pinned hits, hidden hits, a replacement query, extra filters
//! and a sort override. `stop_processing` halts the scan once a matching
//! override carries it.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Query match mode of an override rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideMatch {
    Exact,
    Contains,
}

/// The matcher half of an override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OverrideRule {
    #[serde(default)]
    pub query: String,
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_type: Option<OverrideMatch>,
    #[serde(default)]
    pub filter_by: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A pinned hit with its 1-based target position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideInclude {
    pub id: String,
    pub position: usize,
}

/// A hidden hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideExclude {
    pub id: String,
}

fn default_stop_processing() -> bool {
    true
}

/// A curation rule, persisted per collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub id: String,
    pub rule: OverrideRule,
    #[serde(default)]
    pub includes: Vec<OverrideInclude>,
    #[serde(default)]
    pub excludes: Vec<OverrideExclude>,
    #[serde(default)]
    pub filter_by: String,
    #[serde(default)]
    pub sort_by: String,
    #[serde(default)]
    pub replace_query: String,
    #[serde(default)]
    pub remove_matched_tokens: bool,
    #[serde(default)]
    pub filter_curated_hits: bool,
    #[serde(default = "default_stop_processing")]
    pub stop_processing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_to_ts: Option<i64>,
}

impl Override {
    /// Validates an override payload before persisting it.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::invalid("An override needs an `id`."));
        }
        let has_matcher = !self.rule.query.is_empty()
            || !self.rule.filter_by.is_empty()
            || !self.rule.tags.is_empty();
        if !has_matcher {
            return Err(Error::invalid(
                "An override rule needs a query, a filter_by or tags.",
            ));
        }
        if !self.rule.query.is_empty() && self.rule.match_type.is_none() {
            return Err(Error::invalid(
                "An override with a rule query needs `match`: exact or contains.",
            ));
        }
        if self.includes.iter().any(|i| i.position == 0) {
            return Err(Error::invalid("Pinned positions start at 1."));
        }
        Ok(())
    }

    /// Whether the override's filter materializes from query tokens.
    pub fn has_dynamic_filter(&self) -> bool {
        self.filter_by.contains('{')
    }

    /// Does this override match the request? `normalized_query` is the
    /// tokenize-rejoined lowercase query, `filter_query` the raw filter.
    pub fn matches(&self, normalized_query: &str, filter_query: &str, now_ts: i64) -> bool {
        if let Some(from) = self.effective_from_ts {
            if now_ts < from {
                return false;
            }
        }
        if let Some(to) = self.effective_to_ts {
            if now_ts > to {
                return false;
            }
        }

        if self.rule.query.is_empty() && self.rule.filter_by.is_empty() {
            // Tag-only override: the tag precedence pass decides.
            return !self.rule.tags.is_empty();
        }

        if !self.rule.filter_by.is_empty() && self.rule.filter_by == filter_query {
            return true;
        }

        if !self.rule.query.is_empty() {
            let rule_query = self.rule.query.to_lowercase();
            match self.rule.match_type {
                Some(OverrideMatch::Exact) => return normalized_query == rule_query,
                Some(OverrideMatch::Contains) => {
                    return contains_token_sequence(normalized_query, &rule_query)
                }
                None => return false,
            }
        }

        false
    }
}

/// Checks whether `query` contains `needle` as a whole-token subsequence.
fn contains_token_sequence(query: &str, needle: &str) -> bool {
    let query_tokens: Vec<&str> = query.split_whitespace().collect();
    let needle_tokens: Vec<&str> = needle.split_whitespace().collect();
    if needle_tokens.is_empty() || needle_tokens.len() > query_tokens.len() {
        return false;
    }
    query_tokens
        .windows(needle_tokens.len())
        .any(|w| w == needle_tokens.as_slice())
}

/// Combined effect of the matched overrides plus `pinned/hidden_hits`.
#[derive(Debug, Clone, Default)]
pub struct CurationOutcome {
    /// `(doc_id, 1-based position)` pinned hits, first writer wins per slot.
    pub included: Vec<(String, usize)>,
    pub excluded: Vec<String>,
    pub replace_query: Option<String>,
    pub remove_matched_tokens: Vec<String>,
    /// Extra filters, or-ed into the request filter.
    pub filter_by: Vec<String>,
    pub sort_by: Option<String>,
    pub filter_curated_hits: bool,
}

/// Selects the overrides that apply under tag precedence, in rule order:
///
/// - With request tags: exact tag-set matches first (falling back to
///   partial-intersection matches), then `*`-tagged overrides; untagged
///   overrides are skipped.
/// - Without request tags: untagged and `*`-tagged overrides apply.
///
/// `stop_processing` on a matching override halts the scan of its class.
pub fn find_matching_overrides<'a>(
    overrides: &'a [Override],
    normalized_query: &str,
    filter_query: &str,
    tags: &[String],
    now_ts: i64,
) -> Vec<&'a Override> {
    let is_wildcard_tagged = |o: &Override| o.rule.tags.iter().any(|t| t == "*");

    let mut classes: Vec<Vec<&Override>> = Vec::new();
    if tags.is_empty() {
        classes.push(
            overrides
                .iter()
                .filter(|o| o.rule.tags.is_empty() || is_wildcard_tagged(o))
                .collect(),
        );
    } else {
        let tag_set: std::collections::BTreeSet<&str> =
            tags.iter().map(|t| t.as_str()).collect();
        let exact: Vec<&Override> = overrides
            .iter()
            .filter(|o| {
                let rule_set: std::collections::BTreeSet<&str> =
                    o.rule.tags.iter().map(|t| t.as_str()).collect();
                !rule_set.is_empty() && rule_set == tag_set
            })
            .collect();
        let tagged = if exact.is_empty() {
            overrides
                .iter()
                .filter(|o| {
                    !is_wildcard_tagged(o)
                        && o.rule.tags.iter().any(|t| tag_set.contains(t.as_str()))
                })
                .collect()
        } else {
            exact
        };
        classes.push(tagged);
        classes.push(overrides.iter().filter(|o| is_wildcard_tagged(o)).collect());
    }

    let mut matched: Vec<&Override> = Vec::new();
    for class in classes {
        for o in class {
            if matched.iter().any(|m| m.id == o.id) {
                continue;
            }
            if o.matches(normalized_query, filter_query, now_ts) {
                let stops = o.stop_processing;
                matched.push(o);
                if stops {
                    break;
                }
            }
        }
    }
    matched
}

/// Folds matched overrides into one outcome. Drops always precede adds in
/// the merged order; the first override to claim a position or reshape the
/// query wins.
pub fn apply_overrides(matched: &[&Override], normalized_query: &str) -> CurationOutcome {
    let mut outcome = CurationOutcome::default();

    for o in matched {
        for exclude in &o.excludes {
            if !outcome.excluded.contains(&exclude.id) {
                outcome.excluded.push(exclude.id.clone());
            }
        }
    }

    for o in matched {
        for include in &o.includes {
            if outcome.included.iter().any(|(id, _)| id == &include.id) {
                continue;
            }
            outcome.included.push((include.id.clone(), include.position));
        }

        if !o.filter_by.is_empty() {
            let materialized = if o.has_dynamic_filter() {
                materialize_dynamic_filter(&o.filter_by, normalized_query)
            } else {
                o.filter_by.clone()
            };
            outcome.filter_by.push(materialized);
        }
        if !o.sort_by.is_empty() && outcome.sort_by.is_none() {
            outcome.sort_by = Some(o.sort_by.clone());
        }
        if !o.replace_query.is_empty() && outcome.replace_query.is_none() {
            outcome.replace_query = Some(o.replace_query.clone());
        }
        // Token removal is suppressed for dynamic filters: those tokens are
        // what the filter materializes from.
        if o.remove_matched_tokens && !o.has_dynamic_filter() {
            for token in o.rule.query.to_lowercase().split_whitespace() {
                outcome.remove_matched_tokens.push(token.to_string());
            }
        }
        outcome.filter_curated_hits |= o.filter_curated_hits;
    }

    outcome.included.sort_by_key(|(_, pos)| *pos);
    outcome
}

/// Replaces `{q}` placeholders with the normalized query.
fn materialize_dynamic_filter(template: &str, normalized_query: &str) -> String {
    template.replace("{q}", normalized_query)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact_override(id: &str, query: &str) -> Override {
        Override {
            id: id.to_string(),
            rule: OverrideRule {
                query: query.to_string(),
                match_type: Some(OverrideMatch::Exact),
                filter_by: String::new(),
                tags: Vec::new(),
            },
            includes: Vec::new(),
            excludes: Vec::new(),
            filter_by: String::new(),
            sort_by: String::new(),
            replace_query: String::new(),
            remove_matched_tokens: false,
            filter_curated_hits: false,
            stop_processing: true,
            effective_from_ts: None,
            effective_to_ts: None,
        }
    }

    #[test]
    fn test_exact_and_contains_match() {
        let o = exact_override("o1", "Red");
        assert!(o.matches("red", "", 0));
        assert!(!o.matches("red shoes", "", 0));

        let mut contains = exact_override("o2", "red");
        contains.rule.match_type = Some(OverrideMatch::Contains);
        assert!(contains.matches("bright red shoes", "", 0));
        assert!(!contains.matches("redish shoes", "", 0));
    }

    #[test]
    fn test_effective_window_inclusive() {
        let mut o = exact_override("o1", "red");
        o.effective_from_ts = Some(100);
        o.effective_to_ts = Some(200);
        assert!(!o.matches("red", "", 99));
        // Boundary timestamps match exactly.
        assert!(o.matches("red", "", 100));
        assert!(o.matches("red", "", 200));
        assert!(!o.matches("red", "", 201));
    }

    #[test]
    fn test_filter_equality_match() {
        let mut o = exact_override("o1", "");
        o.rule.match_type = None;
        o.rule.filter_by = "brand:=Acme".to_string();
        assert!(o.matches("anything", "brand:=Acme", 0));
        assert!(!o.matches("anything", "brand:=Other", 0));
    }

    #[test]
    fn test_stop_processing_halts_later_overrides() {
        // Scenario S3: an exact-match override pins A and stops; a later
        // contains-match override would drop A but must never run.
        let mut first = exact_override("o1", "red");
        first.includes.push(OverrideInclude {
            id: "A".to_string(),
            position: 1,
        });
        first.stop_processing = true;

        let mut second = exact_override("o2", "red");
        second.rule.match_type = Some(OverrideMatch::Contains);
        second.excludes.push(OverrideExclude {
            id: "A".to_string(),
        });

        let overrides = vec![first, second];
        let matched = find_matching_overrides(&overrides, "red", "", &[], 0);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "o1");

        let outcome = apply_overrides(&matched, "red");
        assert_eq!(outcome.included, vec![("A".to_string(), 1)]);
        assert!(outcome.excluded.is_empty());
    }

    #[test]
    fn test_tag_precedence_exact_set_wins() {
        let mut spring = exact_override("spring", "sale");
        spring.rule.tags = vec!["spring".to_string()];
        spring.stop_processing = false;
        let mut summer = exact_override("summer", "sale");
        summer.rule.tags = vec!["summer".to_string()];
        summer.stop_processing = false;
        let mut wildcard = exact_override("wild", "sale");
        wildcard.rule.tags = vec!["*".to_string()];
        wildcard.stop_processing = false;
        let untagged = exact_override("plain", "sale");

        let overrides = vec![spring, summer, wildcard, untagged];

        // Exact tag set: spring matches, then wildcard; untagged skipped.
        let matched =
            find_matching_overrides(&overrides, "sale", "", &["spring".to_string()], 0);
        let ids: Vec<&str> = matched.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["spring", "wild"]);

        // Without tags: untagged and wildcard apply.
        let matched = find_matching_overrides(&overrides, "sale", "", &[], 0);
        let ids: Vec<&str> = matched.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["wild", "plain"]);
    }

    #[test]
    fn test_partial_tag_intersection_fallback() {
        let mut o = exact_override("o1", "sale");
        o.rule.tags = vec!["spring".to_string(), "summer".to_string()];
        let overrides = vec![o];
        // No exact set match, but one overlapping tag qualifies.
        let matched =
            find_matching_overrides(&overrides, "sale", "", &["summer".to_string()], 0);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn test_drops_precede_adds() {
        let mut first = exact_override("o1", "red");
        first.stop_processing = false;
        first.includes.push(OverrideInclude {
            id: "B".to_string(),
            position: 2,
        });
        let mut second = exact_override("o2", "red");
        second.excludes.push(OverrideExclude {
            id: "C".to_string(),
        });

        let overrides = vec![first, second];
        let matched = find_matching_overrides(&overrides, "red", "", &[], 0);
        let outcome = apply_overrides(&matched, "red");
        assert_eq!(outcome.excluded, vec!["C"]);
        assert_eq!(outcome.included, vec![("B".to_string(), 2)]);
    }

    #[test]
    fn test_remove_matched_tokens_suppressed_for_dynamic_filter() {
        let mut o = exact_override("o1", "acme shoes");
        o.rule.match_type = Some(OverrideMatch::Contains);
        o.remove_matched_tokens = true;
        o.filter_by = "brand:={q}".to_string();
        let overrides = vec![o];
        let matched = find_matching_overrides(&overrides, "acme shoes", "", &[], 0);
        let outcome = apply_overrides(&matched, "acme shoes");
        assert!(outcome.remove_matched_tokens.is_empty());
        assert_eq!(outcome.filter_by, vec!["brand:=acme shoes"]);
    }

    #[test]
    fn test_validation() {
        let mut o = exact_override("", "red");
        assert!(o.validate().is_err());
        o.id = "o1".to_string();
        o.validate().unwrap();

        let mut no_match_type = exact_override("o2", "red");
        no_match_type.rule.match_type = None;
        assert!(no_match_type.validate().is_err());

        let empty_rule = Override {
            rule: OverrideRule::default(),
            ..exact_override("o3", "")
        };
        assert!(empty_rule.validate().is_err());
    }
}
