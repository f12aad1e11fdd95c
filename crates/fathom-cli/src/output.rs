//! Output formatting for search results.

use anyhow::Result;
use fathom_core::search::SearchResponse;

/// Full response as pretty-printed JSON.
pub fn format_json(response: &SearchResponse) -> Result<String> {
    Ok(serde_json::to_string_pretty(response)?)
}

/// Compact human-readable listing.
pub fn format_human(query: &str, response: &SearchResponse) -> String {
    let mut out = format!(
        "{} result(s) for \"{}\" (out of {})\n",
        response.found, query, response.out_of
    );

    let empty = Vec::new();
    let hits = response.hits.as_ref().unwrap_or(&empty);
    for (i, hit) in hits.iter().enumerate() {
        let id = hit
            .document
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("?");
        out.push_str(&format!("{:>3}. [{}]", i + 1, id));
        if let Some(snippet) = first_snippet(&hit.highlight) {
            out.push_str(&format!("  {}", snippet));
        }
        out.push('\n');
    }

    if response.search_cutoff {
        out.push_str("(search was cut off by the time budget)\n");
    }
    out
}

/// First snippet anywhere in the nested highlight object.
fn first_snippet(highlight: &serde_json::Value) -> Option<String> {
    match highlight {
        serde_json::Value::Object(map) => {
            if let Some(snippet) = map.get("snippet").and_then(|s| s.as_str()) {
                return Some(snippet.to_string());
            }
            map.values().find_map(first_snippet)
        }
        serde_json::Value::Array(items) => items.iter().find_map(first_snippet),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_snippet_walks_nested_highlight() {
        let highlight = json!({
            "author": {"name": {"snippet": "<mark>Red</mark> Smith", "matched_tokens": ["red"]}}
        });
        assert_eq!(
            first_snippet(&highlight).unwrap(),
            "<mark>Red</mark> Smith"
        );
        assert!(first_snippet(&json!({})).is_none());
    }
}
