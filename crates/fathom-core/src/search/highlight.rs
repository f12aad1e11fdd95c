//! Highlighting of matched spans over stored documents.
//!
//! For each highlighted field the matcher walks token offsets produced by
//! the field's tokenizer, wraps matched spans in the configured tags, and
//! builds a snippet window around the first match. Nested fields are
//! traversed into a parallel highlight document whose leaves become
//! `{snippet, matched_tokens, value?}` objects. The v2 nested `highlight`
//! object is always produced; the flat v1 `highlights[]` array covers
//! non-nested fields when requested.

use super::plan::HighlightPlan;
use crate::schema::Field;
use crate::tokenizer::Tokenizer;
use serde_json::{json, Map, Value};

/// Maximum text length for infix substring highlighting.
const INFIX_MAX_TEXT_LEN: usize = 100;

/// A single highlighted leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct HighlightedLeaf {
    pub snippet: String,
    pub matched_tokens: Vec<String>,
    /// Fully highlighted value; only for `highlight_full_fields`.
    pub value: Option<String>,
}

/// Produces the v2 nested highlight object and the optional v1 flat array
/// for one document.
pub fn highlight_document(
    doc: &Map<String, Value>,
    fields: &[Field],
    plan: &HighlightPlan,
    query_tokens: &[String],
    collection_symbols: &[char],
    collection_separators: &[char],
) -> (Value, Vec<Value>) {
    let mut v2 = Map::new();
    let mut v1 = Vec::new();

    if query_tokens.is_empty() {
        return (Value::Object(v2), v1);
    }

    let mut targets: Vec<&String> = plan.fields.iter().collect();
    for extra in &plan.full_fields {
        if !targets.contains(&extra) {
            targets.push(extra);
        }
    }

    for field_name in targets {
        let Some(field) = Field::resolve(fields, field_name) else {
            continue;
        };
        if !field.field_type.is_string() && !field.field_type.is_object() {
            continue;
        }
        let Some(value) = lookup_path(doc, field_name) else {
            continue;
        };
        let tokenizer = field_tokenizer(field, collection_symbols, collection_separators);
        let full = plan.full_fields.iter().any(|f| f == field_name);
        let infix = field.infix;

        let highlighted = highlight_value(value, plan, query_tokens, &tokenizer, full, infix);
        let Some(highlighted) = highlighted else {
            continue;
        };

        insert_path(&mut v2, field_name, highlighted.clone());

        if plan.v1 && !field_name.contains('.') && !field.field_type.is_object() {
            let mut entry = Map::new();
            entry.insert("field".to_string(), json!(field_name));
            match &highlighted {
                Value::Object(o) => {
                    if let Some(snippet) = o.get("snippet") {
                        entry.insert("snippet".to_string(), snippet.clone());
                    }
                    if let Some(snippets) = o.get("snippets") {
                        entry.insert("snippets".to_string(), snippets.clone());
                    }
                    if let Some(matched) = o.get("matched_tokens") {
                        entry.insert("matched_tokens".to_string(), matched.clone());
                    }
                    if let Some(value) = o.get("value") {
                        entry.insert("value".to_string(), value.clone());
                    }
                }
                other => {
                    entry.insert("snippet".to_string(), other.clone());
                }
            }
            v1.push(Value::Object(entry));
        }
    }

    (Value::Object(v2), v1)
}

fn field_tokenizer(
    field: &Field,
    collection_symbols: &[char],
    collection_separators: &[char],
) -> Tokenizer {
    let symbols = if field.symbols_to_index.is_empty() {
        collection_symbols
    } else {
        &field.symbols_to_index
    };
    let separators = if field.token_separators.is_empty() {
        collection_separators
    } else {
        &field.token_separators
    };
    Tokenizer::new(symbols, separators, field.locale.as_deref())
}

/// Recursively highlights a JSON value. Strings produce leaf objects,
/// arrays and objects recurse; `None` means nothing matched underneath.
fn highlight_value(
    value: &Value,
    plan: &HighlightPlan,
    query_tokens: &[String],
    tokenizer: &Tokenizer,
    full: bool,
    infix: bool,
) -> Option<Value> {
    match value {
        Value::String(text) => {
            let leaf = highlight_text(text, plan, query_tokens, tokenizer, full, infix)?;
            let mut obj = Map::new();
            obj.insert("snippet".to_string(), json!(leaf.snippet));
            obj.insert("matched_tokens".to_string(), json!(leaf.matched_tokens));
            if let Some(value) = leaf.value {
                obj.insert("value".to_string(), json!(value));
            }
            Some(Value::Object(obj))
        }
        Value::Array(items) if items.iter().all(|v| v.is_string()) => {
            let mut snippets = Vec::new();
            let mut matched = Vec::new();
            let mut values = Vec::new();
            let mut any = false;
            for item in items {
                let text = item.as_str().unwrap_or_default();
                match highlight_text(text, plan, query_tokens, tokenizer, full, infix) {
                    Some(leaf) => {
                        any = true;
                        snippets.push(json!(leaf.snippet));
                        matched.push(json!(leaf.matched_tokens));
                        if let Some(value) = leaf.value {
                            values.push(json!(value));
                        }
                    }
                    None => {
                        snippets.push(json!(text));
                        matched.push(json!(Vec::<String>::new()));
                        if full {
                            values.push(json!(text));
                        }
                    }
                }
            }
            if !any {
                return None;
            }
            let mut obj = Map::new();
            obj.insert("snippets".to_string(), Value::Array(snippets));
            obj.insert("matched_tokens".to_string(), Value::Array(matched));
            if full {
                obj.insert("values".to_string(), Value::Array(values));
            }
            Some(Value::Object(obj))
        }
        Value::Array(items) => {
            let mut out = Vec::new();
            let mut any = false;
            for item in items {
                match highlight_value(item, plan, query_tokens, tokenizer, full, infix) {
                    Some(v) => {
                        any = true;
                        out.push(v);
                    }
                    None => out.push(Value::Object(Map::new())),
                }
            }
            if any {
                Some(Value::Array(out))
            } else {
                None
            }
        }
        Value::Object(inner) => {
            let mut out = Map::new();
            for (key, v) in inner {
                if let Some(h) = highlight_value(v, plan, query_tokens, tokenizer, full, infix) {
                    out.insert(key.clone(), h);
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        _ => None,
    }
}

struct MatchSpan {
    /// Character range to wrap.
    start: usize,
    end: usize,
    token: String,
}

/// Highlights one text value. Returns `None` when no query token matches.
fn highlight_text(
    text: &str,
    plan: &HighlightPlan,
    query_tokens: &[String],
    tokenizer: &Tokenizer,
    full: bool,
    infix: bool,
) -> Option<HighlightedLeaf> {
    let tokens = tokenizer.tokenize(text);
    let mut spans: Vec<MatchSpan> = Vec::new();
    let mut matched_tokens: Vec<String> = Vec::new();
    let mut first_match_idx: Option<usize> = None;

    for (idx, token) in tokens.iter().enumerate() {
        for query in query_tokens {
            if &token.text == query {
                spans.push(MatchSpan {
                    start: token.start,
                    end: token.end,
                    token: token.text.clone(),
                });
                matched_tokens.push(token.text.clone());
                first_match_idx.get_or_insert(idx);
                break;
            }
            // Prefix-only match highlights only the prefix, measured in
            // code points rather than bytes.
            if token.text.starts_with(query.as_str()) && query.chars().count() < token.text.chars().count()
            {
                let prefix_chars = query.chars().count();
                spans.push(MatchSpan {
                    start: token.start,
                    end: token.start + prefix_chars,
                    token: query.clone(),
                });
                matched_tokens.push(query.clone());
                first_match_idx.get_or_insert(idx);
                break;
            }
        }
    }

    // Infix fields additionally highlight a substring occurrence of the
    // first query token in short texts.
    if spans.is_empty() && infix && text.chars().count() < INFIX_MAX_TEXT_LEN {
        if let Some(first_query) = query_tokens.first() {
            let lower: String = text.to_lowercase();
            if let Some(byte_pos) = lower.find(first_query.as_str()) {
                let start = lower[..byte_pos].chars().count();
                let end = start + first_query.chars().count();
                spans.push(MatchSpan {
                    start,
                    end,
                    token: first_query.clone(),
                });
                matched_tokens.push(first_query.clone());
                first_match_idx = Some(0);
            }
        }
    }

    let first_match_idx = first_match_idx?;

    let full_value = wrap_spans(text, &spans, &plan.start_tag, &plan.end_tag, None);

    // Snippet window: affix tokens either side of the first match, extended
    // up to the snippet threshold.
    let snippet = if tokens.len() <= plan.snippet_threshold {
        full_value.clone()
    } else {
        let window_start_token = first_match_idx.saturating_sub(plan.affix_tokens);
        let window_end_token = (first_match_idx + plan.affix_tokens)
            .max(window_start_token + plan.snippet_threshold.saturating_sub(1))
            .min(tokens.len() - 1);
        let char_start = tokens[window_start_token].start;
        let char_end = tokens[window_end_token].end;
        wrap_spans(
            text,
            &spans,
            &plan.start_tag,
            &plan.end_tag,
            Some((char_start, char_end)),
        )
    };

    matched_tokens.dedup();
    Some(HighlightedLeaf {
        snippet,
        matched_tokens,
        value: if full { Some(full_value) } else { None },
    })
}

/// Rebuilds `text` with every span wrapped in tags, optionally clipped to a
/// character window. Spans never include trailing punctuation because token
/// ranges end at the last token character.
fn wrap_spans(
    text: &str,
    spans: &[MatchSpan],
    start_tag: &str,
    end_tag: &str,
    window: Option<(usize, usize)>,
) -> String {
    let chars: Vec<char> = text.chars().collect();
    let (from, to) = window.unwrap_or((0, chars.len()));
    let mut out = String::new();
    let mut i = from;
    while i < to {
        if let Some(span) = spans.iter().find(|s| s.start == i) {
            out.push_str(start_tag);
            let span_end = span.end.min(to);
            for c in &chars[i..span_end] {
                out.push(*c);
            }
            out.push_str(end_tag);
            // Unhighlighted remainder of a prefix-matched token.
            let _ = &span.token;
            i = span_end;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

fn lookup_path<'a>(doc: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(direct) = doc.get(path) {
        return Some(direct);
    }
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn insert_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = map;
    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            current.insert(part.to_string(), value);
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            // A sibling leaf landed on the same path; the deeper entry wins.
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("just ensured an object");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use serde_json::json;

    fn plan() -> HighlightPlan {
        HighlightPlan {
            fields: vec!["title".to_string()],
            full_fields: Vec::new(),
            start_tag: "<mark>".to_string(),
            end_tag: "</mark>".to_string(),
            snippet_threshold: 30,
            affix_tokens: 4,
            v1: false,
        }
    }

    fn fields() -> Vec<Field> {
        vec![
            Field::new("title", FieldType::String),
            Field::new("tags", FieldType::StringArray),
            Field::new("author", FieldType::Object),
        ]
    }

    fn doc(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_exact_token_highlight() {
        let d = doc(json!({"title": "Red running shoes"}));
        let (v2, _) = highlight_document(
            &d,
            &fields(),
            &plan(),
            &["red".to_string()],
            &[],
            &[],
        );
        assert_eq!(
            v2["title"]["snippet"],
            json!("<mark>Red</mark> running shoes")
        );
        assert_eq!(v2["title"]["matched_tokens"], json!(["red"]));
    }

    #[test]
    fn test_trailing_punctuation_outside_mark() {
        let d = doc(json!({"title": "Red, then blue"}));
        let (v2, _) = highlight_document(
            &d,
            &fields(),
            &plan(),
            &["red".to_string()],
            &[],
            &[],
        );
        assert_eq!(v2["title"]["snippet"], json!("<mark>Red</mark>, then blue"));
    }

    #[test]
    fn test_prefix_match_highlights_prefix_only() {
        let d = doc(json!({"title": "Redwood forest"}));
        let (v2, _) = highlight_document(
            &d,
            &fields(),
            &plan(),
            &["red".to_string()],
            &[],
            &[],
        );
        assert_eq!(v2["title"]["snippet"], json!("<mark>Red</mark>wood forest"));
    }

    #[test]
    fn test_snippet_window_clips_long_text() {
        let words: Vec<String> = (0..60).map(|i| format!("word{}", i)).collect();
        let mut text = words.join(" ");
        text.push_str(" target end");
        let d = doc(json!({ "title": text }));
        let mut p = plan();
        p.snippet_threshold = 8;
        p.affix_tokens = 2;
        let (v2, _) = highlight_document(&d, &fields(), &p, &["target".to_string()], &[], &[]);
        let snippet = v2["title"]["snippet"].as_str().unwrap();
        assert!(snippet.contains("<mark>target</mark>"));
        // Clipped: far-away leading words are not in the snippet.
        assert!(!snippet.contains("word0"));
    }

    #[test]
    fn test_string_array_highlighting() {
        let mut p = plan();
        p.fields = vec!["tags".to_string()];
        let d = doc(json!({"tags": ["red label", "blue label"]}));
        let (v2, _) = highlight_document(&d, &fields(), &p, &["red".to_string()], &[], &[]);
        assert_eq!(
            v2["tags"]["snippets"],
            json!(["<mark>red</mark> label", "blue label"])
        );
    }

    #[test]
    fn test_nested_field_highlight_doc() {
        let mut p = plan();
        p.fields = vec!["author".to_string()];
        let d = doc(json!({"author": {"name": "Red Smith", "age": 50}}));
        let (v2, _) = highlight_document(&d, &fields(), &p, &["red".to_string()], &[], &[]);
        assert_eq!(
            v2["author"]["name"]["snippet"],
            json!("<mark>Red</mark> Smith")
        );
        // Non-string leaves don't appear in the highlight doc.
        assert!(v2["author"].get("age").is_none());
    }

    #[test]
    fn test_full_fields_carry_value() {
        let mut p = plan();
        p.full_fields = vec!["title".to_string()];
        let d = doc(json!({"title": "Red shoes"}));
        let (v2, _) = highlight_document(&d, &fields(), &p, &["red".to_string()], &[], &[]);
        assert_eq!(v2["title"]["value"], json!("<mark>Red</mark> shoes"));
    }

    #[test]
    fn test_v1_flat_array_for_plain_fields() {
        let mut p = plan();
        p.v1 = true;
        let d = doc(json!({"title": "Red shoes"}));
        let (_, v1) = highlight_document(&d, &fields(), &p, &["red".to_string()], &[], &[]);
        assert_eq!(v1.len(), 1);
        assert_eq!(v1[0]["field"], json!("title"));
        assert_eq!(v1[0]["snippet"], json!("<mark>Red</mark> shoes"));
    }

    #[test]
    fn test_no_match_no_entry() {
        let d = doc(json!({"title": "Blue shoes"}));
        let (v2, v1) = highlight_document(
            &d,
            &fields(),
            &plan(),
            &["red".to_string()],
            &[],
            &[],
        );
        assert!(v2.as_object().unwrap().is_empty());
        assert!(v1.is_empty());
    }

    #[test]
    fn test_infix_substring_highlight_in_short_text() {
        let mut infix_fields = fields();
        infix_fields[0].infix = true;
        let d = doc(json!({"title": "ultrared spectrum"}));
        let (v2, _) = highlight_document(
            &d,
            &infix_fields,
            &plan(),
            &["red".to_string()],
            &[],
            &[],
        );
        assert_eq!(
            v2["title"]["snippet"],
            json!("ultra<mark>red</mark> spectrum")
        );
    }
}
