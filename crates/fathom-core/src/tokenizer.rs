//! Locale-aware tokenization with character offsets.
//!
//! The tokenizer drives indexing, query normalization, and highlighting.
//! Splitting is controlled per collection (and overridable per field) by two
//! character sets:
//!
//! - `symbols_to_index`: non-alphanumeric characters that are kept *inside*
//!   tokens instead of acting as boundaries (e.g. `-` for `t-shirt`).
//! - `token_separators`: characters that always split, even if they are
//!   alphanumeric-adjacent defaults would keep them together.
//!
//! Tokens carry their character range in the original text so the
//! highlighter can wrap exact spans without re-deriving offsets. Locale
//! backends for languages that need segmentation (CJK, Thai) are external;
//! the locale tag is carried through untouched.

/// A single token with its character range in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Normalized (lowercased) token text.
    pub text: String,
    /// Inclusive character offset of the first char.
    pub start: usize,
    /// Exclusive character offset past the last char.
    pub end: usize,
}

/// Tokenizer configured from a collection or field definition.
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {
    symbols_to_index: Vec<char>,
    token_separators: Vec<char>,
    locale: Option<String>,
}

impl Tokenizer {
    pub fn new(
        symbols_to_index: &[char],
        token_separators: &[char],
        locale: Option<&str>,
    ) -> Self {
        Self {
            symbols_to_index: symbols_to_index.to_vec(),
            token_separators: token_separators.to_vec(),
            locale: locale.map(|l| l.to_string()),
        }
    }

    /// Locale tag this tokenizer was configured with, if any.
    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    fn is_token_char(&self, c: char) -> bool {
        if self.token_separators.contains(&c) {
            return false;
        }
        c.is_alphanumeric() || self.symbols_to_index.contains(&c)
    }

    /// Splits `text` into lowercased tokens with character offsets.
    pub fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut start = 0usize;

        for (pos, c) in text.chars().enumerate() {
            if self.is_token_char(c) {
                if current.is_empty() {
                    start = pos;
                }
                current.extend(c.to_lowercase());
            } else if !current.is_empty() {
                tokens.push(Token {
                    text: std::mem::take(&mut current),
                    start,
                    end: pos,
                });
            }
        }
        if !current.is_empty() {
            let end = text.chars().count();
            tokens.push(Token {
                text: current,
                start,
                end,
            });
        }
        tokens
    }

    /// Lowercases, tokenizes and rejoins with single spaces. This is the
    /// "normalized query" form that curation rules match against.
    pub fn normalize(&self, text: &str) -> String {
        self.tokenize(text)
            .into_iter()
            .map(|t| t.text)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
