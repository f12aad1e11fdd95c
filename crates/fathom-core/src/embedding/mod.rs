//! Embedding model dispatch.
//!
//! Models are consumed as request/response endpoints; nothing in here knows
//! how inference works. A [`ModelConfig`] names the model with a provider
//! prefix (`openai/...`, `google/...`, `gcp/...`, `azure/...`,
//! `personalization/...`); anything unprefixed resolves to the built-in
//! deterministic local backend used for development and tests.
//!
//! Remote calls run under the *search budget*: the deadline derived from
//! `search_begin` plus the remote embedding timeout. A call that would
//! overshoot the remaining budget fails with `Timeout` instead of being
//! issued.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tracing::warn;

static HTTP: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

/// Model configuration carried by an embedding field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider-prefixed model name, e.g. `openai/text-embedding-3-small`.
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Endpoint override; required for `azure/` and `personalization/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Prepended to texts embedded at query time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_prefix: Option<String>,
    /// Prepended to texts embedded at indexing time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexing_prefix: Option<String>,
}

/// Which backend a model name dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Local,
    OpenAiCompat,
    Google,
    Gcp,
    Azure,
    Personalization,
}

impl ModelConfig {
    pub fn provider(&self) -> Provider {
        match self.model_name.split('/').next() {
            Some("openai") => Provider::OpenAiCompat,
            Some("google") => Provider::Google,
            Some("gcp") => Provider::Gcp,
            Some("azure") => Provider::Azure,
            Some("personalization") => Provider::Personalization,
            _ => Provider::Local,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.provider() != Provider::Local
    }

    fn bare_model(&self) -> &str {
        self.model_name
            .split_once('/')
            .map(|(_, m)| m)
            .unwrap_or(&self.model_name)
    }
}

/// Timeout/retry budget for remote embedding calls.
#[derive(Debug, Clone, Copy)]
pub struct RemoteEmbeddingParams {
    pub timeout_ms: u64,
    pub num_tries: u32,
}

impl Default for RemoteEmbeddingParams {
    fn default() -> Self {
        Self {
            timeout_ms: crate::config::DEFAULT_REMOTE_EMBEDDING_TIMEOUT_MS,
            num_tries: crate::config::DEFAULT_REMOTE_EMBEDDING_NUM_TRIES,
        }
    }
}

/// Stateless dispatcher over all providers.
#[derive(Debug, Clone, Default)]
pub struct Embedder;

impl Embedder {
    pub fn new() -> Self {
        Self
    }

    /// Embeds a query string with the model's query prefix applied.
    pub async fn embed_query(
        &self,
        config: &ModelConfig,
        text: &str,
        num_dim: usize,
        params: &RemoteEmbeddingParams,
        deadline: Option<Instant>,
    ) -> Result<Vec<f32>> {
        let prefixed = match &config.query_prefix {
            Some(prefix) => format!("{}{}", prefix, text),
            None => text.to_string(),
        };
        self.embed(config, &prefixed, num_dim, params, deadline).await
    }

    /// Embeds a document string with the model's indexing prefix applied.
    pub async fn embed_for_indexing(
        &self,
        config: &ModelConfig,
        text: &str,
        num_dim: usize,
        params: &RemoteEmbeddingParams,
    ) -> Result<Vec<f32>> {
        let prefixed = match &config.indexing_prefix {
            Some(prefix) => format!("{}{}", prefix, text),
            None => text.to_string(),
        };
        self.embed(config, &prefixed, num_dim, params, None).await
    }

    async fn embed(
        &self,
        config: &ModelConfig,
        text: &str,
        num_dim: usize,
        params: &RemoteEmbeddingParams,
        deadline: Option<Instant>,
    ) -> Result<Vec<f32>> {
        match config.provider() {
            Provider::Local => Ok(local_embedding(text, num_dim)),
            _ => {
                if params.num_tries < 1 {
                    return Err(Error::invalid(
                        "remote_embedding_num_tries must be at least 1.",
                    ));
                }
                self.embed_remote(config, text, params, deadline).await
            }
        }
    }

    async fn embed_remote(
        &self,
        config: &ModelConfig,
        text: &str,
        params: &RemoteEmbeddingParams,
        deadline: Option<Instant>,
    ) -> Result<Vec<f32>> {
        let mut last_err = Error::Timeout("Remote embedding timed out.".to_string());
        for attempt in 0..params.num_tries {
            let timeout = remaining_budget(params.timeout_ms, deadline)?;
            match self.call_provider(config, text, timeout).await {
                Ok(embedding) => return Ok(embedding),
                Err(e) => {
                    warn!(
                        model = %config.model_name,
                        attempt = attempt + 1,
                        error = %e,
                        "Remote embedding attempt failed"
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn call_provider(
        &self,
        config: &ModelConfig,
        text: &str,
        timeout: Duration,
    ) -> Result<Vec<f32>> {
        let (url, body, auth_header) = build_request(config, text)?;

        let mut req = HTTP.post(&url).timeout(timeout).json(&body);
        if let Some((name, value)) = auth_header {
            req = req.header(name, value);
        }
        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("Embedding model `{}` timed out.", config.model_name))
            } else {
                Error::internal(format!("Embedding request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            return Err(Error::internal(format!(
                "Embedding model `{}` returned HTTP {}.",
                config.model_name,
                response.status()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::internal(format!("Embedding response parse failed: {}", e)))?;
        extract_embedding(config.provider(), &payload)
    }
}

fn remaining_budget(timeout_ms: u64, deadline: Option<Instant>) -> Result<Duration> {
    let timeout = Duration::from_millis(timeout_ms);
    match deadline {
        None => Ok(timeout),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(
                    "Search deadline exhausted before the embedding call.".to_string(),
                ));
            }
            Ok(timeout.min(deadline - now))
        }
    }
}

fn build_request(
    config: &ModelConfig,
    text: &str,
) -> Result<(String, Value, Option<(&'static str, String)>)> {
    let api_key = config.api_key.clone().unwrap_or_default();
    match config.provider() {
        Provider::OpenAiCompat => {
            let url = config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1/embeddings".to_string());
            let body = json!({"input": text, "model": config.bare_model()});
            Ok((url, body, Some(("Authorization", format!("Bearer {}", api_key)))))
        }
        Provider::Google => {
            let url = format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{}:embedContent?key={}",
                config.bare_model(),
                api_key
            );
            let body = json!({"content": {"parts": [{"text": text}]}});
            Ok((url, body, None))
        }
        Provider::Gcp => {
            let url = config.url.clone().ok_or_else(|| {
                Error::invalid("GCP embedding models require a `url` in the model config.")
            })?;
            let body = json!({"instances": [{"content": text}]});
            Ok((url, body, Some(("Authorization", format!("Bearer {}", api_key)))))
        }
        Provider::Azure => {
            let url = config.url.clone().ok_or_else(|| {
                Error::invalid("Azure embedding models require a `url` in the model config.")
            })?;
            let body = json!({"input": text});
            Ok((url, body, Some(("api-key", api_key))))
        }
        Provider::Personalization => {
            let url = config.url.clone().ok_or_else(|| {
                Error::invalid("Personalization models require a `url` in the model config.")
            })?;
            let body = json!({"query": text, "model": config.bare_model()});
            Ok((url, body, Some(("Authorization", format!("Bearer {}", api_key)))))
        }
        Provider::Local => Err(Error::internal("Local models are not dispatched remotely.")),
    }
}

fn extract_embedding(provider: Provider, payload: &Value) -> Result<Vec<f32>> {
    let values = match provider {
        Provider::OpenAiCompat | Provider::Azure => payload
            .pointer("/data/0/embedding")
            .and_then(|v| v.as_array()),
        Provider::Google => payload
            .pointer("/embedding/values")
            .and_then(|v| v.as_array()),
        Provider::Gcp => payload
            .pointer("/predictions/0/embeddings/values")
            .and_then(|v| v.as_array()),
        Provider::Personalization => payload.pointer("/embedding").and_then(|v| v.as_array()),
        Provider::Local => None,
    };
    let values =
        values.ok_or_else(|| Error::internal("Embedding response had an unexpected shape."))?;
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| Error::internal("Embedding response contained a non-number."))
        })
        .collect()
}

/// Deterministic bag-of-words embedding used by the local backend. Tokens
/// hash into dimensions; the result is L2-normalized so cosine distances
/// behave sensibly in tests.
pub fn local_embedding(text: &str, num_dim: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; num_dim.max(1)];
    for token in text.split_whitespace() {
        let mut hasher = DefaultHasher::new();
        token.to_lowercase().hash(&mut hasher);
        let h = hasher.finish();
        let dim = (h % vec.len() as u64) as usize;
        let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
        vec[dim] += sign;
    }
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

/// Unweighted average of dimensionally identical embeddings.
pub fn average_embeddings(embeddings: &[Vec<f32>]) -> Result<Vec<f32>> {
    combine_embeddings(embeddings, None)
}

/// `query_weights`-weighted sum of dimensionally identical embeddings.
pub fn weighted_sum(embeddings: &[Vec<f32>], weights: &[f32]) -> Result<Vec<f32>> {
    if embeddings.len() != weights.len() {
        return Err(Error::invalid(
            "query_weights must match the number of queries.",
        ));
    }
    combine_embeddings(embeddings, Some(weights))
}

fn combine_embeddings(embeddings: &[Vec<f32>], weights: Option<&[f32]>) -> Result<Vec<f32>> {
    let first = embeddings
        .first()
        .ok_or_else(|| Error::invalid("At least one query embedding is required."))?;
    let dim = first.len();
    if embeddings.iter().any(|e| e.len() != dim) {
        return Err(Error::invalid(
            "All query embeddings must have the same dimension.",
        ));
    }
    let mut out = vec![0.0f32; dim];
    for (i, emb) in embeddings.iter().enumerate() {
        let w = match weights {
            Some(ws) => ws[i],
            None => 1.0 / embeddings.len() as f32,
        };
        for (o, v) in out.iter_mut().zip(emb) {
            *o += w * v;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ModelConfig {
        ModelConfig {
            model_name: "dev-hash".to_string(),
            api_key: None,
            url: None,
            query_prefix: None,
            indexing_prefix: None,
        }
    }

    #[test]
    fn test_provider_dispatch_by_prefix() {
        let mut cfg = local_config();
        assert_eq!(cfg.provider(), Provider::Local);
        cfg.model_name = "openai/text-embedding-3-small".into();
        assert_eq!(cfg.provider(), Provider::OpenAiCompat);
        cfg.model_name = "azure/deployment".into();
        assert_eq!(cfg.provider(), Provider::Azure);
        assert!(cfg.is_remote());
    }

    #[test]
    fn test_local_embedding_is_deterministic_and_normalized() {
        let a = local_embedding("red shoes", 16);
        let b = local_embedding("red shoes", 16);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_ne!(a, local_embedding("blue shoes", 16));
    }

    #[tokio::test]
    async fn test_embed_query_applies_prefix() {
        let mut cfg = local_config();
        cfg.query_prefix = Some("query: ".to_string());
        let embedder = Embedder::new();
        let with_prefix = embedder
            .embed_query(&cfg, "shoes", 16, &RemoteEmbeddingParams::default(), None)
            .await
            .unwrap();
        assert_eq!(with_prefix, local_embedding("query: shoes", 16));
    }

    #[tokio::test]
    async fn test_expired_deadline_times_out_before_calling() {
        let mut cfg = local_config();
        cfg.model_name = "openai/text-embedding-3-small".into();
        let embedder = Embedder::new();
        let expired = Instant::now() - Duration::from_secs(1);
        let err = embedder
            .embed_query(
                &cfg,
                "q",
                16,
                &RemoteEmbeddingParams::default(),
                Some(expired),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_zero_tries_rejected_for_remote() {
        let mut cfg = local_config();
        cfg.model_name = "openai/m".into();
        let params = RemoteEmbeddingParams {
            timeout_ms: 10,
            num_tries: 0,
        };
        let err = Embedder::new()
            .embed_query(&cfg, "q", 16, &params, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_average_and_weighted_sum() {
        let embs = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        assert_eq!(average_embeddings(&embs).unwrap(), vec![0.5, 0.5]);
        assert_eq!(
            weighted_sum(&embs, &[2.0, 1.0]).unwrap(),
            vec![2.0, 1.0]
        );
        assert!(weighted_sum(&embs, &[1.0]).is_err());
        let ragged = vec![vec![1.0], vec![0.0, 1.0]];
        assert!(average_embeddings(&ragged).is_err());
    }
}
