//! Text-to-vector providers.
//!
//! Everything that turns semantic text into a vector goes through
//! [`EmbeddingProvider`]. The configured `embedding.provider` picks one of:
//!
//! | name | type | notes |
//! |------|------|-------|
//! | `disabled` | [`DisabledProvider`] | search answers 503, rows stay unembedded |
//! | `openai` | [`OpenAIProvider`] | `POST {url}/embeddings`, key from `OPENAI_API_KEY` |
//! | `ollama` | [`OllamaProvider`] | `POST {url}/api/embed` |
//! | `local` | `LocalProvider` | fastembed in-process, feature `local-embeddings-fastembed` |
//! | `hash` | [`HashProvider`] | token feature hashing, no network |
//!
//! The vector width is fixed per deployment. Shadow tables declare
//! `vector(dims)`, so switching models means rebuilding the shadow databases.
//!
//! HTTP providers share [`send_with_retry`]: 429, 5xx and transport errors are
//! retried with a doubling delay starting at one second and capped at 32s;
//! other statuses fail on the spot.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// A source of fixed-width vectors.
///
/// Held behind an `Arc` by the sync path and the query path at once; clients
/// and loaded models live inside the provider.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// Width of every vector returned by [`embed`](Self::embed).
    fn dims(&self) -> usize;

    fn is_enabled(&self) -> bool {
        true
    }

    /// One vector per input text, same order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Load whatever the first call would otherwise load.
    async fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}

pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    provider
        .embed(&[text.to_string()])
        .await?
        .pop()
        .ok_or_else(|| anyhow!("provider returned no vector for the query"))
}

/// Stand-in when no provider is configured. Every call fails.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

/// `model` and `dims` are mandatory for the HTTP providers.
fn model_and_dims(config: &EmbeddingConfig, label: &str) -> Result<(String, usize)> {
    let Some(model) = config.model.clone() else {
        bail!("embedding.model is required by the {} provider", label);
    };
    let Some(dims) = config.dims else {
        bail!("embedding.dims is required by the {} provider", label);
    };
    Ok((model, dims))
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// OpenAI-compatible `/embeddings` endpoint. `embedding.url` may point at any
/// server speaking the same protocol.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_key: String,
    endpoint: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = model_and_dims(config, "openai")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config.url.as_deref().unwrap_or("https://api.openai.com/v1");

        Ok(Self {
            model,
            dims,
            api_key,
            endpoint: format!("{}/embeddings", base.trim_end_matches('/')),
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
                "dimensions": self.dims,
            }));

        let reply = send_with_retry(request, self.max_retries, "OpenAI").await?;
        parse_openai_response(&reply)
    }
}

/// `data[]` items may arrive out of order; `index` says where each belongs.
fn parse_openai_response(reply: &Value) -> Result<Vec<Vec<f32>>> {
    let Some(items) = reply.get("data").and_then(Value::as_array) else {
        bail!("OpenAI reply has no data array");
    };

    let mut slotted = items
        .iter()
        .enumerate()
        .map(|(position, item)| {
            let values = item
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow!("OpenAI reply item {} has no embedding", position))?;
            let slot = item
                .get("index")
                .and_then(Value::as_u64)
                .map_or(position, |i| i as usize);
            Ok((slot, json_floats(values)))
        })
        .collect::<Result<Vec<_>>>()?;

    slotted.sort_by_key(|(slot, _)| *slot);
    Ok(slotted.into_iter().map(|(_, vector)| vector).collect())
}

/// An Ollama server (default `http://localhost:11434`) with the model pulled.
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = model_and_dims(config, "ollama")?;
        let url = config
            .url
            .as_deref()
            .unwrap_or("http://localhost:11434")
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            model,
            dims,
            url,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&serde_json::json!({ "model": self.model, "input": texts }));

        let reply = send_with_retry(request, self.max_retries, "Ollama")
            .await
            .map_err(|e| anyhow!("{} (is Ollama reachable at {}?)", e, self.url))?;
        parse_ollama_response(&reply)
    }
}

fn parse_ollama_response(reply: &Value) -> Result<Vec<Vec<f32>>> {
    let Some(vectors) = reply.get("embeddings").and_then(Value::as_array) else {
        bail!("Ollama reply has no embeddings array");
    };

    vectors
        .iter()
        .map(|v| {
            v.as_array()
                .map(|values| json_floats(values))
                .ok_or_else(|| anyhow!("Ollama reply holds a non-array embedding"))
        })
        .collect()
}

fn json_floats(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or_default() as f32)
        .collect()
}

/// Send `request`, retrying transient failures up to `max_retries` times.
async fn send_with_retry(
    request: reqwest::RequestBuilder,
    max_retries: u32,
    label: &str,
) -> Result<Value> {
    let mut last_failure = anyhow!("{} request was never sent", label);

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
        }

        let Some(req) = request.try_clone() else {
            bail!("{} request body is not cloneable", label);
        };

        let response = match req.send().await {
            Ok(response) => response,
            Err(e) => {
                last_failure = anyhow!("{} transport error: {}", label, e);
                continue;
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let detail = response.text().await.unwrap_or_default();
        let failure = anyhow!("{} returned {}: {}", label, status, detail);
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            last_failure = failure;
            continue;
        }
        return Err(failure);
    }

    Err(last_failure)
}

/// Supported fastembed models and their native widths.
#[cfg(feature = "local-embeddings-fastembed")]
const LOCAL_MODELS: &[(&str, fastembed::EmbeddingModel, usize)] = &[
    ("all-minilm-l6-v2", fastembed::EmbeddingModel::AllMiniLML6V2, 384),
    ("bge-small-en-v1.5", fastembed::EmbeddingModel::BGESmallENV15, 384),
    ("bge-base-en-v1.5", fastembed::EmbeddingModel::BGEBaseENV15, 768),
    ("bge-large-en-v1.5", fastembed::EmbeddingModel::BGELargeENV15, 1024),
    ("nomic-embed-text-v1", fastembed::EmbeddingModel::NomicEmbedTextV1, 768),
    ("nomic-embed-text-v1.5", fastembed::EmbeddingModel::NomicEmbedTextV15, 768),
    ("multilingual-e5-small", fastembed::EmbeddingModel::MultilingualE5Small, 384),
    ("multilingual-e5-base", fastembed::EmbeddingModel::MultilingualE5Base, 768),
    ("multilingual-e5-large", fastembed::EmbeddingModel::MultilingualE5Large, 1024),
];

#[cfg(feature = "local-embeddings-fastembed")]
fn local_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    LOCAL_MODELS
        .iter()
        .find(|(known, _, _)| *known == name)
        .map(|(_, model, dims)| (model.clone(), *dims))
        .ok_or_else(|| {
            let known: Vec<&str> = LOCAL_MODELS.iter().map(|(n, _, _)| *n).collect();
            anyhow!(
                "Unknown local embedding model '{}' (choose one of: {})",
                name,
                known.join(", ")
            )
        })
}

/// Vector width for a local model. fastembed always returns the model's
/// native width, so a configured `dims` must agree with it.
#[cfg_attr(not(feature = "local-embeddings-fastembed"), allow(dead_code))]
fn local_width(name: &str, native: usize, configured: Option<usize>) -> Result<usize> {
    match configured {
        Some(dims) if dims != native => bail!(
            "embedding.dims = {} does not match local model '{}', which produces {}-dimensional vectors",
            dims,
            name,
            native
        ),
        _ => Ok(native),
    }
}

/// In-process inference through fastembed.
///
/// The session is created lazily on a blocking thread and then kept for the
/// provider's lifetime, so only the first call, or [`warm_up`], waits for the
/// download and load.
///
/// [`warm_up`]: EmbeddingProvider::warm_up
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    name: String,
    model: fastembed::EmbeddingModel,
    dims: usize,
    batch_size: usize,
    session: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let name = config
            .model
            .clone()
            .unwrap_or_else(|| "bge-base-en-v1.5".to_string());
        let (model, native_dims) = local_model(&name)?;
        let dims = local_width(&name, native_dims, config.dims)?;

        Ok(Self {
            name,
            model,
            dims,
            batch_size: config.batch_size,
            session: Arc::new(std::sync::Mutex::new(None)),
        })
    }

    async fn run(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let session = self.session.clone();
        let model = self.model.clone();
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            let mut slot = session
                .lock()
                .map_err(|_| anyhow!("local embedding session lock poisoned"))?;

            let loaded = match slot.take() {
                Some(loaded) => loaded,
                None => fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(false),
                )
                .map_err(|e| anyhow!("Failed to load local embedding model: {}", e))?,
            };
            let loaded = slot.insert(loaded);

            if texts.is_empty() {
                return Ok(Vec::new());
            }
            loaded
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.run(texts.to_vec()).await
    }

    async fn warm_up(&self) -> Result<()> {
        self.run(Vec::new()).await.map(drop)
    }
}

/// Deterministic bag-of-words embedding.
///
/// Each lowercase alphanumeric token is hashed (FNV-1a, 64-bit) into one of
/// `dims` buckets with a sign taken from the hash's top bit. Token vectors
/// are mean-pooled and L2-normalized. Texts sharing tokens land close
/// together; nothing else about meaning is captured.
pub struct HashProvider {
    dims: usize,
}

impl HashProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();
        if tokens.is_empty() {
            tokens.push(text.trim().to_lowercase());
        }

        let mut vector = vec![0.0f32; self.dims];
        for token in &tokens {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
            vector[bucket] += sign;
        }

        let count = tokens.len() as f32;
        for v in vector.iter_mut() {
            *v /= count;
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Build the provider named by `embedding.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
        "disabled" => Arc::new(DisabledProvider),
        "openai" => Arc::new(OpenAIProvider::new(config)?),
        "ollama" => Arc::new(OllamaProvider::new(config)?),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Arc::new(LocalProvider::new(config)?),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("the local provider needs the local-embeddings-fastembed feature"),
        "hash" => Arc::new(HashProvider::new(config.dims.unwrap_or(256))),
        other => bail!("Unknown embedding provider: {}", other),
    };
    Ok(provider)
}

/// Cosine of the angle between `a` and `b`; `0.0` when either is empty or
/// zero, or when the widths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, aa, bb), (x, y)| {
            (dot + x * y, aa + x * x, bb + y * y)
        });

    let denom = (aa * bb).sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}
