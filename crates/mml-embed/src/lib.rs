//! Dual embedding generation (image + text) over a resident CLIP session.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions,
    TextEmbedding,
};
use mml_core::{Record, EMBEDDING_DIM};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mml-embed";

/// Same browser-like UA the feed client sends; the CDN rejects bare bots.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Character budget for the description slice of the info text.
const DESCRIPTION_BUDGET: usize = 2000;
/// Character budget for the serialized metadata slice.
const METADATA_BUDGET: usize = 1000;

#[derive(Debug, Clone)]
pub struct EmbedConfig {
    pub image_timeout: Duration,
    pub target_dim: usize,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            image_timeout: Duration::from_secs(30),
            target_dim: EMBEDDING_DIM,
        }
    }
}

impl EmbedConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            image_timeout: Duration::from_secs(mml_core::env::parse(
                "MML_IMAGE_TIMEOUT_SECS",
                defaults.image_timeout.as_secs(),
            )),
            // Stored vectors are a fixed width; not an env tunable.
            target_dim: defaults.target_dim,
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("loading embedding model: {0}")]
    LoadModel(String),
    #[error("image download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("model inference failed: {0}")]
    Inference(String),
    #[error("temp image file: {0}")]
    Io(#[from] std::io::Error),
    #[error("model returned no embedding")]
    Empty,
}

/// Ordered strategies tried for one image, first success wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageStrategy {
    /// Feed the downloaded bytes to the model untouched.
    Direct,
    /// Decode, force RGB8, re-encode as PNG. Recovers formats the direct
    /// path rejects (CMYK JPEGs, palette PNGs, webp oddities).
    ReencodedRgb,
}

const IMAGE_STRATEGIES: [ImageStrategy; 2] =
    [ImageStrategy::Direct, ImageStrategy::ReencodedRgb];

/// Seam between the orchestrator and the model session; pipeline tests
/// substitute a canned implementation.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// 768-dim image-space vector, or None on any failure (soft).
    async fn image_embedding(&self, image_url: &str) -> Option<Vec<f32>>;
    /// 768-dim text-space vector over the record's info text, or None.
    fn info_embedding(&self, record: &Record, brand: &str) -> Option<Vec<f32>>;
}

/// Owns the loaded CLIP session for the lifetime of a run. Loading is
/// expensive; every embedding call borrows the same models.
pub struct EmbeddingGenerator {
    text_model: TextEmbedding,
    image_model: ImageEmbedding,
    client: reqwest::Client,
    config: EmbedConfig,
}

impl EmbeddingGenerator {
    pub fn new(config: EmbedConfig) -> Result<Self, EmbedError> {
        info!("loading CLIP embedding models");
        let text_model =
            TextEmbedding::try_new(InitOptions::new(EmbeddingModel::ClipVitB32))
                .map_err(|err| EmbedError::LoadModel(err.to_string()))?;
        let image_model =
            ImageEmbedding::try_new(ImageInitOptions::new(ImageEmbeddingModel::ClipVitB32))
                .map_err(|err| EmbedError::LoadModel(err.to_string()))?;
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.image_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        info!("embedding models loaded");
        Ok(Self {
            text_model,
            image_model,
            client,
            config,
        })
    }

    async fn download_image(&self, image_url: &str) -> Result<Vec<u8>, EmbedError> {
        let response = self.client.get(image_url).send().await?;
        let response = response.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    fn embed_image_bytes(
        &self,
        bytes: &[u8],
        strategy: ImageStrategy,
    ) -> Result<Vec<f32>, EmbedError> {
        let payload = match strategy {
            ImageStrategy::Direct => None,
            ImageStrategy::ReencodedRgb => Some(reencode_rgb_png(bytes)?),
        };
        let file = NamedTempFile::with_suffix(".png")?;
        std::fs::write(file.path(), payload.as_deref().unwrap_or(bytes))?;
        let mut embeddings = self
            .image_model
            .embed(vec![file.path()], None)
            .map_err(|err| EmbedError::Inference(err.to_string()))?;
        embeddings.pop().ok_or(EmbedError::Empty)
    }
}

#[async_trait]
impl Embedder for EmbeddingGenerator {
    async fn image_embedding(&self, image_url: &str) -> Option<Vec<f32>> {
        let bytes = match self.download_image(image_url).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(image_url, error = %err, "image download failed");
                return None;
            }
        };
        for strategy in IMAGE_STRATEGIES {
            match self.embed_image_bytes(&bytes, strategy) {
                Ok(raw) => return fit_dimension(raw, self.config.target_dim),
                Err(err) => {
                    warn!(image_url, ?strategy, error = %err, "image embedding attempt failed");
                }
            }
        }
        None
    }

    fn info_embedding(&self, record: &Record, brand: &str) -> Option<Vec<f32>> {
        let text = info_text(record, brand);
        if text.trim().is_empty() {
            return None;
        }
        match self.text_model.embed(vec![text], None) {
            Ok(mut embeddings) => {
                let raw = embeddings.pop()?;
                fit_dimension(raw, self.config.target_dim)
            }
            Err(err) => {
                warn!(title = %record.title, error = %err, "text embedding failed");
                None
            }
        }
    }
}

/// Single text string embedded for the info vector, concatenated in fixed
/// order: title, brand, price, sale, category, gender, truncated
/// description, truncated metadata JSON.
pub fn info_text(record: &Record, brand: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !record.title.is_empty() {
        parts.push(record.title.clone());
    }
    if !brand.is_empty() {
        parts.push(brand.to_string());
    }
    if let Some(price) = &record.price {
        parts.push(format!("Price: {price}"));
    }
    if let Some(sale) = &record.sale {
        parts.push(format!("Sale: {sale}"));
    }
    if let Some(category) = &record.category {
        parts.push(format!("Category: {category}"));
    }
    parts.push(format!("Gender: {}", record.gender.as_str()));
    if let Some(description) = &record.description {
        parts.push(truncate_chars(description, DESCRIPTION_BUDGET));
    }
    if let Some(metadata) = &record.metadata {
        if let Ok(json) = serde_json::to_string(metadata) {
            parts.push(truncate_chars(&json, METADATA_BUDGET));
        }
    }
    parts.join(" ")
}

fn truncate_chars(text: &str, budget: usize) -> String {
    text.chars().take(budget).collect()
}

/// Fit a raw model vector to `target` components with unit Euclidean norm:
/// truncate-then-renormalize when longer, zero-pad-then-renormalize when
/// shorter. A zero-norm input cannot be normalized and yields None.
pub fn fit_dimension(raw: Vec<f32>, target: usize) -> Option<Vec<f32>> {
    let mut vec = l2_normalize(raw)?;
    if vec.len() == target {
        return Some(vec);
    }
    if vec.len() > target {
        vec.truncate(target);
    } else {
        vec.resize(target, 0.0);
    }
    l2_normalize(vec)
}

fn l2_normalize(mut vec: Vec<f32>) -> Option<Vec<f32>> {
    let norm = vec
        .iter()
        .map(|v| f64::from(*v) * f64::from(*v))
        .sum::<f64>()
        .sqrt();
    if norm <= 0.0 {
        return None;
    }
    for v in &mut vec {
        *v = (f64::from(*v) / norm) as f32;
    }
    Some(vec)
}

fn reencode_rgb_png(bytes: &[u8]) -> Result<Vec<u8>, EmbedError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|err| EmbedError::Decode(err.to_string()))?;
    let rgb = image::DynamicImage::ImageRgb8(decoded.to_rgb8());
    let mut out = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|err| EmbedError::Decode(err.to_string()))?;
    Ok(out)
}
