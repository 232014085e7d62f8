//! Shopify collection feed client + Listing normalization for MML.

use std::time::Duration;

use async_trait::async_trait;
use mml_core::{env, Listing};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub mod normalize;

pub const CRATE_NAME: &str = "mml-shopify";

/// Browser-like UA; the storefront rejects the default reqwest one.
pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Storefront origin. Shared with the orchestrator so the scraped
    /// collection and the canonical product URLs come from one place.
    pub base_url: String,
    /// Collection whose `products.json` endpoint is paged.
    pub collection_handle: String,
    pub page_size: u32,
    pub timeout: Duration,
    /// Pause between successive page fetches, and the backoff unit.
    pub request_delay: Duration,
    pub backoff: LinearBackoff,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://moremoneymorelove.de".to_string(),
            collection_handle: "shop-all".to_string(),
            page_size: 50,
            timeout: Duration::from_secs(30),
            request_delay: Duration::from_secs(1),
            backoff: LinearBackoff::default(),
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env::string("MML_BASE_URL", defaults.base_url),
            collection_handle: env::string("MML_COLLECTION", defaults.collection_handle),
            page_size: env::parse("MML_PAGE_SIZE", defaults.page_size),
            timeout: Duration::from_secs(env::parse(
                "MML_HTTP_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )),
            request_delay: Duration::from_secs(env::parse(
                "MML_REQUEST_DELAY_SECS",
                defaults.request_delay.as_secs(),
            )),
            backoff: LinearBackoff {
                max_attempts: env::parse("MML_FETCH_ATTEMPTS", defaults.backoff.max_attempts),
                base_delay: defaults.backoff.base_delay,
            },
        }
    }

    /// Paged `products.json` endpoint for the configured collection.
    pub fn collection_json_url(&self) -> String {
        format!(
            "{}/en/collections/{}/products.json",
            self.base_url.trim_end_matches('/'),
            self.collection_handle
        )
    }
}

/// Retry schedule for one page fetch: attempt `n` failing sleeps
/// `base_delay * n` before the next attempt.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl LinearBackoff {
    /// Delay after the 1-based attempt number `attempt` fails.
    pub fn delay_after_attempt(&self, attempt: usize) -> Duration {
        self.base_delay.saturating_mul(attempt as u32)
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Seam between the orchestrator and the live storefront; lets tests drive
/// the pipeline from a fixed in-memory catalog.
#[async_trait]
pub trait ListingFeed: Send + Sync {
    /// One page of listings. An empty page means either "catalog ended" or
    /// "page failed after exhausting retries"; callers cannot tell the two
    /// apart, which is why downstream reconciliation is guarded.
    async fn fetch_page(&self, page: u32) -> Vec<Listing>;

    /// Pause the orchestrator inserts between page fetches.
    fn page_delay(&self) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Deserialize)]
struct CollectionPage {
    #[serde(default)]
    products: Vec<Listing>,
}

#[derive(Debug)]
pub struct ShopifyFeed {
    client: reqwest::Client,
    config: FeedConfig,
    collection_url: String,
}

impl ShopifyFeed {
    pub fn new(config: FeedConfig) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()?;
        let collection_url = config.collection_json_url();
        Ok(Self {
            client,
            config,
            collection_url,
        })
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    async fn try_fetch(&self, page: u32) -> Result<Vec<Listing>, FeedError> {
        let response = self
            .client
            .get(&self.collection_url)
            .query(&[("page", page), ("limit", self.config.page_size)])
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        let body: CollectionPage = response.json().await?;
        Ok(body.products)
    }
}

#[async_trait]
impl ListingFeed for ShopifyFeed {
    async fn fetch_page(&self, page: u32) -> Vec<Listing> {
        let backoff = self.config.backoff;
        for attempt in 1..=backoff.max_attempts {
            match self.try_fetch(page).await {
                Ok(products) => return products,
                Err(err) => {
                    warn!(
                        page,
                        attempt,
                        max_attempts = backoff.max_attempts,
                        error = %err,
                        "collection page fetch failed"
                    );
                    if attempt < backoff.max_attempts {
                        tokio::time::sleep(backoff.delay_after_attempt(attempt)).await;
                    }
                }
            }
        }
        // Exhausted retries: treated as an empty page, same as end-of-catalog.
        Vec::new()
    }

    fn page_delay(&self) -> Duration {
        self.config.request_delay
    }
}
