//! PostgREST-backed product storage for the MML catalog sync.

use std::time::Duration;

use async_trait::async_trait;
use mml_core::Row;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "mml-store";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Supabase project URL, e.g. `https://<ref>.supabase.co`.
    pub supabase_url: String,
    pub service_key: String,
    pub table: String,
    /// Fixed source tag every row from this pipeline carries.
    pub source: String,
    pub timeout: Duration,
}

impl StoreConfig {
    /// Credentials come from `SUPABASE_URL` plus `SUPABASE_SERVICE_KEY`
    /// (fallback `SUPABASE_KEY`). Missing either is fatal before any work
    /// begins.
    pub fn from_env(source: &str) -> Result<Self, StoreError> {
        let supabase_url =
            std::env::var("SUPABASE_URL").map_err(|_| StoreError::MissingCredentials)?;
        let service_key = std::env::var("SUPABASE_SERVICE_KEY")
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .map_err(|_| StoreError::MissingCredentials)?;
        if supabase_url.trim().is_empty() || service_key.trim().is_empty() {
            return Err(StoreError::MissingCredentials);
        }
        Ok(Self {
            supabase_url,
            service_key,
            table: "products".to_string(),
            source: source.to_string(),
            timeout: Duration::from_secs(30),
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SUPABASE_URL and SUPABASE_SERVICE_KEY (or SUPABASE_KEY) must be set")]
    MissingCredentials,
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("storage status {status}: {body}")]
    HttpStatus { status: u16, body: String },
}

/// Storage seam the pipeline writes through; the PostgREST client is the
/// production implementation, tests use an in-memory fake.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Upsert a batch of rows, resolving conflicts on
    /// `(source, product_url)` by overwriting.
    async fn upsert_chunk(&self, rows: &[Row]) -> Result<(), StoreError>;

    /// One page of stored identities for this source, ordered for stable
    /// pagination.
    async fn fetch_ids(&self, offset: usize, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Delete the given identities; returns how many rows went away.
    async fn delete_ids(&self, ids: &[String]) -> Result<usize, StoreError>;
}

/// Store that accepts everything and owns nothing. Lets report-only runs
/// proceed without credentials; the pipeline never reaches it in dry-run
/// mode anyway.
#[derive(Debug, Default)]
pub struct NoopStore;

#[async_trait]
impl CatalogStore for NoopStore {
    async fn upsert_chunk(&self, _rows: &[Row]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn fetch_ids(&self, _offset: usize, _limit: usize) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }

    async fn delete_ids(&self, _ids: &[String]) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// Render a PostgREST `in.(…)` filter over quoted identities.
pub fn in_filter(ids: &[String]) -> String {
    let quoted: Vec<String> = ids.iter().map(|id| format!("\"{id}\"")).collect();
    format!("in.({})", quoted.join(","))
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: String,
}

#[derive(Debug)]
pub struct PostgrestStore {
    client: reqwest::Client,
    config: StoreConfig,
    endpoint: String,
}

impl PostgrestStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        let endpoint = format!(
            "{}/rest/v1/{}",
            config.supabase_url.trim_end_matches('/'),
            config.table
        );
        Ok(Self {
            client,
            config,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.config.service_key)
            .bearer_auth(&self.config.service_key)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::HttpStatus {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl CatalogStore for PostgrestStore {
    async fn upsert_chunk(&self, rows: &[Row]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        debug!(rows = rows.len(), "upserting chunk");
        let response = self
            .authed(self.client.post(&self.endpoint))
            .query(&[("on_conflict", "source,product_url")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn fetch_ids(&self, offset: usize, limit: usize) -> Result<Vec<String>, StoreError> {
        let response = self
            .authed(self.client.get(&self.endpoint))
            .query(&[
                ("select", "id".to_string()),
                ("source", format!("eq.{}", self.config.source)),
                ("order", "id.asc".to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;
        let response = Self::check(response).await?;
        let rows: Vec<IdRow> = response.json().await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let response = self
            .authed(self.client.delete(&self.endpoint))
            .query(&[
                ("source", format!("eq.{}", self.config.source)),
                ("id", in_filter(ids)),
            ])
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let response = Self::check(response).await?;
        let deleted: Vec<serde_json::Value> = response.json().await?;
        Ok(deleted.len())
    }
}
