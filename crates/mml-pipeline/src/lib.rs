//! One-pass catalog sync orchestration: page → normalize → embed → buffer →
//! upsert → reconcile.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mml_core::env;
use mml_embed::Embedder;
use mml_shopify::{normalize, ListingFeed};
use mml_store::CatalogStore;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub mod batch;
pub mod reconcile;
pub mod row;

pub const CRATE_NAME: &str = "mml-pipeline";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Fixed source tag; part of every row's identity.
    pub source: String,
    pub brand: String,
    /// Storefront origin for canonical product URLs.
    pub base_url: String,
    pub country: Option<String>,
    pub second_hand: bool,
    pub upsert_chunk_size: usize,
    pub id_page_size: usize,
    pub delete_chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source: "scraper".to_string(),
            brand: "Moremoney Morelove".to_string(),
            base_url: "https://moremoneymorelove.de".to_string(),
            country: Some("DE".to_string()),
            second_hand: false,
            upsert_chunk_size: 100,
            id_page_size: 1000,
            delete_chunk_size: 100,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            source: env::string("MML_SOURCE", defaults.source),
            brand: env::string("MML_BRAND", defaults.brand),
            base_url: env::string("MML_BASE_URL", defaults.base_url),
            country: defaults.country,
            second_hand: defaults.second_hand,
            upsert_chunk_size: env::parse("MML_UPSERT_CHUNK", defaults.upsert_chunk_size),
            id_page_size: env::parse("MML_ID_PAGE_SIZE", defaults.id_page_size),
            delete_chunk_size: env::parse("MML_DELETE_CHUNK", defaults.delete_chunk_size),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Report-only mode: buffer rows but never write or delete.
    pub dry_run: bool,
    /// Stop after this many listings have been pulled from the feed.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Listings pulled from the feed, including skipped ones.
    pub processed: usize,
    pub skipped_no_image: usize,
    pub upserted: usize,
    pub stale_removed: usize,
    pub dry_run: bool,
}

pub struct SyncPipeline {
    config: SyncConfig,
    feed: Box<dyn ListingFeed>,
    embedder: Box<dyn Embedder>,
    store: Box<dyn CatalogStore>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        feed: Box<dyn ListingFeed>,
        embedder: Box<dyn Embedder>,
        store: Box<dyn CatalogStore>,
    ) -> Self {
        Self {
            config,
            feed,
            embedder,
            store,
        }
    }

    /// Single forward pass over the catalog. Strictly sequential: no item
    /// starts before the previous one finishes.
    pub async fn run_once(&self, options: RunOptions) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            %run_id,
            dry_run = options.dry_run,
            limit = options.limit,
            "starting catalog sync"
        );

        let mut rows = Vec::new();
        let mut processed = 0usize;
        let mut skipped_no_image = 0usize;

        let mut page = 1u32;
        'pages: loop {
            let listings = self.feed.fetch_page(page).await;
            if listings.is_empty() {
                info!(page, "page returned 0 listings, stopping");
                break;
            }
            info!(page, count = listings.len(), "fetched page");

            for listing in listings {
                if let Some(limit) = options.limit {
                    if processed >= limit {
                        info!(limit, "reached item limit");
                        break 'pages;
                    }
                }
                processed += 1;

                let record = normalize::to_record(&listing, &self.config.base_url);
                let title = short_title(&record.title, &record.product_url);

                // No primary image → the record is unusable for search and
                // stays out of the current-id set.
                if record.image_url.is_empty() {
                    warn!(%title, "skipping listing with no image");
                    skipped_no_image += 1;
                    continue;
                }

                info!(%title, "processing");
                let image_embedding = self.embedder.image_embedding(&record.image_url).await;
                if image_embedding.is_none() {
                    warn!(%title, "no image embedding");
                }
                let info_embedding = self.embedder.info_embedding(&record, &self.config.brand);
                if info_embedding.is_none() {
                    warn!(%title, "no info embedding");
                }

                rows.push(row::build_row(
                    &self.config,
                    &record,
                    image_embedding,
                    info_embedding,
                ));
            }

            page += 1;
            tokio::time::sleep(self.feed.page_delay()).await;
        }

        if options.dry_run {
            info!(
                rows = rows.len(),
                "dry run: would upsert, skipping writes and stale removal"
            );
            return Ok(SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                processed,
                skipped_no_image,
                upserted: 0,
                stale_removed: 0,
                dry_run: true,
            });
        }

        batch::upsert_all(self.store.as_ref(), &rows, self.config.upsert_chunk_size)
            .await
            .context("upsert failed; stale removal skipped to avoid data loss")?;
        if !rows.is_empty() {
            info!(rows = rows.len(), "upserted products");
        }

        // Reconciliation runs even for an empty buffer: an empty catalog
        // clears every stored row for this source.
        let current_ids: HashSet<String> = rows.iter().map(|row| row.id.clone()).collect();
        let stale_removed = reconcile::remove_stale(
            self.store.as_ref(),
            &current_ids,
            self.config.id_page_size,
            self.config.delete_chunk_size,
        )
        .await
        .context("stale removal failed")?;

        let finished_at = Utc::now();
        info!(
            processed,
            upserted = rows.len(),
            stale_removed,
            "sync complete"
        );
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            processed,
            skipped_no_image,
            upserted: rows.len(),
            stale_removed,
            dry_run: false,
        })
    }
}

fn short_title(title: &str, product_url: &str) -> String {
    let source = if title.is_empty() { product_url } else { title };
    source.chars().take(60).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mml_core::{identity, Listing, Record, Row};
    use mml_store::StoreError;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeFeed {
        pages: Vec<Vec<Listing>>,
    }

    #[async_trait]
    impl ListingFeed for FakeFeed {
        async fn fetch_page(&self, page: u32) -> Vec<Listing> {
            self.pages
                .get((page - 1) as usize)
                .cloned()
                .unwrap_or_default()
        }

        fn page_delay(&self) -> Duration {
            Duration::ZERO
        }
    }

    struct FakeEmbedder {
        image_available: bool,
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn image_embedding(&self, _image_url: &str) -> Option<Vec<f32>> {
            self.image_available.then(|| vec![1.0; 768])
        }

        fn info_embedding(&self, _record: &Record, _brand: &str) -> Option<Vec<f32>> {
            Some(vec![1.0; 768])
        }
    }

    #[derive(Default)]
    struct FakeStore {
        upserted_chunks: Mutex<Vec<Vec<Row>>>,
        existing_ids: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
        /// product_urls whose rows are rejected on every attempt.
        poisoned: Vec<String>,
        /// Reject any multi-row chunk, forcing isolation retries.
        reject_chunks: bool,
    }

    impl FakeStore {
        fn with_existing(ids: &[&str]) -> Self {
            Self {
                existing_ids: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
                ..Self::default()
            }
        }

        fn upserted_rows(&self) -> Vec<Row> {
            self.upserted_chunks
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl CatalogStore for FakeStore {
        async fn upsert_chunk(&self, rows: &[Row]) -> Result<(), StoreError> {
            if self.reject_chunks && rows.len() > 1 {
                return Err(StoreError::HttpStatus {
                    status: 400,
                    body: "bad batch".into(),
                });
            }
            if rows
                .iter()
                .any(|row| self.poisoned.contains(&row.product_url))
            {
                return Err(StoreError::HttpStatus {
                    status: 400,
                    body: "malformed row".into(),
                });
            }
            self.upserted_chunks.lock().unwrap().push(rows.to_vec());
            Ok(())
        }

        async fn fetch_ids(&self, offset: usize, limit: usize) -> Result<Vec<String>, StoreError> {
            let ids = self.existing_ids.lock().unwrap();
            Ok(ids.iter().skip(offset).take(limit).cloned().collect())
        }

        async fn delete_ids(&self, ids: &[String]) -> Result<usize, StoreError> {
            self.deleted.lock().unwrap().extend(ids.iter().cloned());
            Ok(ids.len())
        }
    }

    fn listing(handle: &str, with_image: bool) -> Listing {
        let images = if with_image {
            serde_json::json!([{"src": format!("https://cdn/{handle}.jpg")}])
        } else {
            serde_json::json!([])
        };
        serde_json::from_value(serde_json::json!({
            "handle": handle,
            "title": handle,
            "variants": [{"price": "40.00"}],
            "images": images,
        }))
        .unwrap()
    }

    fn pipeline(feed: FakeFeed, store: FakeStore) -> (SyncPipeline, std::sync::Arc<FakeStore>) {
        let store = std::sync::Arc::new(store);
        let pipeline = SyncPipeline::new(
            SyncConfig::default(),
            Box::new(feed),
            Box::new(FakeEmbedder {
                image_available: true,
            }),
            Box::new(SharedStore(store.clone())),
        );
        (pipeline, store)
    }

    /// Lets a test keep a handle on the store the pipeline owns.
    struct SharedStore(std::sync::Arc<FakeStore>);

    #[async_trait]
    impl CatalogStore for SharedStore {
        async fn upsert_chunk(&self, rows: &[Row]) -> Result<(), StoreError> {
            self.0.upsert_chunk(rows).await
        }
        async fn fetch_ids(&self, offset: usize, limit: usize) -> Result<Vec<String>, StoreError> {
            self.0.fetch_ids(offset, limit).await
        }
        async fn delete_ids(&self, ids: &[String]) -> Result<usize, StoreError> {
            self.0.delete_ids(ids).await
        }
    }

    #[tokio::test]
    async fn imageless_listing_is_skipped_entirely() {
        let feed = FakeFeed {
            pages: vec![vec![listing("hoodie", true), listing("ghost", false)]],
        };
        let (pipeline, store) = pipeline(feed, FakeStore::default());

        let summary = pipeline.run_once(RunOptions::default()).await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.skipped_no_image, 1);
        assert_eq!(summary.upserted, 1);

        let rows = store.upserted_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].id,
            identity("scraper", "https://moremoneymorelove.de/en/products/hoodie")
        );
        assert_eq!(rows[0].image_embedding.as_ref().map(Vec::len), Some(768));
    }

    #[tokio::test]
    async fn reconciliation_deletes_exactly_the_stale_set() {
        let current: HashSet<String> =
            ["b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let store = FakeStore::with_existing(&["a", "b", "c"]);

        let removed = reconcile::remove_stale(&store, &current, 1000, 100)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(*store.deleted.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn reconciliation_pages_until_a_short_page() {
        let ids: Vec<String> = (0..250).map(|i| format!("id{i:03}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let store = FakeStore::with_existing(&id_refs);
        let current: HashSet<String> = ids[..200].iter().cloned().collect();

        let removed = reconcile::remove_stale(&store, &current, 100, 20)
            .await
            .unwrap();
        assert_eq!(removed, 50);
        assert_eq!(store.deleted.lock().unwrap().len(), 50);
    }

    #[tokio::test]
    async fn rows_are_upserted_in_fixed_size_chunks() {
        let rows: Vec<Row> = (0..250)
            .map(|i| {
                let record = normalize::to_record(&listing(&format!("p{i}"), true), "https://s");
                row::build_row(&SyncConfig::default(), &record, None, None)
            })
            .collect();
        let store = FakeStore::default();
        batch::upsert_all(&store, &rows, 100).await.unwrap();

        let chunks = store.upserted_chunks.lock().unwrap();
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[tokio::test]
    async fn isolation_retry_saves_the_healthy_rows_then_fails_the_run() {
        let rows: Vec<Row> = (0..5)
            .map(|i| {
                let record = normalize::to_record(&listing(&format!("p{i}"), true), "https://s");
                row::build_row(&SyncConfig::default(), &record, None, None)
            })
            .collect();
        let store = FakeStore {
            reject_chunks: true,
            poisoned: vec!["https://s/en/products/p2".to_string()],
            ..FakeStore::default()
        };

        let result = batch::upsert_all(&store, &rows, 100).await;
        assert!(result.is_err());
        // The other four rows landed via isolation retry.
        assert_eq!(store.upserted_rows().len(), 4);
    }

    #[tokio::test]
    async fn failed_upsert_skips_reconciliation() {
        let feed = FakeFeed {
            pages: vec![vec![listing("poisoned", true)]],
        };
        let store = FakeStore {
            poisoned: vec![
                "https://moremoneymorelove.de/en/products/poisoned".to_string(),
            ],
            existing_ids: Mutex::new(vec!["stale".to_string()]),
            ..FakeStore::default()
        };
        let (pipeline, store) = pipeline(feed, store);

        let result = pipeline.run_once(RunOptions::default()).await;
        assert!(result.is_err());
        assert!(store.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dry_run_never_touches_the_store() {
        let feed = FakeFeed {
            pages: vec![vec![listing("hoodie", true)]],
        };
        let store = FakeStore::with_existing(&["stale"]);
        let (pipeline, store) = pipeline(feed, store);

        let summary = pipeline
            .run_once(RunOptions {
                dry_run: true,
                limit: None,
            })
            .await
            .unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.upserted, 0);
        assert!(store.upserted_chunks.lock().unwrap().is_empty());
        assert!(store.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn item_limit_caps_the_run_between_listings() {
        let feed = FakeFeed {
            pages: vec![
                vec![listing("a", true), listing("b", true)],
                vec![listing("c", true)],
            ],
        };
        let (pipeline, store) = pipeline(feed, FakeStore::default());

        let summary = pipeline
            .run_once(RunOptions {
                dry_run: false,
                limit: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(store.upserted_rows().len(), 1);
    }

    #[tokio::test]
    async fn empty_catalog_still_reconciles_with_an_empty_set() {
        let feed = FakeFeed { pages: vec![] };
        let store = FakeStore::with_existing(&["a", "b"]);
        let (pipeline, store) = pipeline(feed, store);

        let summary = pipeline.run_once(RunOptions::default()).await.unwrap();
        assert_eq!(summary.upserted, 0);
        // Current behavior: an empty run deletes the whole stored catalog
        // for this source.
        assert_eq!(summary.stale_removed, 2);
        assert_eq!(store.deleted.lock().unwrap().len(), 2);
    }
}
