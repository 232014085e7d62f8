use anyhow::{Context, Result};
use clap::Parser;
use mml_embed::{EmbedConfig, EmbeddingGenerator};
use mml_pipeline::{RunOptions, SyncConfig, SyncPipeline};
use mml_shopify::{FeedConfig, ShopifyFeed};
use mml_store::{CatalogStore, NoopStore, PostgrestStore, StoreConfig};
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mml")]
#[command(about = "More Money More Love catalog sync")]
struct Cli {
    /// Report-only mode: fetch and embed, but never write or delete.
    #[arg(long)]
    dry_run: bool,

    /// Stop after this many listings.
    #[arg(long)]
    limit: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();

    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let sync_config = SyncConfig::from_env();

    // Credentials are checked before any work begins; only a dry run may
    // proceed without them.
    let store: Box<dyn CatalogStore> = match StoreConfig::from_env(&sync_config.source) {
        Ok(store_config) => Box::new(PostgrestStore::new(store_config)?),
        Err(err) if cli.dry_run => {
            warn!(error = %err, "no storage credentials; dry run continues without storage");
            Box::new(NoopStore)
        }
        Err(err) => {
            return Err(err)
                .context("set SUPABASE_SERVICE_KEY or SUPABASE_KEY in .env for database upload");
        }
    };

    // One base URL feeds both the collection endpoint and the canonical
    // product URLs, so an override re-points the scrape and the identities
    // together.
    let feed_config = FeedConfig {
        base_url: sync_config.base_url.clone(),
        ..FeedConfig::from_env()
    };
    let feed = ShopifyFeed::new(feed_config)?;
    let embedder =
        EmbeddingGenerator::new(EmbedConfig::from_env()).context("loading embedding models")?;

    let pipeline = SyncPipeline::new(sync_config, Box::new(feed), Box::new(embedder), store);
    let summary = pipeline
        .run_once(RunOptions {
            dry_run: cli.dry_run,
            limit: cli.limit,
        })
        .await?;

    println!(
        "sync complete: run_id={} processed={} skipped_no_image={} upserted={} stale_removed={} dry_run={}",
        summary.run_id,
        summary.processed,
        summary.skipped_no_image,
        summary.upserted,
        summary.stale_removed,
        summary.dry_run
    );
    Ok(())
}
