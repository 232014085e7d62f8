//! Chunked idempotent upsert with degrade-to-per-row retry.

use mml_core::Row;
use mml_store::{CatalogStore, StoreError};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("row {product_url} failed after isolation retry: {source}")]
    Row {
        product_url: String,
        source: StoreError,
    },
}

/// Upsert every row in fixed-size chunks. A rejected chunk is retried
/// row-by-row to isolate the malformed row; any row still failing fails the
/// whole run. Fail-closed: a partially-written batch must never be followed
/// by a stale-removal pass.
pub async fn upsert_all(
    store: &dyn CatalogStore,
    rows: &[Row],
    chunk_size: usize,
) -> Result<(), UpsertError> {
    for chunk in rows.chunks(chunk_size.max(1)) {
        match store.upsert_chunk(chunk).await {
            Ok(()) => {}
            Err(err) => {
                warn!(
                    rows = chunk.len(),
                    error = %err,
                    "chunk upsert rejected, retrying row by row"
                );
                // Finish the whole chunk so only the malformed rows are
                // lost, then abort.
                let mut failed: Option<UpsertError> = None;
                for row in chunk {
                    if let Err(row_err) = store.upsert_chunk(std::slice::from_ref(row)).await {
                        warn!(product_url = %row.product_url, error = %row_err, "row failed in isolation");
                        if failed.is_none() {
                            failed = Some(UpsertError::Row {
                                product_url: row.product_url.clone(),
                                source: row_err,
                            });
                        }
                    }
                }
                if let Some(err) = failed {
                    return Err(err);
                }
                info!(rows = chunk.len(), "isolation retry recovered the chunk");
            }
        }
    }
    Ok(())
}
