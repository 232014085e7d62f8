//! Stale-row reconciliation: delete stored identities absent from the
//! current run. Must only run after the upsert reported full success.

use std::collections::HashSet;

use mml_store::{CatalogStore, StoreError};
use tracing::info;

/// Page through every stored identity for this source, diff against the
/// current run's id set, and delete the difference in chunks. Returns the
/// count removed; zero is a normal outcome.
pub async fn remove_stale(
    store: &dyn CatalogStore,
    current_ids: &HashSet<String>,
    id_page_size: usize,
    delete_chunk_size: usize,
) -> Result<usize, StoreError> {
    let id_page_size = id_page_size.max(1);
    let mut existing = Vec::new();
    let mut offset = 0;
    loop {
        let page = store.fetch_ids(offset, id_page_size).await?;
        let page_len = page.len();
        existing.extend(page);
        // A short page is the end of the stored set.
        if page_len < id_page_size {
            break;
        }
        offset += page_len;
    }

    let stale: Vec<String> = existing
        .into_iter()
        .filter(|id| !current_ids.contains(id))
        .collect();
    if stale.is_empty() {
        return Ok(0);
    }

    let mut removed = 0;
    for chunk in stale.chunks(delete_chunk_size.max(1)) {
        removed += store.delete_ids(chunk).await?;
    }
    info!(removed, "removed stale products no longer in catalog");
    Ok(removed)
}
