use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::watch;

use depeche_meta::MetaStore;
use depeche_storage::cache::LocalCache;
use depeche_user::error::Result;

/// Cache housekeeping cadence.
const PURGE_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Cache entries idle this long get checked against the metadata store.
const ORPHAN_AGE: Duration = Duration::from_secs(30 * 24 * 3600);

/// Metadata lookups batch size for the orphan purge.
const ORPHAN_CHECK_BATCH: usize = 1000;

/// Local-cache maintenance: reconcile the index with the disk at startup,
/// then periodically sweep stale index rows, purge down to capacity, and
/// drop blobs no live message references anymore.
pub struct CacheMaintenance {
    cache: Arc<LocalCache>,
    meta: Arc<MetaStore>,
}

impl CacheMaintenance {
    pub fn new(cache: Arc<LocalCache>, meta: Arc<MetaStore>) -> Arc<Self> {
        Arc::new(Self { cache, meta })
    }

    pub async fn run(self: Arc<Self>, mut must_exit: watch::Receiver<bool>) {
        // On startup the filesystem is authoritative: whatever survived the
        // last shutdown gets re-indexed before any purge decision.
        if let Err(e) = self.cache.sync_from_disk().await {
            tracing::error!(err = %e, "cache startup reconciliation failed");
        }
        if let Err(e) = self.cache.purge_to_capacity().await {
            tracing::error!(err = %e, "cache startup purge failed");
        }

        loop {
            select! {
                _ = tokio::time::sleep(PURGE_INTERVAL) => (),
                _ = must_exit.changed() => (),
            }
            if *must_exit.borrow() {
                break;
            }

            if let Err(e) = self.cache.remove_stale_entries().await {
                tracing::warn!(err = %e, "stale cache entry sweep failed");
            }
            if let Err(e) = self.cache.purge_to_capacity().await {
                tracing::warn!(err = %e, "cache purge failed");
            }
            if let Err(e) = self.purge_orphans().await {
                tracing::warn!(err = %e, "cache orphan purge failed");
            }
        }
        tracing::info!("cache maintenance exiting");
    }

    /// Drop cache entries older than the threshold whose content hash no
    /// live message or pending upload references anymore.
    async fn purge_orphans(&self) -> Result<()> {
        let old = self.cache.entries_older_than(ORPHAN_AGE).await?;
        let mut dropped = 0usize;
        for chunk in old.chunks(ORPHAN_CHECK_BATCH) {
            let live = self.meta.find_existing_content_hashes(chunk).await?;
            for blob in chunk {
                if !live.contains(blob) {
                    self.cache.delete(blob).await?;
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            tracing::info!(dropped, "cache orphan purge removed unreferenced blobs");
        }
        Ok(())
    }
}
