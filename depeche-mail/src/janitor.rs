use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::watch;

use depeche_meta::MetaStore;
use depeche_storage::cache::LocalCache;
use depeche_storage::object::ObjectStore;
use depeche_user::config::CleanupConfig;
use depeche_user::error::Result;

/// At most this many content hashes are considered per cycle.
const BATCH: usize = 100;

/// Never spin faster than once a minute, whatever the config says.
const MIN_WAKE_INTERVAL: Duration = Duration::from_secs(60);

/// Cluster-singleton reclaimer: once all references to a content hash are
/// expunged and the grace period has passed, the blob leaves the object
/// store, then the metadata rows, then the local cache — in that order, so
/// an uploaded, non-expunged message always has a reachable blob.
///
/// Exclusivity across nodes comes from a database advisory lock. There is
/// no retry inside a cycle; the next cycle is the retry.
pub struct Janitor {
    meta: Arc<MetaStore>,
    store: Arc<ObjectStore>,
    cache: Arc<LocalCache>,
    grace: Duration,
    wake_interval: Duration,
}

impl Janitor {
    pub fn new(
        meta: Arc<MetaStore>,
        store: Arc<ObjectStore>,
        cache: Arc<LocalCache>,
        config: &CleanupConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            meta,
            store,
            cache,
            grace: config.grace_period.duration(),
            wake_interval: std::cmp::max(config.wake_interval.duration(), MIN_WAKE_INTERVAL),
        })
    }

    pub async fn run(self: Arc<Self>, mut must_exit: watch::Receiver<bool>) {
        tracing::info!(interval_s = self.wake_interval.as_secs(), "cleanup worker started");
        loop {
            select! {
                _ = tokio::time::sleep(self.wake_interval) => (),
                _ = must_exit.changed() => (),
            }
            if *must_exit.borrow() {
                break;
            }
            if let Err(e) = self.cycle().await {
                tracing::warn!(err = %e, "cleanup cycle failed");
            }
        }
        tracing::info!("cleanup worker exiting");
    }

    async fn cycle(&self) -> Result<()> {
        let lock = match self.meta.try_cleanup_lock().await? {
            Some(lock) => lock,
            None => {
                tracing::debug!("another node holds the cleanup lock, skipping cycle");
                return Ok(());
            }
        };
        let res = self.run_locked().await;
        lock.release().await;
        res
    }

    async fn run_locked(&self) -> Result<()> {
        match self.meta.prune_vacation_responses(self.grace).await {
            Ok(0) => (),
            Ok(n) => tracing::debug!(n, "pruned vacation responses"),
            Err(e) => tracing::warn!(err = %e, "vacation response pruning failed"),
        }

        let candidates = self.meta.cleanup_candidates(self.grace, BATCH).await?;
        if candidates.is_empty() {
            return Ok(());
        }
        tracing::info!(n = candidates.len(), "reclaiming unreferenced blobs");

        for blob in candidates {
            // A missing blob counts as deleted; any other failure leaves the
            // candidate for the next cycle without blocking the rest.
            if let Err(e) = self.store.delete(&blob).await {
                tracing::warn!(blob = %blob, err = %e, "blob delete failed, skipping candidate");
                continue;
            }
            match self.meta.delete_expunged_messages_by_content_hash(&blob).await {
                Ok(rows) => tracing::debug!(blob = %blob, rows, "metadata rows removed"),
                Err(e) => {
                    tracing::warn!(blob = %blob, err = %e, "metadata removal failed, skipping candidate");
                    continue;
                }
            }
            if let Err(e) = self.cache.delete(&blob).await {
                tracing::warn!(blob = %blob, err = %e, "cache removal failed");
            }
        }
        Ok(())
    }
}
