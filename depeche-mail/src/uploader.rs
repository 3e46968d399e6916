use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::select;
use tokio::sync::{watch, Notify};

use depeche_meta::model::PendingUpload;
use depeche_meta::MetaStore;
use depeche_storage::cache::LocalCache;
use depeche_storage::object::ObjectStore;
use depeche_storage::spool::Spool;
use depeche_user::config::UploaderConfig;
use depeche_user::error::Result;

/// Drains the pending-upload queue without ever blocking ingest.
///
/// One long-lived task with two wake sources: a periodic ticker and the
/// notification raised by ingest. Each wake drains the queue in batches;
/// rows are processed in insertion order with bounded concurrency.
/// The pending-upload table, not any in-memory state, is the source of
/// truth: a restart simply picks up whatever the queue still holds.
pub struct Uploader {
    meta: Arc<MetaStore>,
    store: Arc<ObjectStore>,
    cache: Arc<LocalCache>,
    spool: Arc<Spool>,
    notify: Arc<Notify>,
    config: UploaderConfig,
}

impl Uploader {
    pub fn new(
        meta: Arc<MetaStore>,
        store: Arc<ObjectStore>,
        cache: Arc<LocalCache>,
        spool: Arc<Spool>,
        notify: Arc<Notify>,
        config: UploaderConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            meta,
            store,
            cache,
            spool,
            notify,
            config,
        })
    }

    pub async fn run(self: Arc<Self>, mut must_exit: watch::Receiver<bool>) {
        tracing::info!("upload worker started");
        while !*must_exit.borrow() {
            self.drain(&must_exit).await;

            select! {
                _ = self.notify.notified() => (),
                _ = tokio::time::sleep(self.config.retry_interval.duration()) => (),
                _ = must_exit.changed() => (),
            }
        }
        tracing::info!("upload worker exiting");
    }

    /// Process batches until the queue has nothing ready.
    async fn drain(&self, must_exit: &watch::Receiver<bool>) {
        loop {
            if *must_exit.borrow() {
                return;
            }
            let batch = match self
                .meta
                .list_pending_uploads(
                    self.config.batch_size,
                    self.config.retry_interval.duration(),
                    self.config.max_attempts,
                )
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(err = %e, "pending-upload query failed, will retry next wake");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }

            tracing::debug!(n = batch.len(), "processing upload batch");
            stream::iter(batch)
                .for_each_concurrent(self.config.concurrency, |row| self.process(row))
                .await;
        }
    }

    async fn process(&self, row: PendingUpload) {
        let upload_id = row.upload_id;
        let blob = row.blob;
        match self.try_upload(row).await {
            Ok(()) => {
                tracing::debug!(upload = upload_id, blob = %blob, "upload complete");
            }
            Err(e) => {
                let attempts = self
                    .meta
                    .mark_upload_attempt(upload_id, false)
                    .await
                    .unwrap_or(0);
                if attempts >= self.config.max_attempts as i32 {
                    // The body is still durable in staging; this needs an
                    // operator, not another retry.
                    tracing::error!(
                        upload = upload_id,
                        blob = %blob,
                        attempts,
                        err = %e,
                        "upload exhausted its attempts, leaving row for operator"
                    );
                } else {
                    tracing::warn!(upload = upload_id, blob = %blob, attempts, err = %e, "upload failed");
                }
            }
        }
    }

    async fn try_upload(&self, row: PendingUpload) -> Result<()> {
        let body = self.spool.read(&row.staging_path).await?;
        self.store.put(&row.blob, body).await?;

        if row.size <= self.cache.max_object_size() {
            self.cache.move_in(&row.staging_path, &row.blob).await?;
        } else {
            self.spool.remove(&row.staging_path).await?;
        }

        // The single commit point: uploaded=true plus queue-row removal,
        // atomically. Rerunning the whole sequence after a crash is safe
        // because the object put is idempotent.
        self.meta.complete_upload(row.message_id, row.upload_id).await
    }
}
