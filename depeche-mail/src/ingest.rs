use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};

use depeche_meta::model::{BodyLocation, FlagSet, MailboxId, ModSeq};
use depeche_meta::MetaStore;
use depeche_storage::spool::Spool;
use depeche_user::error::Result;

use crate::retry::{retry, INGEST_RETRY};

/// The shared ingest path behind LMTP DATA and IMAP APPEND.
///
/// A delivery stages the body durably on local disk and commits the
/// metadata row plus a pending-upload row in one transaction; the client is
/// acknowledged as soon as that commit returns, and the upload worker is
/// nudged to pick the body up asynchronously.
pub struct Ingestor {
    meta: Arc<MetaStore>,
    spool: Arc<Spool>,
    upload_notify: Arc<Notify>,
}

impl Ingestor {
    pub fn new(meta: Arc<MetaStore>, spool: Arc<Spool>, upload_notify: Arc<Notify>) -> Self {
        Self {
            meta,
            spool,
            upload_notify,
        }
    }

    /// Parse, hash, and durably record a message. Transient database
    /// failures are retried with backoff; parse failures are permanent.
    /// Returns the allocated UID and modseq.
    pub async fn deliver(
        &self,
        address: &str,
        mailbox_id: MailboxId,
        flags: FlagSet,
        internal_date: DateTime<Utc>,
        raw: &[u8],
        must_exit: &watch::Receiver<bool>,
    ) -> Result<(u32, ModSeq)> {
        let parsed = crate::message::ParsedMessage::parse(raw)?;
        let blob = parsed.blob;
        let new_msg = parsed.into_new_message(mailbox_id, flags, internal_date);

        let out = retry(INGEST_RETRY, must_exit, || async {
            // Track the staged path so a failed transaction does not leak
            // an unreferenced spool file into the next attempt.
            let staged: Mutex<Option<PathBuf>> = Mutex::new(None);
            let res = self
                .meta
                .insert_message(&new_msg, || async {
                    let path = self.spool.stage(address, raw).await?;
                    *staged.lock().unwrap() = Some(path.clone());
                    Ok(BodyLocation::Staged { path })
                })
                .await;

            if res.is_err() {
                if let Some(path) = staged.lock().unwrap().take() {
                    let _ = self.spool.remove(&path).await;
                }
            }
            res
        })
        .await?;

        tracing::info!(mailbox = mailbox_id, uid = out.0, blob = %blob, "message accepted");
        self.upload_notify.notify_one();
        Ok(out)
    }
}
