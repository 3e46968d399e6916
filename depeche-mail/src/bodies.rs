use std::path::Path;
use std::sync::Arc;

use depeche_storage::cache::LocalCache;
use depeche_storage::object::ObjectStore;
use depeche_storage::spool::Spool;
use depeche_user::blob::BlobId;
use depeche_user::error::{Error, Result};

/// Read chain for message bodies: local cache, then object store, then the
/// staging spool for bodies whose upload has not completed yet. Object-store
/// hits repopulate the cache opportunistically.
pub struct Bodies {
    cache: Arc<LocalCache>,
    store: Arc<ObjectStore>,
    spool: Arc<Spool>,
}

impl Bodies {
    pub fn new(cache: Arc<LocalCache>, store: Arc<ObjectStore>, spool: Arc<Spool>) -> Self {
        Self {
            cache,
            store,
            spool,
        }
    }

    pub async fn fetch(&self, blob: &BlobId, staging: Option<&Path>) -> Result<Vec<u8>> {
        match self.cache.get(blob).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_not_found() => (),
            Err(e) => tracing::warn!(blob = %blob, err = %e, "cache read failed, trying object store"),
        }

        match self.store.get(blob).await {
            Ok(bytes) => {
                if bytes.len() as u64 <= self.cache.max_object_size() {
                    if let Err(e) = self.cache.put(blob, &bytes).await {
                        tracing::debug!(blob = %blob, err = %e, "cache population failed");
                    }
                }
                return Ok(bytes);
            }
            Err(e) if e.is_not_found() => (),
            Err(e) => {
                // Staging may still save the request; otherwise report the
                // store failure rather than a misleading NotFound.
                if staging.is_none() {
                    return Err(e);
                }
                tracing::warn!(blob = %blob, err = %e, "object store read failed, trying staging");
            }
        }

        if let Some(path) = staging {
            return self.spool.read(path).await;
        }
        Err(Error::not_found(format!("body {}", blob)))
    }
}
