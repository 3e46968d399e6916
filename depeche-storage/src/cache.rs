use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use depeche_user::blob::BlobId;
use depeche_user::config::LocalCacheConfig;
use depeche_user::error::{Error, Result};

/// Content-addressed read cache and upload landing zone on local disk.
///
/// Blobs live under `<root>/data/<hh>/<HH>/<hex>` (two-level fan-out on the
/// hash prefix), the index in `<root>/cache_index.sqlite`. The index is
/// authoritative for purge decisions, the filesystem for content presence;
/// `sync_from_disk` and the stale sweep reconcile the two.
///
/// All mutations serialize on one mutex. `get` is an ordinary filesystem
/// read and takes no lock: racing a concurrent delete yields either the
/// full bytes or `NotFound`, both fine.
pub struct LocalCache {
    root: PathBuf,
    data: PathBuf,
    capacity: u64,
    max_object_size: u64,
    index: Mutex<Connection>,
}

const INDEX_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entries (
    path  TEXT PRIMARY KEY,
    size  INTEGER NOT NULL,
    mtime INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS entries_mtime ON entries (mtime);
";

impl LocalCache {
    pub fn open(config: &LocalCacheConfig) -> Result<Self> {
        let root = config.path.clone();
        let data = root.join("data");
        std::fs::create_dir_all(&data)?;

        let db = Connection::open(root.join("cache_index.sqlite"))
            .map_err(|e| Error::internal(format!("cache index: {}", e)))?;
        db.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| Error::internal(format!("cache index: {}", e)))?;
        db.execute_batch(INDEX_SCHEMA)
            .map_err(|e| Error::internal(format!("cache index: {}", e)))?;

        Ok(Self {
            root,
            data,
            capacity: config.capacity.bytes(),
            max_object_size: config.max_object_size.bytes(),
            index: Mutex::new(db),
        })
    }

    pub fn max_object_size(&self) -> u64 {
        self.max_object_size
    }

    fn blob_path(&self, id: &BlobId) -> PathBuf {
        let (hh, hh2) = id.shard();
        self.data.join(hh).join(hh2).join(id.to_string())
    }

    fn rel_path(id: &BlobId) -> String {
        let (hh, hh2) = id.shard();
        format!("{}/{}/{}", hh, hh2, id)
    }

    // ---- lock-free read path ----

    pub async fn get(&self, id: &BlobId) -> Result<Vec<u8>> {
        match tokio::fs::read(self.blob_path(id)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("cached blob {}", id)))
            }
            Err(e) => Err(Error::transient(format!("cache read: {}", e))),
        }
    }

    pub async fn exists(&self, id: &BlobId) -> bool {
        tokio::fs::metadata(self.blob_path(id)).await.is_ok()
    }

    // ---- serialized write path ----

    pub async fn put(&self, id: &BlobId, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 > self.max_object_size {
            return Err(Error::internal(format!(
                "blob {} exceeds max cacheable size ({} > {})",
                id,
                bytes.len(),
                self.max_object_size
            )));
        }

        let index = self.index.lock().await;
        tokio::task::block_in_place(|| {
            let path = self.blob_path(id);
            write_atomic(&path, bytes)?;
            self.index_insert(&index, id, bytes.len() as u64, &path)
        })
    }

    /// Atomic rename of a staged file into the cache, then index insert.
    /// Refreshes the mtime so the entry counts as recently used.
    pub async fn move_in(&self, src: &Path, id: &BlobId) -> Result<()> {
        let index = self.index.lock().await;
        tokio::task::block_in_place(|| {
            let path = self.blob_path(id);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match std::fs::rename(src, &path) {
                Ok(()) => (),
                // The staging spool may live on another filesystem.
                Err(_) => {
                    std::fs::copy(src, &path)?;
                    std::fs::remove_file(src)?;
                }
            }
            if let Ok(f) = std::fs::File::options().append(true).open(&path) {
                let _ = f.set_modified(SystemTime::now());
            }
            let size = std::fs::metadata(&path)?.len();
            self.index_insert(&index, id, size, &path)
        })
    }

    fn index_insert(&self, index: &Connection, id: &BlobId, size: u64, path: &Path) -> Result<()> {
        let res = index.execute(
            "INSERT OR REPLACE INTO entries (path, size, mtime) VALUES (?1, ?2, ?3)",
            params![Self::rel_path(id), size as i64, unix_now() as i64],
        );
        if let Err(e) = res {
            // The file without an index row would never be purged; undo.
            if let Err(rm) = std::fs::remove_file(path) {
                tracing::error!(blob = %id, index_err = %e, rm_err = %rm,
                    "cache index insert failed and file cleanup failed too");
            }
            return Err(Error::internal(format!("cache index insert: {}", e)));
        }
        Ok(())
    }

    /// Remove a blob. Tolerant of a missing file and a missing index row;
    /// prunes emptied fan-out directories up to (not including) `data/`.
    pub async fn delete(&self, id: &BlobId) -> Result<()> {
        let index = self.index.lock().await;
        tokio::task::block_in_place(|| {
            let path = self.blob_path(id);
            match std::fs::remove_file(&path) {
                Ok(()) => (),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => return Err(Error::transient(format!("cache delete: {}", e))),
            }
            if let Err(e) = index.execute(
                "DELETE FROM entries WHERE path = ?1",
                params![Self::rel_path(id)],
            ) {
                tracing::warn!(blob = %id, err = %e, "cache index delete failed");
            }
            self.prune_empty_parents(&path);
            Ok(())
        })
    }

    fn prune_empty_parents(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.data || !d.starts_with(&self.data) {
                break;
            }
            if std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }

    // ---- maintenance ----

    /// Walk `data/`, index every regular file, drop index rows whose file is
    /// gone, remove empty directories. Run at startup before anything else.
    pub async fn sync_from_disk(&self) -> Result<()> {
        let index = self.index.lock().await;
        tokio::task::block_in_place(|| {
            let mut found = Vec::new();
            walk_files(&self.data, &mut |path, meta| {
                let rel = path
                    .strip_prefix(&self.data)
                    .unwrap_or(path)
                    .to_string_lossy()
                    .replace('\\', "/");
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or_else(unix_now);
                found.push((rel, meta.len(), mtime));
            })?;

            for (rel, size, mtime) in &found {
                index
                    .execute(
                        "INSERT OR REPLACE INTO entries (path, size, mtime) VALUES (?1, ?2, ?3)",
                        params![rel, *size as i64, *mtime as i64],
                    )
                    .map_err(|e| Error::internal(format!("cache index insert: {}", e)))?;
            }

            self.sweep_stale_rows(&index)?;
            remove_empty_dirs(&self.data);
            Ok(())
        })
    }

    /// Drop index rows whose file no longer exists.
    pub async fn remove_stale_entries(&self) -> Result<()> {
        let index = self.index.lock().await;
        tokio::task::block_in_place(|| self.sweep_stale_rows(&index))
    }

    fn sweep_stale_rows(&self, index: &Connection) -> Result<()> {
        let mut stmt = index
            .prepare("SELECT path FROM entries")
            .map_err(|e| Error::internal(format!("cache index: {}", e)))?;
        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| Error::internal(format!("cache index: {}", e)))?;
        drop(stmt);

        let mut removed = 0usize;
        for rel in paths {
            if !self.data.join(&rel).exists() {
                index
                    .execute("DELETE FROM entries WHERE path = ?1", params![rel])
                    .map_err(|e| Error::internal(format!("cache index: {}", e)))?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "cache: removed stale index entries");
        }
        Ok(())
    }

    /// Evict entries, oldest mtime first, until the indexed total fits the
    /// configured capacity. Put and move-in refresh mtime, so this is an
    /// approximate LRU; the guarantee is eventual bounded disk use.
    pub async fn purge_to_capacity(&self) -> Result<()> {
        let index = self.index.lock().await;
        tokio::task::block_in_place(|| {
            let mut total: u64 = index
                .query_row("SELECT COALESCE(SUM(size), 0) FROM entries", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map_err(|e| Error::internal(format!("cache index: {}", e)))?
                as u64;
            if total <= self.capacity {
                return Ok(());
            }

            let mut stmt = index
                .prepare("SELECT path, size FROM entries ORDER BY mtime ASC")
                .map_err(|e| Error::internal(format!("cache index: {}", e)))?;
            let victims = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(|e| Error::internal(format!("cache index: {}", e)))?;
            drop(stmt);

            let mut evicted = 0usize;
            for (rel, size) in victims {
                if total <= self.capacity {
                    break;
                }
                let path = self.data.join(&rel);
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %path.display(), err = %e, "cache purge: unlink failed");
                        continue;
                    }
                }
                index
                    .execute("DELETE FROM entries WHERE path = ?1", params![rel])
                    .map_err(|e| Error::internal(format!("cache index: {}", e)))?;
                self.prune_empty_parents(&path);
                total = total.saturating_sub(size);
                evicted += 1;
            }
            tracing::info!(evicted, total, "cache: purge finished");
            Ok(())
        })
    }

    /// Entries whose index mtime is older than `age`, as blob ids. Feeds the
    /// orphan purge, which checks them against the metadata store in batches.
    pub async fn entries_older_than(&self, age: Duration) -> Result<Vec<BlobId>> {
        let cutoff = unix_now().saturating_sub(age.as_secs());
        let index = self.index.lock().await;
        tokio::task::block_in_place(|| {
            let mut stmt = index
                .prepare("SELECT path FROM entries WHERE mtime <= ?1")
                .map_err(|e| Error::internal(format!("cache index: {}", e)))?;
            let paths = stmt
                .query_map(params![cutoff as i64], |row| row.get::<_, String>(0))
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(|e| Error::internal(format!("cache index: {}", e)))?;
            Ok(paths
                .into_iter()
                .filter_map(|rel| rel.rsplit('/').next().and_then(|h| h.parse().ok()))
                .collect())
        })
    }

    /// Total size currently recorded in the index.
    pub async fn indexed_size(&self) -> Result<u64> {
        let index = self.index.lock().await;
        let total = index
            .query_row("SELECT COALESCE(SUM(size), 0) FROM entries", [], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .map_err(|e| Error::internal(format!("cache index: {}", e)))?
            .unwrap_or(0);
        Ok(total as u64)
    }

    #[allow(dead_code)]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::internal("cache path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(
        ".{}.part",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));
    {
        use std::io::Write;
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn walk_files(
    dir: &Path,
    visit: &mut impl FnMut(&Path, &std::fs::Metadata),
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            walk_files(&path, visit)?;
        } else if meta.is_file() {
            visit(&path, &meta);
        }
    }
    Ok(())
}

fn remove_empty_dirs(dir: &Path) {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                remove_empty_dirs(&path);
                let _ = std::fs::remove_dir(&path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depeche_user::config::ConfigSize;

    fn cache_at(dir: &Path, capacity: u64) -> LocalCache {
        LocalCache::open(&LocalCacheConfig {
            path: dir.to_path_buf(),
            capacity: ConfigSize(capacity),
            max_object_size: ConfigSize(1 << 20),
        })
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 1 << 20);

        let id = BlobId::of(b"some mail body");
        cache.put(&id, b"some mail body").await.unwrap();
        assert!(cache.exists(&id).await);
        assert_eq!(cache.get(&id).await.unwrap(), b"some mail body");

        cache.delete(&id).await.unwrap();
        assert!(!cache.exists(&id).await);
        assert!(cache.get(&id).await.unwrap_err().is_not_found());

        // delete twice is fine
        cache.delete(&id).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_prunes_fanout_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 1 << 20);

        let id = BlobId::of(b"x");
        cache.put(&id, b"x").await.unwrap();
        let (hh, _) = id.shard();
        assert!(dir.path().join("data").join(&hh).exists());

        cache.delete(&id).await.unwrap();
        assert!(!dir.path().join("data").join(&hh).exists());
        assert!(dir.path().join("data").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(&LocalCacheConfig {
            path: dir.path().to_path_buf(),
            capacity: ConfigSize(1 << 20),
            max_object_size: ConfigSize(8),
        })
        .unwrap();

        let id = BlobId::of(b"way more than eight bytes");
        assert!(cache.put(&id, b"way more than eight bytes").await.is_err());
        assert!(!cache.exists(&id).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn purge_stays_under_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 4096);

        for i in 0u32..12 {
            let body = vec![i as u8; 1024];
            let id = BlobId::of(&body);
            cache.put(&id, &body).await.unwrap();
        }
        assert!(cache.indexed_size().await.unwrap() > 4096);

        cache.purge_to_capacity().await.unwrap();
        assert!(cache.indexed_size().await.unwrap() <= 4096);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_from_disk_recovers_index() {
        let dir = tempfile::tempdir().unwrap();
        let id = BlobId::of(b"pre-existing");
        {
            let cache = cache_at(dir.path(), 1 << 20);
            cache.put(&id, b"pre-existing").await.unwrap();
        }

        // Blow the index away, keep the file.
        std::fs::remove_file(dir.path().join("cache_index.sqlite")).unwrap();
        let cache = cache_at(dir.path(), 1 << 20);
        assert_eq!(cache.indexed_size().await.unwrap(), 0);

        cache.sync_from_disk().await.unwrap();
        assert_eq!(cache.indexed_size().await.unwrap(), 12);
        assert_eq!(cache.get(&id).await.unwrap(), b"pre-existing");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_rows_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 1 << 20);

        let id = BlobId::of(b"soon gone");
        cache.put(&id, b"soon gone").await.unwrap();

        // Remove the file behind the index's back.
        std::fs::remove_file(dir.path().join("data").join({
            let (hh, hh2) = id.shard();
            format!("{}/{}/{}", hh, hh2, id)
        }))
        .unwrap();

        cache.remove_stale_entries().await.unwrap();
        assert_eq!(cache.indexed_size().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn move_in_renames_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 1 << 20);

        let src = staging.path().join("staged");
        std::fs::write(&src, b"staged body").unwrap();

        let id = BlobId::of(b"staged body");
        cache.move_in(&src, &id).await.unwrap();
        assert!(!src.exists());
        assert_eq!(cache.get(&id).await.unwrap(), b"staged body");
        assert_eq!(cache.indexed_size().await.unwrap(), 11);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn old_entries_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 1 << 20);

        let id = BlobId::of(b"aging");
        cache.put(&id, b"aging").await.unwrap();

        assert!(cache
            .entries_older_than(Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());
        let old = cache.entries_older_than(Duration::ZERO).await.unwrap();
        assert_eq!(old, vec![id]);
    }
}
