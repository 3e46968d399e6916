use std::path::{Path, PathBuf};

use uuid::Uuid;

use depeche_user::config::UploaderConfig;
use depeche_user::error::{Error, Result};

/// Staging area for bodies that have been accepted but not yet confirmed in
/// the object store. One file per pending message, laid out as
/// `<root>/<domain>/<localpart>/<uuid>`.
///
/// Staged files are owned by the upload worker from the moment the ingest
/// transaction commits: it either moves them into the cache or removes them.
/// Recovery never relies on in-memory state; the pending-upload table is the
/// source of truth and points back at these paths.
pub struct Spool {
    root: PathBuf,
}

impl Spool {
    pub fn open(config: &UploaderConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.path)?;
        Ok(Self {
            root: config.path.clone(),
        })
    }

    /// Durably write a fresh body for `address` and return its path.
    pub async fn stage(&self, address: &str, body: &[u8]) -> Result<PathBuf> {
        let (localpart, domain) = match address.split_once('@') {
            Some((l, d)) => (l, d),
            None => (address, "local"),
        };
        let dir = self
            .root
            .join(sanitize_component(domain))
            .join(sanitize_component(localpart));
        let path = dir.join(Uuid::new_v4().to_string());

        let body = body.to_vec();
        tokio::task::block_in_place(|| {
            use std::io::Write;
            std::fs::create_dir_all(&dir)?;
            let tmp = path.with_extension("part");
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&body)?;
            f.sync_all()?;
            std::fs::rename(&tmp, &path)?;
            Ok::<_, Error>(())
        })?;
        Ok(path)
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("staging file {}", path.display())))
            }
            Err(e) => Err(Error::transient(format!("staging read: {}", e))),
        }
    }

    /// Tolerant of an already-removed file.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::transient(format!("staging remove: {}", e))),
        }
    }
}

/// Path components come from mail addresses; strip anything that could
/// escape the spool directory.
fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".into(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depeche_user::config::{ConfigDuration, UploaderConfig};
    use std::time::Duration;

    fn spool_at(dir: &Path) -> Spool {
        Spool::open(&UploaderConfig {
            path: dir.to_path_buf(),
            batch_size: 32,
            concurrency: 4,
            max_attempts: 5,
            retry_interval: ConfigDuration(Duration::from_secs(30)),
        })
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stage_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool_at(dir.path());

        let path = spool.stage("alice@example.com", b"raw mail").await.unwrap();
        assert!(path.starts_with(dir.path().join("example.com").join("alice")));
        assert_eq!(spool.read(&path).await.unwrap(), b"raw mail");

        spool.remove(&path).await.unwrap();
        assert!(spool.read(&path).await.unwrap_err().is_not_found());
        spool.remove(&path).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hostile_address_stays_inside() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool_at(dir.path());

        let path = spool.stage("../../etc@..", b"x").await.unwrap();
        assert!(path.starts_with(dir.path()));
    }
}
