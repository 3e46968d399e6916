use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use depeche_user::blob::BlobId;
use depeche_user::config::S3Config;
use depeche_user::error::{Error, Result};

/// Adapter over the S3-compatible body bucket.
///
/// Keys are the hex content hashes; the adapter has no notion of mailboxes
/// or messages. The uploader is the only writer, the janitor the only
/// deleter; everything else reads.
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    bucket: String,
    trace: bool,
}

impl ObjectStore {
    pub fn new(config: &S3Config) -> Self {
        let creds = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "depeche-config",
        );
        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint.clone())
            .credentials_provider(creds)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            trace: config.trace,
        }
    }

    /// Store a blob. Content-addressed keys make this idempotent: if the key
    /// is already present the bytes are the same and no reupload happens.
    pub async fn put(&self, id: &BlobId, body: Vec<u8>) -> Result<()> {
        if self.exists(id).await? {
            if self.trace {
                tracing::trace!(key = %id, "s3 put skipped, key already present");
            }
            return Ok(());
        }

        if self.trace {
            tracing::trace!(key = %id, size = body.len(), "s3 put");
        }
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(id.to_string())
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    pub async fn get(&self, id: &BlobId) -> Result<Vec<u8>> {
        if self.trace {
            tracing::trace!(key = %id, "s3 get");
        }
        let out = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(id.to_string())
            .send()
            .await
        {
            Ok(out) => out,
            Err(SdkError::ServiceError(se)) if se.err().is_no_such_key() => {
                return Err(Error::not_found(format!("blob {}", id)))
            }
            Err(e) => return Err(classify(e)),
        };

        let data = out
            .body
            .collect()
            .await
            .map_err(|e| Error::transient(format!("s3 body read: {}", e)))?;
        Ok(data.into_bytes().to_vec())
    }

    /// Server-side copy between two keys of the same bucket.
    pub async fn copy(&self, src: &BlobId, dst: &BlobId) -> Result<()> {
        if self.trace {
            tracing::trace!(src = %src, dst = %dst, "s3 copy");
        }
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src))
            .key(dst.to_string())
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Idempotent delete: a missing key is a success.
    pub async fn delete(&self, id: &BlobId) -> Result<()> {
        if self.trace {
            tracing::trace!(key = %id, "s3 delete");
        }
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(id.to_string())
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(se)) if se.raw().status().as_u16() == 404 => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    pub async fn exists(&self, id: &BlobId) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(id.to_string())
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(se)) if se.err().is_not_found() => Ok(false),
            Err(e) => Err(classify(e)),
        }
    }

    /// Probe used at startup so that bad credentials fail the daemon
    /// instead of every future upload.
    pub async fn check_credentials(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// Split SDK failures into retryable network trouble and permanent
/// auth/bucket errors.
fn classify<E, R>(err: SdkError<E, R>) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            Error::transient(format!("s3: {}", err))
        }
        _ => Error::internal(format!("s3: {}", err)),
    }
}
