//! Hand-off of the finished archive to object storage.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, AttributeValue, Attributes, ClientOptions, ObjectStore};
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::io::AsyncWriteExt;

use crate::{MosaicError, MosaicResult};

/// Content type of `PMTiles` archives.
pub const PMTILES_CONTENT_TYPE: &str = "application/vnd.pmtiles";
/// Content type of the error log uploaded next to the archive.
pub const ERROR_LOG_CONTENT_TYPE: &str = "text/plain";

/// AWS S3.
pub const DEFAULT_S3_ENDPOINT: &str = "s3.amazonaws.com";
/// Signing region used when none is configured.
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Copies a local file to remote storage.
pub trait ArchiveUploader: Send + Sync {
    /// Uploads `local_path` as `key`, returning the number of bytes sent.
    fn upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> impl Future<Output = MosaicResult<u64>> + Send;
}

/// Connection settings of an S3-compatible bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    /// Host name or URL. A bare host name is reached over https.
    pub endpoint: String,
    /// Bucket receiving the objects.
    pub bucket: String,
    /// Signing region.
    pub region: String,
    /// Required, as is the secret key.
    pub access_key: Option<String>,
    /// Secret matching `access_key`.
    pub secret_key: Option<String>,
}

impl S3Config {
    /// Fails when credentials are missing or empty.
    pub fn validate(&self) -> MosaicResult<()> {
        if self.bucket.is_empty() {
            return Err(MosaicError::Config("S3 bucket name is empty".into()));
        }
        let missing = |v: &Option<String>| v.as_deref().is_none_or(str::is_empty);
        if missing(&self.access_key) || missing(&self.secret_key) {
            return Err(MosaicError::Config(format!(
                "uploading to bucket {} requires an S3 access key and secret key",
                self.bucket
            )));
        }
        Ok(())
    }

    fn endpoint_url(&self) -> String {
        if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else {
            format!("https://{}", self.endpoint)
        }
    }
}

/// Multipart upload to an S3-compatible store with a public-read ACL.
#[derive(Debug)]
pub struct S3Uploader {
    store: Arc<dyn ObjectStore>,
}

impl S3Uploader {
    /// Validates `config` and builds the client. No request is made.
    pub fn new(config: &S3Config) -> MosaicResult<Self> {
        config.validate()?;
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-acl", HeaderValue::from_static("public-read"));

        let mut builder = AmazonS3Builder::new()
            .with_endpoint(config.endpoint_url())
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_client_options(ClientOptions::new().with_default_headers(headers));
        if let (Some(key), Some(secret)) = (&config.access_key, &config.secret_key) {
            builder = builder
                .with_access_key_id(key)
                .with_secret_access_key(secret);
        }
        Ok(Self {
            store: Arc::new(builder.build()?),
        })
    }

    /// Uploads into an already configured store.
    #[must_use]
    pub fn from_store(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

impl ArchiveUploader for S3Uploader {
    async fn upload(&self, local_path: &Path, key: &str, content_type: &str) -> MosaicResult<u64> {
        let mut file = tokio::fs::File::open(local_path).await?;
        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(content_type.to_string()),
        );

        log::info!("Uploading {} to {key}", local_path.display());
        let mut writer =
            BufWriter::new(Arc::clone(&self.store), ObjectPath::from(key)).with_attributes(attributes);
        let size = tokio::io::copy(&mut file, &mut writer).await?;
        writer.shutdown().await?;
        log::info!("Uploaded {size} bytes to {key}");
        Ok(size)
    }
}

/// Uploads the error log at `path` as `key`, unless it is missing or empty.
///
/// Returns the number of bytes sent, or `None` when there was nothing to upload.
pub async fn upload_error_log<U: ArchiveUploader>(
    uploader: &U,
    path: &Path,
    key: &str,
) -> MosaicResult<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.len() > 0 => {
            Ok(Some(uploader.upload(path, key, ERROR_LOG_CONTENT_TYPE).await?))
        }
        Ok(_) => {
            log::info!("{} is empty, not uploading it", path.display());
            Ok(None)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use object_store::GetOptions;
    use object_store::memory::InMemory;

    use super::*;

    fn config() -> S3Config {
        S3Config {
            endpoint: DEFAULT_S3_ENDPOINT.to_string(),
            bucket: "oin-hotosm-temp".to_string(),
            region: DEFAULT_S3_REGION.to_string(),
            access_key: Some("key".to_string()),
            secret_key: Some("secret".to_string()),
        }
    }

    #[test]
    fn missing_credentials_are_rejected() {
        assert!(config().validate().is_ok());
        let no_secret = S3Config {
            secret_key: None,
            ..config()
        };
        assert!(matches!(no_secret.validate(), Err(MosaicError::Config(_))));
        let empty_key = S3Config {
            access_key: Some(String::new()),
            ..config()
        };
        assert!(S3Uploader::new(&empty_key).is_err());
    }

    #[test]
    fn endpoint_gets_scheme() {
        assert_eq!(config().endpoint_url(), "https://s3.amazonaws.com");
        let local = S3Config {
            endpoint: "http://localhost:9000".to_string(),
            ..config()
        };
        assert_eq!(local.endpoint_url(), "http://localhost:9000");
        assert!(S3Uploader::new(&local).is_ok());
    }

    #[tokio::test]
    async fn uploads_file_with_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mosaic.pmtiles");
        let payload: Vec<u8> = (0..100_000_u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let store = Arc::new(InMemory::new());
        let uploader = S3Uploader::from_store(store.clone());
        let size = uploader
            .upload(&path, "global-mosaic.pmtiles", PMTILES_CONTENT_TYPE)
            .await
            .unwrap();
        assert_eq!(size, payload.len() as u64);

        let result = store
            .get_opts(&ObjectPath::from("global-mosaic.pmtiles"), GetOptions::default())
            .await
            .unwrap();
        assert_eq!(
            result.attributes.get(&Attribute::ContentType),
            Some(&AttributeValue::from(PMTILES_CONTENT_TYPE))
        );
        assert_eq!(result.bytes().await.unwrap().as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn missing_local_file() {
        let uploader = S3Uploader::from_store(Arc::new(InMemory::new()));
        let err = uploader
            .upload(Path::new("/no/such/file"), "k", PMTILES_CONTENT_TYPE)
            .await
            .unwrap_err();
        assert!(matches!(err, MosaicError::Io(_)));
    }

    #[tokio::test]
    async fn error_log_is_uploaded_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("global_mosaic_error.log");
        std::fs::write(&path, "[WARN] Skipping catalog item\n").unwrap();

        let store = Arc::new(InMemory::new());
        let uploader = S3Uploader::from_store(store.clone());
        let sent = upload_error_log(&uploader, &path, "global_mosaic_error.log")
            .await
            .unwrap();
        assert_eq!(sent, Some(29));

        let result = store
            .get_opts(&ObjectPath::from("global_mosaic_error.log"), GetOptions::default())
            .await
            .unwrap();
        assert_eq!(
            result.attributes.get(&Attribute::ContentType),
            Some(&AttributeValue::from(ERROR_LOG_CONTENT_TYPE))
        );
    }

    #[tokio::test]
    async fn empty_or_missing_error_log_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.log");
        std::fs::write(&empty, "").unwrap();

        let store = Arc::new(InMemory::new());
        let uploader = S3Uploader::from_store(store.clone());
        assert_eq!(upload_error_log(&uploader, &empty, "empty.log").await.unwrap(), None);
        let missing = dir.path().join("missing.log");
        assert_eq!(upload_error_log(&uploader, &missing, "missing.log").await.unwrap(), None);
        assert!(
            store
                .get_opts(&ObjectPath::from("empty.log"), GetOptions::default())
                .await
                .is_err()
        );
    }
}
