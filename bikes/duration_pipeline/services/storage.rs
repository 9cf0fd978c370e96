use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::config::StorageSettings;

/// Errors raised by object stores.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Local file could not be read or written.
    #[error("io error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Network or HTTP client failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The store refused the object.
    #[error("upload of {location} rejected: {reason}")]
    Rejected {
        /// Destination.
        location: String,
        /// Status and message returned by the store.
        reason: String,
    },
}

/// Bucket plus object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    /// Bucket name.
    pub bucket: String,
    /// Object key inside the bucket.
    pub key: String,
}

impl ObjectLocation {
    /// Creates a location.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.key)
    }
}

/// Destination for pipeline artifacts. Uploads overwrite existing objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads the local file at `source` to `location`.
    async fn upload_file(
        &self,
        location: &ObjectLocation,
        source: &Path,
        content_type: &str,
    ) -> Result<(), StorageError>;
}

async fn read_source(source: &Path) -> Result<Vec<u8>, StorageError> {
    fs::read(source).await.map_err(|source_err| StorageError::Io {
        path: source.to_path_buf(),
        source: source_err,
    })
}

/// Cloud Storage JSON API client using simple media uploads.
#[derive(Debug, Clone)]
pub struct GcsObjectStore {
    client: Client,
    endpoint: String,
    access_token: Option<String>,
}

impl GcsObjectStore {
    /// Builds a client from storage settings and an optional OAuth token.
    pub fn new(
        settings: &StorageSettings,
        access_token: Option<String>,
    ) -> Result<Self, StorageError> {
        let client = Client::builder()
            .user_agent("bikes-duration-pipeline/0.1")
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|err| StorageError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            access_token,
        })
    }

    fn upload_url(&self, bucket: &str) -> String {
        format!("{}/upload/storage/v1/b/{bucket}/o", self.endpoint)
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn upload_file(
        &self,
        location: &ObjectLocation,
        source: &Path,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let bytes = read_source(source).await?;
        let mut request = self
            .client
            .post(self.upload_url(&location.bucket))
            .query(&[("uploadType", "media"), ("name", location.key.as_str())])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| StorageError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                location: location.to_string(),
                reason: format!("{status}: {}", body.chars().take(512).collect::<String>()),
            });
        }
        Ok(())
    }
}

/// Filesystem store laid out as `<root>/<bucket>/<key>`.
///
/// Each object is written to a sibling `.partial` file first and renamed into
/// place, so readers never observe a half-written artifact.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path an object lives at.
    #[must_use]
    pub fn object_path(&self, location: &ObjectLocation) -> PathBuf {
        self.root.join(&location.bucket).join(&location.key)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload_file(
        &self,
        location: &ObjectLocation,
        source: &Path,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let bytes = read_source(source).await?;
        let target = self.object_path(location);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StorageError::Io { path, source }
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        let mut partial = target.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        fs::write(&partial, bytes).await.map_err(io_err(&partial))?;
        fs::rename(&partial, &target).await.map_err(io_err(&target))?;
        Ok(())
    }
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<IndexMap<ObjectLocation, StoredObject>>,
    failures: Mutex<IndexMap<String, String>>,
}

/// An object held by [`MemoryObjectStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object bytes.
    pub bytes: Vec<u8>,
    /// Declared content type.
    pub content_type: String,
}

impl MemoryObjectStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object directly, e.g. an artifact from an earlier run.
    pub fn put(&self, location: ObjectLocation, bytes: impl Into<Vec<u8>>, content_type: &str) {
        self.objects.lock().insert(
            location,
            StoredObject {
                bytes: bytes.into(),
                content_type: content_type.to_string(),
            },
        );
    }

    /// Makes uploads to `key` fail with `reason`.
    #[must_use]
    pub fn failing_key(self, key: impl Into<String>, reason: impl Into<String>) -> Self {
        self.failures.lock().insert(key.into(), reason.into());
        self
    }

    /// Snapshot of every stored object, in upload order.
    #[must_use]
    pub fn objects(&self) -> Vec<(ObjectLocation, StoredObject)> {
        self.objects
            .lock()
            .iter()
            .map(|(location, object)| (location.clone(), object.clone()))
            .collect()
    }

    /// Object at `location`.
    #[must_use]
    pub fn get(&self, location: &ObjectLocation) -> Option<StoredObject> {
        self.objects.lock().get(location).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload_file(
        &self,
        location: &ObjectLocation,
        source: &Path,
        content_type: &str,
    ) -> Result<(), StorageError> {
        if let Some(reason) = self.failures.lock().get(&location.key) {
            return Err(StorageError::Rejected {
                location: location.to_string(),
                reason: reason.clone(),
            });
        }
        let bytes = read_source(source).await?;
        self.put(location.clone(), bytes, content_type);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::stub_server::StubServer;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn location_renders_as_gs_uri() {
        let location = ObjectLocation::new("bucket-a", "model.json");
        assert_eq!(location.to_string(), "gs://bucket-a/model.json");
    }

    #[test]
    fn gcs_upload_url_targets_media_endpoint() {
        let settings = StorageSettings {
            endpoint: "http://127.0.0.1:4443/".into(),
            ..StorageSettings::default()
        };
        let store = GcsObjectStore::new(&settings, None).unwrap();
        assert_eq!(
            store.upload_url("bikes"),
            "http://127.0.0.1:4443/upload/storage/v1/b/bikes/o"
        );
    }

    #[tokio::test]
    async fn local_store_overwrites_objects() {
        let dir = tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().join("objects"));
        let location = ObjectLocation::new("bikes", "metrics.json");
        let source = dir.path().join("metrics.json");

        std::fs::write(&source, br#"{"mse":1.0}"#).unwrap();
        store.upload_file(&location, &source, "application/json").await.unwrap();
        std::fs::write(&source, br#"{"mse":2.0}"#).unwrap();
        store.upload_file(&location, &source, "application/json").await.unwrap();

        let target = store.object_path(&location);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), r#"{"mse":2.0}"#);
        assert!(!target.with_file_name("metrics.json.partial").exists());
    }

    #[tokio::test]
    async fn missing_source_is_an_io_error() {
        let dir = tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store
            .upload_file(
                &ObjectLocation::new("b", "k"),
                &dir.path().join("absent.json"),
                "application/json",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
    }

    #[tokio::test]
    async fn memory_store_injects_failures_per_key() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("model.json");
        std::fs::write(&source, b"{}").unwrap();
        let store = MemoryObjectStore::new().failing_key("metrics.json", "quota");

        store
            .upload_file(&ObjectLocation::new("b", "model.json"), &source, "application/json")
            .await
            .unwrap();
        let err = store
            .upload_file(&ObjectLocation::new("b", "metrics.json"), &source, "application/json")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota"));
        assert_eq!(store.objects().len(), 1);
        assert_eq!(
            store.get(&ObjectLocation::new("b", "model.json")).unwrap().bytes,
            b"{}".to_vec()
        );
    }

    #[tokio::test]
    async fn gcs_upload_posts_media_with_bearer_token() {
        let server = StubServer::start(vec![(200, json!({ "name": "model.json" }))]).await;
        let settings = StorageSettings {
            endpoint: server.endpoint.clone(),
            ..StorageSettings::default()
        };
        let store = GcsObjectStore::new(&settings, Some("ya29.token".into())).unwrap();
        let dir = tempdir().unwrap();
        let source = dir.path().join("model.json");
        std::fs::write(&source, br#"{"intercept":300.0}"#).unwrap();

        let location = ObjectLocation::new("bikes-artifacts", "model.json");
        store
            .upload_file(&location, &source, "application/json")
            .await
            .unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/upload/storage/v1/b/bikes-artifacts/o");
        assert_eq!(request.query, "uploadType=media&name=model.json");
        assert_eq!(request.authorization.as_deref(), Some("Bearer ya29.token"));
        assert_eq!(request.content_type.as_deref(), Some("application/json"));
        assert_eq!(request.body, r#"{"intercept":300.0}"#);
    }

    #[tokio::test]
    async fn gcs_rejection_names_the_object() {
        let server = StubServer::start(vec![(
            403,
            json!({ "error": { "message": "caller does not have storage.objects.create access" } }),
        )])
        .await;
        let settings = StorageSettings {
            endpoint: server.endpoint.clone(),
            ..StorageSettings::default()
        };
        let store = GcsObjectStore::new(&settings, None).unwrap();
        let dir = tempdir().unwrap();
        let source = dir.path().join("metrics.json");
        std::fs::write(&source, b"{}").unwrap();

        let err = store
            .upload_file(&ObjectLocation::new("b", "metrics.json"), &source, "application/json")
            .await
            .unwrap_err();
        match err {
            StorageError::Rejected { location, reason } => {
                assert_eq!(location, "gs://b/metrics.json");
                assert!(reason.starts_with("403"));
                assert!(reason.contains("storage.objects.create"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(server.requests()[0].authorization.is_none());
    }
}
