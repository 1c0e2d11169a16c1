//! Evidence storage for checklist photos and signatures.
//!
//! Uploads go to a storage bucket over HTTP when one is configured. If the
//! bucket is unreachable the file is kept on local disk instead and the result
//! is flagged as not durable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::EvidenceError;

/// Where an uploaded file ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvidence {
    pub key: String,
    pub url: String,
    /// False when the file only exists on this server's disk.
    pub durable: bool,
}

#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredEvidence, EvidenceError>;
}

/// Object key for a file attached to a checklist answer.
pub fn evidence_key(checklist_id: Uuid, question_id: Uuid, extension: &str) -> String {
    let ext = extension.trim_start_matches('.');
    format!("checklists/{checklist_id}/{question_id}-{}.{ext}", Uuid::new_v4())
}

/// File extension for a content type.
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type.split(';').next().unwrap_or("").trim() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/heic" => "heic",
        "image/svg+xml" => "svg",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}

/// Reject keys that could escape the storage root.
pub fn validate_key(key: &str) -> Result<(), EvidenceError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(EvidenceError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Supabase-style storage bucket.
pub struct BucketStore {
    config: StorageConfig,
    client: reqwest::Client,
}

impl BucketStore {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn base(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    pub fn upload_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{key}", self.base(), self.config.bucket)
    }

    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{key}",
            self.base(),
            self.config.bucket
        )
    }
}

#[async_trait]
impl EvidenceStore for BucketStore {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredEvidence, EvidenceError> {
        validate_key(key)?;
        let resp = self
            .client
            .post(self.upload_url(key))
            .bearer_auth(self.config.key.expose_secret())
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .map_err(|e| EvidenceError::Upload(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EvidenceError::Upload(format!("bucket returned {status}: {body}")));
        }

        debug!(key, "Uploaded evidence to bucket");
        Ok(StoredEvidence {
            key: key.to_string(),
            url: self.public_url(key),
            durable: true,
        })
    }
}

/// Files under a local directory, served back at `url_prefix`.
pub struct LocalStore {
    root: PathBuf,
    url_prefix: String,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, EvidenceError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    pub async fn read(&self, key: &str) -> Result<Vec<u8>, EvidenceError> {
        Ok(fs::read(self.path_for(key)?).await?)
    }
}

#[async_trait]
impl EvidenceStore for LocalStore {
    async fn put(
        &self,
        key: &str,
        _content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredEvidence, EvidenceError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        debug!(path = %path.display(), "Stored evidence locally");
        Ok(StoredEvidence {
            key: key.to_string(),
            url: format!("{}/{key}", self.url_prefix.trim_end_matches('/')),
            durable: false,
        })
    }
}

/// Bucket first, local disk when the bucket fails or is not configured.
pub struct FallbackStore {
    primary: Option<Box<dyn EvidenceStore>>,
    local: LocalStore,
}

impl FallbackStore {
    pub fn new(primary: Option<Box<dyn EvidenceStore>>, local: LocalStore) -> Self {
        Self { primary, local }
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }
}

#[async_trait]
impl EvidenceStore for FallbackStore {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredEvidence, EvidenceError> {
        validate_key(key)?;
        if let Some(primary) = &self.primary {
            match primary.put(key, content_type, bytes.clone()).await {
                Ok(stored) => return Ok(stored),
                Err(e) => warn!(key, error = %e, "Bucket upload failed, keeping evidence locally"),
            }
        }
        self.local.put(key, content_type, bytes).await
    }
}
