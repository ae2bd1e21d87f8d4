//! Content-addressed blob storage for raw uploads.
//!
//! Blobs are identified by the lowercase BLAKE3 hex of their exact bytes and
//! stored under `{root}/{cid[..2]}/{cid}.pdf`. Writes are idempotent: putting
//! bytes that already exist is a no-op that reports `existed`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;

/// Canonical content identifier (BLAKE3 lowercase hex of exact bytes).
pub type Cid = String;

/// Minimal metadata returned by `head` about a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub cid: Cid,
    pub size_bytes: u64,
}

/// Result returned by `put` describing whether the blob already existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub cid: Cid,
    pub size_bytes: u64,
    pub existed: bool,
}

/// Errors emitted by blob storage operations.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found")]
    NotFound,
    #[error("invalid cid: {0}")]
    InvalidCid(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::Io(err.to_string())
    }
}

/// Validate a candidate CID: lowercase hex, long enough to shard.
pub fn validate_cid(cid: &str) -> Result<(), BlobError> {
    if cid.len() < 2 {
        return Err(BlobError::InvalidCid(cid.to_string()));
    }
    if !cid
        .chars()
        .all(|c: char| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(BlobError::InvalidCid(cid.to_string()));
    }
    Ok(())
}

/// Compute the BLAKE3 CID for a byte slice.
pub fn blake3_cid(bytes: &[u8]) -> Cid {
    blake3::hash(bytes).to_hex().to_string()
}

/// Trait abstracting over blob storage backends.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the bytes and return the canonical `PutResult`. Idempotent.
    async fn put(&self, bytes: &[u8]) -> Result<PutResult, BlobError>;

    /// Fetch the bytes for `cid` or `BlobError::NotFound`.
    async fn get(&self, cid: &str) -> Result<Vec<u8>, BlobError>;

    /// Metadata for `cid` if present.
    async fn head(&self, cid: &str) -> Result<Option<BlobMeta>, BlobError>;

    /// Delete the blob if present. `Ok(true)` when something was removed.
    async fn delete(&self, cid: &str) -> Result<bool, BlobError>;
}

/// Filesystem-backed store with two-character prefix sharding.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn blob_path(&self, cid: &str) -> Result<PathBuf, BlobError> {
        validate_cid(cid)?;
        let mut path = self.root.clone();
        path.push(&cid[..2]);
        path.push(format!("{cid}.pdf"));
        Ok(path)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<PutResult, BlobError> {
        let cid = blake3_cid(bytes);
        let path = self.blob_path(&cid)?;
        if fs::try_exists(&path).await? {
            return Ok(PutResult {
                cid,
                size_bytes: bytes.len() as u64,
                existed: true,
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write through a sibling temp file so a crashed put never leaves a
        // half-written blob under its final name.
        let tmp = path.with_extension("pdf.part");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(PutResult {
            cid,
            size_bytes: bytes.len() as u64,
            existed: false,
        })
    }

    async fn get(&self, cid: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.blob_path(cid)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    async fn head(&self, cid: &str) -> Result<Option<BlobMeta>, BlobError> {
        let path = self.blob_path(cid)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(BlobMeta {
                cid: cid.to_string(),
                size_bytes: meta.len(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, cid: &str) -> Result<bool, BlobError> {
        let path = self.blob_path(cid)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
