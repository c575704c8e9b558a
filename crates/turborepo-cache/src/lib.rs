#![deny(clippy::all)]

//! Two-tier content-addressed artifact cache.
//!
//! Artifacts are tarballs keyed by task fingerprint. Reads consult the
//! local filesystem tier first and fall back to the remote HTTP tier,
//! writing remote hits through to disk. Writes go to both tiers (the
//! remote one asynchronously, see [`AsyncCache`]). Cache failures are
//! deliberately non-fatal: a corrupt local entry is evicted and treated
//! as a miss, and remote transport errors degrade to misses on read and
//! warnings on write.

mod async_cache;
/// The core cache creation and restoration logic.
pub mod cache_archive;
/// File system cache
pub mod fs;
/// Remote cache
pub mod http;
/// A wrapper that allows reads and writes from the file system and remote
/// cache.
mod multiplexer;
/// Cache signature authentication lets users provide a private key to sign
/// their cache payloads.
pub mod signature_authentication;

pub use async_cache::AsyncCache;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signature_authentication::SignatureError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error(
        "artifact verification failed: downloaded artifact is missing required x-artifact-tag \
         header"
    )]
    ArtifactTagMissing,
    #[error("invalid artifact verification tag")]
    InvalidTag,
    #[error("cannot untar file to {0}")]
    InvalidFilePath(String),
    #[error("failed to contact remote cache: {0}")]
    ApiClientError(Box<turborepo_api_client::Error>),
    #[error("the cache artifact for {0} was too large to upload within the timeout")]
    TimeoutError(String),
    #[error("could not connect to the cache")]
    ConnectError,
    #[error("signing artifact failed: {0}")]
    SignatureError(#[from] SignatureError),
    #[error("invalid duration")]
    InvalidDuration,
    #[error("Invalid file path: {0}")]
    PathError(#[from] turbopath::PathError),
    #[error("links in the cache are cyclic")]
    CycleDetected,
    #[error("Invalid file path, link target does not exist: {0}")]
    LinkTargetDoesNotExist(String),
    #[error("attempted to restore unsupported file type: {0:?}")]
    RestoreUnsupportedFileType(tar::EntryType),
    // We don't pass the `FileType` because there's no simple
    // way to display it nicely.
    #[error("attempted to create unsupported file type")]
    CreateUnsupportedFileType,
    #[error("tar attempts to write outside of directory: {0}")]
    LinkOutsideOfDirectory(String),
    #[error("Invalid cache metadata file")]
    InvalidMetadata(serde_json::Error),
    #[error("Failed to write cache metadata file")]
    MetadataWriteFailure(serde_json::Error),
    #[error("Unable to perform write as cache is shutting down")]
    CacheShuttingDown,
}

impl From<turborepo_api_client::Error> for CacheError {
    fn from(value: turborepo_api_client::Error) -> Self {
        CacheError::ApiClientError(Box::new(value))
    }
}

impl CacheError {
    /// A corrupt artifact: the entry itself is bad and should be evicted,
    /// as opposed to a transport problem that may clear up.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            CacheError::InvalidTag
                | CacheError::ArtifactTagMissing
                | CacheError::InvalidFilePath(_)
                | CacheError::CycleDetected
                | CacheError::LinkTargetDoesNotExist(_)
                | CacheError::LinkOutsideOfDirectory(_)
                | CacheError::RestoreUnsupportedFileType(_)
                | CacheError::InvalidMetadata(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Copy, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Copy)]
pub struct CacheHitMetadata {
    pub source: CacheSource,
    pub time_saved: u64,
}

#[derive(Clone, Debug)]
pub struct CacheOpts {
    pub cache_dir: Utf8PathBuf,
    pub remote_cache_read_only: bool,
    pub skip_remote: bool,
    pub skip_filesystem: bool,
    pub workers: u32,
    pub remote_cache_opts: Option<RemoteCacheOpts>,
}

impl Default for CacheOpts {
    fn default() -> Self {
        Self {
            cache_dir: Utf8PathBuf::from(".turbo/cache"),
            remote_cache_read_only: false,
            skip_remote: false,
            skip_filesystem: false,
            workers: 10,
            remote_cache_opts: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteCacheOpts {
    pub team_id: Option<String>,
    pub signature: bool,
}

impl RemoteCacheOpts {
    pub fn new(team_id: Option<String>, signature: bool) -> Self {
        Self { team_id, signature }
    }
}
