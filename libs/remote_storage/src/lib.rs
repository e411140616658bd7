//! A set of pluggable destinations a backup byte stream can be stored to
//! and retrieved from.
//!
//! Two variants exist: a local filesystem directory and a Dropbox app
//! folder driven through chunked upload sessions. Both consume the same
//! bounded chunk channel and observe the same failure signal, so the
//! pipeline that feeds them does not care which one it talks to.

mod dropbox_bucket;
mod local_fs;

use std::num::NonZeroUsize;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use self::dropbox_bucket::DropboxBucket;
pub use self::local_fs::LocalFs;

/// Default cap on concurrent `upload_session/append_v2` requests.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 5;

/// Byte chunks of one artifact, delivered in production order.
///
/// The channel is bounded; a slow destination therefore backpressures the
/// producer through it.
pub type ChunkStream = mpsc::Receiver<Bytes>;

/// Path on the remote storage, relative to some root, used as an artifact
/// name. Cannot be empty or absolute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemotePath(Utf8PathBuf);

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl RemotePath {
    pub fn new(relative_path: &Utf8Path) -> anyhow::Result<Self> {
        anyhow::ensure!(
            relative_path.is_relative(),
            "Path {relative_path:?} is not relative"
        );
        Ok(Self(relative_path.to_path_buf()))
    }

    pub fn from_string(relative_path: &str) -> anyhow::Result<Self> {
        Self::new(Utf8Path::new(relative_path))
    }

    pub fn with_base(&self, base_path: &Utf8Path) -> Utf8PathBuf {
        base_path.join(&self.0)
    }

    /// Last path segment, i.e. the artifact filename.
    pub fn object_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn get_path(&self) -> &Utf8PathBuf {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The artifact is not present on the remote storage.
    #[error("No artifact found for the remote path")]
    NotFound,
    /// The download was aborted through the failure signal.
    #[error("Download cancelled")]
    Cancelled,
    /// Transport or local I/O failure; the wrapped error carries the chain.
    #[error("Failed to download an artifact: {0:#}")]
    Other(#[source] anyhow::Error),
}

/// External backup storage configuration, enough for creating a client for
/// that storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStorageConfig {
    pub storage: RemoteStorageKind,
}

/// A kind of a remote storage to connect to, with its connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStorageKind {
    /// Storage based on local file system.
    /// Specify a root folder to place all stored artifacts into.
    LocalFs(Utf8PathBuf),
    /// Storage based on a Dropbox app folder, with chunked upload sessions.
    Dropbox(DropboxConfig),
}

/// Dropbox app folder coordinates.
#[derive(Clone, PartialEq, Eq)]
pub struct DropboxConfig {
    pub access_token: String,
    /// Folder inside the app root all artifacts are committed under.
    pub root_path: String,
    pub concurrency_limit: NonZeroUsize,
}

impl std::fmt::Debug for DropboxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log the bearer token
        f.debug_struct("DropboxConfig")
            .field("root_path", &self.root_path)
            .field("concurrency_limit", &self.concurrency_limit)
            .finish()
    }
}

/// Destination dispatch: every variant stores whole named artifacts and
/// hands back local paths on retrieval.
pub enum GenericRemoteStorage {
    LocalFs(LocalFs),
    Dropbox(DropboxBucket),
}

impl GenericRemoteStorage {
    pub fn from_config(config: &RemoteStorageConfig) -> anyhow::Result<Self> {
        Ok(match &config.storage {
            RemoteStorageKind::LocalFs(root) => {
                tracing::info!("Using fs root '{root}' as a remote storage");
                Self::LocalFs(LocalFs::new(root.clone())?)
            }
            RemoteStorageKind::Dropbox(dropbox_config) => {
                tracing::info!(
                    "Using dropbox folder '{}' as a remote storage",
                    dropbox_config.root_path
                );
                Self::Dropbox(DropboxBucket::new(dropbox_config)?)
            }
        })
    }

    /// Stores the artifact under `to`, consuming `chunks` until the channel
    /// closes. Returns the number of bytes stored.
    ///
    /// If `failure` fires the destination keeps draining the channel so the
    /// producer can exit, but transmits nothing further and discards any
    /// partially assembled state before returning an error.
    pub async fn save(
        &self,
        chunks: ChunkStream,
        failure: &CancellationToken,
        to: &RemotePath,
    ) -> anyhow::Result<u64> {
        match self {
            Self::LocalFs(s) => s.save(chunks, failure, to).await,
            Self::Dropbox(s) => s.save(chunks, failure, to).await,
        }
    }

    /// Makes every named artifact readable on the local filesystem and
    /// returns the local paths, in argument order.
    pub async fn retrieve(&self, paths: &[RemotePath]) -> Result<Vec<Utf8PathBuf>, DownloadError> {
        match self {
            Self::LocalFs(s) => s.retrieve(paths),
            Self::Dropbox(s) => s.retrieve(paths).await,
        }
    }

    /// Releases whatever [`Self::retrieve`] materialized locally. A no-op
    /// for destinations that serve files in place.
    pub async fn delete_retrievals(&self, local_paths: &[Utf8PathBuf]) -> anyhow::Result<()> {
        match self {
            Self::LocalFs(_) => Ok(()),
            Self::Dropbox(s) => s.delete_retrievals(local_paths).await,
        }
    }
}
