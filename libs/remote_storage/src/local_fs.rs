//! Local filesystem working as a backup destination.
//!
//! Artifacts land under a configured root directory, one subdirectory per
//! database. Writes go to a temporary sibling first and are renamed into
//! place only when the whole stream arrived, so readers never observe a
//! half-written artifact.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::{ChunkStream, DownloadError, RemotePath};

pub struct LocalFs {
    storage_root: Utf8PathBuf,
}

impl LocalFs {
    /// Attempts to create local FS storage, along with its root directory.
    pub fn new(root: Utf8PathBuf) -> anyhow::Result<Self> {
        if !root.exists() {
            std::fs::create_dir_all(&root).with_context(|| {
                format!("Failed to create all directories in the given root path {root:?}")
            })?;
        }
        Ok(Self { storage_root: root })
    }

    pub(crate) async fn save(
        &self,
        mut chunks: ChunkStream,
        failure: &CancellationToken,
        to: &RemotePath,
    ) -> anyhow::Result<u64> {
        let target_file_path = to.with_base(&self.storage_root);
        if let Some(parent) = target_file_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create parent directories of {target_file_path:?}"))?;
        }
        let temp_file_path = path_with_temp_suffix(&target_file_path);

        let res = write_all_chunks(&mut chunks, failure, &temp_file_path, &target_file_path).await;
        if res.is_err() {
            // the temp file may not exist if the failure was hit before the
            // first chunk, or may already be renamed
            if let Err(e) = fs::remove_file(&temp_file_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove partial upload {temp_file_path:?}: {e}");
                }
            }
        }
        res
    }

    pub(crate) fn retrieve(&self, paths: &[RemotePath]) -> Result<Vec<Utf8PathBuf>, DownloadError> {
        // nothing is copied, the stored artifacts are served in place
        paths
            .iter()
            .map(|path| {
                let file_path = path.with_base(&self.storage_root);
                if file_path.exists() && file_path.is_file() {
                    Ok(file_path)
                } else {
                    Err(DownloadError::NotFound)
                }
            })
            .collect()
    }
}

async fn write_all_chunks(
    chunks: &mut ChunkStream,
    failure: &CancellationToken,
    temp_file_path: &Utf8Path,
    target_file_path: &Utf8Path,
) -> anyhow::Result<u64> {
    let mut destination = fs::File::create(temp_file_path)
        .await
        .with_context(|| format!("Failed to create the temp file at {temp_file_path:?}"))?;
    let mut bytes_written = 0u64;

    loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Some(chunk) => {
                    destination
                        .write_all(&chunk)
                        .await
                        .with_context(|| format!("Failed to write to the temp file at {temp_file_path:?}"))?;
                    bytes_written += chunk.len() as u64;
                }
                None => {
                    destination.flush().await?;
                    destination.sync_all().await?;
                    drop(destination);
                    fs::rename(temp_file_path, target_file_path)
                        .await
                        .with_context(|| {
                            format!("Failed to rename temp file to the target path {target_file_path:?}")
                        })?;
                    return Ok(bytes_written);
                }
            },
            _ = failure.cancelled() => {
                anyhow::bail!("Upload of {target_file_path:?} aborted on peer failure");
            }
        }
    }
}

fn path_with_temp_suffix(original_path: &Utf8Path) -> Utf8PathBuf {
    let new_extension = match original_path.extension() {
        Some(extension) => format!("{extension}.temp"),
        None => "temp".to_string(),
    };
    original_path.with_extension(new_extension)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use camino_tempfile::tempdir;
    use tokio::sync::mpsc;

    use super::*;

    fn chunk_channel(chunks: &[&[u8]]) -> ChunkStream {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            tx.try_send(Bytes::copy_from_slice(chunk)).unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn save_renames_complete_artifact_into_place() -> anyhow::Result<()> {
        let root = tempdir()?;
        let storage = LocalFs::new(root.path().to_path_buf())?;
        let target = RemotePath::from_string("demo/1_full.sql")?;

        let chunks = chunk_channel(&[b"create table t;", b"\ninsert into t;"]);
        let written = storage
            .save(chunks, &CancellationToken::new(), &target)
            .await?;

        assert_eq!(written, 30);
        let stored = root.path().join("demo").join("1_full.sql");
        assert_eq!(
            std::fs::read_to_string(&stored)?,
            "create table t;\ninsert into t;"
        );
        assert!(
            !path_with_temp_suffix(&stored).exists(),
            "temp file should be renamed away"
        );
        Ok(())
    }

    #[tokio::test]
    async fn failure_signal_discards_partial_artifact() -> anyhow::Result<()> {
        let root = tempdir()?;
        let storage = LocalFs::new(root.path().to_path_buf())?;
        let target = RemotePath::from_string("demo/1_full.sql")?;

        let (tx, rx) = mpsc::channel(1);
        tx.try_send(Bytes::from_static(b"partial")).unwrap();
        let failure = CancellationToken::new();
        failure.cancel();
        // keep tx alive so the channel never reports completion
        let res = storage.save(rx, &failure, &target).await;
        drop(tx);

        assert!(res.is_err());
        let artifact_dir = root.path().join("demo");
        let leftovers: Vec<_> = std::fs::read_dir(artifact_dir)?
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
        Ok(())
    }

    #[tokio::test]
    async fn retrieve_serves_artifacts_in_place() -> anyhow::Result<()> {
        let root = tempdir()?;
        let storage = LocalFs::new(root.path().to_path_buf())?;
        let target = RemotePath::from_string("demo/1_full.sql")?;

        let chunks = chunk_channel(&[b"select 1;"]);
        storage
            .save(chunks, &CancellationToken::new(), &target)
            .await?;

        let retrieved = storage.retrieve(std::slice::from_ref(&target))?;
        assert_eq!(retrieved, vec![root.path().join("demo").join("1_full.sql")]);

        let missing = RemotePath::from_string("demo/2_full.sql")?;
        assert!(matches!(
            storage.retrieve(std::slice::from_ref(&missing)),
            Err(DownloadError::NotFound)
        ));
        Ok(())
    }
}
