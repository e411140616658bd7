//! Incremental captures: reads one server binary log file from a byte
//! offset.
//!
//! The log file is opened directly from the server's log directory; the
//! server keeps appending to newer logs while sealed ones stay immutable,
//! so a plain read from the recorded offset yields exactly the delta that
//! has not been captured yet.

use std::io::SeekFrom;

use anyhow::Context;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use super::{ChunkSender, CHUNK_SIZE};

pub struct BinlogReader {
    log_path: Utf8PathBuf,
    starting_position: u64,
}

impl BinlogReader {
    pub fn new(binlog_dir: &Utf8Path, log_name: &str, starting_position: u64) -> Self {
        Self {
            log_path: binlog_dir.join(log_name),
            starting_position,
        }
    }

    pub(super) async fn generate(
        self,
        chunks: ChunkSender,
        failure: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut file = fs::File::open(&self.log_path)
            .await
            .with_context(|| format!("Failed to open binary log {:?}", self.log_path))?;
        if self.starting_position > 0 {
            file.seek(SeekFrom::Start(self.starting_position))
                .await
                .with_context(|| {
                    format!(
                        "Failed to seek binary log {:?} to {}",
                        self.log_path, self.starting_position
                    )
                })?;
        }
        tracing::info!(
            "reading binary log {:?} from position {}",
            self.log_path,
            self.starting_position
        );

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = tokio::select! {
                read = file.read(&mut buf) => {
                    read.with_context(|| format!("Failed to read binary log {:?}", self.log_path))?
                }
                _ = failure.cancelled() => {
                    // a plain file, nothing needs draining
                    anyhow::bail!("Read of {:?} canceled on peer failure", self.log_path);
                }
            };
            if n == 0 {
                return Ok(());
            }
            tokio::select! {
                sent = chunks.send(Bytes::copy_from_slice(&buf[..n])) => {
                    if sent.is_err() {
                        anyhow::bail!(
                            "Read of {:?} canceled: the destination went away",
                            self.log_path
                        );
                    }
                }
                _ = failure.cancelled() => {
                    anyhow::bail!("Read of {:?} canceled on peer failure", self.log_path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use camino_tempfile::tempdir;
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn reads_from_the_recorded_offset() -> anyhow::Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("mysql-bin.000001"), b"headerchanges")?;

        let (tx, mut rx) = mpsc::channel(4);
        let reader = BinlogReader::new(dir.path(), "mysql-bin.000001", 6);
        reader.generate(tx, &CancellationToken::new()).await?;

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"changes");
        Ok(())
    }

    #[tokio::test]
    async fn missing_log_file_is_an_error() {
        let dir = tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(1);

        let reader = BinlogReader::new(dir.path(), "mysql-bin.000042", 0);
        let res = reader.generate(tx, &CancellationToken::new()).await;

        assert!(res.is_err());
    }

    #[tokio::test]
    async fn failure_signal_stops_a_blocked_send() -> anyhow::Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("mysql-bin.000001"), vec![0u8; 64])?;

        // fill the channel up front, so the reader's send can only block
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(bytes::Bytes::from_static(b"stuck")).unwrap();
        let failure = CancellationToken::new();

        let reader = BinlogReader::new(dir.path(), "mysql-bin.000001", 0);
        let generate = reader.generate(tx.clone(), &failure);
        let cancel_soon = async {
            tokio::task::yield_now().await;
            failure.cancel();
        };
        let (res, ()) = tokio::join!(generate, cancel_soon);

        let message = format!("{:#}", res.unwrap_err());
        assert!(message.contains("canceled"), "got: {message}");
        Ok(())
    }
}
