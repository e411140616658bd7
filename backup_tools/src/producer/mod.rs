//! Producers: the upstream half of the backup pipeline.
//!
//! A producer owns one external byte source (a dump tool's stdout or a
//! server log file), cuts it into fixed-size chunks and pushes them into
//! the pipeline channel. When the failure signal fires, a producer stops
//! emitting but keeps consuming its source, so a child process can die
//! without blocking on a full pipe.

pub mod binlog_reader;
pub mod mysql_dump;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use self::binlog_reader::BinlogReader;
pub use self::mysql_dump::MysqlDump;
use crate::config::{BackupMethodKind, Config};

/// Fixed read size of every producer.
pub const CHUNK_SIZE: usize = 5 * 1024 * 1024;

pub type ChunkSender = mpsc::Sender<Bytes>;

pub enum BackupProducer {
    MysqlDump(MysqlDump),
    BinlogReader(BinlogReader),
}

impl BackupProducer {
    /// Producer for a full logical dump, per the configured backup method.
    pub fn for_full_dump(config: &Config, database: &str) -> Self {
        match config.backup_method {
            BackupMethodKind::MysqlDump => {
                Self::MysqlDump(MysqlDump::new(database, &config.connection))
            }
        }
    }

    pub async fn generate(
        self,
        chunks: ChunkSender,
        failure: &CancellationToken,
    ) -> anyhow::Result<()> {
        match self {
            Self::MysqlDump(producer) => producer.generate(chunks, failure).await,
            Self::BinlogReader(producer) => producer.generate(chunks, failure).await,
        }
    }
}

/// Streams a child's stdout into the chunk channel.
///
/// Once `failure` fires the child is killed, but its pipe keeps being read
/// until EOF so the dying child never stalls on it.
pub(crate) async fn stream_child_stdout(
    mut child: Child,
    tool: &str,
    chunks: ChunkSender,
    failure: &CancellationToken,
) -> anyhow::Result<()> {
    let mut stdout = child
        .stdout
        .take()
        .with_context(|| format!("{tool} has no stdout pipe"))?;
    let stderr = crate::process::spawn_stderr_collector(&mut child);

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut aborted = false;
    loop {
        let n = if aborted {
            // only draining the pipe so the dying child can exit
            stdout
                .read(&mut buf)
                .await
                .with_context(|| format!("Failed to read {tool} output"))?
        } else {
            tokio::select! {
                read = stdout.read(&mut buf) => {
                    read.with_context(|| format!("Failed to read {tool} output"))?
                }
                _ = failure.cancelled() => {
                    aborted = true;
                    child
                        .start_kill()
                        .with_context(|| format!("Failed to cancel {tool}"))?;
                    continue;
                }
            }
        };
        if n == 0 {
            break;
        }
        if aborted {
            continue;
        }
        tokio::select! {
            sent = chunks.send(Bytes::copy_from_slice(&buf[..n])) => {
                if sent.is_err() {
                    // the destination went away; stop emitting, drain the child
                    aborted = true;
                    child
                        .start_kill()
                        .with_context(|| format!("Failed to cancel {tool}"))?;
                }
            }
            _ = failure.cancelled() => {
                aborted = true;
                child
                    .start_kill()
                    .with_context(|| format!("Failed to cancel {tool}"))?;
            }
        }
    }

    let status = child
        .wait()
        .await
        .with_context(|| format!("Failed to wait for {tool}"))?;
    if aborted {
        anyhow::bail!("{tool} canceled on peer failure");
    }
    if !status.success() {
        anyhow::bail!(
            "{tool} exited with {status}: {}",
            crate::process::collected_stderr(stderr).await
        );
    }
    Ok(())
}
