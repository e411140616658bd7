//! Full logical dumps through `mysqldump`.

use std::process::Stdio;

use anyhow::Context;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{stream_child_stdout, ChunkSender};
use crate::config::ConnectionConfig;

pub struct MysqlDump {
    database: String,
    connection: ConnectionConfig,
}

impl MysqlDump {
    pub fn new(database: &str, connection: &ConnectionConfig) -> Self {
        Self {
            database: database.to_string(),
            connection: connection.clone(),
        }
    }

    pub(super) async fn generate(
        self,
        chunks: ChunkSender,
        failure: &CancellationToken,
    ) -> anyhow::Result<()> {
        let child = Command::new("mysqldump")
            .arg(format!("-u{}", self.connection.user))
            .arg(format!("-p{}", self.connection.password))
            .arg(format!("--host={}", self.connection.host))
            .arg(format!("--port={}", self.connection.port))
            // writes keep running while the dump reads one consistent snapshot
            .arg("--single-transaction")
            .arg(&self.database)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn mysqldump")?;

        tracing::info!("dumping database '{}' through mysqldump", self.database);
        stream_child_stdout(child, "mysqldump", chunks, failure).await
    }
}
