//! Server-side logging configuration owned by the engine.
//!
//! The engine owns one fragment file in the server's include directory and
//! rewrites it wholesale (truncate-and-write); user-authored fragments are
//! never merged in. After a rewrite the configuration is validated with the
//! server's own binary and the server is reloaded.

use anyhow::Context;
use camino::Utf8Path;
use tokio::process::Command;

use crate::catalog::{Catalog, Database};

/// The fragment file this engine owns.
pub const MANAGED_FRAGMENT_PATH: &str = "/etc/mysql/mysql.conf.d/backup-binlog.cnf";

const LOG_FILE_PREFIX: &str = "mysql-bin";
const LOG_EXPIRY_SECONDS: u64 = 86_400;
const MAX_LOG_SIZE: &str = "10M";

/// Renders the fragment from catalog state: logging stays on while at
/// least one database wants it, with every opted-out database excluded
/// from the log.
pub fn render_fragment(databases: &[Database]) -> String {
    let mut content = String::from("[mysqld]\n\n");
    if databases.iter().any(|database| database.logging_enabled) {
        content.push_str(&format!("log-bin={LOG_FILE_PREFIX}\n"));
        content.push_str("binlog_format=ROW\n");
        content.push_str(&format!("binlog_expire_logs_seconds={LOG_EXPIRY_SECONDS}\n"));
        content.push_str(&format!("max_binlog_size={MAX_LOG_SIZE}\n"));
        for database in databases.iter().filter(|database| !database.logging_enabled) {
            content.push_str(&format!("binlog-ignore-db={}\n", database.name));
        }
    } else {
        content.push_str("disable-log-bin\n");
    }
    content
}

/// Rewrites the managed fragment from catalog state, validates the full
/// server configuration, and reloads the server to pick it up.
pub async fn apply_managed_fragment(
    catalog: &Catalog,
    fragment_path: &Utf8Path,
) -> anyhow::Result<()> {
    let databases = catalog.list_databases()?;
    let content = render_fragment(&databases);
    tokio::fs::write(fragment_path, &content)
        .await
        .with_context(|| format!("Failed to write the managed fragment {fragment_path:?}"))?;
    tracing::info!("rewrote {fragment_path} for {} database(s)", databases.len());

    validate_server_config().await?;
    reload_server().await
}

async fn validate_server_config() -> anyhow::Result<()> {
    let output = Command::new("mysqld")
        .arg("--validate-config")
        .output()
        .await
        .context("Failed to run mysqld --validate-config")?;
    anyhow::ensure!(
        output.status.success(),
        "The server rejected its configuration: {}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(())
}

async fn reload_server() -> anyhow::Result<()> {
    let output = Command::new("/etc/init.d/mysql")
        .arg("restart")
        .output()
        .await
        .context("Failed to restart the server")?;
    anyhow::ensure!(
        output.status.success(),
        "The server failed to restart: {}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(())
}
