//! Administrative access to the backed-up server.
//!
//! One capability set behind an enum, one variant per supported server
//! family; the `RDBMS` environment variable selects the variant. Everything
//! the orchestrators need from the server goes through here: log
//! coordinates, log listings, rotation and purging, and restoring a dump.

pub mod mysql;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};

use self::mysql::MysqlServer;
use crate::config::{ConnectionConfig, RdbmsKind};

/// The server's current append point in its binary log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogCoordinate {
    pub log_name: String,
    pub position: u64,
}

/// One binary log file as the server reports it, in server order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLog {
    pub name: String,
    pub size: u64,
    pub encrypted: bool,
}

/// The subset of server variables surfaced by the `config` command.
#[derive(Debug, Clone, Default)]
pub struct ServerConfigReport {
    pub max_connections: String,
    pub allows_remote_connections: bool,
    pub server_port: String,
    pub long_query_time: String,
    pub general_logging: bool,
    pub logs_slow_queries: bool,
}

pub enum Rdbms {
    Mysql(MysqlServer),
}

impl Rdbms {
    pub async fn connect(kind: RdbmsKind, connection: &ConnectionConfig) -> anyhow::Result<Self> {
        match kind {
            RdbmsKind::Mysql => Ok(Self::Mysql(MysqlServer::connect(connection).await?)),
        }
    }

    pub async fn current_log_coordinate(&mut self) -> anyhow::Result<LogCoordinate> {
        match self {
            Self::Mysql(server) => server.current_log_coordinate().await,
        }
    }

    pub async fn list_logs(&mut self) -> anyhow::Result<Vec<ServerLog>> {
        match self {
            Self::Mysql(server) => server.list_logs().await,
        }
    }

    /// Seals the current log and makes the server start a new one.
    pub async fn flush_logs(&mut self) -> anyhow::Result<()> {
        match self {
            Self::Mysql(server) => server.flush_logs().await,
        }
    }

    /// Drops server-side logs older than `log_name`, keeping `log_name`
    /// itself. Best effort; the server may have nothing to purge.
    pub async fn purge_logs_to(&mut self, log_name: &str) -> anyhow::Result<()> {
        match self {
            Self::Mysql(server) => server.purge_logs_to(log_name).await,
        }
    }

    pub async fn server_config_report(&mut self) -> anyhow::Result<ServerConfigReport> {
        match self {
            Self::Mysql(server) => server.server_config_report().await,
        }
    }

    /// Recreates the target database if it was dropped since its backup.
    pub async fn ensure_database(&mut self, database: &str) -> anyhow::Result<()> {
        match self {
            Self::Mysql(server) => server.ensure_database(database).await,
        }
    }

    /// Streams a dump file into the named database as one transactional
    /// import.
    pub async fn restore(&self, dump_path: &Utf8Path, database: &str) -> anyhow::Result<()> {
        match self {
            Self::Mysql(server) => server.restore(dump_path, database).await,
        }
    }

    /// Replays the given binary log files against the server, stopping at
    /// `stop_datetime`. Returns the number of statement bytes piped in.
    pub async fn replay_logs(
        &self,
        database: &str,
        stop_datetime: DateTime<Utc>,
        log_paths: &[Utf8PathBuf],
    ) -> anyhow::Result<u64> {
        match self {
            Self::Mysql(server) => server.replay_logs(database, stop_datetime, log_paths).await,
        }
    }
}
