//! Process configuration.
//!
//! Everything comes from the environment and is read exactly once per
//! invocation into an owned [`Config`] value that gets passed down
//! explicitly, so tests can substitute their own.

use std::num::NonZeroUsize;

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use remote_storage::{
    DropboxConfig, RemoteStorageConfig, RemoteStorageKind, DEFAULT_UPLOAD_CONCURRENCY,
};

/// Where the server keeps its binary logs unless `BINLOG_DIR` says otherwise.
pub const DEFAULT_BINLOG_DIR: &str = "/var/lib/mysql";

/// Which server family the engine drives. Selected by the `RDBMS` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdbmsKind {
    Mysql,
}

/// How full dumps are produced. Selected by the `BACKUP_METHOD` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMethodKind {
    MysqlDump,
}

/// Storage driver chosen per invocation on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StorageDriver {
    Filesystem,
    Dropbox,
}

impl std::fmt::Display for StorageDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageDriver::Filesystem => f.write_str("filesystem"),
            StorageDriver::Dropbox => f.write_str("dropbox"),
        }
    }
}

/// Coordinates and credentials of the backed-up server.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub rdbms: RdbmsKind,
    pub backup_method: BackupMethodKind,
    /// Path of the embedded catalog file.
    pub catalog_path: Utf8PathBuf,
    /// Directory the server writes its binary logs into.
    pub binlog_dir: Utf8PathBuf,
    filesystem_root: Option<Utf8PathBuf>,
    dropbox: Option<DropboxConfig>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let connection = ConnectionConfig {
            host: require_var("DB_HOST")?,
            port: require_var("DB_PORT")?
                .parse()
                .context("DB_PORT is not a valid port number")?,
            user: require_var("DB_USER")?,
            password: require_var("DB_PASSWORD")?,
        };

        let rdbms = match optional_var("RDBMS")?.as_deref() {
            None | Some("mysql") => RdbmsKind::Mysql,
            Some(other) => bail!("Unsupported RDBMS '{other}'"),
        };
        let backup_method = match optional_var("BACKUP_METHOD")?.as_deref() {
            None | Some("mysqldump") => BackupMethodKind::MysqlDump,
            Some(other) => bail!("Unsupported backup method '{other}'"),
        };

        let catalog_path = Utf8PathBuf::from(require_var("SYSTEM_DB_FILE")?);
        let binlog_dir = optional_var("BINLOG_DIR")?
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_BINLOG_DIR));

        let filesystem_root = optional_var("FILESYSTEM_PATH")?.map(Utf8PathBuf::from);

        let dropbox = match optional_var("DROPBOX_ACCESS_TOKEN")? {
            Some(access_token) => {
                let root_path = require_var("DROPBOX_PATH")?;
                let concurrency_limit = match optional_var("DROPBOX_CONCURRENT_REQUESTS")? {
                    Some(value) => value
                        .parse::<NonZeroUsize>()
                        .context("DROPBOX_CONCURRENT_REQUESTS must be a positive integer")?,
                    None => NonZeroUsize::new(DEFAULT_UPLOAD_CONCURRENCY)
                        .expect("default concurrency is nonzero"),
                };
                Some(DropboxConfig {
                    access_token,
                    root_path,
                    concurrency_limit,
                })
            }
            None => None,
        };

        Ok(Self {
            connection,
            rdbms,
            backup_method,
            catalog_path,
            binlog_dir,
            filesystem_root,
            dropbox,
        })
    }

    /// Resolves the driver chosen on the command line against what the
    /// environment actually configures.
    pub fn storage_config(&self, driver: StorageDriver) -> anyhow::Result<RemoteStorageConfig> {
        let storage = match driver {
            StorageDriver::Filesystem => {
                let root = self
                    .filesystem_root
                    .clone()
                    .context("FILESYSTEM_PATH is not set")?;
                RemoteStorageKind::LocalFs(root)
            }
            StorageDriver::Dropbox => {
                let dropbox = self
                    .dropbox
                    .clone()
                    .context("DROPBOX_ACCESS_TOKEN / DROPBOX_PATH are not set")?;
                RemoteStorageKind::Dropbox(dropbox)
            }
        };
        Ok(RemoteStorageConfig { storage })
    }
}

fn require_var(name: &str) -> anyhow::Result<String> {
    std::env::var(name).map_err(|_| anyhow::anyhow!("Missing environment variable {name}"))
}

fn optional_var(name: &str) -> anyhow::Result<Option<String>> {
    match std::env::var(name) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to read {name}"))),
    }
}
