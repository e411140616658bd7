//! The catalog: the engine's persistent record of databases, full backups
//! and their binary log segments.
//!
//! Backed by an embedded SQLite file at `SYSTEM_DB_FILE`. The schema is
//! migrated on open. Rows are soft-deleted: `deleted_at` is set and every
//! reader filters on it, so a rolled-back backup attempt leaves an audit
//! trace without ever becoming visible to recovery.
//!
//! All timestamps are stored at second resolution.

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One backed-up database. Created on the first backup of the name, never
/// deleted automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Database {
    pub id: i64,
    pub name: String,
    pub first_backup_time: DateTime<Utc>,
    pub latest_backup_time: DateTime<Utc>,
    /// Whether the server retains binary logs for this database; drives the
    /// managed server configuration fragment.
    pub logging_enabled: bool,
}

/// A full snapshot that reached the destination. At most one row per
/// database is active at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub id: i64,
    pub database_id: i64,
    pub filename: String,
    pub backup_time: DateTime<Utc>,
    pub size: u64,
    pub is_active: bool,
}

/// One named segment of the server's binary log, tied to the full backup it
/// extends. `size` is the server-observed length at the last catalog
/// update; `position` is where the first capture began and never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binlog {
    pub id: i64,
    pub backup_id: i64,
    pub filename: String,
    pub log_name: String,
    pub size: u64,
    pub position: u64,
    pub backed_up: bool,
}

pub struct NewBackup {
    pub database_id: i64,
    pub filename: String,
    pub backup_time: DateTime<Utc>,
    pub size: u64,
    pub is_active: bool,
}

pub struct NewBinlog {
    pub backup_id: i64,
    pub filename: String,
    pub log_name: String,
    pub size: u64,
    pub position: u64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS databases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER,
    name TEXT NOT NULL UNIQUE,
    first_backup_time INTEGER NOT NULL,
    latest_backup_time INTEGER NOT NULL,
    logging_enabled INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS backups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER,
    database_id INTEGER NOT NULL REFERENCES databases (id),
    filename TEXT NOT NULL,
    backup_time INTEGER NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS binlogs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER,
    backup_id INTEGER NOT NULL REFERENCES backups (id),
    filename TEXT NOT NULL,
    log_name TEXT NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    position INTEGER NOT NULL DEFAULT 0,
    backed_up INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS backups_database_active ON backups (database_id, is_active);
CREATE INDEX IF NOT EXISTS binlogs_backup ON binlogs (backup_id);
";

pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Opens (creating if needed) the catalog file and migrates the schema.
    pub fn open(path: &Utf8Path) -> Result<Self, CatalogError> {
        let conn = Connection::open(path.as_std_path())?;
        Self::init(conn)
    }

    /// Catalog in a private in-memory store; used by tests.
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CatalogError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Runs `f` inside a catalog transaction. The first error rolls every
    /// write back. Transactions do not nest.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, CatalogError>,
    ) -> Result<T, CatalogError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK") {
                    tracing::error!("Failed to roll back a catalog transaction: {rollback_err}");
                }
                Err(e)
            }
        }
    }

    pub fn find_database(&self, name: &str) -> Result<Option<Database>, CatalogError> {
        self.conn
            .query_row(
                "SELECT id, name, first_backup_time, latest_backup_time, logging_enabled
                 FROM databases WHERE name = ?1 AND deleted_at IS NULL",
                params![name],
                database_from_row,
            )
            .optional()
            .map_err(CatalogError::from)
    }

    pub fn find_or_create_database(&self, name: &str) -> Result<Database, CatalogError> {
        if let Some(database) = self.find_database(name)? {
            return Ok(database);
        }
        let now = Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO databases
                 (created_at, updated_at, name, first_backup_time, latest_backup_time, logging_enabled)
             VALUES (?1, ?1, ?2, ?1, ?1, 1)",
            params![now, name],
        )?;
        self.find_database(name)?
            .ok_or_else(|| CatalogError::Other(anyhow::anyhow!("Database row vanished after insert")))
    }

    pub fn list_databases(&self) -> Result<Vec<Database>, CatalogError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, first_backup_time, latest_backup_time, logging_enabled
             FROM databases WHERE deleted_at IS NULL ORDER BY name",
        )?;
        let databases = stmt
            .query_map([], database_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(databases)
    }

    pub fn set_logging_enabled(&self, database_id: i64, enabled: bool) -> Result<(), CatalogError> {
        self.conn.execute(
            "UPDATE databases SET logging_enabled = ?2, updated_at = ?3
             WHERE id = ?1 AND deleted_at IS NULL",
            params![database_id, enabled, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn touch_latest_backup_time(
        &self,
        database_id: i64,
        moment: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        self.conn.execute(
            "UPDATE databases SET latest_backup_time = ?2, updated_at = ?3
             WHERE id = ?1 AND deleted_at IS NULL",
            params![database_id, moment.timestamp(), Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Flips the currently active backup of the database, if any, to
    /// inactive.
    pub fn deactivate_active(&self, database_id: i64) -> Result<(), CatalogError> {
        self.conn.execute(
            "UPDATE backups SET is_active = 0, updated_at = ?2
             WHERE database_id = ?1 AND is_active = 1 AND deleted_at IS NULL",
            params![database_id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn create_backup(&self, backup: &NewBackup) -> Result<i64, CatalogError> {
        let now = Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO backups
                 (created_at, updated_at, database_id, filename, backup_time, size, is_active)
             VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                now,
                backup.database_id,
                backup.filename,
                backup.backup_time.timestamp(),
                backup.size as i64,
                backup.is_active,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn create_binlog(&self, binlog: &NewBinlog) -> Result<i64, CatalogError> {
        let now = Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO binlogs
                 (created_at, updated_at, backup_id, filename, log_name, size, position, backed_up)
             VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                now,
                binlog.backup_id,
                binlog.filename,
                binlog.log_name,
                binlog.size as i64,
                binlog.position as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn find_active_backup(&self, database_id: i64) -> Result<Option<Backup>, CatalogError> {
        self.conn
            .query_row(
                "SELECT id, database_id, filename, backup_time, size, is_active
                 FROM backups
                 WHERE database_id = ?1 AND is_active = 1 AND deleted_at IS NULL",
                params![database_id],
                backup_from_row,
            )
            .optional()
            .map_err(CatalogError::from)
    }

    /// Latest backup taken at or before `moment`.
    pub fn find_backup_before(
        &self,
        database_id: i64,
        moment: DateTime<Utc>,
    ) -> Result<Option<Backup>, CatalogError> {
        self.conn
            .query_row(
                "SELECT id, database_id, filename, backup_time, size, is_active
                 FROM backups
                 WHERE database_id = ?1 AND backup_time <= ?2 AND deleted_at IS NULL
                 ORDER BY backup_time DESC, id DESC LIMIT 1",
                params![database_id, moment.timestamp()],
                backup_from_row,
            )
            .optional()
            .map_err(CatalogError::from)
    }

    /// Segments of one backup, ordered by server log name; the seed segment
    /// created with the backup sorts first.
    pub fn list_binlogs(&self, backup_id: i64) -> Result<Vec<Binlog>, CatalogError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, backup_id, filename, log_name, size, position, backed_up
             FROM binlogs WHERE backup_id = ?1 AND deleted_at IS NULL
             ORDER BY log_name",
        )?;
        let binlogs = stmt
            .query_map(params![backup_id], binlog_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(binlogs)
    }

    /// Every segment whose latest server-side state has not reached the
    /// destination yet.
    pub fn list_unprocessed_binlogs(&self) -> Result<Vec<Binlog>, CatalogError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, backup_id, filename, log_name, size, position, backed_up
             FROM binlogs WHERE backed_up = 0 AND deleted_at IS NULL
             ORDER BY backup_id, log_name",
        )?;
        let binlogs = stmt
            .query_map([], binlog_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(binlogs)
    }

    pub fn update_binlog(
        &self,
        binlog_id: i64,
        new_size: u64,
        backed_up: bool,
    ) -> Result<(), CatalogError> {
        self.conn.execute(
            "UPDATE binlogs SET size = ?2, backed_up = ?3, updated_at = ?4
             WHERE id = ?1 AND deleted_at IS NULL",
            params![binlog_id, new_size as i64, backed_up, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn update_backup_size(&self, backup_id: i64, size: u64) -> Result<(), CatalogError> {
        self.conn.execute(
            "UPDATE backups SET size = ?2, updated_at = ?3
             WHERE id = ?1 AND deleted_at IS NULL",
            params![backup_id, size as i64, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn delete_backup(&self, backup_id: i64) -> Result<(), CatalogError> {
        let now = Utc::now().timestamp();
        self.conn.execute(
            "UPDATE backups SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![backup_id, now],
        )?;
        Ok(())
    }

    pub fn delete_binlog(&self, binlog_id: i64) -> Result<(), CatalogError> {
        let now = Utc::now().timestamp();
        self.conn.execute(
            "UPDATE binlogs SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![binlog_id, now],
        )?;
        Ok(())
    }
}

fn timestamp_field(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let seconds: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp(seconds, 0).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Integer,
            format!("timestamp {seconds} is out of range").into(),
        )
    })
}

fn database_from_row(row: &Row<'_>) -> rusqlite::Result<Database> {
    Ok(Database {
        id: row.get(0)?,
        name: row.get(1)?,
        first_backup_time: timestamp_field(row, 2)?,
        latest_backup_time: timestamp_field(row, 3)?,
        logging_enabled: row.get(4)?,
    })
}

fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<Backup> {
    Ok(Backup {
        id: row.get(0)?,
        database_id: row.get(1)?,
        filename: row.get(2)?,
        backup_time: timestamp_field(row, 3)?,
        size: row.get::<_, i64>(4)? as u64,
        is_active: row.get(5)?,
    })
}

fn binlog_from_row(row: &Row<'_>) -> rusqlite::Result<Binlog> {
    Ok(Binlog {
        id: row.get(0)?,
        backup_id: row.get(1)?,
        filename: row.get(2)?,
        log_name: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        position: row.get::<_, i64>(5)? as u64,
        backed_up: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn moment(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn new_backup(database_id: i64, filename: &str, at: i64) -> NewBackup {
        NewBackup {
            database_id,
            filename: filename.to_string(),
            backup_time: moment(at),
            size: 0,
            is_active: true,
        }
    }

    fn seed_binlog(backup_id: i64, log_name: &str, position: u64) -> NewBinlog {
        NewBinlog {
            backup_id,
            filename: format!("{log_name}_0"),
            log_name: log_name.to_string(),
            size: position,
            position,
        }
    }

    #[test]
    fn find_or_create_database_is_idempotent() -> Result<(), CatalogError> {
        let catalog = Catalog::open_in_memory()?;

        let first = catalog.find_or_create_database("demo")?;
        let second = catalog.find_or_create_database("demo")?;

        assert_eq!(first, second);
        assert!(first.logging_enabled);
        assert_eq!(first.first_backup_time, first.latest_backup_time);
        Ok(())
    }

    #[test]
    fn at_most_one_backup_stays_active() -> Result<(), CatalogError> {
        let catalog = Catalog::open_in_memory()?;
        let database = catalog.find_or_create_database("demo")?;

        let first_id = catalog.transaction(|c| {
            c.deactivate_active(database.id)?;
            c.create_backup(&new_backup(database.id, "1_full.sql", 100))
        })?;
        let second_id = catalog.transaction(|c| {
            c.deactivate_active(database.id)?;
            c.create_backup(&new_backup(database.id, "2_full.sql", 200))
        })?;

        let active = catalog.find_active_backup(database.id)?.unwrap();
        assert_eq!(active.id, second_id);
        assert_ne!(first_id, second_id);
        Ok(())
    }

    #[test]
    fn failed_transaction_rolls_back_backup_and_seed_binlog() -> Result<(), CatalogError> {
        let catalog = Catalog::open_in_memory()?;
        let database = catalog.find_or_create_database("demo")?;

        let res: Result<(), CatalogError> = catalog.transaction(|c| {
            let backup_id = c.create_backup(&new_backup(database.id, "1_full.sql", 100))?;
            c.create_binlog(&seed_binlog(backup_id, "mysql-bin.000001", 157))?;
            Err(CatalogError::Other(anyhow::anyhow!("coordinate read failed")))
        });

        assert!(res.is_err());
        assert_eq!(catalog.find_active_backup(database.id)?, None);
        assert!(catalog.list_unprocessed_binlogs()?.is_empty());
        Ok(())
    }

    #[test]
    fn backup_before_honors_the_boundary() -> Result<(), CatalogError> {
        let catalog = Catalog::open_in_memory()?;
        let database = catalog.find_or_create_database("demo")?;
        catalog.create_backup(&new_backup(database.id, "1_full.sql", 100))?;

        assert!(catalog.find_backup_before(database.id, moment(99))?.is_none());
        let at_boundary = catalog.find_backup_before(database.id, moment(100))?;
        assert_eq!(at_boundary.unwrap().filename, "1_full.sql");
        Ok(())
    }

    #[test]
    fn backup_before_picks_the_latest_eligible() -> Result<(), CatalogError> {
        let catalog = Catalog::open_in_memory()?;
        let database = catalog.find_or_create_database("demo")?;
        catalog.create_backup(&new_backup(database.id, "1_full.sql", 100))?;
        catalog.create_backup(&new_backup(database.id, "2_full.sql", 200))?;
        catalog.create_backup(&new_backup(database.id, "3_full.sql", 300))?;

        let found = catalog.find_backup_before(database.id, moment(250))?.unwrap();
        assert_eq!(found.filename, "2_full.sql");
        Ok(())
    }

    #[test]
    fn soft_deleted_rows_disappear_from_lookups() -> Result<(), CatalogError> {
        let catalog = Catalog::open_in_memory()?;
        let database = catalog.find_or_create_database("demo")?;
        let backup_id = catalog.create_backup(&new_backup(database.id, "1_full.sql", 100))?;
        let binlog_id =
            catalog.create_binlog(&seed_binlog(backup_id, "mysql-bin.000001", 157))?;

        catalog.delete_binlog(binlog_id)?;
        catalog.delete_backup(backup_id)?;

        assert_eq!(catalog.find_active_backup(database.id)?, None);
        assert!(catalog.list_binlogs(backup_id)?.is_empty());
        assert!(catalog.find_backup_before(database.id, moment(500))?.is_none());
        Ok(())
    }

    #[test]
    fn update_binlog_records_growth_and_processing() -> Result<(), CatalogError> {
        let catalog = Catalog::open_in_memory()?;
        let database = catalog.find_or_create_database("demo")?;
        let backup_id = catalog.create_backup(&new_backup(database.id, "1_full.sql", 100))?;
        let binlog_id =
            catalog.create_binlog(&seed_binlog(backup_id, "mysql-bin.000001", 157))?;

        assert_eq!(catalog.list_unprocessed_binlogs()?.len(), 1);

        catalog.update_binlog(binlog_id, 4096, true)?;
        assert!(catalog.list_unprocessed_binlogs()?.is_empty());
        let stored = &catalog.list_binlogs(backup_id)?[0];
        assert_eq!(stored.size, 4096);
        assert_eq!(stored.position, 157, "position never changes");

        catalog.update_binlog(binlog_id, 8192, false)?;
        assert_eq!(catalog.list_unprocessed_binlogs()?.len(), 1);
        Ok(())
    }

    #[test]
    fn logging_opt_out_is_recorded() -> Result<(), CatalogError> {
        let catalog = Catalog::open_in_memory()?;
        let database = catalog.find_or_create_database("demo")?;

        catalog.set_logging_enabled(database.id, false)?;
        let reloaded = catalog.find_database("demo")?.unwrap();
        assert!(!reloaded.logging_enabled);
        Ok(())
    }
}
