//! Incremental capture of binary log segments against the active backup,
//! plus the logging opt-in switch recovery uses around a restore.

use anyhow::Context;
use camino::Utf8Path;
use chrono::Utc;
use remote_storage::{GenericRemoteStorage, RemotePath};
use tracing::{info, warn};

use crate::catalog::{Binlog, Catalog, NewBinlog};
use crate::config::{Config, StorageDriver};
use crate::pipeline;
use crate::producer::{BackupProducer, BinlogReader};
use crate::rdbms::{Rdbms, ServerLog};
use crate::server_config;

/// Captures every server-side log segment the active backup does not hold
/// in its latest state yet. Returns the number of segments uploaded.
pub async fn run_incremental_backup(
    config: &Config,
    catalog: &Catalog,
    database_name: &str,
    driver: StorageDriver,
) -> anyhow::Result<usize> {
    let Some(database) = catalog.find_database(database_name)? else {
        warn!("No catalog record for database '{database_name}', nothing to capture");
        return Ok(0);
    };
    let Some(active_backup) = catalog.find_active_backup(database.id)? else {
        warn!("Database '{database_name}' has no active full backup, nothing to capture");
        return Ok(0);
    };

    let mut rdbms = Rdbms::connect(config.rdbms, &config.connection).await?;
    let server_logs = rdbms.list_logs().await?;
    let saved = catalog.list_binlogs(active_backup.id)?;

    let transitioned = diff_server_logs(catalog, active_backup.id, &server_logs, &saved)?;
    if transitioned > 0 {
        // seal the ranges we are about to copy; the server starts a new log
        rdbms.flush_logs().await?;
    }

    let unprocessed: Vec<Binlog> = catalog
        .list_unprocessed_binlogs()?
        .into_iter()
        .filter(|binlog| binlog.backup_id == active_backup.id)
        .collect();
    if unprocessed.is_empty() {
        info!("every known log segment of '{database_name}' is already stored");
        return Ok(0);
    }

    let storage = GenericRemoteStorage::from_config(&config.storage_config(driver)?)?;
    for segment in &unprocessed {
        let producer = BackupProducer::BinlogReader(BinlogReader::new(
            &config.binlog_dir,
            &segment.log_name,
            segment.position,
        ));
        let target = RemotePath::from_string(&format!("{database_name}/{}", segment.filename))?;
        let bytes = pipeline::run(
            |chunks, failure| async move { producer.generate(chunks, &failure).await },
            |chunks, failure| {
                let storage = &storage;
                let target = &target;
                async move { storage.save(chunks, &failure, target).await }
            },
        )
        .await
        .with_context(|| format!("capture of binary log '{}'", segment.log_name))?;
        catalog.update_binlog(segment.id, segment.size, true)?;
        info!(
            "captured binary log '{}' ({bytes} bytes) as '{}'",
            segment.log_name, segment.filename
        );
    }

    // logs below the seed segment are never read again, neither by the
    // diff above nor by recovery; let the server drop them
    if let Some(seed) = saved.first() {
        if let Err(e) = rdbms.purge_logs_to(&seed.log_name).await {
            warn!("best-effort purge of pre-anchor logs failed: {e:#}");
        }
    }
    Ok(unprocessed.len())
}

/// Merge-and-diff of the server's log list against the catalog rows of one
/// backup. A grown segment gets re-marked unprocessed with its new size; a
/// name the catalog does not know becomes a new row, unless it predates
/// the backup's seed segment and can never matter for replay.
///
/// Returns how many rows transitioned to unprocessed.
fn diff_server_logs(
    catalog: &Catalog,
    backup_id: i64,
    server_logs: &[ServerLog],
    saved: &[Binlog],
) -> anyhow::Result<usize> {
    let seed_log_name = saved
        .first()
        .map(|binlog| binlog.log_name.as_str())
        .context("The active backup has no seed binlog row")?;

    let mut transitioned = 0;
    for server_log in server_logs {
        match saved.iter().find(|binlog| binlog.log_name == server_log.name) {
            Some(known) if server_log.size > known.size => {
                catalog.update_binlog(known.id, server_log.size, false)?;
                transitioned += 1;
            }
            Some(_) => {}
            None if server_log.name.as_str() >= seed_log_name => {
                catalog.create_binlog(&NewBinlog {
                    backup_id,
                    filename: format!("{}_{}", server_log.name, Utc::now().timestamp()),
                    log_name: server_log.name.clone(),
                    size: server_log.size,
                    position: 0,
                })?;
                transitioned += 1;
            }
            None => {
                // rotated out before the anchor backup; never replayed
            }
        }
    }
    Ok(transitioned)
}

/// Flips incremental logging for one database and pushes the resulting
/// managed configuration fragment to the server.
pub async fn set_logging_enabled(
    catalog: &Catalog,
    database_name: &str,
    enabled: bool,
) -> anyhow::Result<()> {
    let database = catalog
        .find_database(database_name)?
        .with_context(|| format!("Unknown database '{database_name}'"))?;
    catalog.set_logging_enabled(database.id, enabled)?;
    server_config::apply_managed_fragment(
        catalog,
        Utf8Path::new(server_config::MANAGED_FRAGMENT_PATH),
    )
    .await
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::catalog::NewBackup;

    fn server_log(name: &str, size: u64) -> ServerLog {
        ServerLog {
            name: name.to_string(),
            size,
            encrypted: false,
        }
    }

    /// Catalog with one active backup anchored at `mysql-bin.000003:157`.
    fn catalog_with_seed() -> (Catalog, i64) {
        let catalog = Catalog::open_in_memory().unwrap();
        let database = catalog.find_or_create_database("demo").unwrap();
        let backup_id = catalog
            .create_backup(&NewBackup {
                database_id: database.id,
                filename: "1_full.sql".to_string(),
                backup_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                size: 0,
                is_active: true,
            })
            .unwrap();
        catalog
            .create_binlog(&NewBinlog {
                backup_id,
                filename: "mysql-bin.000003_1700000000".to_string(),
                log_name: "mysql-bin.000003".to_string(),
                size: 157,
                position: 157,
            })
            .unwrap();
        (catalog, backup_id)
    }

    #[test]
    fn grown_segment_is_remarked_unprocessed() -> anyhow::Result<()> {
        let (catalog, backup_id) = catalog_with_seed();
        // pretend the seed was already captured once
        let seed = catalog.list_binlogs(backup_id)?.remove(0);
        catalog.update_binlog(seed.id, 157, true)?;

        let saved = catalog.list_binlogs(backup_id)?;
        let transitioned = diff_server_logs(
            &catalog,
            backup_id,
            &[server_log("mysql-bin.000003", 4096)],
            &saved,
        )?;

        assert_eq!(transitioned, 1);
        let rows = catalog.list_binlogs(backup_id)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].size, 4096);
        assert!(!rows[0].backed_up);
        assert_eq!(rows[0].position, 157, "position never changes");
        Ok(())
    }

    #[test]
    fn unknown_newer_segment_becomes_a_row() -> anyhow::Result<()> {
        let (catalog, backup_id) = catalog_with_seed();

        let saved = catalog.list_binlogs(backup_id)?;
        let transitioned = diff_server_logs(
            &catalog,
            backup_id,
            &[
                server_log("mysql-bin.000003", 157),
                server_log("mysql-bin.000004", 1024),
            ],
            &saved,
        )?;

        assert_eq!(transitioned, 1);
        let rows = catalog.list_binlogs(backup_id)?;
        assert_eq!(rows.len(), 2);
        let added = &rows[1];
        assert_eq!(added.log_name, "mysql-bin.000004");
        assert_eq!(added.size, 1024);
        assert_eq!(added.position, 0);
        assert!(!added.backed_up);
        assert!(added.filename.starts_with("mysql-bin.000004_"));
        Ok(())
    }

    #[test]
    fn segments_predating_the_seed_are_ignored() -> anyhow::Result<()> {
        let (catalog, backup_id) = catalog_with_seed();

        let saved = catalog.list_binlogs(backup_id)?;
        let transitioned = diff_server_logs(
            &catalog,
            backup_id,
            &[
                server_log("mysql-bin.000001", 9000),
                server_log("mysql-bin.000003", 157),
            ],
            &saved,
        )?;

        assert_eq!(transitioned, 0);
        assert_eq!(catalog.list_binlogs(backup_id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn quiet_server_transitions_nothing() -> anyhow::Result<()> {
        let (catalog, backup_id) = catalog_with_seed();
        let seed = catalog.list_binlogs(backup_id)?.remove(0);
        catalog.update_binlog(seed.id, 157, true)?;

        // same list twice; the second diff must be a no-op as well
        for _ in 0..2 {
            let saved = catalog.list_binlogs(backup_id)?;
            let transitioned = diff_server_logs(
                &catalog,
                backup_id,
                &[server_log("mysql-bin.000003", 157)],
                &saved,
            )?;
            assert_eq!(transitioned, 0);
        }
        assert!(catalog.list_unprocessed_binlogs()?.is_empty());
        Ok(())
    }
}
