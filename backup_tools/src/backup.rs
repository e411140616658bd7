//! Full backup orchestration.
//!
//! One invocation takes one full logical backup: seed the catalog rows in
//! a transaction, stream the dump into the destination, then either record
//! the stored size or drop the seed rows again.

use anyhow::Context;
use chrono::Utc;
use remote_storage::{GenericRemoteStorage, RemotePath};
use tracing::{info, warn};

use crate::catalog::{Catalog, NewBackup, NewBinlog};
use crate::config::{Config, StorageDriver};
use crate::pipeline;
use crate::producer::BackupProducer;
use crate::rdbms::Rdbms;

/// Takes a full backup of `database_name` and records it in the catalog as
/// the new active backup. Returns the stored byte count.
pub async fn run_full_backup(
    config: &Config,
    catalog: &Catalog,
    database_name: &str,
    driver: StorageDriver,
) -> anyhow::Result<u64> {
    let storage = GenericRemoteStorage::from_config(&config.storage_config(driver)?)?;
    let mut rdbms = Rdbms::connect(config.rdbms, &config.connection).await?;

    let database = catalog.find_or_create_database(database_name)?;
    let backup_time = Utc::now();
    let filename = format!(
        "{}_full.sql",
        backup_time
            .timestamp_nanos_opt()
            .context("The system clock is outside the supported range")?
    );

    // the starting coordinate is where replay must begin for this backup
    let coordinate = rdbms.current_log_coordinate().await?;
    let seed_filename = format!("{}_{}", coordinate.log_name, backup_time.timestamp());

    let (backup_id, seed_binlog_id) = catalog.transaction(|catalog| {
        catalog.deactivate_active(database.id)?;
        let backup_id = catalog.create_backup(&NewBackup {
            database_id: database.id,
            filename: filename.clone(),
            backup_time,
            size: 0,
            is_active: true,
        })?;
        let seed_binlog_id = catalog.create_binlog(&NewBinlog {
            backup_id,
            filename: seed_filename.clone(),
            log_name: coordinate.log_name.clone(),
            size: coordinate.position,
            position: coordinate.position,
        })?;
        Ok((backup_id, seed_binlog_id))
    })?;
    info!(
        "backing up database '{database_name}' into '{filename}', log anchor {}:{}",
        coordinate.log_name, coordinate.position
    );

    let producer = BackupProducer::for_full_dump(config, database_name);
    let target = RemotePath::from_string(&format!("{database_name}/{filename}"))?;

    let result = pipeline::run(
        |chunks, failure| async move { producer.generate(chunks, &failure).await },
        |chunks, failure| {
            let storage = &storage;
            let target = &target;
            async move { storage.save(chunks, &failure, target).await }
        },
    )
    .await;

    match result {
        Ok(bytes) => {
            catalog.update_backup_size(backup_id, bytes)?;
            catalog.touch_latest_backup_time(database.id, backup_time)?;
            info!("full backup of '{database_name}' stored as '{filename}' ({bytes} bytes)");
            Ok(bytes)
        }
        Err(e) => {
            // the artifact never fully made it; drop the rows so recovery
            // cannot pick this attempt up
            if let Err(cleanup_err) = catalog
                .delete_binlog(seed_binlog_id)
                .and_then(|()| catalog.delete_backup(backup_id))
            {
                warn!("Failed to drop the catalog rows of a failed backup: {cleanup_err}");
            }
            Err(e)
        }
    }
}
