//! Point-in-time recovery: restore the right full backup, then replay its
//! stored log segments up to the requested moment.

use anyhow::Context;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use remote_storage::{DownloadError, GenericRemoteStorage, RemotePath};
use tokio::process::Command;
use tracing::info;

use crate::binlog;
use crate::catalog::{Backup, Binlog, Catalog, CatalogError};
use crate::config::{Config, StorageDriver};
use crate::rdbms::Rdbms;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("Unknown database '{0}'")]
    UnknownDatabase(String),
    #[error(
        "The requested point in time {requested} predates the first backup at {first_backup_time}"
    )]
    InvalidRecoveryPoint {
        requested: DateTime<Utc>,
        first_backup_time: DateTime<Utc>,
    },
    #[error("No full backup exists at or before {requested}")]
    NoEligibleBackup { requested: DateTime<Utc> },
    #[error(
        "Not enough disk space to download the full backup: {available} bytes available, {needed} needed"
    )]
    DiskFullForBackup { available: u64, needed: u64 },
    #[error(
        "Not enough disk space to download the binary logs: {available} bytes available, {needed} needed"
    )]
    DiskFullForBinlogs { available: u64, needed: u64 },
    #[error(
        "Not enough disk space to download all recovery artifacts: {available} bytes available, {needed} needed"
    )]
    DiskFullForTotal { available: u64, needed: u64 },
    #[error("Failed to restore the full backup; incremental logging is left disabled: {0:#}")]
    RestoreFailed(#[source] anyhow::Error),
    #[error("Failed to replay the binary logs; the database may be partially recovered: {0:#}")]
    ReplayFailed(#[source] anyhow::Error),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What a recovery run will restore and replay.
struct RecoveryPlan {
    backup: Backup,
    /// Only segments that reached the destination; the rest exist nowhere
    /// but on the server.
    segments: Vec<Binlog>,
}

/// Restores `database_name` to its state at `target_time`.
pub async fn run_recovery(
    config: &Config,
    catalog: &Catalog,
    database_name: &str,
    target_time: DateTime<Utc>,
    driver: StorageDriver,
) -> Result<(), RecoveryError> {
    let plan = plan_recovery(catalog, database_name, target_time)?;
    info!(
        "recovering '{database_name}' to {target_time} from backup '{}' plus {} stored log segment(s)",
        plan.backup.filename,
        plan.segments.len()
    );

    let available = available_disk_space(Utf8Path::new("/")).await?;
    check_disk_space(available, &plan)?;

    let storage = GenericRemoteStorage::from_config(&config.storage_config(driver)?)?;
    let mut rdbms = Rdbms::connect(config.rdbms, &config.connection).await?;

    let dump_remote = RemotePath::from_string(&format!("{database_name}/{}", plan.backup.filename))?;
    let dump_paths = storage.retrieve(std::slice::from_ref(&dump_remote)).await?;
    let dump_path = dump_paths
        .first()
        .cloned()
        .context("The destination returned no local path for the dump")?;

    // the restore itself must not land in the logs we are about to replay
    binlog::set_logging_enabled(catalog, database_name, false).await?;
    rdbms.ensure_database(database_name).await?;
    match rdbms.restore(&dump_path, database_name).await {
        Ok(()) => binlog::set_logging_enabled(catalog, database_name, true).await?,
        Err(e) => return Err(RecoveryError::RestoreFailed(e)),
    }
    storage.delete_retrievals(&dump_paths).await?;
    info!("restored full backup '{}'", plan.backup.filename);

    if plan.segments.is_empty() {
        info!("no stored log segments; recovery ends at the backup snapshot");
        return Ok(());
    }

    let segment_remotes = plan
        .segments
        .iter()
        .map(|segment| RemotePath::from_string(&format!("{database_name}/{}", segment.filename)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let log_paths = storage.retrieve(&segment_remotes).await?;

    let replayed = rdbms
        .replay_logs(database_name, target_time, &log_paths)
        .await
        .map_err(RecoveryError::ReplayFailed)?;
    info!("replayed {replayed} bytes of binary log up to {target_time}");

    storage.delete_retrievals(&log_paths).await?;
    Ok(())
}

fn plan_recovery(
    catalog: &Catalog,
    database_name: &str,
    target_time: DateTime<Utc>,
) -> Result<RecoveryPlan, RecoveryError> {
    let database = catalog
        .find_database(database_name)?
        .ok_or_else(|| RecoveryError::UnknownDatabase(database_name.to_string()))?;
    if target_time < database.first_backup_time {
        return Err(RecoveryError::InvalidRecoveryPoint {
            requested: target_time,
            first_backup_time: database.first_backup_time,
        });
    }
    let backup = catalog
        .find_backup_before(database.id, target_time)?
        .ok_or(RecoveryError::NoEligibleBackup {
            requested: target_time,
        })?;
    let segments = catalog
        .list_binlogs(backup.id)?
        .into_iter()
        .filter(|binlog| binlog.backed_up)
        .collect();
    Ok(RecoveryPlan { backup, segments })
}

/// The three space checks are separate so each shortage names what does
/// not fit. An exact fit fails: the comparisons are strict.
fn check_disk_space(available: u64, plan: &RecoveryPlan) -> Result<(), RecoveryError> {
    let backup_size = plan.backup.size;
    let segments_size: u64 = plan.segments.iter().map(|segment| segment.size).sum();

    if available <= backup_size {
        return Err(RecoveryError::DiskFullForBackup {
            available,
            needed: backup_size,
        });
    }
    if available <= segments_size {
        return Err(RecoveryError::DiskFullForBinlogs {
            available,
            needed: segments_size,
        });
    }
    if available <= backup_size + segments_size {
        return Err(RecoveryError::DiskFullForTotal {
            available,
            needed: backup_size + segments_size,
        });
    }
    Ok(())
}

async fn available_disk_space(mount: &Utf8Path) -> anyhow::Result<u64> {
    let output = Command::new("df")
        .arg("--output=avail")
        .arg("--block-size=1")
        .arg(mount.as_str())
        .output()
        .await
        .context("Failed to run df")?;
    anyhow::ensure!(
        output.status.success(),
        "df exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    parse_df_available(&String::from_utf8_lossy(&output.stdout))
}

fn parse_df_available(df_output: &str) -> anyhow::Result<u64> {
    let value = df_output
        .lines()
        .nth(1)
        .map(str::trim)
        .context("df printed no data row")?;
    value
        .parse()
        .with_context(|| format!("Failed to parse df output {value:?}"))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::catalog::{NewBackup, NewBinlog};

    fn moment(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn stored_backup(catalog: &Catalog, database_id: i64, at: DateTime<Utc>, size: u64) -> i64 {
        catalog
            .create_backup(&NewBackup {
                database_id,
                filename: format!("{}_full.sql", at.timestamp()),
                backup_time: at,
                size,
                is_active: true,
            })
            .unwrap()
    }

    #[test]
    fn recovery_point_boundary_is_inclusive() -> anyhow::Result<()> {
        let catalog = Catalog::open_in_memory()?;
        let database = catalog.find_or_create_database("demo")?;
        stored_backup(&catalog, database.id, database.first_backup_time, 10);

        let too_early = database.first_backup_time - Duration::seconds(1);
        let res = plan_recovery(&catalog, "demo", too_early);
        assert!(
            matches!(res, Err(RecoveryError::InvalidRecoveryPoint { .. })),
            "one second before the first backup must be rejected"
        );

        let plan = plan_recovery(&catalog, "demo", database.first_backup_time)?;
        assert_eq!(plan.backup.size, 10);
        Ok(())
    }

    #[test]
    fn unknown_database_is_rejected() {
        let catalog = Catalog::open_in_memory().unwrap();
        let res = plan_recovery(&catalog, "ghost", moment(1_700_000_000));
        assert!(matches!(res, Err(RecoveryError::UnknownDatabase(_))));
    }

    #[test]
    fn missing_eligible_backup_is_reported() -> anyhow::Result<()> {
        let catalog = Catalog::open_in_memory()?;
        let database = catalog.find_or_create_database("demo")?;
        // a backup exists, but only after the requested moment
        stored_backup(
            &catalog,
            database.id,
            database.first_backup_time + Duration::hours(1),
            10,
        );

        let res = plan_recovery(&catalog, "demo", database.first_backup_time);
        assert!(matches!(res, Err(RecoveryError::NoEligibleBackup { .. })));
        Ok(())
    }

    #[test]
    fn only_stored_segments_enter_the_plan() -> anyhow::Result<()> {
        let catalog = Catalog::open_in_memory()?;
        let database = catalog.find_or_create_database("demo")?;
        let backup_id = stored_backup(&catalog, database.id, database.first_backup_time, 10);
        let stored = catalog.create_binlog(&NewBinlog {
            backup_id,
            filename: "mysql-bin.000001_1".to_string(),
            log_name: "mysql-bin.000001".to_string(),
            size: 100,
            position: 0,
        })?;
        catalog.update_binlog(stored, 100, true)?;
        catalog.create_binlog(&NewBinlog {
            backup_id,
            filename: "mysql-bin.000002_2".to_string(),
            log_name: "mysql-bin.000002".to_string(),
            size: 50,
            position: 0,
        })?;

        let plan = plan_recovery(&catalog, "demo", database.first_backup_time)?;
        assert_eq!(plan.segments.len(), 1);
        assert_eq!(plan.segments[0].log_name, "mysql-bin.000001");
        Ok(())
    }

    fn synthetic_plan(backup_size: u64, segment_sizes: &[u64]) -> RecoveryPlan {
        RecoveryPlan {
            backup: Backup {
                id: 1,
                database_id: 1,
                filename: "1_full.sql".to_string(),
                backup_time: moment(1_700_000_000),
                size: backup_size,
                is_active: true,
            },
            segments: segment_sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| Binlog {
                    id: i as i64 + 1,
                    backup_id: 1,
                    filename: format!("mysql-bin.{i}_1"),
                    log_name: format!("mysql-bin.{i}"),
                    size,
                    position: 0,
                    backed_up: true,
                })
                .collect(),
        }
    }

    #[test]
    fn each_space_shortage_is_named() {
        let plan = synthetic_plan(100, &[30, 30]);

        assert!(matches!(
            check_disk_space(90, &plan),
            Err(RecoveryError::DiskFullForBackup { needed: 100, .. })
        ));
        let tight_plan = synthetic_plan(10, &[200]);
        assert!(matches!(
            check_disk_space(50, &tight_plan),
            Err(RecoveryError::DiskFullForBinlogs { needed: 200, .. })
        ));
        assert!(matches!(
            check_disk_space(150, &plan),
            Err(RecoveryError::DiskFullForTotal { needed: 160, .. })
        ));
        assert!(check_disk_space(161, &plan).is_ok());
    }

    #[test]
    fn an_exact_fit_is_still_full() {
        let plan = synthetic_plan(100, &[30, 30]);
        assert!(matches!(
            check_disk_space(160, &plan),
            Err(RecoveryError::DiskFullForTotal { .. })
        ));
        assert!(matches!(
            check_disk_space(100, &plan),
            Err(RecoveryError::DiskFullForBackup { .. })
        ));
    }

    #[test]
    fn df_output_parses_to_bytes() {
        let parsed = parse_df_available("     Avail\n123456789\n").unwrap();
        assert_eq!(parsed, 123456789);

        assert!(parse_df_available("").is_err());
        assert!(parse_df_available("Avail\nnot-a-number\n").is_err());
    }
}
