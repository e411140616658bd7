//! `backup_ctl` is the one-shot command line surface of the backup engine.
//!
//! Usage examples:
//! ```sh
//! backup_ctl backup demo_db dropbox
//! backup_ctl backup demo_db --binlog
//! backup_ctl recover demo_db "2024-01-01 00:00:00"
//! backup_ctl config --update
//! ```
//!
//! Connection coordinates and destination credentials come from the
//! environment (`DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD`,
//! `SYSTEM_DB_FILE`, `FILESYSTEM_PATH`, `DROPBOX_*`, …). Exit code is 0 on
//! success and 1 on any surfaced failure; the outcome is summarized in one
//! color-coded line.

use std::process::ExitCode;

use anyhow::Context;
use camino::Utf8Path;
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::Table;

use backup_tools::catalog::Catalog;
use backup_tools::config::{Config, StorageDriver};
use backup_tools::rdbms::{Rdbms, ServerConfigReport};
use backup_tools::{backup, binlog, recovery, server_config};

#[derive(Parser)]
#[command(
    name = "backup_ctl",
    about = "Point-in-time backup and recovery for MySQL-family servers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Take a full backup of a database, or capture its binary logs
    Backup {
        /// Database to back up
        database: String,
        /// Destination driver
        #[arg(value_enum, default_value_t = StorageDriver::Filesystem)]
        driver: StorageDriver,
        /// Skip the full dump; capture unprocessed binary logs only
        #[arg(short = 'b', long = "binlog")]
        binlog_only: bool,
    },
    /// Restore a database to a point in time
    Recover {
        /// Database to restore
        database: String,
        /// Unix timestamp or 'YYYY-MM-DD HH:MM:SS' (UTC)
        time: String,
        /// Destination driver holding the artifacts
        #[arg(value_enum, default_value_t = StorageDriver::Filesystem)]
        driver: StorageDriver,
    },
    /// Show the server configuration, or push the managed logging fragment
    Config {
        /// Rewrite, validate and reload the managed fragment
        #[arg(short = 'u', long = "update")]
        update: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(summary) => {
            println!("{}", summary.green());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", format!("Error: {e:#}").red());
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Command) -> anyhow::Result<String> {
    let config = Config::from_env()?;
    let catalog = Catalog::open(&config.catalog_path)?;

    match command {
        Command::Backup {
            database,
            driver,
            binlog_only,
        } => {
            if binlog_only {
                let segments =
                    binlog::run_incremental_backup(&config, &catalog, &database, driver).await?;
                Ok(format!(
                    "Captured {segments} binary log segment(s) of '{database}' using the {driver} driver"
                ))
            } else {
                let bytes = backup::run_full_backup(&config, &catalog, &database, driver).await?;
                Ok(format!(
                    "The '{database}' database has been backed up ({bytes} bytes) using the {driver} driver"
                ))
            }
        }
        Command::Recover {
            database,
            time,
            driver,
        } => {
            let target_time = parse_point_in_time(&time)?;
            recovery::run_recovery(&config, &catalog, &database, target_time, driver).await?;
            Ok(format!(
                "The '{database}' database has been recovered to {target_time}"
            ))
        }
        Command::Config { update } => {
            if update {
                server_config::apply_managed_fragment(
                    &catalog,
                    Utf8Path::new(server_config::MANAGED_FRAGMENT_PATH),
                )
                .await?;
                Ok("The managed server configuration has been rewritten and reloaded".to_string())
            } else {
                let mut rdbms = Rdbms::connect(config.rdbms, &config.connection).await?;
                let report = rdbms.server_config_report().await?;
                print_config_report(&report);
                Ok("Fetched the server configuration".to_string())
            }
        }
    }
}

fn parse_point_in_time(value: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(timestamp) = value.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp(timestamp, 0)
            .with_context(|| format!("Timestamp {timestamp} is out of range"));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").with_context(|| {
        format!("Invalid point in time {value:?}; use a unix timestamp or 'YYYY-MM-DD HH:MM:SS'")
    })?;
    Ok(naive.and_utc())
}

fn print_config_report(report: &ServerConfigReport) {
    let mut table = Table::new();
    table.set_header(vec!["Configuration", "Value"]);
    table.add_row(vec![
        "Max connections".to_string(),
        report.max_connections.clone(),
    ]);
    table.add_row(vec![
        "Allows remote connections".to_string(),
        report.allows_remote_connections.to_string(),
    ]);
    table.add_row(vec!["Server port".to_string(), report.server_port.clone()]);
    table.add_row(vec![
        "Log slow queries".to_string(),
        report.logs_slow_queries.to_string(),
    ]);
    table.add_row(vec![
        "General logging".to_string(),
        report.general_logging.to_string(),
    ]);
    table.add_row(vec![
        "Long query time".to_string(),
        report.long_query_time.clone(),
    ]);
    println!("{table}");
}
