//! MySQL flavor of the server adapter.
//!
//! Administrative statements go over a regular authenticated connection;
//! restore and replay drive the `mysql` interactive client as a child
//! process, because `SOURCE` and binlog replay only exist there.

use std::process::Stdio;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, Row};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{LogCoordinate, ServerConfigReport, ServerLog};
use crate::config::ConnectionConfig;
use crate::process;

/// Server error codes that mean "the user may not run this statement".
const ACCESS_DENIED_CODES: [u16; 3] = [1044, 1045, 1227];

pub struct MysqlServer {
    conn: Conn,
    connection: ConnectionConfig,
}

impl MysqlServer {
    pub async fn connect(connection: &ConnectionConfig) -> anyhow::Result<Self> {
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(connection.host.clone())
            .tcp_port(connection.port)
            .user(Some(connection.user.clone()))
            .pass(Some(connection.password.clone()))
            .into();
        let mut conn = Conn::new(opts).await.with_context(|| {
            format!(
                "Failed to connect to the server at {}:{}",
                connection.host, connection.port
            )
        })?;
        conn.ping().await.context("Failed to ping the server")?;
        Ok(Self {
            conn,
            connection: connection.clone(),
        })
    }

    pub(super) async fn current_log_coordinate(&mut self) -> anyhow::Result<LogCoordinate> {
        let row: Option<Row> = self
            .conn
            .query_first("SHOW MASTER STATUS")
            .await
            .map_err(|e| admin_query_error(e, "SHOW MASTER STATUS"))?;
        let row =
            row.context("The server reported no master status; is binary logging enabled?")?;
        let log_name: String = row
            .get(0)
            .context("SHOW MASTER STATUS returned no File column")?;
        let position: u64 = row
            .get(1)
            .context("SHOW MASTER STATUS returned no Position column")?;
        Ok(LogCoordinate { log_name, position })
    }

    pub(super) async fn list_logs(&mut self) -> anyhow::Result<Vec<ServerLog>> {
        let rows: Vec<Row> = self
            .conn
            .query("SHOW BINARY LOGS")
            .await
            .map_err(|e| admin_query_error(e, "SHOW BINARY LOGS"))?;
        rows.into_iter()
            .map(|row| {
                let name: String = row
                    .get(0)
                    .context("SHOW BINARY LOGS returned no Log_name column")?;
                let size: u64 = row
                    .get(1)
                    .context("SHOW BINARY LOGS returned no File_size column")?;
                // servers below 8.0.14 report no Encrypted column
                let encrypted = row
                    .get::<String, _>(2)
                    .map(|value| value == "Yes")
                    .unwrap_or(false);
                Ok(ServerLog {
                    name,
                    size,
                    encrypted,
                })
            })
            .collect()
    }

    pub(super) async fn flush_logs(&mut self) -> anyhow::Result<()> {
        self.conn
            .query_drop("FLUSH BINARY LOGS")
            .await
            .map_err(|e| admin_query_error(e, "FLUSH BINARY LOGS"))
    }

    pub(super) async fn purge_logs_to(&mut self, log_name: &str) -> anyhow::Result<()> {
        let statement = purge_to_statement(log_name);
        self.conn
            .query_drop(&statement)
            .await
            .map_err(|e| admin_query_error(e, &statement))
    }

    pub(super) async fn server_config_report(&mut self) -> anyhow::Result<ServerConfigReport> {
        let bind_address = self.variable("bind_address").await?.unwrap_or_default();
        Ok(ServerConfigReport {
            max_connections: self.variable("max_connections").await?.unwrap_or_default(),
            allows_remote_connections: bind_address == "0.0.0.0" || bind_address == "*",
            server_port: self.variable("port").await?.unwrap_or_default(),
            long_query_time: self.variable("long_query_time").await?.unwrap_or_default(),
            general_logging: self.variable("general_log").await?.as_deref() == Some("ON"),
            logs_slow_queries: self.variable("slow_query_log").await?.as_deref() == Some("ON"),
        })
    }

    async fn variable(&mut self, name: &str) -> anyhow::Result<Option<String>> {
        let statement = format!("SHOW VARIABLES LIKE '{name}'");
        let row: Option<Row> = self
            .conn
            .query_first(&statement)
            .await
            .map_err(|e| admin_query_error(e, &statement))?;
        Ok(row.and_then(|row| row.get(1)))
    }

    pub(super) async fn ensure_database(&mut self, database: &str) -> anyhow::Result<()> {
        let statement = format!(
            "CREATE DATABASE IF NOT EXISTS `{}`",
            database.replace('`', "``")
        );
        self.conn
            .query_drop(&statement)
            .await
            .map_err(|e| admin_query_error(e, &statement))
    }

    pub(super) async fn restore(&self, dump_path: &Utf8Path, database: &str) -> anyhow::Result<()> {
        let mut client = self
            .client_command()
            .arg(database)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn the mysql client")?;
        let stderr = process::spawn_stderr_collector(&mut client);

        let mut stdin = client
            .stdin
            .take()
            .context("The mysql client has no stdin pipe")?;
        // one transactional import; half a dump must never commit
        let script = format!("SET autocommit=0;\nSOURCE {dump_path};\nCOMMIT;\n");
        stdin
            .write_all(script.as_bytes())
            .await
            .context("Failed to feed the restore script to the mysql client")?;
        drop(stdin);

        let status = client
            .wait()
            .await
            .context("Failed to wait for the mysql client")?;
        if !status.success() {
            bail!(
                "Restore of '{database}' from {dump_path:?} failed with {status}: {}",
                process::collected_stderr(stderr).await
            );
        }
        Ok(())
    }

    pub(super) async fn replay_logs(
        &self,
        database: &str,
        stop_datetime: DateTime<Utc>,
        log_paths: &[Utf8PathBuf],
    ) -> anyhow::Result<u64> {
        let mut reader = Command::new("mysqlbinlog")
            .arg("--database")
            .arg(database)
            // without this the replayed statements would be logged again and
            // feed the next capture
            .arg("--disable-log-bin")
            .arg(format!(
                "--stop-datetime={}",
                stop_datetime.format("%Y-%m-%d %H:%M:%S")
            ))
            .args(log_paths)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn mysqlbinlog")?;
        let reader_stderr = process::spawn_stderr_collector(&mut reader);

        let mut client = self
            .client_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn the mysql client")?;
        let client_stderr = process::spawn_stderr_collector(&mut client);

        let mut sql = reader
            .stdout
            .take()
            .context("mysqlbinlog has no stdout pipe")?;
        let mut client_stdin = client
            .stdin
            .take()
            .context("The mysql client has no stdin pipe")?;
        let piped = tokio::io::copy(&mut sql, &mut client_stdin)
            .await
            .context("Failed to pipe mysqlbinlog output into the mysql client")?;
        drop(client_stdin);

        let (reader_status, client_status) = tokio::join!(reader.wait(), client.wait());
        let reader_status = reader_status.context("Failed to wait for mysqlbinlog")?;
        let client_status = client_status.context("Failed to wait for the mysql client")?;

        if !reader_status.success() {
            bail!(
                "mysqlbinlog exited with {reader_status}: {}",
                process::collected_stderr(reader_stderr).await
            );
        }
        if !client_status.success() {
            bail!(
                "The mysql client exited with {client_status} during replay: {}",
                process::collected_stderr(client_stderr).await
            );
        }
        Ok(piped)
    }

    fn client_command(&self) -> Command {
        let mut cmd = Command::new("mysql");
        cmd.arg(format!("-u{}", self.connection.user))
            .arg(format!("-p{}", self.connection.password))
            .arg(format!("--host={}", self.connection.host))
            .arg(format!("--port={}", self.connection.port));
        cmd
    }
}

fn purge_to_statement(log_name: &str) -> String {
    format!("PURGE BINARY LOGS TO '{}'", log_name.replace('\'', "''"))
}

fn admin_query_error(e: mysql_async::Error, statement: &str) -> anyhow::Error {
    let denied = matches!(
        &e,
        mysql_async::Error::Server(server_err) if ACCESS_DENIED_CODES.contains(&server_err.code)
    );
    if denied {
        anyhow::Error::new(e).context(format!(
            "The server denied '{statement}'; the configured user lacks the required privilege"
        ))
    } else {
        anyhow::Error::new(e).context(format!("Failed to execute '{statement}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_statement_quotes_the_log_name() {
        assert_eq!(
            purge_to_statement("mysql-bin.000003"),
            "PURGE BINARY LOGS TO 'mysql-bin.000003'"
        );
        // a hostile name must not break out of the literal
        assert_eq!(
            purge_to_statement("x'; DROP TABLE t; --"),
            "PURGE BINARY LOGS TO 'x''; DROP TABLE t; --'"
        );
    }
}
