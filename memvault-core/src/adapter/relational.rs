/*!
Relational store adapter (Postgres).

Capture performs one `pg_dumpall --roles-only` shared across databases plus a
full logical dump per configured database. Dumps are taken with `--clean
--if-exists` so replaying one is a create-or-replace operation: existing
objects are dropped before being recreated, and re-running a restore is safe.
Restore applies the roles dump first (tolerating "already exists" conflicts),
creates each target database if absent, then applies its dump with
`ON_ERROR_STOP` enabled.
*/

use super::{Cardinality, StoreAdapter};
use crate::config::RelationalConfig;
use crate::metadata::{StoreKind, StoreManifest, UnitRecord};
use crate::{Result, VaultError};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Unit name of the shared roles dump.
pub const ROLES_UNIT: &str = "roles";

/// Maintenance database used for server-level statements.
const MAINTENANCE_DB: &str = "postgres";

/// Quote a string literal for interpolation into SQL, doubling embedded
/// single quotes. Database names arrive from archive manifests, which may
/// have been produced on another host.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote an identifier, doubling embedded double quotes.
fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Postgres-backed implementation of [`StoreAdapter`].
pub struct RelationalAdapter {
    config: RelationalConfig,
}

impl RelationalAdapter {
    pub fn new(config: RelationalConfig) -> Self {
        Self { config }
    }

    /// Build a command for one of the Postgres client tools with connection
    /// parameters applied. The password travels via `PGPASSWORD`, never argv.
    fn tool(&self, name: &str) -> Command {
        let mut cmd = Command::new(name);
        cmd.arg("-h")
            .arg(&self.config.host)
            .arg("-p")
            .arg(self.config.port.to_string())
            .arg("-U")
            .arg(&self.config.user)
            .env("PGPASSWORD", &self.config.password)
            .stdin(Stdio::null());
        cmd
    }

    async fn run(&self, mut cmd: Command, tool: &str) -> Result<String> {
        debug!(tool, "running postgres client tool");
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(VaultError::Tool {
                tool: tool.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a single SQL statement and return its unaligned tuple output.
    async fn query(&self, database: &str, sql: &str) -> Result<String> {
        let mut cmd = self.tool("psql");
        cmd.arg("-d").arg(database).arg("-tA").arg("-c").arg(sql);
        self.run(cmd, "psql").await
    }

    async fn dump_roles(&self, dest: &Path) -> Result<()> {
        let mut cmd = self.tool("pg_dumpall");
        cmd.arg("--roles-only").arg("-f").arg(dest);
        self.run(cmd, "pg_dumpall").await?;
        Ok(())
    }

    /// Dump one database. `--clean --if-exists` makes the dump drop each
    /// object before recreating it, so applying it over a populated database
    /// replaces the content instead of erroring out.
    fn dump_database_command(&self, database: &str, dest: &Path) -> Command {
        let mut cmd = self.tool("pg_dump");
        cmd.arg("--clean")
            .arg("--if-exists")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("-d")
            .arg(database)
            .arg("-f")
            .arg(dest);
        cmd
    }

    async fn dump_database(&self, database: &str, dest: &Path) -> Result<()> {
        self.run(self.dump_database_command(database, dest), "pg_dump")
            .await?;
        Ok(())
    }

    async fn apply_sql_file(&self, database: &str, file: &Path, strict: bool) -> Result<()> {
        let mut cmd = self.tool("psql");
        if strict {
            cmd.arg("-v").arg("ON_ERROR_STOP=1");
        }
        cmd.arg("-d").arg(database).arg("-f").arg(file);
        self.run(cmd, "psql").await?;
        Ok(())
    }

    async fn database_exists(&self, database: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM pg_database WHERE datname = {}",
            quote_literal(database)
        );
        let out = self.query(MAINTENANCE_DB, &sql).await?;
        Ok(out.trim() == "1")
    }

    async fn create_database(&self, database: &str) -> Result<()> {
        let sql = format!("CREATE DATABASE {}", quote_ident(database));
        self.query(MAINTENANCE_DB, &sql).await?;
        Ok(())
    }

    async fn table_count(&self, database: &str) -> Result<u64> {
        let out = self
            .query(
                database,
                "SELECT count(*) FROM information_schema.tables WHERE table_schema = 'public'",
            )
            .await?;
        out.trim()
            .parse()
            .map_err(|_| VaultError::validation(format!("unexpected table count output: {out}")))
    }

    async fn row_estimate(&self, database: &str) -> Result<u64> {
        let out = self
            .query(
                database,
                "SELECT coalesce(sum(n_live_tup), 0) FROM pg_stat_user_tables",
            )
            .await?;
        out.trim()
            .parse()
            .map_err(|_| VaultError::validation(format!("unexpected row estimate output: {out}")))
    }
}

#[async_trait]
impl StoreAdapter for RelationalAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    async fn discover(&self) -> Result<Vec<String>> {
        Ok(self.config.databases.clone())
    }

    async fn capture(&self, dest: &Path) -> Result<StoreManifest> {
        fs::create_dir_all(dest).await?;
        let mut manifest = StoreManifest::new(StoreKind::Relational);
        let dir = StoreKind::Relational.dir_name();

        // Roles are captured once, shared across all databases.
        let roles_file = dest.join("roles.sql");
        match self.dump_roles(&roles_file).await {
            Ok(()) => {
                manifest.push(UnitRecord::captured(
                    ROLES_UNIT,
                    vec![format!("{dir}/roles.sql")],
                ));
            }
            Err(e) => {
                warn!(error = %e, "roles dump failed");
                manifest.push(UnitRecord::failed(ROLES_UNIT, e.to_string()));
            }
        }

        for database in &self.config.databases {
            let file_name = format!("{database}.sql");
            match self.dump_database(database, &dest.join(&file_name)).await {
                Ok(()) => {
                    info!(database, "database dumped");
                    manifest.push(UnitRecord::captured(
                        database,
                        vec![format!("{dir}/{file_name}")],
                    ));
                }
                Err(e) => {
                    warn!(database, error = %e, "database dump failed");
                    manifest.push(UnitRecord::failed(database, e.to_string()));
                }
            }
        }
        Ok(manifest)
    }

    async fn restore(&self, src: &Path, manifest: &StoreManifest) -> Result<()> {
        // Roles first: "already exists" noise is expected on a non-virgin
        // server, so this pass is deliberately not strict.
        if let Some(roles) = manifest.captured_units().find(|u| u.name == ROLES_UNIT) {
            let file = src.join(&roles.files[0]);
            if let Err(e) = self.apply_sql_file(MAINTENANCE_DB, &file, false).await {
                warn!(error = %e, "roles restore reported errors, continuing");
            }
        }

        for unit in manifest.captured_units().filter(|u| u.name != ROLES_UNIT) {
            let file = unit
                .files
                .first()
                .map(|f| src.join(f))
                .ok_or_else(|| VaultError::restore(&unit.name, "manifest lists no files"))?;

            if !self
                .database_exists(&unit.name)
                .await
                .map_err(|e| VaultError::restore(&unit.name, e.to_string()))?
            {
                self.create_database(&unit.name)
                    .await
                    .map_err(|e| VaultError::restore(&unit.name, e.to_string()))?;
            }

            self.apply_sql_file(&unit.name, &file, true)
                .await
                .map_err(|e| VaultError::restore(&unit.name, e.to_string()))?;
            info!(database = %unit.name, "database restored");
        }
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        for database in &self.config.databases {
            if self.database_exists(database).await? && self.table_count(database).await? > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn probe(&self) -> Result<()> {
        self.query(MAINTENANCE_DB, "SELECT 1").await.map(|_| ())
    }

    async fn cardinality(&self) -> Result<Vec<Cardinality>> {
        let mut counts = Vec::new();
        for database in &self.config.databases {
            counts.push(Cardinality::new(
                database.clone(),
                "tables",
                self.table_count(database).await?,
            ));
            counts.push(Cardinality::new(
                database.clone(),
                "rows (estimated)",
                self.row_estimate(database).await?,
            ));
        }
        Ok(counts)
    }
}
