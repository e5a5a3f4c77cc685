//! MigrationManager - file-based versioned migrations with rollback
//!
//! Migration files live in one directory and are named
//! `<14-digit version>_<name>.sql`. Each file has an optional
//! `-- migrate:up` section and an optional `-- migrate:down` section; a file
//! with neither marker is treated as all "up" with no rollback.
//!
//! Every migration runs its SQL and writes its tracking row inside one
//! transaction. A failure rolls back that migration only and aborts the rest
//! of the run. Runs are serialized across processes with an advisory lock.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use pulsegrid_core::{Error, Result};
use regex::Regex;
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgPool, Postgres};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::classify;
use crate::metrics::StoreMetrics;

static FILE_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{14})_([A-Za-z0-9_-]+)\.sql$").expect("valid regex"));

/// Advisory lock key shared by every process migrating this database
pub const MIGRATION_LOCK_KEY: i64 = 0x5055_4c53_4547_5244;

const TRACKING_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        rollback_sql TEXT
    )
"#;

/// A migration discovered on disk
#[derive(Debug, Clone)]
pub struct MigrationFile {
    pub version: String,
    pub name: String,
    pub path: PathBuf,
    pub up_sql: String,
    pub down_sql: Option<String>,
}

impl MigrationFile {
    /// Split a file name into `(version, name)`; `None` if it does not match
    pub fn parse_file_name(file_name: &str) -> Option<(String, String)> {
        let caps = FILE_NAME_PATTERN.captures(file_name)?;
        Some((caps[1].to_string(), caps[2].to_string()))
    }

    pub fn from_contents(version: String, name: String, path: PathBuf, contents: &str) -> Self {
        let (up_sql, down_sql) = split_sections(contents);
        Self {
            version,
            name,
            path,
            up_sql,
            down_sql,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Preamble,
    Up,
    Down,
}

/// Split file contents into up SQL and optional down SQL
pub fn split_sections(contents: &str) -> (String, Option<String>) {
    let mut preamble = Vec::new();
    let mut up = Vec::new();
    let mut down = Vec::new();
    let mut saw_up = false;
    let mut section = Section::Preamble;

    for line in contents.lines() {
        let marker = line.trim().to_ascii_lowercase();
        if marker == "-- migrate:up" {
            section = Section::Up;
            saw_up = true;
            continue;
        }
        if marker == "-- migrate:down" {
            section = Section::Down;
            continue;
        }
        match section {
            Section::Preamble => preamble.push(line),
            Section::Up => up.push(line),
            Section::Down => down.push(line),
        }
    }

    let up_sql = if saw_up { up.join("\n") } else { preamble.join("\n") };
    let down_sql = down.join("\n");
    let down_sql = if down_sql.trim().is_empty() {
        None
    } else {
        Some(down_sql.trim().to_string())
    };
    (up_sql.trim().to_string(), down_sql)
}

/// A row of `schema_migrations`
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
    pub applied_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub rollback_sql: Option<String>,
}

impl MigrationRecord {
    pub fn has_rollback(&self) -> bool {
        self.rollback_sql.is_some()
    }
}

/// Problem found by `validate_migrations`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationIssue {
    /// Recorded as applied but no file with that version exists
    AppliedWithoutFile { version: String },
    /// Two or more files share a version
    DuplicateVersion { version: String, files: Vec<PathBuf> },
    /// A pending file is older than the newest applied version
    OutOfOrder {
        version: String,
        latest_applied: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingMigration {
    pub version: String,
    pub name: String,
    pub has_rollback: bool,
}

impl From<&MigrationFile> for PendingMigration {
    fn from(file: &MigrationFile) -> Self {
        Self {
            version: file.version.clone(),
            name: file.name.clone(),
            has_rollback: file.down_sql.is_some(),
        }
    }
}

/// Applied and pending migrations for introspection
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub current_version: Option<String>,
    pub applied: Vec<MigrationRecord>,
    pub pending: Vec<PendingMigration>,
}

/// Files to apply, in version order: unapplied and at or below `target`
pub fn plan_migrate<'a>(
    files: &'a [MigrationFile],
    applied: &[MigrationRecord],
    target: Option<&str>,
) -> Vec<&'a MigrationFile> {
    let applied: BTreeSet<&str> = applied.iter().map(|r| r.version.as_str()).collect();
    let mut plan: Vec<&MigrationFile> = files
        .iter()
        .filter(|f| !applied.contains(f.version.as_str()))
        .filter(|f| target.is_none_or(|t| f.version.as_str() <= t))
        .collect();
    plan.sort_by(|a, b| a.version.cmp(&b.version));
    plan
}

/// Records to undo, newest first: the newest one, or every one above `target`
pub fn plan_rollback<'a>(
    applied: &'a [MigrationRecord],
    target: Option<&str>,
) -> Vec<&'a MigrationRecord> {
    let mut newest_first: Vec<&MigrationRecord> = applied.iter().collect();
    newest_first.sort_by(|a, b| b.version.cmp(&a.version));
    match target {
        None => newest_first.into_iter().take(1).collect(),
        Some(t) => newest_first
            .into_iter()
            .filter(|r| r.version.as_str() > t)
            .collect(),
    }
}

/// Detect orphaned records, duplicate versions and out-of-order pending files
pub fn validate(files: &[MigrationFile], applied: &[MigrationRecord]) -> Vec<MigrationIssue> {
    let mut issues = Vec::new();

    let mut by_version: BTreeMap<&str, Vec<PathBuf>> = BTreeMap::new();
    for file in files {
        by_version
            .entry(file.version.as_str())
            .or_default()
            .push(file.path.clone());
    }
    for (version, paths) in &by_version {
        if paths.len() > 1 {
            issues.push(MigrationIssue::DuplicateVersion {
                version: version.to_string(),
                files: paths.clone(),
            });
        }
    }

    for record in applied {
        if !by_version.contains_key(record.version.as_str()) {
            issues.push(MigrationIssue::AppliedWithoutFile {
                version: record.version.clone(),
            });
        }
    }

    if let Some(latest) = applied.iter().map(|r| r.version.as_str()).max() {
        let applied_set: BTreeSet<&str> = applied.iter().map(|r| r.version.as_str()).collect();
        for version in by_version.keys() {
            if !applied_set.contains(version) && *version < latest {
                issues.push(MigrationIssue::OutOfOrder {
                    version: version.to_string(),
                    latest_applied: latest.to_string(),
                });
            }
        }
    }

    issues
}

/// Discover migration files in `dir`, sorted by version
///
/// Non-matching file names are skipped with a warning. A missing directory
/// yields no migrations.
pub async fn discover(dir: &Path) -> Result<Vec<MigrationFile>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(dir = %dir.display(), "Migrations directory not found");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((version, name)) = MigrationFile::parse_file_name(file_name) else {
            warn!(file = %file_name, "Skipping file with invalid migration name");
            continue;
        };
        let contents = tokio::fs::read_to_string(&path).await?;
        files.push(MigrationFile::from_contents(version, name, path, &contents));
    }

    files.sort_by(|a, b| a.version.cmp(&b.version).then(a.path.cmp(&b.path)));
    debug!(count = files.len(), dir = %dir.display(), "Discovered migrations");
    Ok(files)
}

pub struct MigrationManager {
    pool: PgPool,
    dir: PathBuf,
    metrics: Option<StoreMetrics>,
}

impl MigrationManager {
    pub fn new(pool: PgPool, dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            dir: dir.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: StoreMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_tracking_table(&self) -> Result<()> {
        sqlx::raw_sql(TRACKING_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "Failed to create schema_migrations table"))?;
        Ok(())
    }

    pub async fn discover(&self) -> Result<Vec<MigrationFile>> {
        discover(&self.dir).await
    }

    pub async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>> {
        self.ensure_tracking_table().await?;
        sqlx::query_as::<_, MigrationRecord>(
            "SELECT version, name, applied_at, rollback_sql FROM schema_migrations ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, "Failed to fetch applied migrations"))
    }

    pub async fn pending_migrations(&self) -> Result<Vec<MigrationFile>> {
        let files = self.discover().await?;
        let applied = self.applied_migrations().await?;
        Ok(plan_migrate(&files, &applied, None)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Returns a list of issues; an empty list means the set is consistent
    pub async fn validate_migrations(&self) -> Result<Vec<MigrationIssue>> {
        let files = self.discover().await?;
        let applied = self.applied_migrations().await?;
        let issues = validate(&files, &applied);
        for issue in &issues {
            warn!(?issue, "Migration validation issue");
        }
        Ok(issues)
    }

    pub async fn status(&self) -> Result<MigrationStatus> {
        let files = self.discover().await?;
        let applied = self.applied_migrations().await?;
        let pending = plan_migrate(&files, &applied, None)
            .into_iter()
            .map(PendingMigration::from)
            .collect();
        let current_version = applied.iter().map(|r| r.version.clone()).max();
        Ok(MigrationStatus {
            current_version,
            applied,
            pending,
        })
    }

    /// Apply pending migrations up to `target` (all when `None`)
    ///
    /// Returns the versions applied by this run.
    pub async fn migrate(&self, target: Option<&str>) -> Result<Vec<String>> {
        self.ensure_tracking_table().await?;
        let files = self.discover().await?;

        if let Some(MigrationIssue::DuplicateVersion { version, .. }) = validate(&files, &[])
            .into_iter()
            .find(|i| matches!(i, MigrationIssue::DuplicateVersion { .. }))
        {
            return Err(Error::Migration {
                version,
                message: "duplicate migration version".to_string(),
            });
        }

        let mut conn = self.lock().await?;
        let result = self.migrate_locked(&mut conn, &files, target).await;
        self.unlock(&mut conn).await;
        result
    }

    async fn migrate_locked(
        &self,
        conn: &mut PoolConnection<Postgres>,
        files: &[MigrationFile],
        target: Option<&str>,
    ) -> Result<Vec<String>> {
        // Re-read under the lock so a concurrent run is observed
        let applied = self.applied_migrations().await?;
        let plan = plan_migrate(files, &applied, target);
        if plan.is_empty() {
            info!("No pending migrations");
            return Ok(Vec::new());
        }

        let mut done = Vec::with_capacity(plan.len());
        for file in plan {
            info!(version = %file.version, name = %file.name, "Applying migration");
            let started = Instant::now();
            apply_one(conn, file).await.map_err(|message| Error::Migration {
                version: file.version.clone(),
                message,
            })?;
            if let Some(metrics) = &self.metrics {
                metrics.record_migration(&file.version, started.elapsed().as_secs_f64());
            }
            done.push(file.version.clone());
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_migrations_applied(applied.len() + done.len());
        }
        info!(count = done.len(), "Migrations applied");
        Ok(done)
    }

    /// Undo the newest migration, or every migration above `target`
    ///
    /// A migration recorded without rollback SQL is skipped with a warning
    /// and its record is kept. Returns the versions rolled back.
    pub async fn rollback(&self, target: Option<&str>) -> Result<Vec<String>> {
        self.ensure_tracking_table().await?;
        let mut conn = self.lock().await?;
        let result = self.rollback_locked(&mut conn, target).await;
        self.unlock(&mut conn).await;
        result
    }

    async fn rollback_locked(
        &self,
        conn: &mut PoolConnection<Postgres>,
        target: Option<&str>,
    ) -> Result<Vec<String>> {
        let applied = self.applied_migrations().await?;
        let plan = plan_rollback(&applied, target);

        let mut done = Vec::new();
        for record in plan {
            let Some(down_sql) = record.rollback_sql.as_deref() else {
                warn!(
                    version = %record.version,
                    name = %record.name,
                    "Migration has no rollback SQL, skipping"
                );
                continue;
            };
            info!(version = %record.version, name = %record.name, "Rolling back migration");
            revert_one(conn, &record.version, down_sql)
                .await
                .map_err(|message| Error::Migration {
                    version: record.version.clone(),
                    message,
                })?;
            done.push(record.version.clone());
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_migrations_applied(applied.len() - done.len());
        }
        Ok(done)
    }

    async fn lock(&self) -> Result<PoolConnection<Postgres>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| classify(e, "Failed to acquire migration connection"))?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await
            .map_err(|e| classify(e, "Failed to take migration lock"))?;
        debug!("Migration lock acquired");
        Ok(conn)
    }

    async fn unlock(&self, conn: &mut PoolConnection<Postgres>) {
        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut **conn)
            .await
        {
            // Session locks die with the connection; closing it would also release
            warn!(error = %e, "Failed to release migration lock");
        }
    }
}

async fn apply_one(
    conn: &mut PoolConnection<Postgres>,
    file: &MigrationFile,
) -> std::result::Result<(), String> {
    let mut tx = Connection::begin(&mut **conn)
        .await
        .map_err(|e| e.to_string())?;
    sqlx::raw_sql(&file.up_sql)
        .execute(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;
    sqlx::query("INSERT INTO schema_migrations (version, name, rollback_sql) VALUES ($1, $2, $3)")
        .bind(&file.version)
        .bind(&file.name)
        .bind(&file.down_sql)
        .execute(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;
    tx.commit().await.map_err(|e| e.to_string())
}

async fn revert_one(
    conn: &mut PoolConnection<Postgres>,
    version: &str,
    down_sql: &str,
) -> std::result::Result<(), String> {
    let mut tx = Connection::begin(&mut **conn)
        .await
        .map_err(|e| e.to_string())?;
    sqlx::raw_sql(down_sql)
        .execute(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;
    sqlx::query("DELETE FROM schema_migrations WHERE version = $1")
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;
    tx.commit().await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn file(version: &str, name: &str, down: Option<&str>) -> MigrationFile {
        MigrationFile {
            version: version.to_string(),
            name: name.to_string(),
            path: PathBuf::from(format!("{}_{}.sql", version, name)),
            up_sql: format!("CREATE TABLE {} (id INT)", name),
            down_sql: down.map(str::to_string),
        }
    }

    fn record(version: &str, rollback: Option<&str>) -> MigrationRecord {
        MigrationRecord {
            version: version.to_string(),
            name: format!("m{}", version),
            applied_at: Utc::now(),
            rollback_sql: rollback.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            MigrationFile::parse_file_name("20240101120000_add_users.sql"),
            Some(("20240101120000".to_string(), "add_users".to_string()))
        );
        assert_eq!(
            MigrationFile::parse_file_name("20240101120000_add-index.sql"),
            Some(("20240101120000".to_string(), "add-index".to_string()))
        );
        assert!(MigrationFile::parse_file_name("2024_add_users.sql").is_none());
        assert!(MigrationFile::parse_file_name("20240101120000_add users.sql").is_none());
        assert!(MigrationFile::parse_file_name("20240101120000_add_users.txt").is_none());
    }

    #[test]
    fn test_split_sections() {
        let contents = "-- header comment\n-- migrate:up\nCREATE TABLE a (id INT);\n\n-- migrate:down\nDROP TABLE a;\n";
        let (up, down) = split_sections(contents);
        assert_eq!(up, "CREATE TABLE a (id INT);");
        assert_eq!(down.as_deref(), Some("DROP TABLE a;"));
    }

    #[test]
    fn test_split_without_markers_is_all_up() {
        let (up, down) = split_sections("CREATE TABLE a (id INT);\n");
        assert_eq!(up, "CREATE TABLE a (id INT);");
        assert!(down.is_none());
    }

    #[test]
    fn test_split_empty_down_is_none() {
        let (up, down) = split_sections("-- migrate:up\nSELECT 1;\n-- migrate:down\n\n");
        assert_eq!(up, "SELECT 1;");
        assert!(down.is_none());
    }

    #[test]
    fn test_plan_migrate_skips_applied_and_respects_target() {
        let files = vec![
            file("20240103000000", "c", None),
            file("20240101000000", "a", None),
            file("20240102000000", "b", None),
        ];
        let applied = vec![record("20240101000000", None)];

        let all: Vec<_> = plan_migrate(&files, &applied, None)
            .iter()
            .map(|f| f.version.as_str())
            .collect();
        assert_eq!(all, vec!["20240102000000", "20240103000000"]);

        let up_to: Vec<_> = plan_migrate(&files, &applied, Some("20240102000000"))
            .iter()
            .map(|f| f.version.as_str())
            .collect();
        assert_eq!(up_to, vec!["20240102000000"]);
    }

    #[test]
    fn test_plan_migrate_is_empty_when_all_applied() {
        let files = vec![file("20240101000000", "a", None)];
        let applied = vec![record("20240101000000", None)];
        assert!(plan_migrate(&files, &applied, None).is_empty());
    }

    #[test]
    fn test_plan_rollback_defaults_to_newest() {
        let applied = vec![
            record("20240101000000", Some("DROP TABLE a")),
            record("20240103000000", Some("DROP TABLE c")),
            record("20240102000000", Some("DROP TABLE b")),
        ];
        let plan = plan_rollback(&applied, None);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].version, "20240103000000");
    }

    #[test]
    fn test_plan_rollback_to_target_is_reverse_order() {
        let applied = vec![
            record("20240101000000", None),
            record("20240102000000", None),
            record("20240103000000", None),
        ];
        let versions: Vec<_> = plan_rollback(&applied, Some("20240101000000"))
            .iter()
            .map(|r| r.version.as_str())
            .collect();
        assert_eq!(versions, vec!["20240103000000", "20240102000000"]);
    }

    #[test]
    fn test_validate_reports_each_issue_kind() {
        let files = vec![
            file("20240101000000", "a", None),
            file("20240102000000", "b", None),
            file("20240102000000", "b_again", None),
        ];
        let applied = vec![record("20240103000000", None), record("20231231000000", None)];

        let issues = validate(&files, &applied);
        assert!(issues.contains(&MigrationIssue::DuplicateVersion {
            version: "20240102000000".to_string(),
            files: vec![
                PathBuf::from("20240102000000_b.sql"),
                PathBuf::from("20240102000000_b_again.sql"),
            ],
        }));
        assert!(issues.contains(&MigrationIssue::AppliedWithoutFile {
            version: "20231231000000".to_string(),
        }));
        assert!(issues.contains(&MigrationIssue::OutOfOrder {
            version: "20240101000000".to_string(),
            latest_applied: "20240103000000".to_string(),
        }));
    }

    #[test]
    fn test_validate_clean_set() {
        let files = vec![file("20240101000000", "a", None)];
        let applied = vec![record("20240101000000", None)];
        assert!(validate(&files, &applied).is_empty());
    }

    #[tokio::test]
    async fn test_discover_reads_and_sorts_files() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("20240102000000_second.sql"),
            "-- migrate:up\nCREATE TABLE b (id INT);\n-- migrate:down\nDROP TABLE b;\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("20240101000000_first.sql"),
            "CREATE TABLE a (id INT);\n",
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "not a migration").unwrap();

        let files = discover(dir.path()).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "first");
        assert!(files[0].down_sql.is_none());
        assert_eq!(files[1].name, "second");
        assert_eq!(files[1].down_sql.as_deref(), Some("DROP TABLE b;"));
    }

    #[tokio::test]
    async fn test_discover_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let files = discover(&dir.path().join("nope")).await.unwrap();
        assert!(files.is_empty());
    }
}
