use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::models::{
    Environment, EnvironmentId, SpawnError, SpawnErrorKind, Worker, WorkerId, WorkerStatus,
};
use crate::persistence::{
    EnvironmentStore, MigrationStore, PersistenceResult, WorkerStore, environment_in_use,
};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "spawn_schema_migrations";

const ENVIRONMENT_COLUMNS: &str = "environment_id, name, repo_url, branch, docker_image, \
     environment_vars_json, created_at_unix_ms";

const WORKER_COLUMNS: &str = "worker_id, environment_id, prompt, status, container_id, \
     created_at_unix_ms, last_activity_unix_ms";

/// Registry backed by a SQLite file. A connection is opened per operation.
pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// Opens the store and brings the schema to the latest version.
    pub fn open(database_path: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let store = Self::new(database_path);
        store.migrate_to_latest()?;
        Ok(store)
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // Recorded versions with missing tables: DDL is IF NOT EXISTS,
                // so replaying it is a no-op on a healthy database.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl EnvironmentStore for SqliteStore {
    fn save_environment(&self, environment: &Environment) -> PersistenceResult<()> {
        self.with_connection("save_environment", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;

            let holder: Option<String> = transaction
                .query_row(
                    "SELECT environment_id FROM environments WHERE name = ?1 AND environment_id != ?2",
                    params![environment.name, environment.id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if holder.is_some() {
                return Ok(Err(SpawnError::new(
                    SpawnErrorKind::EnvironmentExists,
                    format!("environment '{}' already exists", environment.name),
                )
                .for_environment(&environment.id)));
            }

            transaction.execute(
                "
INSERT INTO environments (
    environment_id, name, repo_url, branch, docker_image, environment_vars_json, created_at_unix_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(environment_id) DO UPDATE SET
    name = excluded.name,
    repo_url = excluded.repo_url,
    branch = excluded.branch,
    docker_image = excluded.docker_image,
    environment_vars_json = excluded.environment_vars_json,
    created_at_unix_ms = excluded.created_at_unix_ms
",
                params![
                    environment.id.as_str(),
                    environment.name,
                    environment.repo_url,
                    environment.branch,
                    environment.docker_image,
                    vars_to_json(&environment.environment_vars)?,
                    to_unix_millis(environment.created_at)?,
                ],
            )?;
            transaction.commit()?;
            Ok(Ok(()))
        })?
    }

    fn environment_by_id(&self, id: &EnvironmentId) -> PersistenceResult<Option<Environment>> {
        self.with_connection("environment_by_id", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    &format!(
                        "SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE environment_id = ?1"
                    ),
                    [id.as_str()],
                    environment_from_row,
                )
                .optional()
        })
    }

    fn environment_by_name(&self, name: &str) -> PersistenceResult<Option<Environment>> {
        self.with_connection("environment_by_name", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    &format!("SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE name = ?1"),
                    [name],
                    environment_from_row,
                )
                .optional()
        })
    }

    fn list_environments(&self) -> PersistenceResult<Vec<Environment>> {
        self.with_connection("list_environments", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "SELECT {ENVIRONMENT_COLUMNS} FROM environments
                 ORDER BY created_at_unix_ms ASC, environment_id ASC"
            ))?;
            let rows = statement.query_map([], environment_from_row)?;
            rows.collect()
        })
    }

    fn delete_environment(&self, id: &EnvironmentId) -> PersistenceResult<bool> {
        self.with_connection("delete_environment", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;

            let running: i64 = transaction.query_row(
                "SELECT COUNT(*) FROM workers WHERE environment_id = ?1 AND status = ?2",
                params![id.as_str(), WorkerStatus::Running.as_str()],
                |row| row.get(0),
            )?;
            if running > 0 {
                let running = usize::try_from(running).unwrap_or(usize::MAX);
                return Ok(Err(environment_in_use(id, running)));
            }

            transaction.execute(
                "DELETE FROM workers WHERE environment_id = ?1",
                [id.as_str()],
            )?;
            let deleted = transaction.execute(
                "DELETE FROM environments WHERE environment_id = ?1",
                [id.as_str()],
            )?;
            transaction.commit()?;
            Ok(Ok(deleted > 0))
        })?
    }
}

impl WorkerStore for SqliteStore {
    fn save_worker(&self, worker: &Worker) -> PersistenceResult<()> {
        self.with_connection("save_worker", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO workers (
    worker_id, environment_id, prompt, status, container_id, created_at_unix_ms, last_activity_unix_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(worker_id) DO UPDATE SET
    environment_id = excluded.environment_id,
    prompt = excluded.prompt,
    status = excluded.status,
    container_id = excluded.container_id,
    created_at_unix_ms = excluded.created_at_unix_ms,
    last_activity_unix_ms = excluded.last_activity_unix_ms
",
                params![
                    worker.id.as_str(),
                    worker.env_id.as_str(),
                    worker.prompt,
                    worker.status.as_str(),
                    worker.container_id.as_deref(),
                    to_unix_millis(worker.created_at)?,
                    to_unix_millis(worker.last_activity)?,
                ],
            )?;
            Ok(())
        })
    }

    fn update_worker(&self, worker: &Worker) -> PersistenceResult<bool> {
        self.with_connection("update_worker", |connection| {
            ensure_schema_ready(connection)?;
            let updated = connection.execute(
                "
UPDATE workers
SET environment_id = ?2, prompt = ?3, status = ?4, container_id = ?5,
    created_at_unix_ms = ?6, last_activity_unix_ms = ?7
WHERE worker_id = ?1
",
                params![
                    worker.id.as_str(),
                    worker.env_id.as_str(),
                    worker.prompt,
                    worker.status.as_str(),
                    worker.container_id.as_deref(),
                    to_unix_millis(worker.created_at)?,
                    to_unix_millis(worker.last_activity)?,
                ],
            )?;
            Ok(updated > 0)
        })
    }

    fn worker_by_id(&self, id: &WorkerId) -> PersistenceResult<Option<Worker>> {
        self.with_connection("worker_by_id", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE worker_id = ?1"),
                    [id.as_str()],
                    worker_from_row,
                )
                .optional()
        })
    }

    fn list_workers(&self) -> PersistenceResult<Vec<Worker>> {
        self.with_connection("list_workers", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "SELECT {WORKER_COLUMNS} FROM workers
                 ORDER BY created_at_unix_ms ASC, worker_id ASC"
            ))?;
            let rows = statement.query_map([], worker_from_row)?;
            rows.collect()
        })
    }

    fn list_workers_for_environment(
        &self,
        environment: &EnvironmentId,
    ) -> PersistenceResult<Vec<Worker>> {
        self.with_connection("list_workers_for_environment", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "SELECT {WORKER_COLUMNS} FROM workers
                 WHERE environment_id = ?1
                 ORDER BY created_at_unix_ms ASC, worker_id ASC"
            ))?;
            let rows = statement.query_map([environment.as_str()], worker_from_row)?;
            rows.collect()
        })
    }

    fn delete_worker(&self, id: &WorkerId) -> PersistenceResult<bool> {
        self.with_connection("delete_worker", |connection| {
            ensure_schema_ready(connection)?;
            let deleted =
                connection.execute("DELETE FROM workers WHERE worker_id = ?1", [id.as_str()])?;
            Ok(deleted > 0)
        })
    }
}

fn environment_from_row(row: &Row<'_>) -> rusqlite::Result<Environment> {
    let id: String = row.get(0)?;
    let vars_json: String = row.get(5)?;
    let created_at_unix_ms: i64 = row.get(6)?;

    Ok(Environment {
        id: EnvironmentId(id),
        name: row.get(1)?,
        repo_url: row.get(2)?,
        branch: row.get(3)?,
        docker_image: row.get(4)?,
        environment_vars: vars_from_json(&vars_json)?,
        created_at: from_unix_millis(created_at_unix_ms)?,
    })
}

fn worker_from_row(row: &Row<'_>) -> rusqlite::Result<Worker> {
    let id: String = row.get(0)?;
    let environment_id: String = row.get(1)?;
    let status_raw: String = row.get(3)?;
    let created_at_unix_ms: i64 = row.get(5)?;
    let last_activity_unix_ms: i64 = row.get(6)?;

    Ok(Worker {
        id: WorkerId(id),
        env_id: EnvironmentId(environment_id),
        prompt: row.get(2)?,
        status: parse_worker_status(&status_raw)?,
        container_id: row.get(4)?,
        created_at: from_unix_millis(created_at_unix_ms)?,
        last_activity: from_unix_millis(last_activity_unix_ms)?,
    })
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    Connection::open(database_path)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before registry operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn parse_worker_status(raw: &str) -> rusqlite::Result<WorkerStatus> {
    raw.parse::<WorkerStatus>().map_err(|_| {
        storage_error_sqlite(&format!(
            "unknown worker status '{raw}' found in persisted sqlite record"
        ))
    })
}

fn vars_to_json(vars: &BTreeMap<String, String>) -> rusqlite::Result<String> {
    serde_json::to_string(vars)
        .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))
}

fn vars_from_json(raw: &str) -> rusqlite::Result<BTreeMap<String, String>> {
    serde_json::from_str(raw).map_err(|error| {
        storage_error_sqlite(&format!("malformed environment_vars_json: {error}"))
    })
}

fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp millis exceed i64 range"))
}

fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn storage_error(operation: &str, error: rusqlite::Error) -> SpawnError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> SpawnError {
    SpawnError::new(
        SpawnErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
