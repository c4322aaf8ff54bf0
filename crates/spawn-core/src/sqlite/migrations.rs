#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_registry_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS environments (
    environment_id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    repo_url TEXT NOT NULL,
    branch TEXT NOT NULL,
    docker_image TEXT NOT NULL,
    environment_vars_json TEXT NOT NULL DEFAULT '{}',
    created_at_unix_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS workers (
    worker_id TEXT PRIMARY KEY,
    environment_id TEXT NOT NULL,
    prompt TEXT NOT NULL,
    status TEXT NOT NULL,
    container_id TEXT,
    created_at_unix_ms INTEGER NOT NULL,
    last_activity_unix_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workers_environment
    ON workers (environment_id);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_workers_environment;
DROP TABLE IF EXISTS workers;
DROP TABLE IF EXISTS environments;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "index_worker_status",
    up_sql: r#"
CREATE INDEX IF NOT EXISTS idx_workers_status
    ON workers (status);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_workers_status;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
