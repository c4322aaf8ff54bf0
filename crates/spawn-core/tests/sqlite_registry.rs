use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use spawn_core::models::{
    Environment, EnvironmentId, SpawnErrorKind, Worker, WorkerId, WorkerStatus,
};
use spawn_core::persistence::{EnvironmentStore, MigrationStore, WorkerStore};
use spawn_core::sqlite::{SqliteStore, current_schema_version};

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("spawn-{test_name}-{nanos}.sqlite3"))
}

fn at_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

fn environment(id: &str, name: &str, created_ms: u64) -> Environment {
    Environment {
        id: EnvironmentId(id.to_string()),
        name: name.to_string(),
        repo_url: format!("git@example.com:{name}.git"),
        branch: "main".to_string(),
        docker_image: "spawn-claude:latest".to_string(),
        environment_vars: BTreeMap::from([
            ("FOO".to_string(), "bar".to_string()),
            ("QUOTED".to_string(), "a \"b\" = c".to_string()),
        ]),
        created_at: at_millis(created_ms),
    }
}

fn worker(id: &str, environment: &str, status: WorkerStatus, created_ms: u64) -> Worker {
    Worker {
        id: WorkerId(id.to_string()),
        env_id: EnvironmentId(environment.to_string()),
        prompt: "fix the build\nand the docs".to_string(),
        status,
        container_id: (status != WorkerStatus::Creating)
            .then(|| format!("worker-{created_ms}-abcdefghi")),
        created_at: at_millis(created_ms),
        last_activity: at_millis(created_ms + 500),
    }
}

#[test]
fn open_migrates_to_latest_version() {
    let store = SqliteStore::open(test_db_path("open")).unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());

    // Re-running at the current version is harmless.
    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());
}

#[test]
fn migrations_roll_back_and_forward() {
    let store = SqliteStore::open(test_db_path("rollback")).unwrap();
    store.save_environment(&environment("env00001", "api", 1_000)).unwrap();

    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);
    let error = store.list_environments().unwrap_err();
    assert_eq!(error.kind, SpawnErrorKind::StorageFailure);

    store.migrate_to_latest().unwrap();
    assert!(store.list_environments().unwrap().is_empty());
}

#[test]
fn undefined_migration_target_is_a_storage_failure() {
    let store = SqliteStore::new(test_db_path("undefined"));
    let error = store
        .apply_migration(current_schema_version() + 1)
        .unwrap_err();
    assert_eq!(error.kind, SpawnErrorKind::StorageFailure);
    assert_eq!(store.planned_migrations(0).len() as i64, current_schema_version());
}

#[test]
fn operations_before_migration_fail() {
    let store = SqliteStore::new(test_db_path("uninitialized"));
    let error = store.list_workers().unwrap_err();
    assert_eq!(error.kind, SpawnErrorKind::StorageFailure);
    assert!(error.message.contains("list_workers"));
}

#[test]
fn environments_round_trip_by_id_and_name() {
    let store = SqliteStore::open(test_db_path("env-round-trip")).unwrap();
    let api = environment("env00001", "api", 2_000);
    let web = environment("env00002", "web", 1_000);
    store.save_environment(&api).unwrap();
    store.save_environment(&web).unwrap();

    assert_eq!(store.environment_by_id(&api.id).unwrap(), Some(api.clone()));
    assert_eq!(store.environment_by_name("web").unwrap(), Some(web.clone()));
    assert_eq!(store.environment_by_name("nope").unwrap(), None);
    assert_eq!(store.list_environments().unwrap(), vec![web, api]);
}

#[test]
fn saving_same_id_updates_in_place() {
    let store = SqliteStore::open(test_db_path("env-update")).unwrap();
    let mut api = environment("env00001", "api", 1_000);
    store.save_environment(&api).unwrap();

    api.branch = "develop".to_string();
    api.environment_vars.clear();
    store.save_environment(&api).unwrap();

    assert_eq!(store.list_environments().unwrap(), vec![api]);
}

#[test]
fn environment_names_are_unique() {
    let store = SqliteStore::open(test_db_path("env-unique")).unwrap();
    store.save_environment(&environment("env00001", "api", 1_000)).unwrap();

    let error = store
        .save_environment(&environment("env00002", "api", 2_000))
        .unwrap_err();

    assert_eq!(error.kind, SpawnErrorKind::EnvironmentExists);
    assert_eq!(store.list_environments().unwrap().len(), 1);
}

#[test]
fn delete_environment_is_guarded_and_cascades() {
    let store = SqliteStore::open(test_db_path("env-delete")).unwrap();
    let api = environment("env00001", "api", 1_000);
    store.save_environment(&api).unwrap();
    let running = worker("wrk00001", "env00001", WorkerStatus::Running, 1_000);
    store.save_worker(&running).unwrap();
    store
        .save_worker(&worker("wrk00002", "env00001", WorkerStatus::Stopped, 2_000))
        .unwrap();
    store
        .save_worker(&worker("wrk00003", "env00009", WorkerStatus::Stopped, 3_000))
        .unwrap();

    let error = store.delete_environment(&api.id).unwrap_err();
    assert_eq!(error.kind, SpawnErrorKind::EnvironmentInUse);
    assert_eq!(store.list_workers().unwrap().len(), 3);

    let mut finished = running;
    finished.transition(WorkerStatus::Stopped);
    store.save_worker(&finished).unwrap();

    assert!(store.delete_environment(&api.id).unwrap());
    assert!(store.environment_by_id(&api.id).unwrap().is_none());
    let remaining = store.list_workers().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id.as_str(), "wrk00003");

    assert!(!store.delete_environment(&api.id).unwrap());
}

#[test]
fn workers_round_trip_with_optional_container() {
    let store = SqliteStore::open(test_db_path("worker-round-trip")).unwrap();
    let creating = worker("wrk00001", "env00001", WorkerStatus::Creating, 5_000);
    let failed = worker("wrk00002", "env00002", WorkerStatus::Failed, 4_000);
    store.save_worker(&creating).unwrap();
    store.save_worker(&failed).unwrap();

    assert_eq!(store.worker_by_id(&creating.id).unwrap(), Some(creating.clone()));
    assert!(creating.container_id.is_none());
    assert_eq!(store.list_workers().unwrap(), vec![failed.clone(), creating.clone()]);
    assert_eq!(
        store
            .list_workers_for_environment(&EnvironmentId("env00002".to_string()))
            .unwrap(),
        vec![failed]
    );
}

#[test]
fn update_worker_skips_deleted_records() {
    let store = SqliteStore::open(test_db_path("worker-update")).unwrap();
    let mut running = worker("wrk00001", "env00001", WorkerStatus::Running, 1_000);
    store.save_worker(&running).unwrap();

    running.status = WorkerStatus::Stopped;
    assert!(store.update_worker(&running).unwrap());
    assert_eq!(
        store.worker_by_id(&running.id).unwrap().unwrap().status,
        WorkerStatus::Stopped
    );

    assert!(store.delete_worker(&running.id).unwrap());
    assert!(!store.update_worker(&running).unwrap());
    assert!(store.worker_by_id(&running.id).unwrap().is_none());
    assert!(!store.delete_worker(&running.id).unwrap());
}
