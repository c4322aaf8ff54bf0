//! Registry traits. Implementations are blocking; async callers go through
//! `tokio::task::spawn_blocking`.

pub mod in_memory;

pub use in_memory::InMemoryRegistry;

use crate::models::{Environment, EnvironmentId, SpawnError, SpawnErrorKind, Worker, WorkerId};

pub type PersistenceResult<T> = Result<T, SpawnError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

pub trait EnvironmentStore: Send + Sync {
    /// Inserts or replaces by id. A name already held by another
    /// Environment fails with `EnvironmentExists`.
    fn save_environment(&self, environment: &Environment) -> PersistenceResult<()>;

    fn environment_by_id(&self, id: &EnvironmentId) -> PersistenceResult<Option<Environment>>;

    fn environment_by_name(&self, name: &str) -> PersistenceResult<Option<Environment>>;

    /// Oldest first.
    fn list_environments(&self) -> PersistenceResult<Vec<Environment>>;

    /// Deletes the Environment together with its Workers. Fails with
    /// `EnvironmentInUse` while any of its Workers is `running`.
    fn delete_environment(&self, id: &EnvironmentId) -> PersistenceResult<bool>;
}

pub trait WorkerStore: Send + Sync {
    /// Inserts or replaces by id.
    fn save_worker(&self, worker: &Worker) -> PersistenceResult<()>;

    /// Replaces an existing record only; returns `false` when it is gone.
    fn update_worker(&self, worker: &Worker) -> PersistenceResult<bool>;

    fn worker_by_id(&self, id: &WorkerId) -> PersistenceResult<Option<Worker>>;

    /// Oldest first.
    fn list_workers(&self) -> PersistenceResult<Vec<Worker>>;

    fn list_workers_for_environment(
        &self,
        environment: &EnvironmentId,
    ) -> PersistenceResult<Vec<Worker>>;

    fn delete_worker(&self, id: &WorkerId) -> PersistenceResult<bool>;
}

/// Everything the controller needs from storage.
pub trait Registry: EnvironmentStore + WorkerStore {}

impl<T: EnvironmentStore + WorkerStore + ?Sized> Registry for T {}

pub(crate) fn environment_in_use(id: &EnvironmentId, running: usize) -> SpawnError {
    SpawnError::new(
        SpawnErrorKind::EnvironmentInUse,
        format!("environment has {running} running worker(s); destroy them first"),
    )
    .for_environment(id)
}
