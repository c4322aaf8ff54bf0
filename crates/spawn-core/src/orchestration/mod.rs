//! Worker lifecycle and environment management on top of the registry and
//! the container runtime.

pub mod controller;
pub mod environments;
pub mod worker_locks;

pub use controller::{
    ControllerSettings, CreateWorkerRequest, ReconciledWorker, WorkerController, WorkerFilter,
    WorkerRunOutcome,
};
pub use environments::{
    CreateEnvironmentRequest, EnvironmentDefaults, EnvironmentService, parse_env_vars,
};
pub use worker_locks::WorkerLocks;

use std::sync::Arc;

use crate::models::{Environment, EnvironmentId, SpawnError, SpawnErrorKind};
use crate::persistence::{PersistenceResult, Registry};

pub type ControllerResult<T> = Result<T, SpawnError>;

/// Runs a registry call on the blocking pool.
pub(crate) async fn with_registry<T, F>(
    registry: &Arc<dyn Registry>,
    operation_name: &'static str,
    operation: F,
) -> ControllerResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Registry) -> PersistenceResult<T> + Send + 'static,
{
    let registry = Arc::clone(registry);
    tokio::task::spawn_blocking(move || operation(registry.as_ref()))
        .await
        .map_err(|join_error| {
            SpawnError::new(
                SpawnErrorKind::Internal,
                format!("registry operation '{operation_name}' failed to join: {join_error}"),
            )
        })?
}

/// Looks `key` up as an id first, then as a name.
pub(crate) async fn resolve_environment(
    registry: &Arc<dyn Registry>,
    key: &str,
) -> ControllerResult<Environment> {
    let lookup = key.to_string();
    let found = with_registry(registry, "resolve_environment", move |registry| {
        if let Some(environment) =
            registry.environment_by_id(&EnvironmentId(lookup.clone()))?
        {
            return Ok(Some(environment));
        }
        registry.environment_by_name(&lookup)
    })
    .await?;

    if let Some(environment) = found {
        return Ok(environment);
    }

    let known = with_registry(registry, "list_environments", |registry| {
        registry.list_environments()
    })
    .await?;
    let message = if known.is_empty() {
        format!("environment '{key}' not found; no environments exist yet")
    } else {
        let names: Vec<String> = known
            .iter()
            .map(|environment| format!("{} ({})", environment.name, environment.id))
            .collect();
        format!(
            "environment '{key}' not found; known environments: {}",
            names.join(", ")
        )
    };
    Err(SpawnError::new(SpawnErrorKind::EnvironmentNotFound, message))
}
