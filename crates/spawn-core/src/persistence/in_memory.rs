use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::{
    Environment, EnvironmentId, SpawnError, SpawnErrorKind, Worker, WorkerId, WorkerStatus,
};
use crate::persistence::{EnvironmentStore, PersistenceResult, WorkerStore, environment_in_use};

/// Registry held entirely in process memory.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    environments: HashMap<EnvironmentId, Environment>,
    workers: HashMap<WorkerId, Worker>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, RegistryState>> {
        self.state.lock().map_err(|_| {
            SpawnError::new(SpawnErrorKind::Internal, "in-memory registry mutex poisoned")
        })
    }
}

impl EnvironmentStore for InMemoryRegistry {
    fn save_environment(&self, environment: &Environment) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        let name_taken = state
            .environments
            .values()
            .any(|existing| existing.name == environment.name && existing.id != environment.id);
        if name_taken {
            return Err(SpawnError::new(
                SpawnErrorKind::EnvironmentExists,
                format!("environment '{}' already exists", environment.name),
            )
            .for_environment(&environment.id));
        }

        state
            .environments
            .insert(environment.id.clone(), environment.clone());
        Ok(())
    }

    fn environment_by_id(&self, id: &EnvironmentId) -> PersistenceResult<Option<Environment>> {
        Ok(self.lock_state()?.environments.get(id).cloned())
    }

    fn environment_by_name(&self, name: &str) -> PersistenceResult<Option<Environment>> {
        Ok(self
            .lock_state()?
            .environments
            .values()
            .find(|environment| environment.name == name)
            .cloned())
    }

    fn list_environments(&self) -> PersistenceResult<Vec<Environment>> {
        let mut environments: Vec<Environment> =
            self.lock_state()?.environments.values().cloned().collect();
        environments.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(environments)
    }

    fn delete_environment(&self, id: &EnvironmentId) -> PersistenceResult<bool> {
        let mut state = self.lock_state()?;
        if !state.environments.contains_key(id) {
            return Ok(false);
        }

        let running = state
            .workers
            .values()
            .filter(|worker| &worker.env_id == id && worker.status == WorkerStatus::Running)
            .count();
        if running > 0 {
            return Err(environment_in_use(id, running));
        }

        state.workers.retain(|_, worker| &worker.env_id != id);
        state.environments.remove(id);
        Ok(true)
    }
}

impl WorkerStore for InMemoryRegistry {
    fn save_worker(&self, worker: &Worker) -> PersistenceResult<()> {
        self.lock_state()?
            .workers
            .insert(worker.id.clone(), worker.clone());
        Ok(())
    }

    fn update_worker(&self, worker: &Worker) -> PersistenceResult<bool> {
        let mut state = self.lock_state()?;
        match state.workers.get_mut(&worker.id) {
            Some(existing) => {
                *existing = worker.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn worker_by_id(&self, id: &WorkerId) -> PersistenceResult<Option<Worker>> {
        Ok(self.lock_state()?.workers.get(id).cloned())
    }

    fn list_workers(&self) -> PersistenceResult<Vec<Worker>> {
        let mut workers: Vec<Worker> = self.lock_state()?.workers.values().cloned().collect();
        workers.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(workers)
    }

    fn list_workers_for_environment(
        &self,
        environment: &EnvironmentId,
    ) -> PersistenceResult<Vec<Worker>> {
        let mut workers = self.list_workers()?;
        workers.retain(|worker| &worker.env_id == environment);
        Ok(workers)
    }

    fn delete_worker(&self, id: &WorkerId) -> PersistenceResult<bool> {
        Ok(self.lock_state()?.workers.remove(id).is_some())
    }
}
