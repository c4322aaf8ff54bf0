use crate::models::{EnvironmentId, WorkerId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SpawnErrorKind {
    EnvironmentNotFound,
    EnvironmentExists,
    EnvironmentInUse,
    WorkerNotFound,
    EmptyPrompt,
    RuntimeUnavailable,
    Build,
    MissingCredential,
    ContainerCreate,
    ContainerStart,
    Stream,
    NoContainer,
    InvalidInput,
    StorageFailure,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct SpawnError {
    pub worker: Option<WorkerId>,
    pub environment: Option<EnvironmentId>,
    pub kind: SpawnErrorKind,
    pub message: String,
}

impl SpawnError {
    pub fn new(kind: SpawnErrorKind, message: impl Into<String>) -> Self {
        Self {
            worker: None,
            environment: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_worker(mut self, worker: &WorkerId) -> Self {
        self.worker.get_or_insert_with(|| worker.clone());
        self
    }

    pub fn for_environment(mut self, environment: &EnvironmentId) -> Self {
        self.environment.get_or_insert_with(|| environment.clone());
        self
    }
}

pub type SpawnResult<T> = Result<T, SpawnError>;
