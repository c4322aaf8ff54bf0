//! Container runtime adapter.
//!
//! Every interaction with the container engine goes through
//! [`ContainerRuntime`]. The adapter knows nothing about environments or
//! workers beyond the parameters it is handed; the controller owns the
//! domain state and the adapter owns only the engine connection.

pub mod container_spec;
pub mod docker;
pub mod in_memory;
pub mod log_lines;
pub mod naming;

pub use container_spec::{
    CREDENTIAL_VARIABLES, ContainerOptions, ContainerSpec, CredentialSource, ProcessEnvironment,
    StaticCredentials, resolve_api_key,
};
pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use in_memory::{ContainerScript, InMemoryContainer, InMemoryContainerRuntime};
pub use log_lines::{LogLineBuffer, clean_log_line, into_log_lines};
pub use naming::{DEFAULT_WORKER_PREFIX, runtime_worker_name};

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::SystemTime;

use futures::Stream;

use crate::models::{Environment, SpawnError};

pub type RuntimeResult<T> = Result<T, SpawnError>;

pub type RuntimeFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lazy, pull-driven sequence of cleaned log lines. Dropping it cancels the
/// underlying engine request.
pub type LogStream = Pin<Box<dyn Stream<Item = RuntimeResult<String>> + Send>>;

/// Fixed inputs of an image build: a build descriptor file and a support
/// directory, both relative to `root`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildContext {
    pub root: PathBuf,
    pub dockerfile: String,
    pub support_dir: String,
}

impl BuildContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dockerfile: "Dockerfile".to_string(),
            support_dir: "docker".to_string(),
        }
    }

    pub fn dockerfile(mut self, dockerfile: impl Into<String>) -> Self {
        self.dockerfile = dockerfile.into();
        self
    }

    pub fn support_dir(mut self, support_dir: impl Into<String>) -> Self {
        self.support_dir = support_dir.into();
        self
    }
}

/// Reference to a created container. `name` is the generated runtime worker
/// identifier and is what gets persisted as the worker's `container_id`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContainerHandle {
    pub name: String,
    pub engine_id: Option<String>,
}

impl ContainerHandle {
    /// Handle for a container known only by name, e.g. from a persisted
    /// worker record.
    pub fn from_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine_id: None,
        }
    }

    pub fn reference(&self) -> &str {
        self.engine_id.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuntimeWorker {
    pub runtime_id: String,
    pub state: String,
    pub created_at: SystemTime,
}

impl RuntimeWorker {
    /// Whether the engine still considers the container alive.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state.as_str(),
            "created" | "running" | "restarting" | "paused"
        )
    }
}

pub trait ContainerRuntime: Send + Sync {
    /// Name prefix shared by every worker container this runtime creates.
    fn worker_prefix(&self) -> &str;

    /// Fails closed: any connectivity error reports `false`.
    fn check_connection(&self) -> RuntimeFuture<'_, bool>;

    /// Any lookup error, including "not found", reports `false`.
    fn image_exists<'a>(&'a self, name: &'a str) -> RuntimeFuture<'a, bool>;

    fn build_image<'a>(
        &'a self,
        name: &'a str,
        context: &'a BuildContext,
    ) -> RuntimeFuture<'a, RuntimeResult<()>>;

    fn create_container(&self, spec: ContainerSpec)
    -> RuntimeFuture<'_, RuntimeResult<ContainerHandle>>;

    fn start<'a>(&'a self, handle: &'a ContainerHandle) -> RuntimeFuture<'a, RuntimeResult<()>>;

    fn stream_logs(&self, handle: &ContainerHandle, follow: bool) -> LogStream;

    fn wait<'a>(&'a self, handle: &'a ContainerHandle) -> RuntimeFuture<'a, RuntimeResult<i64>>;

    /// Stops (or kills when `force`) and removes the container. Never fails;
    /// problems are logged as warnings.
    fn stop<'a>(&'a self, handle: &'a ContainerHandle, force: bool) -> RuntimeFuture<'a, ()>;

    fn list_runtime_workers(&self) -> RuntimeFuture<'_, RuntimeResult<Vec<RuntimeWorker>>>;
}

/// Builds `name` from `context` unless the image already exists.
///
/// Returns whether a build ran.
pub async fn ensure_image(
    runtime: &dyn ContainerRuntime,
    name: &str,
    context: &BuildContext,
) -> RuntimeResult<bool> {
    if runtime.image_exists(name).await {
        tracing::debug!(image = name, "image already present");
        return Ok(false);
    }

    tracing::info!(image = name, "image missing; building");
    runtime.build_image(name, context).await?;
    Ok(true)
}

/// Assembles the container spec for a worker and creates the container
/// without starting it.
///
/// The API credential is read from `credentials` at this point; a missing
/// credential fails before the engine is contacted.
pub async fn create_worker_container(
    runtime: &dyn ContainerRuntime,
    env: &Environment,
    prompt: &str,
    credentials: &dyn CredentialSource,
    options: &ContainerOptions,
) -> RuntimeResult<ContainerHandle> {
    let api_key = resolve_api_key(credentials)?;
    let spec = ContainerSpec::for_worker(env, prompt, &api_key, options, runtime.worker_prefix());
    runtime.create_container(spec).await
}
