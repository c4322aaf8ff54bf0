use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::BuildImageOptions;
use futures::StreamExt;

use crate::models::{SpawnError, SpawnErrorKind};
use crate::runtime::naming::normalize_container_name;
use crate::runtime::{
    BuildContext, ContainerHandle, ContainerRuntime, ContainerSpec, DEFAULT_WORKER_PREFIX,
    LogStream, RuntimeFuture, RuntimeResult, RuntimeWorker, into_log_lines,
};

/// Receives incremental build output as it arrives.
pub type BuildProgress = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DockerRuntimeConfig {
    pub worker_prefix: String,
    /// Grace period before a graceful stop escalates to a kill.
    pub stop_timeout: Duration,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            worker_prefix: DEFAULT_WORKER_PREFIX.to_string(),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// [`ContainerRuntime`] backed by the local Docker engine.
pub struct DockerRuntime {
    docker: Docker,
    config: DockerRuntimeConfig,
    progress: BuildProgress,
}

impl DockerRuntime {
    /// Connects using the platform's local defaults (socket or named pipe).
    /// No request is made until the first operation.
    pub fn connect(config: DockerRuntimeConfig) -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|error| {
            SpawnError::new(
                SpawnErrorKind::RuntimeUnavailable,
                format!("failed to configure docker client: {error}"),
            )
        })?;
        Ok(Self::with_client(docker, config))
    }

    pub fn with_client(docker: Docker, config: DockerRuntimeConfig) -> Self {
        Self {
            docker,
            config,
            progress: Arc::new(print_progress),
        }
    }

    pub fn with_progress(mut self, progress: BuildProgress) -> Self {
        self.progress = progress;
        self
    }
}

impl ContainerRuntime for DockerRuntime {
    fn worker_prefix(&self) -> &str {
        &self.config.worker_prefix
    }

    fn check_connection(&self) -> RuntimeFuture<'_, bool> {
        Box::pin(async move {
            match self.docker.ping().await {
                Ok(_) => true,
                Err(error) => {
                    tracing::debug!(error = %error, "docker ping failed");
                    false
                }
            }
        })
    }

    fn image_exists<'a>(&'a self, name: &'a str) -> RuntimeFuture<'a, bool> {
        Box::pin(async move { self.docker.inspect_image(name).await.is_ok() })
    }

    fn build_image<'a>(
        &'a self,
        name: &'a str,
        context: &'a BuildContext,
    ) -> RuntimeFuture<'a, RuntimeResult<()>> {
        Box::pin(async move {
            let archive_context = context.clone();
            let archive = tokio::task::spawn_blocking(move || pack_build_context(&archive_context))
                .await
                .map_err(|join_error| {
                    build_error(format!("build context packing join failure: {join_error}"))
                })??;

            let options = BuildImageOptions {
                dockerfile: context.dockerfile.clone(),
                t: name.to_string(),
                rm: true,
                ..Default::default()
            };

            let mut progress = Box::pin(self.docker.build_image(
                options,
                None,
                Some(bytes::Bytes::from(archive)),
            ));

            while let Some(item) = progress.next().await {
                let info = item.map_err(|error| build_error(error.to_string()))?;
                if let Some(message) = info.error {
                    return Err(build_error(message));
                }
                if let Some(output) = info.stream {
                    (self.progress)(&output);
                }
            }

            tracing::info!(image = name, "image build finished");
            Ok(())
        })
    }

    fn create_container(
        &self,
        spec: ContainerSpec,
    ) -> RuntimeFuture<'_, RuntimeResult<ContainerHandle>> {
        Box::pin(async move {
            let env = spec.env_list();
            let config = Config {
                image: Some(spec.image.clone()),
                env: Some(env),
                working_dir: Some(spec.working_dir.clone()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                tty: Some(spec.tty),
                labels: Some(spec.labels.clone().into_iter().collect()),
                ..Default::default()
            };
            let options = CreateContainerOptions {
                name: spec.name.clone(),
                ..Default::default()
            };

            let response = self
                .docker
                .create_container(Some(options), config)
                .await
                .map_err(|error| {
                    SpawnError::new(
                        SpawnErrorKind::ContainerCreate,
                        format!("failed to create container '{}': {error}", spec.name),
                    )
                })?;

            for warning in &response.warnings {
                tracing::warn!(container = %spec.name, warning = %warning, "engine warning on create");
            }

            Ok(ContainerHandle {
                name: spec.name,
                engine_id: Some(response.id),
            })
        })
    }

    fn start<'a>(&'a self, handle: &'a ContainerHandle) -> RuntimeFuture<'a, RuntimeResult<()>> {
        Box::pin(async move {
            self.docker
                .start_container::<String>(handle.reference(), None)
                .await
                .map_err(|error| {
                    SpawnError::new(
                        SpawnErrorKind::ContainerStart,
                        format!("failed to start container '{}': {error}", handle.name),
                    )
                })
        })
    }

    fn stream_logs(&self, handle: &ContainerHandle, follow: bool) -> LogStream {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            timestamps: true,
            ..Default::default()
        };
        let name = handle.name.clone();

        let chunks = self
            .docker
            .logs(handle.reference(), Some(options))
            .map(move |item| match item {
                Ok(output) => Ok(log_output_bytes(output)),
                Err(error) => Err(SpawnError::new(
                    SpawnErrorKind::Stream,
                    format!("log stream for '{name}' failed: {error}"),
                )),
            });

        into_log_lines(chunks)
    }

    fn wait<'a>(&'a self, handle: &'a ContainerHandle) -> RuntimeFuture<'a, RuntimeResult<i64>> {
        Box::pin(async move {
            let options = WaitContainerOptions {
                condition: "not-running".to_string(),
            };
            let mut responses =
                Box::pin(self.docker.wait_container(handle.reference(), Some(options)));

            match responses.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                // Non-zero exits arrive as errors from the engine client.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Ok(code)
                }
                Some(Err(error)) => Err(SpawnError::new(
                    SpawnErrorKind::Stream,
                    format!("failed to wait for container '{}': {error}", handle.name),
                )),
                None => Err(SpawnError::new(
                    SpawnErrorKind::Stream,
                    format!("wait for container '{}' ended without a status", handle.name),
                )),
            }
        })
    }

    fn stop<'a>(&'a self, handle: &'a ContainerHandle, force: bool) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            let reference = handle.reference();
            let halted = if force {
                self.docker
                    .kill_container(reference, None::<KillContainerOptions<String>>)
                    .await
            } else {
                let grace = i64::try_from(self.config.stop_timeout.as_secs()).unwrap_or(i64::MAX);
                self.docker
                    .stop_container(reference, Some(StopContainerOptions { t: grace }))
                    .await
            };
            if let Err(error) = halted {
                tracing::warn!(
                    container = %handle.name,
                    force,
                    error = %error,
                    "failed to halt container (may already be stopped)"
                );
            }

            if let Err(error) = self
                .docker
                .remove_container(
                    reference,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                tracing::warn!(
                    container = %handle.name,
                    error = %error,
                    "failed to remove container (may already be removed)"
                );
            }
        })
    }

    fn list_runtime_workers(&self) -> RuntimeFuture<'_, RuntimeResult<Vec<RuntimeWorker>>> {
        Box::pin(async move {
            let prefix = self.config.worker_prefix.as_str();
            let options = ListContainersOptions::<String> {
                all: true,
                filters: HashMap::from([("name".to_string(), vec![prefix.to_string()])]),
                ..Default::default()
            };

            let summaries = self
                .docker
                .list_containers(Some(options))
                .await
                .map_err(|error| {
                    SpawnError::new(
                        SpawnErrorKind::RuntimeUnavailable,
                        format!("failed to list containers: {error}"),
                    )
                })?;

            // The engine's name filter is a substring match; keep only true prefixes.
            let workers = summaries
                .into_iter()
                .filter_map(|summary| {
                    let name = summary
                        .names
                        .unwrap_or_default()
                        .iter()
                        .map(|raw| normalize_container_name(raw).to_string())
                        .find(|name| name.starts_with(prefix))?;
                    let created_secs = summary
                        .created
                        .and_then(|created| u64::try_from(created).ok())
                        .unwrap_or_default();
                    Some(RuntimeWorker {
                        runtime_id: name,
                        state: summary.state.unwrap_or_else(|| "unknown".to_string()),
                        created_at: UNIX_EPOCH + Duration::from_secs(created_secs),
                    })
                })
                .collect();

            Ok(workers)
        })
    }
}

fn pack_build_context(context: &BuildContext) -> RuntimeResult<Vec<u8>> {
    let dockerfile = context.root.join(&context.dockerfile);
    let support_dir = context.root.join(&context.support_dir);

    let mut archive = tar::Builder::new(Vec::new());
    archive
        .append_path_with_name(&dockerfile, &context.dockerfile)
        .map_err(|error| pack_error(&dockerfile, error))?;
    if support_dir.is_dir() {
        archive
            .append_dir_all(&context.support_dir, &support_dir)
            .map_err(|error| pack_error(&support_dir, error))?;
    }
    archive
        .into_inner()
        .map_err(|error| build_error(format!("failed to finish build context archive: {error}")))
}

fn log_output_bytes(output: LogOutput) -> Vec<u8> {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message.to_vec(),
    }
}

fn print_progress(output: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(output.as_bytes());
    let _ = stdout.flush();
}

fn pack_error(path: &Path, error: std::io::Error) -> SpawnError {
    build_error(format!(
        "failed to add {} to build context: {error}",
        path.display()
    ))
}

fn build_error(message: impl Into<String>) -> SpawnError {
    SpawnError::new(SpawnErrorKind::Build, message)
}
