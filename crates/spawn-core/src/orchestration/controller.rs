use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;

use crate::models::{
    Environment, SpawnError, SpawnErrorKind, Worker, WorkerId, WorkerStatus,
};
use crate::orchestration::{ControllerResult, WorkerLocks, resolve_environment, with_registry};
use crate::persistence::Registry;
use crate::prompt::{PromptEditor, prompt_template, strip_template};
use crate::runtime::{
    BuildContext, ContainerHandle, ContainerOptions, ContainerRuntime, CredentialSource,
    LogStream, RuntimeWorker, create_worker_container, ensure_image, resolve_api_key,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ControllerSettings {
    pub build_context: BuildContext,
    pub container: ContainerOptions,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            build_context: BuildContext::new("."),
            container: ContainerOptions::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateWorkerRequest {
    /// Environment id or name.
    pub environment: String,
    /// When absent or blank the prompt editor is asked.
    pub prompt: Option<String>,
    pub detached: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WorkerRunOutcome {
    /// Started and left running in the background.
    Detached(Worker),
    /// Ran in the foreground until the container exited.
    Exited { worker: Worker, exit_code: i64 },
    /// Foreground streaming was interrupted; the container keeps running.
    Interrupted(Worker),
}

impl WorkerRunOutcome {
    pub fn worker(&self) -> &Worker {
        match self {
            Self::Detached(worker) | Self::Interrupted(worker) => worker,
            Self::Exited { worker, .. } => worker,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WorkerFilter {
    /// Environment id or name.
    pub environment: Option<String>,
    pub status: Option<WorkerStatus>,
}

/// A worker whose status reconciliation changed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconciledWorker {
    pub worker: Worker,
    pub previous: WorkerStatus,
    /// Exit code reported by the runtime, when it still had the container.
    pub exit_code: Option<i64>,
}

/// Drives workers through `creating -> running -> stopped | failed` and keeps
/// the registry in step with the container runtime.
pub struct WorkerController {
    registry: Arc<dyn Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    credentials: Arc<dyn CredentialSource>,
    editor: Option<Arc<dyn PromptEditor>>,
    settings: ControllerSettings,
    locks: WorkerLocks,
}

impl WorkerController {
    pub fn new(
        registry: Arc<dyn Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            registry,
            runtime,
            credentials,
            editor: None,
            settings: ControllerSettings::default(),
            locks: WorkerLocks::new(),
        }
    }

    pub fn with_settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_editor(mut self, editor: Arc<dyn PromptEditor>) -> Self {
        self.editor = Some(editor);
        self
    }

    /// Creates and starts a worker.
    ///
    /// Foreground runs hand every prefixed output line to `output` and
    /// finish when the container exits or `interrupt` resolves, whichever
    /// comes first. A non-zero exit is reported through
    /// [`WorkerRunOutcome::Exited`], not as an error.
    pub async fn create_worker<O, I>(
        &self,
        request: CreateWorkerRequest,
        mut output: O,
        interrupt: I,
    ) -> ControllerResult<WorkerRunOutcome>
    where
        O: FnMut(String) + Send,
        I: Future<Output = ()> + Send,
    {
        let environment = resolve_environment(&self.registry, &request.environment).await?;
        let prompt = self.resolve_prompt(&environment, request.prompt).await?;
        // Checked before any build or record so a missing key fails fast and
        // leaves nothing behind.
        resolve_api_key(self.credentials.as_ref())?;

        if !self.runtime.check_connection().await {
            return Err(SpawnError::new(
                SpawnErrorKind::RuntimeUnavailable,
                "container runtime is not reachable; is the daemon running?",
            ));
        }
        ensure_image(
            self.runtime.as_ref(),
            &environment.docker_image,
            &self.settings.build_context,
        )
        .await
        .map_err(|error| error.for_environment(&environment.id))?;

        let mut worker = Worker::new(environment.id.clone(), prompt);
        let worker_lock = self.locks.lock(&worker.id).await;
        self.save_worker(&worker).await?;
        tracing::info!(
            worker_id = %worker.id,
            environment_id = %environment.id,
            "worker record created"
        );

        let handle = match create_worker_container(
            self.runtime.as_ref(),
            &environment,
            &worker.prompt,
            self.credentials.as_ref(),
            &self.settings.container,
        )
        .await
        {
            Ok(handle) => handle,
            Err(error) => {
                let error = self.fail_worker(worker, error).await;
                drop(worker_lock);
                self.forget_failed(&error).await;
                return Err(error);
            }
        };
        worker.container_id = Some(handle.name.clone());

        if let Err(error) = self.runtime.start(&handle).await {
            let error = self.fail_worker(worker, error).await;
            drop(worker_lock);
            self.forget_failed(&error).await;
            return Err(error);
        }
        worker.transition(WorkerStatus::Running);
        self.save_worker(&worker).await?;
        tracing::info!(worker_id = %worker.id, container = %handle.name, "worker running");
        drop(worker_lock);

        if request.detached {
            return Ok(WorkerRunOutcome::Detached(worker));
        }

        let prefix = line_prefix(&worker.id);
        let run = self.follow_until_exit(&handle, &prefix, &mut output);
        let finished = tokio::select! {
            result = run => Some(result),
            () = interrupt => None,
        };

        let worker_id = worker.id.clone();
        let worker_lock = self.locks.lock(&worker_id).await;
        let outcome = match finished {
            Some(Ok(exit_code)) => {
                worker.transition(WorkerStatus::from_exit_code(exit_code));
                self.update_worker(&worker).await?;
                tracing::info!(
                    worker_id = %worker.id,
                    exit_code,
                    status = %worker.status,
                    "worker exited"
                );
                Ok(WorkerRunOutcome::Exited { worker, exit_code })
            }
            Some(Err(error)) => {
                worker.transition(WorkerStatus::Failed);
                self.update_worker(&worker).await?;
                tracing::warn!(worker_id = %worker.id, error = %error, "worker output failed");
                Err(error.for_worker(&worker.id))
            }
            None => {
                worker.touch();
                self.update_worker(&worker).await?;
                tracing::info!(worker_id = %worker.id, "detached from running worker");
                return Ok(WorkerRunOutcome::Interrupted(worker));
            }
        };
        drop(worker_lock);
        self.locks.forget(&worker_id).await;
        outcome
    }

    /// Stops and removes the worker's container, then deletes its record.
    /// Runtime problems are logged and never block the deletion.
    pub async fn destroy_worker(&self, id: &WorkerId, force: bool) -> ControllerResult<Worker> {
        let worker_lock = self.locks.lock(id).await;
        let worker = match self.get_worker(id).await {
            Ok(worker) => worker,
            Err(error) => {
                drop(worker_lock);
                self.locks.forget(id).await;
                return Err(error);
            }
        };

        if let Some(container) = &worker.container_id {
            tracing::debug!(worker_id = %id, container = %container, force, "stopping container");
            self.runtime
                .stop(&ContainerHandle::from_name(container.clone()), force)
                .await;
        }

        let worker_id = id.clone();
        with_registry(&self.registry, "delete_worker", move |registry| {
            registry.delete_worker(&worker_id)
        })
        .await?;
        drop(worker_lock);
        self.locks.forget(id).await;

        tracing::info!(worker_id = %id, "worker destroyed");
        Ok(worker)
    }

    /// Destroys every worker of an environment.
    pub async fn destroy_environment_workers(
        &self,
        environment: &str,
        force: bool,
    ) -> ControllerResult<Vec<Worker>> {
        let environment = resolve_environment(&self.registry, environment).await?;
        let id = environment.id.clone();
        let workers = with_registry(&self.registry, "list_workers_for_environment", move |registry| {
            registry.list_workers_for_environment(&id)
        })
        .await?;

        let mut destroyed = Vec::with_capacity(workers.len());
        for worker in workers {
            match self.destroy_worker(&worker.id, force).await {
                Ok(worker) => destroyed.push(worker),
                Err(error) if error.kind == SpawnErrorKind::WorkerNotFound => {
                    tracing::debug!(worker_id = %worker.id, "worker already gone");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(destroyed)
    }

    /// Output of the worker's container, each line prefixed with the worker
    /// id. Following streams end when the container exits or the stream is
    /// dropped.
    pub async fn stream_logs_for_worker(
        &self,
        id: &WorkerId,
        follow: bool,
    ) -> ControllerResult<LogStream> {
        let worker = self.get_worker(id).await?;
        let Some(container) = worker.container_id else {
            return Err(SpawnError::new(
                SpawnErrorKind::NoContainer,
                "worker has no container yet",
            )
            .for_worker(id));
        };

        let prefix = line_prefix(id);
        let lines = self
            .runtime
            .stream_logs(&ContainerHandle::from_name(container), follow)
            .map(move |line| line.map(|line| format!("{prefix}{line}")));
        Ok(Box::pin(lines))
    }

    /// Follows the output of a running worker.
    pub async fn connect_worker(&self, id: &WorkerId) -> ControllerResult<LogStream> {
        let worker = self.get_worker(id).await?;
        if worker.status != WorkerStatus::Running {
            return Err(SpawnError::new(
                SpawnErrorKind::InvalidInput,
                format!("worker is {}; only running workers accept connections", worker.status),
            )
            .for_worker(id));
        }
        self.stream_logs_for_worker(id, true).await
    }

    pub async fn get_worker(&self, id: &WorkerId) -> ControllerResult<Worker> {
        let worker_id = id.clone();
        with_registry(&self.registry, "worker_by_id", move |registry| {
            registry.worker_by_id(&worker_id)
        })
        .await?
        .ok_or_else(|| {
            SpawnError::new(SpawnErrorKind::WorkerNotFound, format!("worker '{id}' not found"))
                .for_worker(id)
        })
    }

    pub async fn list_workers(&self, filter: WorkerFilter) -> ControllerResult<Vec<Worker>> {
        let mut workers = match &filter.environment {
            Some(key) => {
                let environment = resolve_environment(&self.registry, key).await?;
                with_registry(&self.registry, "list_workers_for_environment", move |registry| {
                    registry.list_workers_for_environment(&environment.id)
                })
                .await?
            }
            None => {
                with_registry(&self.registry, "list_workers", |registry| registry.list_workers())
                    .await?
            }
        };

        if let Some(status) = filter.status {
            workers.retain(|worker| worker.status == status);
        }
        Ok(workers)
    }

    /// Brings `running` records in line with what the runtime reports.
    ///
    /// Exited containers resolve to `stopped` or `failed` by exit code;
    /// containers the runtime no longer knows resolve to `failed`.
    pub async fn reconcile_workers(&self) -> ControllerResult<Vec<ReconciledWorker>> {
        if !self.runtime.check_connection().await {
            return Err(SpawnError::new(
                SpawnErrorKind::RuntimeUnavailable,
                "container runtime is not reachable; cannot reconcile workers",
            ));
        }

        let observed: HashMap<String, RuntimeWorker> = self
            .runtime
            .list_runtime_workers()
            .await?
            .into_iter()
            .map(|runtime_worker| (runtime_worker.runtime_id.clone(), runtime_worker))
            .collect();
        let running = self
            .list_workers(WorkerFilter {
                environment: None,
                status: Some(WorkerStatus::Running),
            })
            .await?;

        let mut changes = Vec::new();
        for candidate in running {
            let _worker_lock = self.locks.lock(&candidate.id).await;
            // Re-read under the lock; destroy or a foreground run may have
            // moved it on.
            let worker_id = candidate.id.clone();
            let current = with_registry(&self.registry, "worker_by_id", move |registry| {
                registry.worker_by_id(&worker_id)
            })
            .await?;
            let Some(mut worker) = current else {
                continue;
            };
            if worker.status != WorkerStatus::Running {
                continue;
            }
            let Some(container) = worker.container_id.clone() else {
                continue;
            };

            let (status, exit_code) = match observed.get(&container) {
                Some(runtime_worker) if runtime_worker.is_active() => continue,
                Some(_) => {
                    match self.runtime.wait(&ContainerHandle::from_name(container.clone())).await {
                        Ok(code) => (WorkerStatus::from_exit_code(code), Some(code)),
                        Err(error) => {
                            tracing::warn!(
                                worker_id = %worker.id,
                                container = %container,
                                error = %error,
                                "could not read exit code of finished container"
                            );
                            (WorkerStatus::Failed, None)
                        }
                    }
                }
                None => (WorkerStatus::Failed, None),
            };

            let previous = worker.status;
            worker.transition(status);
            if !self.update_worker(&worker).await? {
                continue;
            }
            tracing::info!(
                worker_id = %worker.id,
                container = %container,
                status = %worker.status,
                "worker reconciled"
            );
            changes.push(ReconciledWorker {
                worker,
                previous,
                exit_code,
            });
        }

        Ok(changes)
    }

    async fn resolve_prompt(
        &self,
        environment: &Environment,
        supplied: Option<String>,
    ) -> ControllerResult<String> {
        if let Some(prompt) = supplied.filter(|prompt| !prompt.trim().is_empty()) {
            return Ok(prompt.trim().to_string());
        }

        let edited = match &self.editor {
            Some(editor) => {
                let editor = Arc::clone(editor);
                let template = prompt_template(environment);
                tokio::task::spawn_blocking(move || editor.edit(&template))
                    .await
                    .map_err(|join_error| {
                        SpawnError::new(
                            SpawnErrorKind::Internal,
                            format!("prompt editor failed to join: {join_error}"),
                        )
                    })??
            }
            None => String::new(),
        };

        let prompt = strip_template(&edited);
        if prompt.is_empty() {
            return Err(SpawnError::new(
                SpawnErrorKind::EmptyPrompt,
                "prompt is empty; nothing to run",
            )
            .for_environment(&environment.id));
        }
        Ok(prompt)
    }

    async fn follow_until_exit<O>(
        &self,
        handle: &ContainerHandle,
        prefix: &str,
        output: &mut O,
    ) -> ControllerResult<i64>
    where
        O: FnMut(String) + Send,
    {
        let mut lines = self.runtime.stream_logs(handle, true);
        while let Some(line) = lines.next().await {
            output(format!("{prefix}{}", line?));
        }
        drop(lines);
        self.runtime.wait(handle).await
    }

    /// Records `failed` for a worker whose container never started and
    /// returns the startup error.
    async fn fail_worker(&self, mut worker: Worker, error: SpawnError) -> SpawnError {
        worker.transition(WorkerStatus::Failed);
        tracing::warn!(worker_id = %worker.id, error = %error, "worker failed during startup");
        if let Err(save_error) = self.save_worker(&worker).await {
            tracing::warn!(
                worker_id = %worker.id,
                error = %save_error,
                "failed to persist worker failure"
            );
        }
        error.for_worker(&worker.id)
    }

    async fn forget_failed(&self, error: &SpawnError) {
        if let Some(id) = &error.worker {
            self.locks.forget(id).await;
        }
    }

    /// Number of workers with a live lock entry.
    pub async fn tracked_locks(&self) -> usize {
        self.locks.tracked().await
    }

    async fn save_worker(&self, worker: &Worker) -> ControllerResult<()> {
        let saved = worker.clone();
        with_registry(&self.registry, "save_worker", move |registry| {
            registry.save_worker(&saved)
        })
        .await
    }

    /// Returns `false` when the record was deleted in the meantime.
    async fn update_worker(&self, worker: &Worker) -> ControllerResult<bool> {
        let updated = worker.clone();
        let present = with_registry(&self.registry, "update_worker", move |registry| {
            registry.update_worker(&updated)
        })
        .await?;
        if !present {
            tracing::debug!(worker_id = %worker.id, "worker record gone; update skipped");
        }
        Ok(present)
    }
}

fn line_prefix(id: &WorkerId) -> String {
    format!("[{id}] ")
}
