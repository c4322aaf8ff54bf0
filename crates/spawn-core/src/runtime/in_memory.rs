use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use futures::{StreamExt, stream};
use tokio::sync::watch;

use crate::models::{SpawnError, SpawnErrorKind};
use crate::runtime::{
    BuildContext, ContainerHandle, ContainerRuntime, ContainerSpec, DEFAULT_WORKER_PREFIX,
    LogStream, RuntimeFuture, RuntimeResult, RuntimeWorker, into_log_lines,
};

/// Scripted behavior for containers created by [`InMemoryContainerRuntime`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ContainerScript {
    pub output: Vec<String>,
    pub exit_code: i64,
    pub stream_error: Option<String>,
    pub wait_error: Option<String>,
    /// Keep running after start until [`InMemoryContainerRuntime::finish`].
    pub runs_until_finished: bool,
}

impl ContainerScript {
    pub fn exits_with(exit_code: i64) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    pub fn output(mut self, lines: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.output = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn stream_error(mut self, message: impl Into<String>) -> Self {
        self.stream_error = Some(message.into());
        self
    }

    pub fn wait_error(mut self, message: impl Into<String>) -> Self {
        self.wait_error = Some(message.into());
        self
    }

    pub fn running_until_finished(mut self) -> Self {
        self.runs_until_finished = true;
        self
    }
}

/// Snapshot of a fake container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InMemoryContainer {
    pub spec: ContainerSpec,
    pub started: bool,
    pub exit_code: Option<i64>,
}

/// Engine stand-in that keeps images and containers in memory.
///
/// Used to exercise the controller without a container engine; behavior of
/// new containers is driven by the current [`ContainerScript`].
pub struct InMemoryContainerRuntime {
    prefix: String,
    state: Mutex<RuntimeState>,
}

struct RuntimeState {
    reachable: bool,
    images: BTreeSet<String>,
    builds: Vec<String>,
    build_failure: Option<String>,
    create_failure: Option<String>,
    start_failure: Option<String>,
    script: ContainerScript,
    containers: BTreeMap<String, ContainerEntry>,
    stop_requests: Vec<(String, bool)>,
}

struct ContainerEntry {
    spec: ContainerSpec,
    script: ContainerScript,
    started: bool,
    created_at: SystemTime,
    exit: watch::Sender<Option<i64>>,
}

impl ContainerEntry {
    fn exit_code(&self) -> Option<i64> {
        *self.exit.borrow()
    }
}

impl Default for InMemoryContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryContainerRuntime {
    pub fn new() -> Self {
        Self {
            prefix: DEFAULT_WORKER_PREFIX.to_string(),
            state: Mutex::new(RuntimeState {
                reachable: true,
                images: BTreeSet::new(),
                builds: Vec::new(),
                build_failure: None,
                create_failure: None,
                start_failure: None,
                script: ContainerScript::default(),
                containers: BTreeMap::new(),
                stop_requests: Vec::new(),
            }),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_image(self, name: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.images.insert(name.into());
        }
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.reachable = reachable;
        }
    }

    pub fn fail_builds_with(&self, message: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.build_failure = Some(message.into());
        }
    }

    pub fn fail_creates_with(&self, message: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.create_failure = Some(message.into());
        }
    }

    pub fn fail_starts_with(&self, message: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.start_failure = Some(message.into());
        }
    }

    /// Script applied to every container created from now on.
    pub fn script(&self, script: ContainerScript) {
        if let Ok(mut state) = self.state.lock() {
            state.script = script;
        }
    }

    /// Image names built so far, in build order.
    pub fn builds(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.builds.clone())
            .unwrap_or_default()
    }

    pub fn container(&self, name: &str) -> Option<InMemoryContainer> {
        let state = self.state.lock().ok()?;
        state.containers.get(name).map(|entry| InMemoryContainer {
            spec: entry.spec.clone(),
            started: entry.started,
            exit_code: entry.exit_code(),
        })
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.containers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// `(container name, force)` for every stop request received.
    pub fn stop_requests(&self) -> Vec<(String, bool)> {
        self.state
            .lock()
            .map(|state| state.stop_requests.clone())
            .unwrap_or_default()
    }

    /// Ends a running container with `exit_code`.
    pub fn finish(&self, name: &str, exit_code: i64) {
        if let Ok(state) = self.state.lock()
            && let Some(entry) = state.containers.get(name)
        {
            entry.exit.send_replace(Some(exit_code));
        }
    }

    /// Removes a container behind the controller's back.
    pub fn remove_externally(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.containers.remove(name);
        }
    }

    fn lock_state(&self) -> RuntimeResult<MutexGuard<'_, RuntimeState>> {
        self.state.lock().map_err(|_| {
            SpawnError::new(
                SpawnErrorKind::Internal,
                "in-memory runtime mutex poisoned",
            )
        })
    }
}

impl ContainerRuntime for InMemoryContainerRuntime {
    fn worker_prefix(&self) -> &str {
        &self.prefix
    }

    fn check_connection(&self) -> RuntimeFuture<'_, bool> {
        Box::pin(async move { self.lock_state().map(|state| state.reachable).unwrap_or(false) })
    }

    fn image_exists<'a>(&'a self, name: &'a str) -> RuntimeFuture<'a, bool> {
        Box::pin(async move {
            self.lock_state()
                .map(|state| state.reachable && state.images.contains(name))
                .unwrap_or(false)
        })
    }

    fn build_image<'a>(
        &'a self,
        name: &'a str,
        _context: &'a BuildContext,
    ) -> RuntimeFuture<'a, RuntimeResult<()>> {
        Box::pin(async move {
            let mut state = self.lock_state()?;
            if !state.reachable {
                return Err(unreachable(SpawnErrorKind::Build));
            }
            state.builds.push(name.to_string());
            if let Some(message) = state.build_failure.clone() {
                return Err(SpawnError::new(SpawnErrorKind::Build, message));
            }
            state.images.insert(name.to_string());
            Ok(())
        })
    }

    fn create_container(
        &self,
        spec: ContainerSpec,
    ) -> RuntimeFuture<'_, RuntimeResult<ContainerHandle>> {
        Box::pin(async move {
            let mut state = self.lock_state()?;
            if !state.reachable {
                return Err(unreachable(SpawnErrorKind::ContainerCreate));
            }
            if let Some(message) = state.create_failure.clone() {
                return Err(SpawnError::new(SpawnErrorKind::ContainerCreate, message));
            }
            if !state.images.contains(&spec.image) {
                return Err(SpawnError::new(
                    SpawnErrorKind::ContainerCreate,
                    format!("no such image: {}", spec.image),
                ));
            }
            if state.containers.contains_key(&spec.name) {
                return Err(SpawnError::new(
                    SpawnErrorKind::ContainerCreate,
                    format!("container name '{}' is already in use", spec.name),
                ));
            }

            let (exit, _) = watch::channel(None);
            let script = state.script.clone();
            let name = spec.name.clone();
            state.containers.insert(
                name.clone(),
                ContainerEntry {
                    spec,
                    script,
                    started: false,
                    created_at: SystemTime::now(),
                    exit,
                },
            );

            Ok(ContainerHandle {
                name: name.clone(),
                engine_id: Some(format!("mem-{name}")),
            })
        })
    }

    fn start<'a>(&'a self, handle: &'a ContainerHandle) -> RuntimeFuture<'a, RuntimeResult<()>> {
        Box::pin(async move {
            let mut state = self.lock_state()?;
            if !state.reachable {
                return Err(unreachable(SpawnErrorKind::ContainerStart));
            }
            if let Some(message) = state.start_failure.clone() {
                return Err(SpawnError::new(SpawnErrorKind::ContainerStart, message));
            }
            let entry = state
                .containers
                .get_mut(&handle.name)
                .ok_or_else(|| no_such_container(SpawnErrorKind::ContainerStart, &handle.name))?;
            if entry.started {
                return Err(SpawnError::new(
                    SpawnErrorKind::ContainerStart,
                    format!("container '{}' is already started", handle.name),
                ));
            }
            entry.started = true;
            if !entry.script.runs_until_finished {
                entry.exit.send_replace(Some(entry.script.exit_code));
            }
            Ok(())
        })
    }

    fn stream_logs(&self, handle: &ContainerHandle, follow: bool) -> LogStream {
        let snapshot = self.lock_state().and_then(|state| {
            let entry = state
                .containers
                .get(&handle.name)
                .ok_or_else(|| no_such_container(SpawnErrorKind::Stream, &handle.name))?;
            Ok((entry.script.clone(), entry.exit.subscribe()))
        });

        let (script, mut exit) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(error) => return into_log_lines(stream::iter(vec![Err(error)])),
        };

        let mut chunks: Vec<RuntimeResult<Vec<u8>>> = script
            .output
            .iter()
            .map(|line| Ok(format!("{line}\n").into_bytes()))
            .collect();
        if let Some(message) = script.stream_error {
            chunks.push(Err(SpawnError::new(SpawnErrorKind::Stream, message)));
        }

        let until_exit = stream::once(async move {
            if follow {
                let _ = exit.wait_for(|code| code.is_some()).await;
            }
            None
        })
        .filter_map(futures::future::ready);

        into_log_lines(stream::iter(chunks).chain(until_exit))
    }

    fn wait<'a>(&'a self, handle: &'a ContainerHandle) -> RuntimeFuture<'a, RuntimeResult<i64>> {
        Box::pin(async move {
            let mut exit = {
                let state = self.lock_state()?;
                let entry = state
                    .containers
                    .get(&handle.name)
                    .ok_or_else(|| no_such_container(SpawnErrorKind::Stream, &handle.name))?;
                if let Some(message) = entry.script.wait_error.clone() {
                    return Err(SpawnError::new(SpawnErrorKind::Stream, message));
                }
                entry.exit.subscribe()
            };

            let code = exit.wait_for(|code| code.is_some()).await.map_err(|_| {
                no_such_container(SpawnErrorKind::Stream, &handle.name)
            })?;
            code.ok_or_else(|| no_such_container(SpawnErrorKind::Stream, &handle.name))
        })
    }

    fn stop<'a>(&'a self, handle: &'a ContainerHandle, force: bool) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            let Ok(mut state) = self.lock_state() else {
                tracing::warn!(container = %handle.name, "in-memory runtime unavailable during stop");
                return;
            };
            state.stop_requests.push((handle.name.clone(), force));
            if !state.reachable {
                tracing::warn!(container = %handle.name, "failed to halt container (runtime unreachable)");
                return;
            }
            if state.containers.remove(&handle.name).is_none() {
                tracing::warn!(container = %handle.name, "failed to remove container (already removed)");
            }
        })
    }

    fn list_runtime_workers(&self) -> RuntimeFuture<'_, RuntimeResult<Vec<RuntimeWorker>>> {
        Box::pin(async move {
            let state = self.lock_state()?;
            if !state.reachable {
                return Err(unreachable(SpawnErrorKind::RuntimeUnavailable));
            }
            Ok(state
                .containers
                .iter()
                .filter(|(name, _)| name.starts_with(&self.prefix))
                .map(|(name, entry)| RuntimeWorker {
                    runtime_id: name.clone(),
                    state: match (entry.started, entry.exit_code()) {
                        (false, _) => "created",
                        (true, None) => "running",
                        (true, Some(_)) => "exited",
                    }
                    .to_string(),
                    created_at: entry.created_at,
                })
                .collect())
        })
    }
}

fn unreachable(kind: SpawnErrorKind) -> SpawnError {
    SpawnError::new(kind, "container runtime is not reachable")
}

fn no_such_container(kind: SpawnErrorKind, name: &str) -> SpawnError {
    SpawnError::new(kind, format!("no such container: {name}"))
}
