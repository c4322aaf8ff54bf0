use std::collections::BTreeMap;
use std::time::SystemTime;

use futures::StreamExt;
use spawn_core::models::{Environment, EnvironmentId, SpawnErrorKind};
use spawn_core::runtime::{
    BuildContext, ContainerHandle, ContainerOptions, ContainerRuntime, ContainerScript,
    InMemoryContainerRuntime, StaticCredentials, create_worker_container, ensure_image,
};

fn environment(vars: &[(&str, &str)]) -> Environment {
    Environment {
        id: EnvironmentId("env00001".to_string()),
        name: "api".to_string(),
        repo_url: "https://example.com/api.git".to_string(),
        branch: "main".to_string(),
        docker_image: "w:latest".to_string(),
        environment_vars: vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<BTreeMap<_, _>>(),
        created_at: SystemTime::now(),
    }
}

fn credentials() -> StaticCredentials {
    StaticCredentials::new().with("CLAUDE_API_KEY", "sk-test")
}

#[tokio::test]
async fn ensure_image_builds_at_most_once() {
    let runtime = InMemoryContainerRuntime::new();
    let context = BuildContext::new("/srv/spawn");

    assert!(ensure_image(&runtime, "w:latest", &context).await.unwrap());
    assert!(!ensure_image(&runtime, "w:latest", &context).await.unwrap());
    assert_eq!(runtime.builds(), vec!["w:latest".to_string()]);
}

#[tokio::test]
async fn ensure_image_surfaces_build_errors() {
    let runtime = InMemoryContainerRuntime::new();
    runtime.fail_builds_with("failed to solve: dockerfile parse error");

    let error = ensure_image(&runtime, "w:latest", &BuildContext::new("."))
        .await
        .unwrap_err();

    assert_eq!(error.kind, SpawnErrorKind::Build);
    assert!(!runtime.image_exists("w:latest").await);
}

#[tokio::test]
async fn environment_vars_shadow_builtins() {
    let runtime = InMemoryContainerRuntime::new().with_image("w:latest");
    let env = environment(&[("FOO", "bar"), ("BRANCH", "feature/x")]);

    let handle = create_worker_container(
        &runtime,
        &env,
        "do it",
        &credentials(),
        &ContainerOptions::default(),
    )
    .await
    .unwrap();

    let container = runtime.container(&handle.name).unwrap();
    assert!(!container.started);
    assert_eq!(container.spec.env["FOO"], "bar");
    assert_eq!(container.spec.env["BRANCH"], "feature/x");
    assert_eq!(container.spec.env["INTERACTIVE"], "false");
}

#[tokio::test]
async fn missing_credentials_never_reach_the_engine() {
    let runtime = InMemoryContainerRuntime::new().with_image("w:latest");

    let error = create_worker_container(
        &runtime,
        &environment(&[]),
        "do it",
        &StaticCredentials::new(),
        &ContainerOptions::default(),
    )
    .await
    .unwrap_err();

    assert_eq!(error.kind, SpawnErrorKind::MissingCredential);
    assert!(runtime.container_names().is_empty());
}

#[tokio::test]
async fn container_names_carry_prefix_and_are_listed() {
    let runtime = InMemoryContainerRuntime::new().with_image("w:latest");
    runtime.script(ContainerScript::exits_with(0).running_until_finished());
    let handle = create_worker_container(
        &runtime,
        &environment(&[]),
        "do it",
        &credentials(),
        &ContainerOptions::default(),
    )
    .await
    .unwrap();
    assert!(handle.name.starts_with("worker-"));

    let listed = runtime.list_runtime_workers().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, "created");

    runtime.start(&handle).await.unwrap();
    assert!(runtime.list_runtime_workers().await.unwrap()[0].is_active());

    let error = runtime.start(&handle).await.unwrap_err();
    assert_eq!(error.kind, SpawnErrorKind::ContainerStart);

    runtime.finish(&handle.name, 0);
    let listed = runtime.list_runtime_workers().await.unwrap();
    assert_eq!(listed[0].state, "exited");
    assert!(!listed[0].is_active());
    assert_eq!(runtime.wait(&handle).await.unwrap(), 0);
}

#[tokio::test]
async fn stop_is_best_effort() {
    let runtime = InMemoryContainerRuntime::new();
    let handle = ContainerHandle::from_name("worker-1-missing");

    // Nothing to stop: still returns normally.
    runtime.stop(&handle, false).await;

    assert_eq!(
        runtime.stop_requests(),
        vec![("worker-1-missing".to_string(), false)]
    );
}

#[tokio::test]
async fn log_stream_strips_timestamps_and_blank_lines() {
    let runtime = InMemoryContainerRuntime::new().with_image("w:latest");
    runtime.script(ContainerScript::exits_with(0).output([
        "2024-05-01T10:00:00.000000001Z one",
        "2024-05-01T10:00:00.000000002Z ",
        "two",
    ]));
    let handle = create_worker_container(
        &runtime,
        &environment(&[]),
        "do it",
        &credentials(),
        &ContainerOptions::default(),
    )
    .await
    .unwrap();
    runtime.start(&handle).await.unwrap();

    let lines: Vec<String> = runtime
        .stream_logs(&handle, true)
        .map(|line| line.unwrap())
        .collect()
        .await;

    assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
}
