use std::sync::Arc;

use spawn_core::models::{
    DEFAULT_BRANCH, DEFAULT_IMAGE, EnvironmentId, SpawnErrorKind, Worker, WorkerStatus,
};
use spawn_core::orchestration::{
    CreateEnvironmentRequest, EnvironmentDefaults, EnvironmentService,
};
use spawn_core::persistence::{InMemoryRegistry, WorkerStore};

fn create_request(name: &str) -> CreateEnvironmentRequest {
    CreateEnvironmentRequest {
        name: name.to_string(),
        repo_url: format!("https://example.com/{name}.git"),
        ..CreateEnvironmentRequest::default()
    }
}

fn worker_in(environment: &EnvironmentId, status: WorkerStatus) -> Worker {
    let mut worker = Worker::new(environment.clone(), "task");
    if status != WorkerStatus::Creating {
        worker.container_id = Some(format!("worker-1-{}", worker.id));
    }
    worker.transition(status);
    worker
}

#[tokio::test]
async fn create_applies_defaults_and_parses_vars() {
    let service = EnvironmentService::new(Arc::new(InMemoryRegistry::new()));

    let environment = service
        .create_environment(CreateEnvironmentRequest {
            vars: vec!["FOO=bar".to_string(), "URL=https://x?a=b".to_string()],
            branch: Some("  ".to_string()),
            ..create_request("api")
        })
        .await
        .unwrap();

    assert_eq!(environment.id.as_str().len(), 8);
    assert_eq!(environment.branch, DEFAULT_BRANCH);
    assert_eq!(environment.docker_image, DEFAULT_IMAGE);
    assert_eq!(environment.environment_vars["FOO"], "bar");
    assert_eq!(environment.environment_vars["URL"], "https://x?a=b");
}

#[tokio::test]
async fn configured_defaults_are_used() {
    let service = EnvironmentService::new(Arc::new(InMemoryRegistry::new())).with_defaults(
        EnvironmentDefaults {
            branch: "develop".to_string(),
            docker_image: "custom:1".to_string(),
        },
    );

    let environment = service.create_environment(create_request("api")).await.unwrap();
    assert_eq!(environment.branch, "develop");
    assert_eq!(environment.docker_image, "custom:1");

    let explicit = service
        .create_environment(CreateEnvironmentRequest {
            branch: Some("release".to_string()),
            docker_image: Some("other:2".to_string()),
            ..create_request("web")
        })
        .await
        .unwrap();
    assert_eq!(explicit.branch, "release");
    assert_eq!(explicit.docker_image, "other:2");
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let service = EnvironmentService::new(Arc::new(InMemoryRegistry::new()));

    let blank_name = service
        .create_environment(create_request(" "))
        .await
        .unwrap_err();
    assert_eq!(blank_name.kind, SpawnErrorKind::InvalidInput);

    let bad_var = service
        .create_environment(CreateEnvironmentRequest {
            vars: vec!["NOT_A_PAIR".to_string()],
            ..create_request("api")
        })
        .await
        .unwrap_err();
    assert_eq!(bad_var.kind, SpawnErrorKind::InvalidInput);
    assert!(service.list_environments().await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_names_are_rejected() {
    let service = EnvironmentService::new(Arc::new(InMemoryRegistry::new()));
    service.create_environment(create_request("api")).await.unwrap();

    let error = service
        .create_environment(create_request("api"))
        .await
        .unwrap_err();

    assert_eq!(error.kind, SpawnErrorKind::EnvironmentExists);
    assert_eq!(service.list_environments().await.unwrap().len(), 1);
}

#[tokio::test]
async fn resolves_by_id_or_name() {
    let service = EnvironmentService::new(Arc::new(InMemoryRegistry::new()));
    let created = service.create_environment(create_request("api")).await.unwrap();

    assert_eq!(service.resolve_environment("api").await.unwrap(), created);
    assert_eq!(
        service.resolve_environment(created.id.as_str()).await.unwrap(),
        created
    );

    let error = service.resolve_environment("nope").await.unwrap_err();
    assert_eq!(error.kind, SpawnErrorKind::EnvironmentNotFound);
    assert!(error.message.contains(&format!("api ({})", created.id)));
}

#[tokio::test]
async fn not_found_message_handles_empty_registry() {
    let service = EnvironmentService::new(Arc::new(InMemoryRegistry::new()));
    let error = service.resolve_environment("api").await.unwrap_err();
    assert!(error.message.contains("no environments exist yet"));
}

#[tokio::test]
async fn delete_is_refused_while_a_worker_runs() {
    let registry = Arc::new(InMemoryRegistry::new());
    let service = EnvironmentService::new(registry.clone());
    let environment = service.create_environment(create_request("api")).await.unwrap();
    let running = worker_in(&environment.id, WorkerStatus::Running);
    registry.save_worker(&running).unwrap();

    let error = service.delete_environment("api").await.unwrap_err();

    assert_eq!(error.kind, SpawnErrorKind::EnvironmentInUse);
    assert_eq!(error.environment, Some(environment.id.clone()));
    assert!(registry.worker_by_id(&running.id).unwrap().is_some());
}

#[tokio::test]
async fn delete_removes_finished_workers_too() {
    let registry = Arc::new(InMemoryRegistry::new());
    let service = EnvironmentService::new(registry.clone());
    let environment = service.create_environment(create_request("api")).await.unwrap();
    let other = service.create_environment(create_request("web")).await.unwrap();
    for status in [WorkerStatus::Stopped, WorkerStatus::Failed, WorkerStatus::Creating] {
        registry.save_worker(&worker_in(&environment.id, status)).unwrap();
    }
    let unrelated = worker_in(&other.id, WorkerStatus::Running);
    registry.save_worker(&unrelated).unwrap();

    let deleted = service.delete_environment(environment.id.as_str()).await.unwrap();

    assert_eq!(deleted.id, environment.id);
    assert_eq!(registry.list_workers().unwrap(), vec![unrelated]);
    assert_eq!(service.list_environments().await.unwrap(), vec![other]);
}
