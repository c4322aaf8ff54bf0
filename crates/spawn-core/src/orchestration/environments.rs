use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::models::{
    DEFAULT_BRANCH, DEFAULT_IMAGE, Environment, EnvironmentId, SpawnError, SpawnErrorKind,
    SpawnResult,
};
use crate::orchestration::{ControllerResult, resolve_environment, with_registry};
use crate::persistence::Registry;

/// Values applied when a create request leaves a field out.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnvironmentDefaults {
    pub branch: String,
    pub docker_image: String,
}

impl Default for EnvironmentDefaults {
    fn default() -> Self {
        Self {
            branch: DEFAULT_BRANCH.to_string(),
            docker_image: DEFAULT_IMAGE.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateEnvironmentRequest {
    pub name: String,
    pub repo_url: String,
    pub branch: Option<String>,
    pub docker_image: Option<String>,
    /// Raw `KEY=VALUE` pairs.
    pub vars: Vec<String>,
}

pub struct EnvironmentService {
    registry: Arc<dyn Registry>,
    defaults: EnvironmentDefaults,
}

impl EnvironmentService {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            defaults: EnvironmentDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: EnvironmentDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub async fn create_environment(
        &self,
        request: CreateEnvironmentRequest,
    ) -> ControllerResult<Environment> {
        let name = required("name", &request.name)?;
        let repo_url = required("repository url", &request.repo_url)?;
        let environment_vars = parse_env_vars(&request.vars)?;

        let environment = Environment {
            id: EnvironmentId::generate(),
            name,
            repo_url,
            branch: non_blank(request.branch).unwrap_or_else(|| self.defaults.branch.clone()),
            docker_image: non_blank(request.docker_image)
                .unwrap_or_else(|| self.defaults.docker_image.clone()),
            environment_vars,
            created_at: SystemTime::now(),
        };

        let saved = environment.clone();
        with_registry(&self.registry, "save_environment", move |registry| {
            registry.save_environment(&saved)
        })
        .await?;

        tracing::info!(
            environment_id = %environment.id,
            name = %environment.name,
            "environment created"
        );
        Ok(environment)
    }

    pub async fn resolve_environment(&self, key: &str) -> ControllerResult<Environment> {
        resolve_environment(&self.registry, key).await
    }

    pub async fn list_environments(&self) -> ControllerResult<Vec<Environment>> {
        with_registry(&self.registry, "list_environments", |registry| {
            registry.list_environments()
        })
        .await
    }

    /// Deletes the Environment and its Workers' records. Refused while any of
    /// its Workers is running.
    pub async fn delete_environment(&self, key: &str) -> ControllerResult<Environment> {
        let environment = self.resolve_environment(key).await?;
        let id = environment.id.clone();
        let deleted = with_registry(&self.registry, "delete_environment", move |registry| {
            registry.delete_environment(&id)
        })
        .await?;

        if !deleted {
            return Err(SpawnError::new(
                SpawnErrorKind::EnvironmentNotFound,
                format!("environment '{key}' was removed concurrently"),
            )
            .for_environment(&environment.id));
        }

        tracing::info!(environment_id = %environment.id, "environment deleted");
        Ok(environment)
    }
}

/// Parses `KEY=VALUE` pairs, splitting on the first `=`. Later duplicates
/// replace earlier ones.
pub fn parse_env_vars(raw: &[String]) -> SpawnResult<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(invalid_var(pair));
        };
        let key = key.trim();
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(invalid_var(pair));
        }
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

fn invalid_var(pair: &str) -> SpawnError {
    SpawnError::new(
        SpawnErrorKind::InvalidInput,
        format!("environment variable '{pair}' must use KEY=VALUE format"),
    )
}

fn required(field: &str, value: &str) -> SpawnResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SpawnError::new(
            SpawnErrorKind::InvalidInput,
            format!("environment {field} must not be empty"),
        ));
    }
    Ok(trimmed.to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
