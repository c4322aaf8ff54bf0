use std::collections::BTreeMap;

use crate::models::{Environment, SpawnError, SpawnErrorKind};
use crate::runtime::RuntimeResult;
use crate::runtime::naming::runtime_worker_name;

/// Credential variables checked in order; the first non-empty one wins.
pub const CREDENTIAL_VARIABLES: [&str; 2] = ["CLAUDE_API_KEY", "ANTHROPIC_API_KEY"];

pub const ENVIRONMENT_ID_LABEL: &str = "spawn.environment";

pub trait CredentialSource: Send + Sync {
    fn lookup(&self, name: &str) -> Option<String>;
}

/// Reads credentials from the current process environment.
pub struct ProcessEnvironment;

impl CredentialSource for ProcessEnvironment {
    fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed credential values, for embedding and tests.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    values: BTreeMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn lookup(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

pub fn resolve_api_key(source: &dyn CredentialSource) -> RuntimeResult<String> {
    CREDENTIAL_VARIABLES
        .iter()
        .filter_map(|name| source.lookup(name))
        .find(|value| !value.is_empty())
        .ok_or_else(|| {
            SpawnError::new(
                SpawnErrorKind::MissingCredential,
                format!(
                    "{} or {} environment variable is required",
                    CREDENTIAL_VARIABLES[0], CREDENTIAL_VARIABLES[1]
                ),
            )
        })
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContainerOptions {
    pub working_dir: String,
    pub interactive: bool,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            working_dir: "/workspace".to_string(),
            interactive: false,
        }
    }
}

/// Everything the engine needs to create one worker container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub working_dir: String,
    pub tty: bool,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn for_worker(
        env: &Environment,
        prompt: &str,
        api_key: &str,
        options: &ContainerOptions,
        prefix: &str,
    ) -> Self {
        let mut variables = BTreeMap::from([
            ("REPO_URL".to_string(), env.repo_url.clone()),
            ("BRANCH".to_string(), env.branch.clone()),
            ("PROMPT".to_string(), prompt.to_string()),
            ("CLAUDE_API_KEY".to_string(), api_key.to_string()),
            ("INTERACTIVE".to_string(), options.interactive.to_string()),
        ]);
        // Environment overlay shadows the built-ins.
        variables.extend(
            env.environment_vars
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        Self {
            name: runtime_worker_name(prefix),
            image: env.docker_image.clone(),
            env: variables,
            working_dir: options.working_dir.clone(),
            tty: options.interactive,
            labels: BTreeMap::from([(
                ENVIRONMENT_ID_LABEL.to_string(),
                env.id.as_str().to_string(),
            )]),
        }
    }

    /// `KEY=VALUE` entries in the shape the engine API expects.
    pub fn env_list(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::models::EnvironmentId;

    fn environment(vars: &[(&str, &str)]) -> Environment {
        Environment {
            id: EnvironmentId("env12345".to_string()),
            name: "api".to_string(),
            repo_url: "https://example.com/api.git".to_string(),
            branch: "main".to_string(),
            docker_image: "spawn-claude:latest".to_string(),
            environment_vars: vars
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            created_at: SystemTime::now(),
        }
    }

    #[test]
    fn builtin_variables_are_present() {
        let spec = ContainerSpec::for_worker(
            &environment(&[]),
            "add tests",
            "sk-test",
            &ContainerOptions::default(),
            "worker-",
        );

        assert_eq!(spec.env["REPO_URL"], "https://example.com/api.git");
        assert_eq!(spec.env["BRANCH"], "main");
        assert_eq!(spec.env["PROMPT"], "add tests");
        assert_eq!(spec.env["CLAUDE_API_KEY"], "sk-test");
        assert_eq!(spec.env["INTERACTIVE"], "false");
        assert_eq!(spec.working_dir, "/workspace");
        assert_eq!(spec.image, "spawn-claude:latest");
        assert!(spec.name.starts_with("worker-"));
    }

    #[test]
    fn environment_overlay_shadows_builtins() {
        let spec = ContainerSpec::for_worker(
            &environment(&[("BRANCH", "develop"), ("FOO", "bar")]),
            "prompt",
            "sk-test",
            &ContainerOptions::default(),
            "worker-",
        );

        assert_eq!(spec.env["BRANCH"], "develop");
        assert_eq!(spec.env["FOO"], "bar");
        let branch_entries = spec
            .env_list()
            .into_iter()
            .filter(|entry| entry.starts_with("BRANCH="))
            .count();
        assert_eq!(branch_entries, 1);
    }

    #[test]
    fn first_present_credential_wins() {
        let both = StaticCredentials::new()
            .with("CLAUDE_API_KEY", "primary")
            .with("ANTHROPIC_API_KEY", "fallback");
        assert_eq!(resolve_api_key(&both).unwrap(), "primary");

        let fallback = StaticCredentials::new()
            .with("CLAUDE_API_KEY", "")
            .with("ANTHROPIC_API_KEY", "fallback");
        assert_eq!(resolve_api_key(&fallback).unwrap(), "fallback");
    }

    #[test]
    fn missing_credentials_fail() {
        let error = resolve_api_key(&StaticCredentials::new()).unwrap_err();
        assert_eq!(error.kind, SpawnErrorKind::MissingCredential);
    }
}
