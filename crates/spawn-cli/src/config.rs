//! CLI configuration stored under `<config dir>/spawn/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use spawn_core::models::{DEFAULT_BRANCH, DEFAULT_IMAGE};
use spawn_core::orchestration::{ControllerSettings, EnvironmentDefaults};
use spawn_core::runtime::{
    BuildContext, ContainerOptions, DEFAULT_WORKER_PREFIX, DockerRuntimeConfig,
};

/// Missing fields fall back to defaults, so a partial file is fine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SpawnConfig {
    pub registry: RegistryConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Image for environments created without `--image`.
    pub default_image: String,
    pub default_branch: String,
    /// Directory holding the Dockerfile and support directory.
    pub build_context: PathBuf,
    pub dockerfile: String,
    pub support_dir: String,
    pub working_dir: String,
    /// Grace period for `worker destroy` without `--force`.
    pub stop_timeout_secs: u64,
    pub container_prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_image: DEFAULT_IMAGE.to_string(),
            default_branch: DEFAULT_BRANCH.to_string(),
            build_context: PathBuf::from("."),
            dockerfile: "Dockerfile".to_string(),
            support_dir: "docker".to_string(),
            working_dir: "/workspace".to_string(),
            stop_timeout_secs: 10,
            container_prefix: DEFAULT_WORKER_PREFIX.to_string(),
        }
    }
}

impl SpawnConfig {
    pub fn validate(&self) -> Result<()> {
        if self.registry.database_path.as_os_str().is_empty() {
            return Err(anyhow!("registry.database_path must not be empty"));
        }
        let runtime = &self.runtime;
        for (field, value) in [
            ("runtime.default_image", &runtime.default_image),
            ("runtime.default_branch", &runtime.default_branch),
            ("runtime.dockerfile", &runtime.dockerfile),
            ("runtime.working_dir", &runtime.working_dir),
            ("runtime.container_prefix", &runtime.container_prefix),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{field} must not be empty"));
            }
        }
        if !runtime.working_dir.starts_with('/') {
            return Err(anyhow!("runtime.working_dir must be an absolute container path"));
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            build_context: BuildContext::new(&self.runtime.build_context)
                .dockerfile(&self.runtime.dockerfile)
                .support_dir(&self.runtime.support_dir),
            container: ContainerOptions {
                working_dir: self.runtime.working_dir.clone(),
                interactive: false,
            },
        }
    }

    pub fn environment_defaults(&self) -> EnvironmentDefaults {
        EnvironmentDefaults {
            branch: self.runtime.default_branch.clone(),
            docker_image: self.runtime.default_image.clone(),
        }
    }

    pub fn docker_runtime_config(&self) -> DockerRuntimeConfig {
        DockerRuntimeConfig {
            worker_prefix: self.runtime.container_prefix.clone(),
            stop_timeout: Duration::from_secs(self.runtime.stop_timeout_secs),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spawn")
        .join("config.toml")
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spawn")
        .join("spawn.sqlite3")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SpawnConfig::default()`.
pub fn load_config(path: &Path) -> Result<SpawnConfig> {
    if !path.exists() {
        let cfg = SpawnConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SpawnConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SpawnConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SpawnConfig::default());
        assert_eq!(cfg.runtime.default_image, "spawn-claude:latest");
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("config.toml");
        let mut cfg = SpawnConfig::default();
        cfg.registry.database_path = temp.path().join("spawn.sqlite3");
        cfg.runtime.stop_timeout_secs = 3;
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[runtime]\ndefault_branch = \"develop\"\n").expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.runtime.default_branch, "develop");
        assert_eq!(cfg.runtime.container_prefix, "worker-");
        assert_eq!(cfg.environment_defaults().branch, "develop");
    }

    #[test]
    fn rejects_blank_prefix_and_relative_working_dir() {
        let mut cfg = SpawnConfig::default();
        cfg.runtime.container_prefix = " ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = SpawnConfig::default();
        cfg.runtime.working_dir = "workspace".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn settings_follow_runtime_section() {
        let mut cfg = SpawnConfig::default();
        cfg.runtime.build_context = PathBuf::from("/srv/spawn");
        cfg.runtime.stop_timeout_secs = 30;

        let settings = cfg.controller_settings();
        assert_eq!(settings.build_context.root, PathBuf::from("/srv/spawn"));
        assert_eq!(settings.build_context.support_dir, "docker");
        assert_eq!(settings.container.working_dir, "/workspace");
        assert_eq!(
            cfg.docker_runtime_config().stop_timeout,
            Duration::from_secs(30)
        );
    }
}
