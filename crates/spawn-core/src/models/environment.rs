use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::models::EnvironmentId;

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_IMAGE: &str = "spawn-claude:latest";

/// A named repository context that workers run under.
///
/// `environment_vars` are injected into every worker container and take
/// precedence over the variables the runtime sets itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Environment {
    pub id: EnvironmentId,
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub docker_image: String,
    pub environment_vars: BTreeMap<String, String>,
    pub created_at: SystemTime,
}
