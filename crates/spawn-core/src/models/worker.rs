use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use crate::models::{EnvironmentId, SpawnError, SpawnErrorKind, WorkerId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum WorkerStatus {
    Creating,
    Running,
    Stopped,
    Failed,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 4] = [
        WorkerStatus::Creating,
        WorkerStatus::Running,
        WorkerStatus::Stopped,
        WorkerStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Terminal status for a container that exited with `exit_code`.
    pub fn from_exit_code(exit_code: i64) -> Self {
        if exit_code == 0 {
            Self::Stopped
        } else {
            Self::Failed
        }
    }
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = SpawnError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| {
                SpawnError::new(
                    SpawnErrorKind::InvalidInput,
                    format!("unknown worker status '{raw}'"),
                )
            })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Worker {
    pub id: WorkerId,
    pub env_id: EnvironmentId,
    pub prompt: String,
    pub status: WorkerStatus,
    pub container_id: Option<String>,
    pub created_at: SystemTime,
    pub last_activity: SystemTime,
}

impl Worker {
    pub fn new(env_id: EnvironmentId, prompt: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            id: WorkerId::generate(),
            env_id,
            prompt: prompt.into(),
            status: WorkerStatus::Creating,
            container_id: None,
            created_at: now,
            last_activity: now,
        }
    }

    /// Moves to `status` and stamps `last_activity`.
    pub fn transition(&mut self, status: WorkerStatus) {
        self.status = status;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity = SystemTime::now().max(self.last_activity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in WorkerStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkerStatus>().unwrap(), status);
        }
        let error = "paused".parse::<WorkerStatus>().unwrap_err();
        assert_eq!(error.kind, SpawnErrorKind::InvalidInput);
    }

    #[test]
    fn exit_code_maps_to_terminal_status() {
        assert_eq!(WorkerStatus::from_exit_code(0), WorkerStatus::Stopped);
        assert_eq!(WorkerStatus::from_exit_code(7), WorkerStatus::Failed);
        assert!(WorkerStatus::from_exit_code(-1).is_terminal());
    }

    #[test]
    fn new_worker_starts_creating_without_container() {
        let worker = Worker::new(EnvironmentId("env1".to_string()), "fix the build");
        assert_eq!(worker.status, WorkerStatus::Creating);
        assert!(worker.container_id.is_none());
        assert_eq!(worker.created_at, worker.last_activity);
    }
}
