//! Stable process exit codes.

use spawn_core::models::{SpawnError, SpawnErrorKind};

pub const OK: i32 = 0;
/// Any failure without a more specific code.
pub const FAILURE: i32 = 1;
/// Bad arguments, malformed variables or an empty prompt.
pub const INVALID_INPUT: i32 = 2;
/// Unknown environment or worker.
pub const NOT_FOUND: i32 = 3;
pub const RUNTIME_UNAVAILABLE: i32 = 4;
/// A foreground worker exited non-zero.
pub const WORKER_FAILED: i32 = 5;
/// Foreground streaming ended by Ctrl+C; the worker keeps running.
pub const INTERRUPTED: i32 = 130;

pub fn for_kind(kind: SpawnErrorKind) -> i32 {
    match kind {
        SpawnErrorKind::InvalidInput | SpawnErrorKind::EmptyPrompt => INVALID_INPUT,
        SpawnErrorKind::EnvironmentNotFound | SpawnErrorKind::WorkerNotFound => NOT_FOUND,
        SpawnErrorKind::RuntimeUnavailable => RUNTIME_UNAVAILABLE,
        _ => FAILURE,
    }
}

pub fn for_error(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<SpawnError>()
        .map(|error| for_kind(error.kind))
        .unwrap_or(FAILURE)
}
