pub mod environment;
pub mod error;
pub mod ids;
pub mod worker;

pub use environment::{DEFAULT_BRANCH, DEFAULT_IMAGE, Environment};
pub use error::{SpawnError, SpawnErrorKind, SpawnResult};
pub use ids::{EnvironmentId, WorkerId};
pub use worker::{Worker, WorkerStatus};
