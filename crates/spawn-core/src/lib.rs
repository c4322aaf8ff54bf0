pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod prompt;
pub mod runtime;
pub mod sqlite;
