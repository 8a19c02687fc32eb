//! Persistence layer — libSQL-backed storage for the fleet collections.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ConflictExpectation, ConflictPatch, Store, TaskExpectation, TaskPatch, TaskQuery, TaskUpdate,
    UpdateOutcome, WorkerExpectation, WorkerPatch,
};
