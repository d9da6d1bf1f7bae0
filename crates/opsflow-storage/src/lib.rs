//! Persistence layer for the opsflow engine.
//!
//! `ProcessRepository` is the logical repository the engine talks to. The
//! Postgres implementation is the production store; the in-memory
//! implementation backs unit and scenario tests.

pub mod memory;
pub mod postgres;
pub mod repository;

pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;
pub use repository::{
    CallbackTarget, CreateInstanceRequest, CreatedInstance, NewBinding, ProcessRepository,
    StoreError,
};
