//! Persistence layer for the heron task orchestrator.
//!
//! PostgreSQL is the single source of truth. This crate owns the schema
//! (SQL migrations under `migrations/`), the row models, the connection
//! pool, the lifecycle predicate library, and the transactional query
//! functions that implement every task state transition.

pub mod config;
pub mod lifecycle;
pub mod models;
pub mod pool;
pub mod queries;
