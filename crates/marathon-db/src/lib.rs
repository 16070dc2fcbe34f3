//! Persistence layer for the Marathon orchestrator.
//!
//! Owns the Postgres connection pool, the runtime migration runner, and the
//! row types and query functions for the `tasks`, `nodes`, `usage_records`,
//! and `users` tables. The orchestrator's task store and node registry treat
//! this crate as a write-through log, not as the source of truth for reads.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
