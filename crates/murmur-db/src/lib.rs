//! Data layer for the Murmur social backend (`PostgreSQL` + in-memory).
//!
//! `PostgreSQL` is the system of record. Every statement is a conditional
//! template from [`queries`] built by `murmur-query` and executed with
//! runtime binds. An in-memory store with the same constraint semantics
//! backs unit tests of the services.
//!
//! # Architecture
//!
//! ```text
//! murmur-core services
//!     |
//!     +-- Store (non-transactional reads/writes)
//!     |     +-- PostgresStore --> PgPool
//!     |     +-- MemoryStore   --> Arc<Mutex<Tables>>
//!     |
//!     +-- StoreTx (begin / statements / commit | rollback)
//! ```
//!
//! # Modules
//!
//! - [`postgres`] -- `PostgreSQL` connection pool and configuration
//! - [`store`] -- backend-neutral [`Store`] and [`StoreTx`] handles
//! - [`pg_store`] -- `PostgreSQL` statement execution
//! - [`memory`] -- in-memory store with fault injection
//! - [`queries`] -- SQL templates
//! - [`error`] -- SQLSTATE-classified error type
//!
//! # Requirements
//!
//! The migrations use the built-in `uuidv7()` function for primary key
//! defaults, so the server must run `PostgreSQL` 18 or newer.

pub mod error;
pub mod memory;
pub mod pg_store;
pub mod postgres;
pub mod queries;
mod rows;
pub mod store;

// Re-export primary types for convenience.
pub use error::DbError;
pub use memory::{FailKind, FailPoint, MemoryStore, MemoryTx};
pub use pg_store::{PostgresStore, PostgresTx};
pub use postgres::{PostgresConfig, PostgresPool, REQUEST_CONNECTIONS};
pub use store::{
    Inserted, Page, PostCounterDrift, PostInsert, RelationDirection, RelationSearch, Store,
    StoreTx, TimelineEntry, UserCounterDrift, UserCounters, UserSearch,
};
