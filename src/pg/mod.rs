//! PostgreSQL wire protocol client.
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `types`: PostgreSQL type encoding/decoding
//! - `startup`/`auth`: Connection handshake and password authentication
//! - `connection`: Per-connection task with the command pipeline
//! - `transaction`: Transaction overlay on a connection
//! - `copy`: `COPY ... FROM STDIN` streaming
//! - `events`: Notification, error and close routing
//! - `pool`: Connection pool

pub mod protocol;
pub mod types;
pub mod error;
pub mod config;
pub mod connection;
pub mod transaction;
pub mod copy;
pub mod events;
pub mod pool;

mod auth;
mod command;
mod startup;

#[cfg(test)]
mod tests;

pub use command::{QueryResult, SharedColumns};
pub use config::PgConfig;
pub use connection::{ConnectionStats, PgConnection};
pub use copy::{CopyFormat, CopyOptions, CopyOutcome, CopyWriter};
pub use error::{PgError, PgResult};
pub use events::{reset_exception_sink, set_exception_sink, Notification};
pub use pool::{PgPool, PgPoolConfig, PoolStatus, PoolTransaction, PooledConnection};
pub use transaction::Transaction;
pub use types::{Oid, PgValue};
