//! pgmux - a pipelining PostgreSQL client core.
//!
//! Every [`PgConnection`] runs as its own task. Commands are queued in call
//! order and written to the socket as soon as the pipelining limit allows,
//! so a burst of queries costs one round trip instead of one each.
//! Transactions, `COPY ... FROM STDIN` streams and server notifications are
//! layered on the same queue.
//!
//! ```no_run
//! use pgmux::{PgPool, PgPoolConfig, PgValue};
//!
//! # async fn run() -> pgmux::PgResult<()> {
//! let pool = PgPool::connect(
//!     PgPoolConfig::from_url("postgresql://app@localhost/app")?.max_connections(4),
//! )
//! .await?;
//!
//! let conn = pool.acquire().await?;
//! let first = conn.query("SELECT $1::int4", &[PgValue::Int4(1)]);
//! let second = conn.query("SELECT $1::int4", &[PgValue::Int4(2)]);
//! let (first, second) = (first.await?, second.await?);
//! assert_eq!(first.rows.len() + second.rows.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod pg;

pub use pg::{
    reset_exception_sink, set_exception_sink, ConnectionStats, CopyFormat, CopyOptions,
    CopyOutcome, CopyWriter, Notification, Oid, PgConfig, PgConnection, PgError, PgPool,
    PgPoolConfig, PgResult, PgValue, PoolStatus, PoolTransaction, PooledConnection,
    QueryResult, Transaction,
};
