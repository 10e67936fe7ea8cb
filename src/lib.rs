//! # pg-relay
//!
//! A PostgreSQL logical replication consumer that streams row-level changes
//! to an application-supplied handler in real-time.
//!
//! ## Overview
//!
//! `pg-relay` connects to PostgreSQL as a logical replication client using
//! the built-in `pgoutput` output plugin, decodes the binary change-stream
//! into typed row events, and hands them to your [`DmlHandler`]. It
//! provides:
//!
//! - **Commit-order delivery**: events reach the handler in the exact commit
//!   order received from the server, only after their transaction commits
//! - **Safe acknowledgement**: the server's slot position only advances
//!   after the handler accepts a transaction, so un-applied changes are
//!   replayed after a reconnect
//! - **Typed decoding**: column values arrive as [`PgValue`] domain values
//!   (integers, floats, timestamps, uuid, json, …), not raw strings
//! - **Changed-column tracking**: with `REPLICA IDENTITY FULL`, update
//!   events name the columns whose value actually changed
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pg_relay::{DmlHandler, HandlerOutcome, ReplicationEvent, ReplicationOptions, Replicator};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl DmlHandler for Printer {
//!     async fn handle(&mut self, event: ReplicationEvent) -> HandlerOutcome {
//!         println!("{:?} {}.{}", event.kind, event.schema, event.table);
//!         HandlerOutcome::Success
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> pg_relay::Result<()> {
//!     let options = ReplicationOptions::from_env()?;
//!     let mut replicator = Replicator::new(options, Printer);
//!     replicator.start(CancellationToken::new()).await
//! }
//! ```
//!
//! ## PostgreSQL Setup
//!
//! 1. Enable logical replication in `postgresql.conf`:
//!    ```ini
//!    wal_level = logical
//!    max_replication_slots = 4
//!    max_wal_senders = 4
//!    ```
//!
//! 2. Connect as a user with the `REPLICATION` attribute:
//!    ```sql
//!    CREATE USER replicator WITH REPLICATION LOGIN PASSWORD 'secret';
//!    GRANT CONNECT ON DATABASE mydb TO replicator;
//!    GRANT USAGE ON SCHEMA public TO replicator;
//!    GRANT SELECT ON ALL TABLES IN SCHEMA public TO replicator;
//!    ```
//!
//! The publication and slot (both named by `slot_name`) are created on
//! session start and persist server-side until [`Replicator::teardown`].
//!
//! ## Architecture
//!
//! - [`replicator`] - session loop, acknowledgement discipline, teardown
//! - [`postgres`] - wire protocol: connection, `pgoutput` parser, typed
//!   codec, relation catalogue
//! - [`handler`] - the handler capability and outcomes
//! - [`config`] - option structures, validation, environment parsing
//! - [`error`] - error types and handling

/// Option structures, validation, and environment variable parsing
pub mod config;

/// Error types and result handling
pub mod error;

/// The handler capability receiving decoded row events
pub mod handler;

/// PostgreSQL logical replication connection and protocol handling
pub mod postgres;

/// The replication session orchestrator
pub mod replicator;

pub use config::{PostgresConfig, ReplicationOptions};
pub use error::{Error, Result};
pub use handler::{DmlHandler, HandlerOutcome, LogHandler};
pub use postgres::codec::PgValue;
pub use postgres::types::{EventKind, Lsn, ReplicationEvent};
pub use replicator::Replicator;
