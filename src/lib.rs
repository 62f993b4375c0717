// ABOUTME: Library root of database-reconciler
// ABOUTME: Table scanning, syncing and two-way replication between two databases

pub mod commands;
pub mod committer;
pub mod config;
pub mod db;
pub mod error;
pub mod event_log;
pub mod replication;
pub mod scan;
pub mod session;
pub mod sync;
pub mod utils;

pub use config::{Config, Options, TableConfig};
pub use db::{Connection, ConnectorRegistry, Row, Value};
pub use error::ReconcileError;
pub use session::{Session, Side};
