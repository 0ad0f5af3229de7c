//! SQLite backend for the Anchor governance ledger.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on dedicated threads
//! without blocking the async runtime. Writes go through a single writer
//! connection, each governed mutation and its audit event in one
//! transaction. Reads use a separate connection in WAL mode and only ever
//! see committed state.

mod encode;
mod schema;
mod store;
mod tx;

pub mod error;

pub use error::{Error, Result};
pub use store::{SqliteStore, StoreOptions};
