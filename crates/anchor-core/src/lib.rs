//! Core types and trait definitions for the Anchor governance ledger.
//!
//! This crate is deliberately free of HTTP and database dependencies. It owns
//! the policy engine, the audit hash-chain rule and its verifier, export
//! encoding, and the [`store::GovernanceStore`] abstraction that storage
//! backends implement.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod agent;
pub mod audit;
pub mod chain;
pub mod checkpoint;
pub mod clock;
pub mod data;
pub mod detect;
pub mod error;
pub mod export;
pub mod ledger;
pub mod policy;
pub mod store;

pub use error::{Error, Result};

/// Workspace used when a request carries no resolved workspace.
pub const DEFAULT_WORKSPACE: &str = "default";
