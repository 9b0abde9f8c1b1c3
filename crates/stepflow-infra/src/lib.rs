//! Infrastructure layer for Stepflow.
//!
//! Concrete implementations of the ports defined in `stepflow-core`:
//! SQLite persistence for execution state, the in-process message broker,
//! HTTP clients for the function gateway and lookup services, and
//! configuration loading from the data directory.

pub mod client;
pub mod config;
pub mod queue;
pub mod sqlite;
