//! Workflow engine logic and repository trait definitions for Stepflow.
//!
//! This crate holds the runner (the per-instance state machine), the
//! expression resolver, the dispatch pipeline, and the "ports" (store,
//! lookup, and broker traits) that the infrastructure layer implements.
//! It depends only on `stepflow-types` -- never on `stepflow-infra` or
//! any database/IO crate.

pub mod engine;
pub mod queue;
pub mod repository;
