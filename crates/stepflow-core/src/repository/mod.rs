//! Repository trait definitions (ports).
//!
//! These traits define the storage and lookup interfaces that the
//! infrastructure layer (stepflow-infra) implements. The core crate never
//! depends on any specific storage technology or HTTP client.

pub mod execution;
pub mod lookup;
