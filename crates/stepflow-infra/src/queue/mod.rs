//! Message broker implementations.

pub mod memory;
