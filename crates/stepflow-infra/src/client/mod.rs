//! HTTP clients and lookup services.

pub mod definition;
pub mod function;
