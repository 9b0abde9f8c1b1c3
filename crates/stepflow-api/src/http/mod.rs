//! HTTP/REST API layer for Stepflow.
//!
//! Axum-based lifecycle surface under `/workflow/` plus the worker-facing
//! callback ingress, with an envelope response format and CORS support.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
