//! Observability support for Stepflow: tracing subscriber initialization
//! with optional OpenTelemetry trace export.

pub mod tracing_setup;
