//! Workflow execution engine: the state machine and everything feeding it.
//!
//! - `definition` -- YAML parsing, validation, filesystem load/save
//! - `expression` -- `[stepId.outputData.path]` references and conditions
//! - `runner` -- per-instance state machine: start, callbacks, lifecycle, finalize
//! - `dispatcher` -- bounded worker pool delivering invocations to the function tier
//! - `intake` -- result queue consumers feeding callbacks into the runner
//! - `watchdog` -- periodic timeout sweep over active instances

pub mod definition;
pub mod dispatcher;
pub mod expression;
pub mod intake;
pub mod runner;
pub mod watchdog;
