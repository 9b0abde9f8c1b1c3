//! CLI command definitions for the `stepflow` binary.
//!
//! Uses clap derive macros for argument parsing. The binary either runs
//! the engine (`stepflow serve`) or checks definition files offline
//! (`stepflow validate`).

pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Drive workflows through external function executors.
#[derive(Parser)]
#[command(name = "stepflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the engine: REST API, dispatch pool, callback intake, watchdog.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Export spans through the OpenTelemetry stdout exporter.
        #[arg(long)]
        otel: bool,
    },

    /// Validate workflow definition YAML without starting the engine.
    Validate {
        /// A definition file, or a directory scanned recursively.
        path: PathBuf,
    },
}
