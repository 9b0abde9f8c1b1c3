//! Global configuration types for Stepflow.
//!
//! `GlobalConfig` represents the top-level `config.toml` controlling engine
//! limits, dispatch behavior, intake concurrency, and the external function
//! gateway endpoint.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Stepflow engine.
///
/// Loaded from `<data-dir>/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Base URL workers use to reach the callback ingress. Attached to every
    /// dispatch as `callBackUrl`.
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,

    /// Directory of YAML workflow definitions for local mode. None = remote
    /// definition service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definitions_dir: Option<String>,

    /// Remote lookup service endpoints. Unset fields fall back to local
    /// sources (`definitions_dir`, gateway-derived function records).
    #[serde(default)]
    pub lookup: LookupConfig,

    /// Engine limits.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Outbound dispatch pool and backoff.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Callback intake concurrency.
    #[serde(default)]
    pub intake: IntakeConfig,

    /// Function execution tier endpoint.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_callback_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            callback_base_url: default_callback_base_url(),
            definitions_dir: None,
            lookup: LookupConfig::default(),
            engine: EngineConfig::default(),
            dispatch: DispatchConfig::default(),
            intake: IntakeConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine limits
// ---------------------------------------------------------------------------

/// Limits applied by the runner and watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Instance timeout when the definition declares none.
    #[serde(default = "default_workflow_timeout_secs")]
    pub default_timeout_seconds: u64,

    /// DO_WHILE safety bound: a loop exceeding this iteration count fails
    /// terminally.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// How often the watchdog scans running instances for timeout.
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_seconds: u64,
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

fn default_max_loop_iterations() -> u32 {
    1000
}

fn default_watchdog_interval_secs() -> u64 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_workflow_timeout_secs(),
            max_loop_iterations: default_max_loop_iterations(),
            watchdog_interval_seconds: default_watchdog_interval_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Outbound dispatch pool size and transport retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Transport attempts per dispatch before the step is failed.
    #[serde(default = "default_dispatch_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds; doubles per attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Concurrent outbound sends.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Pending dispatch queue depth; enqueueing blocks when full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-request timeout for the function gateway, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_seconds: u64,
}

fn default_dispatch_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_dispatch_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            request_timeout_seconds: default_request_timeout_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

/// Callback intake consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Concurrent queue consumers. Per-instance locking keeps transitions
    /// serialized regardless of this value.
    #[serde(default = "default_consumer_count")]
    pub consumer_count: usize,
}

fn default_consumer_count() -> usize {
    2
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            consumer_count: default_consumer_count(),
        }
    }
}

// ---------------------------------------------------------------------------
// Lookup services
// ---------------------------------------------------------------------------

/// Where definitions and function records are resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    /// Base URL of the remote definition service. None = load YAML
    /// definitions from `definitions_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_service_url: Option<String>,

    /// Base URL of the remote function metadata service. None = derive
    /// records from the gateway base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_service_url: Option<String>,

    /// Per-request timeout for lookup calls, in seconds.
    #[serde(default = "default_lookup_timeout_secs")]
    pub request_timeout_seconds: u64,
}

fn default_lookup_timeout_secs() -> u64 {
    10
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            definition_service_url: None,
            function_service_url: None,
            request_timeout_seconds: default_lookup_timeout_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Where function invocations are sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the function execution tier.
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,

    /// Bearer token for the execution tier, when it requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_gateway_base_url() -> String {
    "http://127.0.0.1:9090".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            auth_token: None,
        }
    }
}
