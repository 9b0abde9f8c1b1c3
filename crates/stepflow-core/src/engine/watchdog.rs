//! Instance timeout watchdog.
//!
//! Periodically asks the runner to sweep active instances for blown
//! deadlines. The first tick fires immediately, so instances that went
//! overdue while the process was down are caught right after startup.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::engine::dispatcher::DispatchSink;
use crate::engine::runner::WorkflowRunner;
use crate::repository::execution::ExecutionStore;
use crate::repository::lookup::DefinitionService;

/// Spawn the watchdog task. Runs until `shutdown` fires.
pub fn spawn_watchdog<S, D, P>(
    runner: Arc<WorkflowRunner<S, D, P>>,
    period: Duration,
    shutdown: &CancellationToken,
) -> JoinHandle<()>
where
    S: ExecutionStore + 'static,
    D: DefinitionService + 'static,
    P: DispatchSink + 'static,
{
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(period_ms = period.as_millis() as u64, "timeout watchdog started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match runner.sweep_overdue().await {
                        Ok(0) => {}
                        Ok(expired) => debug!(expired, "watchdog timed out instances"),
                        Err(err) => error!(%err, "watchdog sweep failed"),
                    }
                }
            }
        }
        debug!("timeout watchdog stopped");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
