//! Step dispatch to the function execution tier.
//!
//! The runner resolves a step's input and enqueues an invocation request;
//! a bounded worker pool looks up the function record and POSTs the
//! invocation to the gateway. Transient transport failures are retried
//! with exponential backoff. When the attempt budget is exhausted (or the
//! gateway rejects the call outright) the dispatcher publishes a synthetic
//! failure callback onto the result queue, so the failure flows through
//! the same retry policy as a failure reported by a worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stepflow_types::callback::CallbackMessage;
use stepflow_types::config::DispatchConfig;
use stepflow_types::execution::StepRunStatus;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::queue::broker::{MessageBroker, RESULT_QUEUE};
use crate::repository::lookup::{FunctionRecord, FunctionService};

// ---------------------------------------------------------------------------
// Client trait and wire types
// ---------------------------------------------------------------------------

/// Errors from the function gateway client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request never produced an HTTP response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The gateway answered with a non-success status.
    #[error("gateway returned {status}: {message}")]
    Status { status: u16, message: String },
}

impl ClientError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Status { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

/// Wire payload POSTed to the function execution tier.
///
/// Workers echo `workflowInstanceId` / `stepInstanceId` back in their
/// callback so the engine can correlate the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationPayload {
    pub function_id: String,
    pub workflow_instance_id: Uuid,
    pub step_instance_id: Uuid,
    pub input_data: HashMap<String, serde_json::Value>,
    /// Where the worker reports its result.
    pub call_back_url: String,
}

/// HTTP client against the function execution tier.
///
/// Implementations live in stepflow-infra (reqwest); tests substitute a
/// recording client.
pub trait FunctionClient: Send + Sync {
    /// Deliver one invocation to the function endpoint.
    fn invoke(
        &self,
        function: &FunctionRecord,
        payload: &InvocationPayload,
    ) -> impl std::future::Future<Output = Result<(), ClientError>> + Send;
}

// ---------------------------------------------------------------------------
// Dispatch queue
// ---------------------------------------------------------------------------

/// A dispatch job as the runner hands it over: input already resolved,
/// function not yet looked up.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub workflow_instance_id: Uuid,
    pub step_instance_id: Uuid,
    pub function_id: String,
    pub input_data: HashMap<String, serde_json::Value>,
}

/// Errors from enqueueing a dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The worker pool has shut down.
    #[error("dispatch queue closed")]
    QueueClosed,
}

impl From<DispatchError> for stepflow_types::error::EngineError {
    fn from(err: DispatchError) -> Self {
        stepflow_types::error::EngineError::InternalService(err.to_string())
    }
}

/// Where the runner pushes dispatch jobs.
///
/// `enqueue` applies backpressure: it waits while the bounded queue is
/// full instead of dropping or buffering unboundedly.
pub trait DispatchSink: Send + Sync {
    fn enqueue(
        &self,
        request: InvocationRequest,
    ) -> impl std::future::Future<Output = Result<(), DispatchError>> + Send;
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Bounded dispatch worker pool in front of the function gateway.
pub struct Dispatcher<F, C, B>
where
    F: FunctionService,
    C: FunctionClient,
    B: MessageBroker,
{
    functions: Arc<F>,
    client: Arc<C>,
    broker: Arc<B>,
    config: DispatchConfig,
    callback_url: String,
    tx: mpsc::Sender<InvocationRequest>,
    // Held until `spawn_workers` hands it to the pool.
    rx: Mutex<Option<mpsc::Receiver<InvocationRequest>>>,
}

impl<F, C, B> Dispatcher<F, C, B>
where
    F: FunctionService + 'static,
    C: FunctionClient + 'static,
    B: MessageBroker + 'static,
{
    /// Create a dispatcher. Workers do not run until `spawn_workers`.
    ///
    /// `callback_base_url` is the externally reachable address of this
    /// engine; the callback route is appended here once.
    pub fn new(
        functions: Arc<F>,
        client: Arc<C>,
        broker: Arc<B>,
        config: DispatchConfig,
        callback_base_url: &str,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let callback_url = format!(
            "{}/workflow/callback",
            callback_base_url.trim_end_matches('/')
        );
        Self {
            functions,
            client,
            broker,
            config,
            callback_url,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Start the worker pool. Workers drain the queue until the shutdown
    /// token fires or every sender is dropped.
    pub async fn spawn_workers(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let Some(rx) = self.rx.lock().await.take() else {
            warn!("dispatch workers already started");
            return Vec::new();
        };
        let queue = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(self.config.worker_count);
        for worker in 0..self.config.worker_count {
            let dispatcher = Arc::clone(self);
            let queue = Arc::clone(&queue);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                debug!(worker, "dispatch worker started");
                loop {
                    let request = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        request = next_request(&queue) => match request {
                            Some(request) => request,
                            None => break,
                        },
                    };
                    dispatcher.process(request).await;
                }
                debug!(worker, "dispatch worker stopped");
            }));
        }
        handles
    }

    async fn process(&self, request: InvocationRequest) {
        let function = match self.functions.get_function(&request.function_id).await {
            Ok(Some(function)) => function,
            Ok(None) => {
                self.report_failure(&request, format!("unknown function `{}`", request.function_id))
                    .await;
                return;
            }
            Err(err) => {
                self.report_failure(&request, format!("function lookup failed: {err}"))
                    .await;
                return;
            }
        };

        let payload = InvocationPayload {
            function_id: function.id.clone(),
            workflow_instance_id: request.workflow_instance_id,
            step_instance_id: request.step_instance_id,
            input_data: request.input_data.clone(),
            call_back_url: self.callback_url.clone(),
        };

        match self.send_with_backoff(&function, &payload).await {
            Ok(()) => {
                debug!(
                    step_instance_id = %request.step_instance_id,
                    function_id = %function.id,
                    "step invocation dispatched"
                );
            }
            Err(err) => {
                warn!(
                    step_instance_id = %request.step_instance_id,
                    function_id = %function.id,
                    error = %err,
                    "dispatch gave up"
                );
                self.report_failure(&request, format!("dispatch failed: {err}"))
                    .await;
            }
        }
    }

    /// Retry transient failures with doubling delays up to `max_attempts`.
    async fn send_with_backoff(
        &self,
        function: &FunctionRecord,
        payload: &InvocationPayload,
    ) -> Result<(), ClientError> {
        let mut attempt = 1u32;
        loop {
            match self.client.invoke(function, payload).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying dispatch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Publish a synthetic FAILED callback so the step fails under its own
    /// retry policy instead of hanging in SCHEDULED forever.
    async fn report_failure(&self, request: &InvocationRequest, reason: String) {
        let message = CallbackMessage {
            workflow_instance_id: request.workflow_instance_id,
            step_instance_id: request.step_instance_id,
            run_status: Some(StepRunStatus::Failed),
            input_data: HashMap::new(),
            output_data: HashMap::new(),
            failure_reason: Some(reason),
            call_back_url: None,
        };
        let payload = match serde_json::to_value(&message) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "failed to encode synthetic failure callback");
                return;
            }
        };
        if let Err(err) = self.broker.publish(RESULT_QUEUE, payload).await {
            error!(
                step_instance_id = %request.step_instance_id,
                error = %err,
                "failed to publish synthetic failure callback"
            );
        }
    }
}

impl<F, C, B> DispatchSink for Dispatcher<F, C, B>
where
    F: FunctionService + 'static,
    C: FunctionClient + 'static,
    B: MessageBroker + 'static,
{
    async fn enqueue(&self, request: InvocationRequest) -> Result<(), DispatchError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| DispatchError::QueueClosed)
    }
}

async fn next_request(
    queue: &Mutex<mpsc::Receiver<InvocationRequest>>,
) -> Option<InvocationRequest> {
    queue.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::broker::{BrokerError, Delivery};
    use crate::repository::lookup::LookupError;
    use serde_json::{Value, json};
    use std::future::Future;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    // --- Fakes ---

    struct StaticFunctions;

    impl FunctionService for StaticFunctions {
        fn get_function(
            &self,
            id: &str,
        ) -> impl Future<Output = Result<Option<FunctionRecord>, LookupError>> + Send {
            let record = (id != "missing").then(|| FunctionRecord {
                id: id.to_string(),
                name: id.to_string(),
                endpoint: format!("http://gateway/functions/{id}"),
            });
            async move { Ok(record) }
        }
    }

    /// Client that fails transiently `failures` times, then succeeds.
    struct FlakyClient {
        failures: AtomicU32,
        calls: AtomicU32,
        permanent: bool,
    }

    impl FlakyClient {
        fn failing(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                permanent: false,
            }
        }

        fn rejecting() -> Self {
            Self {
                failures: AtomicU32::new(u32::MAX),
                calls: AtomicU32::new(0),
                permanent: true,
            }
        }
    }

    impl FunctionClient for FlakyClient {
        fn invoke(
            &self,
            _function: &FunctionRecord,
            _payload: &InvocationPayload,
        ) -> impl Future<Output = Result<(), ClientError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            let result = if remaining == 0 {
                Ok(())
            } else if self.permanent {
                Err(ClientError::Status {
                    status: 400,
                    message: "bad invocation".to_string(),
                })
            } else {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                Err(ClientError::Transport("connection reset".to_string()))
            };
            async move { result }
        }
    }

    /// Broker that records published payloads.
    #[derive(Default)]
    struct RecordingBroker {
        published: StdMutex<Vec<Value>>,
    }

    impl MessageBroker for RecordingBroker {
        fn ensure_topology(&self) -> impl Future<Output = Result<(), BrokerError>> + Send {
            async { Ok(()) }
        }

        fn publish(
            &self,
            _queue: &str,
            payload: Value,
        ) -> impl Future<Output = Result<(), BrokerError>> + Send {
            self.published.lock().unwrap().push(payload);
            async { Ok(()) }
        }

        fn consume(&self, _queue: &str) -> impl Future<Output = Result<Delivery, BrokerError>> + Send {
            async { Err(BrokerError::Closed) }
        }

        fn ack(
            &self,
            _queue: &str,
            _tag: u64,
        ) -> impl Future<Output = Result<(), BrokerError>> + Send {
            async { Ok(()) }
        }

        fn nack(
            &self,
            _queue: &str,
            _tag: u64,
        ) -> impl Future<Output = Result<(), BrokerError>> + Send {
            async { Ok(()) }
        }
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
            worker_count: 2,
            queue_capacity: 8,
            request_timeout_seconds: 5,
        }
    }

    fn request(function_id: &str) -> InvocationRequest {
        InvocationRequest {
            workflow_instance_id: Uuid::now_v7(),
            step_instance_id: Uuid::now_v7(),
            function_id: function_id.to_string(),
            input_data: HashMap::from([("k".to_string(), json!("v"))]),
        }
    }

    fn dispatcher(
        client: FlakyClient,
    ) -> Arc<Dispatcher<StaticFunctions, FlakyClient, RecordingBroker>> {
        Arc::new(Dispatcher::new(
            Arc::new(StaticFunctions),
            Arc::new(client),
            Arc::new(RecordingBroker::default()),
            fast_config(),
            "http://engine:8080/",
        ))
    }

    // --- Tests ---

    #[test]
    fn transient_classification() {
        assert!(ClientError::Transport("reset".to_string()).is_transient());
        assert!(ClientError::Status { status: 503, message: String::new() }.is_transient());
        assert!(ClientError::Status { status: 429, message: String::new() }.is_transient());
        assert!(!ClientError::Status { status: 400, message: String::new() }.is_transient());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let d = dispatcher(FlakyClient::failing(0));
        assert_eq!(d.backoff_delay(1), Duration::from_millis(1));
        assert_eq!(d.backoff_delay(2), Duration::from_millis(2));
        assert_eq!(d.backoff_delay(3), Duration::from_millis(4));
        assert_eq!(d.backoff_delay(10), Duration::from_millis(4));
    }

    #[test]
    fn callback_url_appends_route_once() {
        let d = dispatcher(FlakyClient::failing(0));
        assert_eq!(d.callback_url, "http://engine:8080/workflow/callback");
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let d = dispatcher(FlakyClient::failing(2));
        d.process(request("fn-ok")).await;
        assert_eq!(d.client.calls.load(Ordering::SeqCst), 3);
        assert!(d.broker.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_publish_synthetic_failure() {
        let d = dispatcher(FlakyClient::failing(10));
        d.process(request("fn-doomed")).await;
        assert_eq!(d.client.calls.load(Ordering::SeqCst), 3);

        let published = d.broker.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let message: CallbackMessage = serde_json::from_value(published[0].clone()).unwrap();
        assert_eq!(message.run_status, Some(StepRunStatus::Failed));
        assert!(message.failure_reason.unwrap().contains("dispatch failed"));
    }

    #[tokio::test]
    async fn permanent_rejection_fails_without_retry() {
        let d = dispatcher(FlakyClient::rejecting());
        d.process(request("fn-bad")).await;
        assert_eq!(d.client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.broker.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_function_fails_immediately() {
        let d = dispatcher(FlakyClient::failing(0));
        d.process(request("missing")).await;
        assert_eq!(d.client.calls.load(Ordering::SeqCst), 0);

        let published = d.broker.published.lock().unwrap();
        let message: CallbackMessage = serde_json::from_value(published[0].clone()).unwrap();
        assert!(message.failure_reason.unwrap().contains("unknown function"));
    }

    #[tokio::test]
    async fn workers_drain_the_queue_and_stop_on_cancel() {
        let d = dispatcher(FlakyClient::failing(0));
        let shutdown = CancellationToken::new();
        let handles = d.spawn_workers(&shutdown).await;
        assert_eq!(handles.len(), 2);

        d.enqueue(request("fn-a")).await.unwrap();
        d.enqueue(request("fn-b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(d.client.calls.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        // Second start is refused.
        assert!(d.spawn_workers(&shutdown).await.is_empty());
    }
}
