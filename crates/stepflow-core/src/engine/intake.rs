//! Callback intake: consumes the result queue and feeds the runner.
//!
//! The queue delivers at least once, so consumers decide per message
//! whether to ack or requeue. Messages that can never apply (unparseable,
//! invalid, or aimed at something that no longer exists) are acked and
//! dropped; only infrastructure failures nack, so the message comes back
//! once the store or broker recovers.

use std::sync::Arc;

use stepflow_types::callback::CallbackMessage;
use stepflow_types::error::EngineError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::engine::dispatcher::DispatchSink;
use crate::engine::runner::WorkflowRunner;
use crate::queue::broker::{BrokerError, Delivery, MessageBroker, RESULT_QUEUE};
use crate::repository::execution::ExecutionStore;
use crate::repository::lookup::DefinitionService;

/// Pulls callback messages off the result queue and applies them through
/// the runner. Multiple consumers may run concurrently; the runner's
/// per-instance locking keeps transitions serialized.
pub struct CallbackIntake<S, D, P, B>
where
    S: ExecutionStore + 'static,
    D: DefinitionService + 'static,
    P: DispatchSink + 'static,
    B: MessageBroker + 'static,
{
    runner: Arc<WorkflowRunner<S, D, P>>,
    broker: Arc<B>,
}

impl<S, D, P, B> CallbackIntake<S, D, P, B>
where
    S: ExecutionStore + 'static,
    D: DefinitionService + 'static,
    P: DispatchSink + 'static,
    B: MessageBroker + 'static,
{
    pub fn new(runner: Arc<WorkflowRunner<S, D, P>>, broker: Arc<B>) -> Self {
        Self { runner, broker }
    }

    /// Declare the result queue, then spawn `consumer_count` consumers.
    ///
    /// Topology comes first: the dispatcher and the REST ingress publish
    /// onto the result queue as soon as anything runs.
    pub async fn start(
        &self,
        consumer_count: usize,
        shutdown: &CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, BrokerError> {
        self.broker.ensure_topology().await?;
        Ok(self.spawn_consumers(consumer_count, shutdown))
    }

    /// Spawn `consumer_count` consumer tasks. Each runs until the broker
    /// closes or `shutdown` fires; in-flight messages finish first.
    pub fn spawn_consumers(
        &self,
        consumer_count: usize,
        shutdown: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..consumer_count)
            .map(|consumer| {
                let runner = self.runner.clone();
                let broker = self.broker.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    debug!(consumer, "callback consumer started");
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            delivery = broker.consume(RESULT_QUEUE) => match delivery {
                                Ok(delivery) => {
                                    handle_delivery(runner.as_ref(), broker.as_ref(), delivery)
                                        .await;
                                }
                                Err(BrokerError::Closed) => break,
                                Err(err) => {
                                    error!(%err, "result queue consume failed");
                                    break;
                                }
                            },
                        }
                    }
                    debug!(consumer, "callback consumer stopped");
                })
            })
            .collect()
    }
}

/// Apply one delivery and settle it with the broker.
async fn handle_delivery<S, D, P, B>(
    runner: &WorkflowRunner<S, D, P>,
    broker: &B,
    delivery: Delivery,
) where
    S: ExecutionStore,
    D: DefinitionService,
    P: DispatchSink,
    B: MessageBroker,
{
    let Delivery {
        delivery_tag: tag,
        payload,
        redelivered,
    } = delivery;

    let message: CallbackMessage = match serde_json::from_value(payload) {
        Ok(message) => message,
        Err(err) => {
            warn!(%err, tag, "unparseable callback dropped");
            ack(broker, tag).await;
            return;
        }
    };

    match runner.handle_callback(&message).await {
        Ok(()) => ack(broker, tag).await,
        // Unknown targets and invalid payloads stay broken on redelivery,
        // so they are consumed rather than requeued.
        Err(EngineError::ResourceNotFound(reason) | EngineError::PayloadNotValid(reason)) => {
            warn!(
                instance_id = %message.workflow_instance_id,
                step_instance_id = %message.step_instance_id,
                reason,
                "callback discarded"
            );
            ack(broker, tag).await;
        }
        Err(err) => {
            error!(
                instance_id = %message.workflow_instance_id,
                step_instance_id = %message.step_instance_id,
                redelivered,
                %err,
                "callback processing failed, requeueing"
            );
            if let Err(err) = broker.nack(RESULT_QUEUE, tag).await {
                warn!(%err, tag, "nack failed");
            }
        }
    }
}

async fn ack<B: MessageBroker>(broker: &B, tag: u64) {
    if let Err(err) = broker.ack(RESULT_QUEUE, tag).await {
        warn!(%err, tag, "ack failed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use serde_json::json;
    use stepflow_types::config::EngineConfig;
    use stepflow_types::error::StoreError;
    use stepflow_types::execution::{
        StepRunStatus, WorkflowExecution, WorkflowInstance, WorkflowStepInstance,
    };
    use stepflow_types::workflow::WorkflowDefinition;
    use uuid::Uuid;

    use crate::engine::dispatcher::{DispatchError, InvocationRequest};
    use crate::repository::lookup::LookupError;

    // --- fakes ---

    /// Store with no rows; `fail` turns every call into a connection error.
    struct StubStore {
        fail: bool,
    }

    impl StubStore {
        fn write(&self) -> Result<(), StoreError> {
            if self.fail {
                Err(StoreError::Connection)
            } else {
                Ok(())
            }
        }

        fn read<T>(&self) -> Result<Option<T>, StoreError> {
            if self.fail {
                Err(StoreError::Connection)
            } else {
                Ok(None)
            }
        }
    }

    impl ExecutionStore for StubStore {
        async fn create_instance(&self, _: &WorkflowInstance) -> Result<(), StoreError> {
            self.write()
        }

        async fn get_instance(&self, _: &Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
            self.read()
        }

        async fn update_instance(&self, _: &WorkflowInstance) -> Result<(), StoreError> {
            self.write()
        }

        async fn list_active_instances(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
            self.write().map(|_| Vec::new())
        }

        async fn create_step_instances(
            &self,
            _: &[WorkflowStepInstance],
        ) -> Result<(), StoreError> {
            self.write()
        }

        async fn get_step_instance(
            &self,
            _: &Uuid,
        ) -> Result<Option<WorkflowStepInstance>, StoreError> {
            self.read()
        }

        async fn get_step_instance_by_step(
            &self,
            _: &Uuid,
            _: &str,
        ) -> Result<Option<WorkflowStepInstance>, StoreError> {
            self.read()
        }

        async fn list_step_instances(
            &self,
            _: &Uuid,
        ) -> Result<Vec<WorkflowStepInstance>, StoreError> {
            self.write().map(|_| Vec::new())
        }

        async fn update_step_instance(&self, _: &WorkflowStepInstance) -> Result<(), StoreError> {
            self.write()
        }

        async fn create_execution(&self, _: &WorkflowExecution) -> Result<(), StoreError> {
            self.write()
        }

        async fn get_execution(&self, _: &Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
            self.read()
        }

        async fn get_execution_by_instance(
            &self,
            _: &Uuid,
        ) -> Result<Option<WorkflowExecution>, StoreError> {
            self.read()
        }

        async fn update_execution(&self, _: &WorkflowExecution) -> Result<(), StoreError> {
            self.write()
        }

        async fn list_executions(
            &self,
            _: &Uuid,
            _: u32,
        ) -> Result<Vec<WorkflowExecution>, StoreError> {
            self.write().map(|_| Vec::new())
        }
    }

    struct NoDefinitions;

    impl DefinitionService for NoDefinitions {
        async fn get_workflow(
            &self,
            _: &Uuid,
        ) -> Result<Option<WorkflowDefinition>, LookupError> {
            Ok(None)
        }
    }

    struct NullSink;

    impl DispatchSink for NullSink {
        async fn enqueue(&self, _: InvocationRequest) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    /// Broker preloaded with deliveries; parks the consumer once drained.
    #[derive(Default)]
    struct ScriptedBroker {
        deliveries: StdMutex<VecDeque<Delivery>>,
        acked: StdMutex<Vec<u64>>,
        nacked: StdMutex<Vec<u64>>,
        declared: StdMutex<usize>,
    }

    impl ScriptedBroker {
        fn with_deliveries(deliveries: Vec<Delivery>) -> Self {
            Self {
                deliveries: StdMutex::new(deliveries.into()),
                ..Self::default()
            }
        }
    }

    impl MessageBroker for ScriptedBroker {
        async fn ensure_topology(&self) -> Result<(), BrokerError> {
            *self.declared.lock().unwrap() += 1;
            Ok(())
        }

        async fn publish(&self, _: &str, _: serde_json::Value) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn consume(&self, _: &str) -> Result<Delivery, BrokerError> {
            let next = self.deliveries.lock().unwrap().pop_front();
            match next {
                Some(delivery) => Ok(delivery),
                None => std::future::pending().await,
            }
        }

        async fn ack(&self, _: &str, delivery_tag: u64) -> Result<(), BrokerError> {
            self.acked.lock().unwrap().push(delivery_tag);
            Ok(())
        }

        async fn nack(&self, _: &str, delivery_tag: u64) -> Result<(), BrokerError> {
            self.nacked.lock().unwrap().push(delivery_tag);
            Ok(())
        }
    }

    fn make_intake(
        fail_store: bool,
        broker: Arc<ScriptedBroker>,
    ) -> CallbackIntake<StubStore, NoDefinitions, NullSink, ScriptedBroker> {
        let runner = Arc::new(WorkflowRunner::new(
            Arc::new(StubStore { fail: fail_store }),
            Arc::new(NoDefinitions),
            Arc::new(NullSink),
            EngineConfig::default(),
        ));
        CallbackIntake::new(runner, broker)
    }

    fn delivery(tag: u64, payload: serde_json::Value) -> Delivery {
        Delivery {
            delivery_tag: tag,
            payload,
            redelivered: false,
        }
    }

    fn callback_payload() -> serde_json::Value {
        serde_json::to_value(CallbackMessage {
            workflow_instance_id: Uuid::now_v7(),
            step_instance_id: Uuid::now_v7(),
            run_status: Some(StepRunStatus::Completed),
            input_data: HashMap::new(),
            output_data: HashMap::from([("result".to_string(), json!(1))]),
            failure_reason: None,
            call_back_url: None,
        })
        .unwrap()
    }

    // --- tests ---

    #[tokio::test]
    async fn test_dead_letter_messages_are_acked() {
        let broker = Arc::new(ScriptedBroker::with_deliveries(vec![
            // Not a callback at all.
            delivery(1, json!({"not": "a callback"})),
            // Parses but fails validation (no runStatus).
            delivery(
                2,
                json!({
                    "workflowInstanceId": Uuid::now_v7(),
                    "stepInstanceId": Uuid::now_v7(),
                }),
            ),
            // Valid, but its instance does not exist.
            delivery(3, callback_payload()),
        ]));
        let intake = make_intake(false, broker.clone());
        let shutdown = CancellationToken::new();
        let handles = intake.spawn_consumers(1, &shutdown);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*broker.acked.lock().unwrap(), vec![1, 2, 3]);
        assert!(broker.nacked.lock().unwrap().is_empty());

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_infra_failure_nacks_for_redelivery() {
        let broker = Arc::new(ScriptedBroker::with_deliveries(vec![delivery(
            9,
            callback_payload(),
        )]));
        let intake = make_intake(true, broker.clone());
        let shutdown = CancellationToken::new();
        let handles = intake.spawn_consumers(1, &shutdown);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*broker.nacked.lock().unwrap(), vec![9]);
        assert!(broker.acked.lock().unwrap().is_empty());

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_consumers_stop_on_shutdown() {
        let broker = Arc::new(ScriptedBroker::default());
        let intake = make_intake(false, broker.clone());
        let shutdown = CancellationToken::new();
        let handles = intake.spawn_consumers(2, &shutdown);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_start_declares_the_result_queue() {
        let broker = Arc::new(ScriptedBroker::default());
        let intake = make_intake(false, broker.clone());
        let shutdown = CancellationToken::new();
        let handles = intake.start(1, &shutdown).await.unwrap();

        assert_eq!(*broker.declared.lock().unwrap(), 1);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
