//! Application state wiring the engine together.
//!
//! The runner, dispatcher, and intake are generic over their ports; AppState
//! pins them to the concrete infra implementations and owns the shared
//! handles the HTTP layer and the background tasks both need.

use std::path::PathBuf;
use std::sync::Arc;

use stepflow_core::engine::dispatcher::Dispatcher;
use stepflow_core::engine::intake::CallbackIntake;
use stepflow_core::engine::runner::WorkflowRunner;
use stepflow_infra::client::definition::{DefinitionSource, FunctionSource};
use stepflow_infra::client::function::ReqwestFunctionClient;
use stepflow_infra::config::{data_dir, load_global_config};
use stepflow_infra::queue::memory::MemoryBroker;
use stepflow_infra::sqlite::execution::SqliteExecutionStore;
use stepflow_infra::sqlite::pool::DatabasePool;
use stepflow_types::config::GlobalConfig;

/// Concrete type aliases for the engine generics pinned to infra implementations.
pub type ConcreteDispatcher = Dispatcher<FunctionSource, ReqwestFunctionClient, MemoryBroker>;

pub type ConcreteRunner =
    WorkflowRunner<SqliteExecutionStore, DefinitionSource, ConcreteDispatcher>;

pub type ConcreteIntake =
    CallbackIntake<SqliteExecutionStore, DefinitionSource, ConcreteDispatcher, MemoryBroker>;

/// Shared application state holding the wired engine.
///
/// Used by the REST handlers; `serve` also pulls the dispatcher, broker,
/// and runner out of it to spawn the background tasks.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<ConcreteRunner>,
    pub dispatcher: Arc<ConcreteDispatcher>,
    pub broker: Arc<MemoryBroker>,
    pub config: GlobalConfig,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Initialize the application state: load config, open the store, wire
    /// the dispatch pipeline and the runner.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = PathBuf::from(data_dir());

        // Ensure data directory exists
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_global_config(&data_dir).await;

        // Initialize database
        let db_url = format!(
            "sqlite://{}?mode=rwc",
            data_dir.join("stepflow.db").display()
        );
        let db_pool = DatabasePool::new(&db_url).await?;
        let store = Arc::new(SqliteExecutionStore::new(db_pool.clone()));

        // Definition and function lookups, local or remote per config
        let definitions = Arc::new(DefinitionSource::from_config(&config)?);
        let functions = Arc::new(FunctionSource::from_config(&config));

        // Outbound dispatch: gateway client feeding the bounded worker pool,
        // synthetic failures reported through the broker
        let client = Arc::new(ReqwestFunctionClient::new(&config.dispatch, &config.gateway));
        let broker = Arc::new(MemoryBroker::new());
        let dispatcher = Arc::new(Dispatcher::new(
            functions,
            client,
            broker.clone(),
            config.dispatch.clone(),
            &config.callback_base_url,
        ));

        let runner = Arc::new(WorkflowRunner::new(
            store,
            definitions,
            dispatcher.clone(),
            config.engine.clone(),
        ));

        Ok(Self {
            runner,
            dispatcher,
            broker,
            config,
            data_dir,
            db_pool,
        })
    }

    /// The intake pairing this state's runner with its broker.
    pub fn intake(&self) -> ConcreteIntake {
        CallbackIntake::new(self.runner.clone(), self.broker.clone())
    }
}
