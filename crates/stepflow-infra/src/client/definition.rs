//! Definition and function lookup services.
//!
//! Local mode loads YAML workflow definitions from a directory at startup
//! and derives function records from the gateway base URL. Remote mode
//! resolves both over HTTP from the platform's lookup services. The
//! [`DefinitionSource`] and [`FunctionSource`] enums pick the mode from
//! configuration while keeping the engine generic over concrete types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashMap;
use stepflow_core::engine::definition::{DefinitionError, discover_workflows};
use stepflow_core::repository::lookup::{
    DefinitionService, FunctionRecord, FunctionService, LookupError,
};
use stepflow_types::config::GlobalConfig;
use stepflow_types::workflow::WorkflowDefinition;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Local sources
// ---------------------------------------------------------------------------

/// Definition lookup over a YAML directory loaded at startup.
///
/// Every file is parsed and validated by the graph checker on load;
/// unparseable files are skipped with a warning.
pub struct LocalDefinitionService {
    definitions: DashMap<Uuid, WorkflowDefinition>,
}

impl LocalDefinitionService {
    /// Load every `.yaml`/`.yml` definition under `dir`.
    pub fn load(dir: &Path) -> Result<Self, DefinitionError> {
        let definitions = DashMap::new();
        for (path, def) in discover_workflows(dir)? {
            debug!(workflow_id = %def.id, name = %def.name, ?path, "loaded workflow definition");
            definitions.insert(def.id, def);
        }
        Ok(Self { definitions })
    }

    /// Number of loaded definitions.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl DefinitionService for LocalDefinitionService {
    async fn get_workflow(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, LookupError> {
        Ok(self.definitions.get(id).map(|entry| entry.value().clone()))
    }
}

/// Function lookup that addresses every function through one gateway.
///
/// The execution tier resolves the function from its id; the engine only
/// needs a stable endpoint shape.
pub struct GatewayFunctionService {
    base_url: String,
}

impl GatewayFunctionService {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl FunctionService for GatewayFunctionService {
    async fn get_function(&self, id: &str) -> Result<Option<FunctionRecord>, LookupError> {
        Ok(Some(FunctionRecord {
            id: id.to_string(),
            name: id.to_string(),
            endpoint: format!("{}/functions/{}", self.base_url, id),
        }))
    }
}

// ---------------------------------------------------------------------------
// Remote sources
// ---------------------------------------------------------------------------

/// Definition lookup against the platform's remote definition service.
pub struct HttpDefinitionService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDefinitionService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl DefinitionService for HttpDefinitionService {
    async fn get_workflow(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, LookupError> {
        let url = format!("{}/workflow/{}", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LookupError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Unavailable(format!(
                "definition service returned {status}"
            )));
        }

        let definition = response
            .json::<WorkflowDefinition>()
            .await
            .map_err(|e| LookupError::Malformed(e.to_string()))?;
        Ok(Some(definition))
    }
}

/// Function metadata lookup against the platform's remote function service.
pub struct HttpFunctionService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFunctionService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create reqwest client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl FunctionService for HttpFunctionService {
    async fn get_function(&self, id: &str) -> Result<Option<FunctionRecord>, LookupError> {
        let url = format!("{}/function/{}", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LookupError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Unavailable(format!(
                "function service returned {status}"
            )));
        }

        let record = response
            .json::<FunctionRecord>()
            .await
            .map_err(|e| LookupError::Malformed(e.to_string()))?;
        Ok(Some(record))
    }
}

// ---------------------------------------------------------------------------
// Config-driven selection
// ---------------------------------------------------------------------------

/// Definition source chosen by configuration at startup.
pub enum DefinitionSource {
    /// YAML directory loaded into memory.
    Local(LocalDefinitionService),
    /// Remote definition service.
    Remote(HttpDefinitionService),
}

impl DefinitionSource {
    /// Remote when `lookup.definition_service_url` is set, otherwise the
    /// local YAML directory (`definitions_dir`, falling back to
    /// `{data_dir}/definitions`).
    pub fn from_config(config: &GlobalConfig) -> Result<Self, DefinitionError> {
        if let Some(url) = &config.lookup.definition_service_url {
            return Ok(DefinitionSource::Remote(HttpDefinitionService::new(
                url.clone(),
                Duration::from_secs(config.lookup.request_timeout_seconds),
            )));
        }

        let dir = config
            .definitions_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(crate::config::data_dir()).join("definitions"));
        let service = LocalDefinitionService::load(&dir)?;
        if service.is_empty() {
            warn!(dir = %dir.display(), "no workflow definitions found");
        }
        Ok(DefinitionSource::Local(service))
    }
}

impl DefinitionService for DefinitionSource {
    async fn get_workflow(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, LookupError> {
        match self {
            DefinitionSource::Local(local) => local.get_workflow(id).await,
            DefinitionSource::Remote(remote) => remote.get_workflow(id).await,
        }
    }
}

/// Function record source chosen by configuration at startup.
pub enum FunctionSource {
    /// Records derived from the gateway base URL.
    Gateway(GatewayFunctionService),
    /// Remote function metadata service.
    Remote(HttpFunctionService),
}

impl FunctionSource {
    /// Remote when `lookup.function_service_url` is set, otherwise records
    /// are derived from the gateway base URL.
    pub fn from_config(config: &GlobalConfig) -> Self {
        match &config.lookup.function_service_url {
            Some(url) => FunctionSource::Remote(HttpFunctionService::new(
                url.clone(),
                Duration::from_secs(config.lookup.request_timeout_seconds),
            )),
            None => FunctionSource::Gateway(GatewayFunctionService::new(
                config.gateway.base_url.clone(),
            )),
        }
    }
}

impl FunctionService for FunctionSource {
    async fn get_function(&self, id: &str) -> Result<Option<FunctionRecord>, LookupError> {
        match self {
            FunctionSource::Gateway(gateway) => gateway.get_function(id).await,
            FunctionSource::Remote(remote) => remote.get_function(id).await,
        }
    }
}
