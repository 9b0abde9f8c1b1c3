//! HTTP client for the function execution tier.
//!
//! POSTs invocation payloads to the endpoint carried by each
//! [`FunctionRecord`]. Retries and backoff live in the dispatcher; this
//! client reports one attempt's outcome.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use stepflow_core::engine::dispatcher::{ClientError, FunctionClient, InvocationPayload};
use stepflow_core::repository::lookup::FunctionRecord;
use stepflow_types::config::{DispatchConfig, GatewayConfig};

/// Reqwest-backed [`FunctionClient`].
///
/// The gateway auth token, when configured, is wrapped in
/// [`SecretString`] and attached as a bearer header. It never appears in
/// Debug output or logs.
pub struct ReqwestFunctionClient {
    client: reqwest::Client,
    auth_token: Option<SecretString>,
}

impl ReqwestFunctionClient {
    /// Create a new client with the dispatch timeout and gateway credentials.
    pub fn new(dispatch: &DispatchConfig, gateway: &GatewayConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(dispatch.request_timeout_seconds))
            .build()
            .expect("failed to create reqwest client");

        let auth_token = gateway
            .auth_token
            .as_ref()
            .map(|token| SecretString::from(token.clone()));

        Self { client, auth_token }
    }
}

// ReqwestFunctionClient intentionally does not derive Debug, so the auth
// token can never be printed.

impl FunctionClient for ReqwestFunctionClient {
    async fn invoke(
        &self,
        function: &FunctionRecord,
        payload: &InvocationPayload,
    ) -> Result<(), ClientError> {
        let mut request = self.client.post(&function.endpoint).json(payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[test]
    fn test_client_without_token() {
        let client =
            ReqwestFunctionClient::new(&DispatchConfig::default(), &GatewayConfig::default());
        assert!(client.auth_token.is_none());
    }

    #[test]
    fn test_client_wraps_configured_token() {
        let gateway = GatewayConfig {
            base_url: "http://gw.internal".to_string(),
            auth_token: Some("gw-secret".to_string()),
        };
        let client = ReqwestFunctionClient::new(&DispatchConfig::default(), &gateway);
        assert!(client.auth_token.is_some());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let client =
            ReqwestFunctionClient::new(&DispatchConfig::default(), &GatewayConfig::default());
        // Port 1 on loopback refuses immediately.
        let record = FunctionRecord {
            id: "fn-ping".to_string(),
            name: "Ping".to_string(),
            endpoint: "http://127.0.0.1:1/invocations".to_string(),
        };
        let payload = InvocationPayload {
            function_id: "fn-ping".to_string(),
            workflow_instance_id: Uuid::now_v7(),
            step_instance_id: Uuid::now_v7(),
            input_data: HashMap::new(),
            call_back_url: "http://127.0.0.1:8080/workflow/callback".to_string(),
        };

        let err = client.invoke(&record, &payload).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
        assert!(err.is_transient());
    }
}
