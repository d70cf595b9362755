//! Operation processors and the type → processor registry
//!
//! A processor knows how to execute one or more operation types against the
//! backend. `can_process` lets a registered processor decline a particular
//! operation for now (missing fields, resource not ready) without that being
//! treated as a missing registration.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::api::{ApiError, BackendClient, TokenProvider};
use super::models::{OperationType, QueuedOperation};

/// Executes operations of the types it is registered for
#[async_trait]
pub trait OperationProcessor: Send + Sync {
    /// Whether this operation can be attempted right now
    fn can_process(&self, operation: &QueuedOperation) -> bool;

    /// Execute the operation; any error counts as a failed attempt
    async fn process(&self, operation: &QueuedOperation) -> Result<(), ProcessError>;

    fn estimated_duration_ms(&self, operation: &QueuedOperation) -> u64;
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Backend reported failure: {0}")]
    Backend(String),

    #[error("{0}")]
    Other(String),
}

// ============================================================================
// Registry
// ============================================================================

/// Maps operation types to processors
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<OperationType, Arc<dyn OperationProcessor>>,
    /// Handles any `api_*` type without an exact registration
    api_fallback: Option<Arc<dyn OperationProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one processor for several operation types
    pub fn register<I>(&mut self, types: I, processor: Arc<dyn OperationProcessor>)
    where
        I: IntoIterator<Item = OperationType>,
    {
        for op_type in types {
            if self
                .processors
                .insert(op_type.clone(), Arc::clone(&processor))
                .is_some()
            {
                log::warn!("Replaced processor for {}", op_type);
            }
        }
    }

    pub fn register_api_fallback(&mut self, processor: Arc<dyn OperationProcessor>) {
        self.api_fallback = Some(processor);
    }

    pub fn get(&self, op_type: &OperationType) -> Option<Arc<dyn OperationProcessor>> {
        self.processors.get(op_type).cloned().or_else(|| {
            if op_type.is_api() {
                self.api_fallback.clone()
            } else {
                None
            }
        })
    }

    pub fn registered_types(&self) -> Vec<OperationType> {
        let mut types: Vec<OperationType> = self.processors.keys().cloned().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty() && self.api_fallback.is_none()
    }
}

/// Registry with every backend processor wired to the given client
pub fn default_registry(
    client: Arc<BackendClient>,
    tokens: Arc<dyn TokenProvider>,
) -> ProcessorRegistry {
    let backend = Backend { client, tokens };
    let mut registry = ProcessorRegistry::new();

    registry.register(
        [OperationType::AutomationExecute],
        Arc::new(AutomationExecuteProcessor::new(backend.clone())),
    );
    registry.register(
        [OperationType::ShareCreate],
        Arc::new(ShareCreateProcessor::new(backend.clone())),
    );
    registry.register(
        [
            OperationType::NfcWrite,
            OperationType::QrGenerate,
            OperationType::DeploymentCreate,
        ],
        Arc::new(DeploymentProcessor::new(backend.clone())),
    );
    registry.register(
        [
            OperationType::AutomationCreate,
            OperationType::AutomationUpdate,
            OperationType::AutomationDelete,
        ],
        Arc::new(AutomationMutationProcessor::new(backend.clone())),
    );
    registry.register_api_fallback(Arc::new(GenericApiProcessor::new(backend)));

    registry
}

// ============================================================================
// Backend processors
// ============================================================================

/// Client plus token source shared by the backend processors
#[derive(Clone)]
pub struct Backend {
    client: Arc<BackendClient>,
    tokens: Arc<dyn TokenProvider>,
}

impl Backend {
    pub fn new(client: Arc<BackendClient>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self { client, tokens }
    }

    async fn call(
        &self,
        operation: &QueuedOperation,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ProcessError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .send(method, path, &token, &operation.id, body)
            .await?;

        // Some endpoints answer 200 with `{ "success": false, "error": ... }`
        if response.get("success").and_then(Value::as_bool) == Some(false) {
            let msg = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ProcessError::Backend(msg.to_string()));
        }
        Ok(response)
    }
}

fn str_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn require_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str, ProcessError> {
    str_field(payload, key).ok_or_else(|| ProcessError::InvalidPayload(format!("missing {}", key)))
}

fn encode(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// `automation_execute` → `POST /automations/{id}/execute`
pub struct AutomationExecuteProcessor {
    backend: Backend,
}

impl AutomationExecuteProcessor {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl OperationProcessor for AutomationExecuteProcessor {
    fn can_process(&self, operation: &QueuedOperation) -> bool {
        str_field(&operation.payload, "automationId").is_some()
    }

    async fn process(&self, operation: &QueuedOperation) -> Result<(), ProcessError> {
        let payload = &operation.payload;
        let automation_id = require_str(payload, "automationId")?;
        let body = json!({
            "inputs": payload.get("inputs").cloned().unwrap_or_else(|| json!({})),
            "queuedAt": operation.timestamp,
            "operationId": operation.id,
        });

        let path = format!("/automations/{}/execute", encode(automation_id));
        self.backend
            .call(operation, Method::POST, &path, Some(&body))
            .await?;
        log::info!("Executed automation {} ({})", automation_id, operation.id);
        Ok(())
    }

    fn estimated_duration_ms(&self, operation: &QueuedOperation) -> u64 {
        let steps = operation
            .payload
            .get("stepCount")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        2000 + steps.min(50) * 500
    }
}

/// `share_create` → `POST /shares`
pub struct ShareCreateProcessor {
    backend: Backend,
}

impl ShareCreateProcessor {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl OperationProcessor for ShareCreateProcessor {
    fn can_process(&self, operation: &QueuedOperation) -> bool {
        str_field(&operation.payload, "automationId").is_some()
    }

    async fn process(&self, operation: &QueuedOperation) -> Result<(), ProcessError> {
        require_str(&operation.payload, "automationId")?;
        self.backend
            .call(operation, Method::POST, "/shares", Some(&operation.payload))
            .await?;
        Ok(())
    }

    fn estimated_duration_ms(&self, _operation: &QueuedOperation) -> u64 {
        1500
    }
}

/// `nfc_write`, `qr_generate`, `deployment_create` → `POST /deployments`
pub struct DeploymentProcessor {
    backend: Backend,
}

impl DeploymentProcessor {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    fn deployment_type(operation: &QueuedOperation) -> Option<String> {
        match &operation.op_type {
            OperationType::NfcWrite => Some("nfc".to_string()),
            OperationType::QrGenerate => Some("qr".to_string()),
            OperationType::DeploymentCreate => {
                str_field(&operation.payload, "deploymentType").map(str::to_string)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl OperationProcessor for DeploymentProcessor {
    fn can_process(&self, operation: &QueuedOperation) -> bool {
        str_field(&operation.payload, "automationId").is_some()
            && Self::deployment_type(operation).is_some()
    }

    async fn process(&self, operation: &QueuedOperation) -> Result<(), ProcessError> {
        let automation_id = require_str(&operation.payload, "automationId")?;
        let deployment_type = Self::deployment_type(operation)
            .ok_or_else(|| ProcessError::InvalidPayload("missing deploymentType".into()))?;

        let body = json!({
            "automationId": automation_id,
            "deploymentType": deployment_type,
            "metadata": operation.payload.get("metadata").cloned().unwrap_or(Value::Null),
            "createdAt": operation.timestamp,
        });
        self.backend
            .call(operation, Method::POST, "/deployments", Some(&body))
            .await?;
        Ok(())
    }

    fn estimated_duration_ms(&self, _operation: &QueuedOperation) -> u64 {
        2000
    }
}

/// `automation_create|update|delete` → `/automations` CRUD
pub struct AutomationMutationProcessor {
    backend: Backend,
}

impl AutomationMutationProcessor {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl OperationProcessor for AutomationMutationProcessor {
    fn can_process(&self, operation: &QueuedOperation) -> bool {
        let payload = &operation.payload;
        match operation.op_type {
            OperationType::AutomationCreate => payload.get("automation").is_some_and(Value::is_object),
            OperationType::AutomationUpdate => {
                str_field(payload, "automationId").is_some()
                    && payload.get("changes").is_some_and(Value::is_object)
            }
            OperationType::AutomationDelete => str_field(payload, "automationId").is_some(),
            _ => false,
        }
    }

    async fn process(&self, operation: &QueuedOperation) -> Result<(), ProcessError> {
        let payload = &operation.payload;
        match operation.op_type {
            OperationType::AutomationCreate => {
                let automation = payload
                    .get("automation")
                    .ok_or_else(|| ProcessError::InvalidPayload("missing automation".into()))?;
                self.backend
                    .call(operation, Method::POST, "/automations", Some(automation))
                    .await?;
            }
            OperationType::AutomationUpdate => {
                let id = require_str(payload, "automationId")?;
                let changes = payload
                    .get("changes")
                    .ok_or_else(|| ProcessError::InvalidPayload("missing changes".into()))?;
                let path = format!("/automations/{}", encode(id));
                self.backend
                    .call(operation, Method::PUT, &path, Some(changes))
                    .await?;
            }
            OperationType::AutomationDelete => {
                let id = require_str(payload, "automationId")?;
                let path = format!("/automations/{}", encode(id));
                match self.backend.call(operation, Method::DELETE, &path, None).await {
                    // Already gone counts as done
                    Err(ProcessError::Api(ApiError::NotFound(_))) => {
                        log::info!("Automation {} already deleted", id);
                    }
                    other => {
                        other?;
                    }
                }
            }
            ref other => {
                return Err(ProcessError::Other(format!(
                    "unsupported operation type {}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn estimated_duration_ms(&self, _operation: &QueuedOperation) -> u64 {
        1500
    }
}

/// `api_*` → arbitrary `{ method, path, body }` call
pub struct GenericApiProcessor {
    backend: Backend,
}

impl GenericApiProcessor {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    fn method(payload: &Value) -> Option<Method> {
        match str_field(payload, "method")?.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "PATCH" => Some(Method::PATCH),
            "DELETE" => Some(Method::DELETE),
            _ => None,
        }
    }
}

#[async_trait]
impl OperationProcessor for GenericApiProcessor {
    fn can_process(&self, operation: &QueuedOperation) -> bool {
        Self::method(&operation.payload).is_some()
            && str_field(&operation.payload, "path").is_some_and(|p| p.starts_with('/'))
    }

    async fn process(&self, operation: &QueuedOperation) -> Result<(), ProcessError> {
        let method = Self::method(&operation.payload)
            .ok_or_else(|| ProcessError::InvalidPayload("missing or unsupported method".into()))?;
        let path = require_str(&operation.payload, "path")?;
        let body = operation.payload.get("body");
        self.backend.call(operation, method, path, body).await?;
        Ok(())
    }

    fn estimated_duration_ms(&self, _operation: &QueuedOperation) -> u64 {
        2000
    }
}

// ============================================================================
// Tests
// ============================================================================
