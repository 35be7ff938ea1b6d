//! Request-level chat orchestration.

use std::sync::Arc;
use std::time::Instant;

use sandbox_tools_error::OrchestratorError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::agent::{extract_response, AgentInvoker};
use crate::llm::ChatModel;
use crate::sandbox::{ReleaseReport, SandboxManager, SessionInfo};
use crate::tools::{self, ToolInfo, ToolRegistryBuilder};

pub const SERVICE_NAME: &str = "sandbox-tools";
pub const DEFAULT_USER_ID: &str = "default-user";
pub const DEFAULT_SESSION_ID: &str = "session";

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub message: String,
    pub success: bool,
    pub timestamp: String,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ResetResponse {
    pub status: String,
    pub message: String,
}

/// Outcome of one chat invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResult {
    pub text: String,
    pub succeeded: bool,
    pub elapsed_ms: u64,
}

impl ChatResponse {
    pub fn from_result(result: ChatResult) -> Self {
        Self {
            message: result.text,
            success: result.succeeded,
            timestamp: local_timestamp(),
            processing_time_ms: result.elapsed_ms,
        }
    }
}

/// Local date-time without offset, e.g. `2024-05-01T09:30:12.345`.
pub fn local_timestamp() -> String {
    chrono::Local::now()
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.3f")
        .to_string()
}

/// Everything one invocation needs to know about its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: String,
    pub session_id: String,
    pub message: String,
}

impl RequestContext {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            message: message.into(),
        }
    }

    pub fn from_request(request: ChatRequest) -> Result<Self, OrchestratorError> {
        if request.message.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest {
                message: "message must not be blank".to_string(),
            });
        }
        let pick = |value: Option<String>, default: &str| {
            value
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Ok(Self {
            user_id: pick(request.user_id, DEFAULT_USER_ID),
            session_id: pick(request.session_id, DEFAULT_SESSION_ID),
            message: request.message,
        })
    }
}

#[derive(Debug)]
pub struct ChatService {
    invoker: AgentInvoker,
    sandbox: Option<Arc<SandboxManager>>,
    builder: ToolRegistryBuilder,
}

impl ChatService {
    pub fn new(
        model: Arc<dyn ChatModel>,
        sandbox: Option<Arc<SandboxManager>>,
        max_iterations: usize,
    ) -> Self {
        Self {
            invoker: AgentInvoker::new(model, max_iterations),
            sandbox,
            builder: ToolRegistryBuilder::new(),
        }
    }

    pub fn with_builder(mut self, builder: ToolRegistryBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn sandbox(&self) -> Option<&Arc<SandboxManager>> {
        self.sandbox.as_ref()
    }

    /// Handles one chat message.
    ///
    /// A blank message is rejected with `InvalidRequest`. Every other failure
    /// is folded into a `ChatResult` with `succeeded == false`.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResult, OrchestratorError> {
        let started = Instant::now();
        let context = RequestContext::from_request(request)?;
        tracing::info!(
            user_id = %context.user_id,
            session_id = %context.session_id,
            "processing chat message"
        );

        let outcome = self.run(&context).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(text) => ChatResult {
                text,
                succeeded: true,
                elapsed_ms,
            },
            Err(err) => {
                tracing::error!(error = %err, elapsed_ms, "chat processing failed");
                ChatResult {
                    text: format!("Error: {err}"),
                    succeeded: false,
                    elapsed_ms,
                }
            }
        };
        tracing::info!(success = result.succeeded, elapsed_ms, "chat processed");
        Ok(result)
    }

    async fn run(&self, context: &RequestContext) -> Result<String, OrchestratorError> {
        let built = self
            .builder
            .build(self.sandbox.as_ref(), context)
            .await?;
        if let Some(err) = &built.sandbox_error {
            tracing::debug!(error = %err, "answering without sandbox tools");
        }

        let invocation = self.invoker.invoke(&built.registry, &context.message).await;

        if let Some(lease) = built.lease {
            let report = lease.release().await;
            if report.failed > 0 {
                tracing::warn!(failed = report.failed, "some request sandboxes failed to release");
            }
        }

        let state = invocation?;
        let extraction = extract_response(&state);
        if !extraction.found {
            tracing::warn!("conversation ended without assistant text");
        }
        Ok(extraction.text)
    }

    pub fn list_tools(&self) -> Vec<ToolInfo> {
        tools::catalogue()
    }

    pub async fn list_sandboxes(&self) -> Vec<SessionInfo> {
        match &self.sandbox {
            Some(manager) => manager.list_sessions().await,
            None => Vec::new(),
        }
    }

    /// Releases every sandbox session. The manager keeps serving.
    pub async fn reset(&self) -> ResetResponse {
        let report = match &self.sandbox {
            Some(manager) => manager.release_all().await,
            None => ReleaseReport::default(),
        };
        tracing::info!(
            released = report.released,
            failed = report.failed,
            "session reset"
        );
        ResetResponse {
            status: "success".to_string(),
            message: "Session reset successfully".to_string(),
        }
    }

    pub async fn sandbox_status(&self) -> &'static str {
        match &self.sandbox {
            Some(manager) => manager.availability().await.label(),
            None => "disabled",
        }
    }

    /// Tears down all sandboxes and stops accepting new ones.
    pub async fn shutdown(&self) -> ReleaseReport {
        match &self.sandbox {
            Some(manager) => manager.shutdown().await,
            None => ReleaseReport::default(),
        }
    }
}
