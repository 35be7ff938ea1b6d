use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Initialization,
    SandboxUnavailable,
    ResourceExhausted,
    DuplicateTool,
    ToolExecution,
    InvalidRequest,
    TokenInvalid,
    Processing,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::Initialization => "urn:sandbox-tools:error:initialization",
            Self::SandboxUnavailable => "urn:sandbox-tools:error:sandbox_unavailable",
            Self::ResourceExhausted => "urn:sandbox-tools:error:resource_exhausted",
            Self::DuplicateTool => "urn:sandbox-tools:error:duplicate_tool",
            Self::ToolExecution => "urn:sandbox-tools:error:tool_execution",
            Self::InvalidRequest => "urn:sandbox-tools:error:invalid_request",
            Self::TokenInvalid => "urn:sandbox-tools:error:token_invalid",
            Self::Processing => "urn:sandbox-tools:error:processing",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Initialization => "Initialization Failed",
            Self::SandboxUnavailable => "Sandbox Unavailable",
            Self::ResourceExhausted => "Resource Exhausted",
            Self::DuplicateTool => "Duplicate Tool",
            Self::ToolExecution => "Tool Execution Failed",
            Self::InvalidRequest => "Invalid Request",
            Self::TokenInvalid => "Token Invalid",
            Self::Processing => "Processing Failed",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Initialization => 500,
            Self::SandboxUnavailable => 503,
            Self::ResourceExhausted => 429,
            Self::DuplicateTool => 500,
            Self::ToolExecution => 502,
            Self::InvalidRequest => 400,
            Self::TokenInvalid => 401,
            Self::Processing => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Failure taxonomy shared by the sandbox manager, tool registry, agent
/// invoker and HTTP layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("initialization failed: {message}")]
    Initialization { message: String },
    #[error("sandbox unavailable: {message}")]
    SandboxUnavailable { message: String },
    #[error("sandbox pool exhausted (limit {limit})")]
    ResourceExhausted { limit: usize },
    #[error("duplicate tool name: {name}")]
    DuplicateTool { name: String },
    #[error("tool {tool} failed: {message}")]
    ToolExecution { tool: String, message: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("processing failed: {message}")]
    Processing { message: String },
}

impl OrchestratorError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Initialization { .. } => ErrorType::Initialization,
            Self::SandboxUnavailable { .. } => ErrorType::SandboxUnavailable,
            Self::ResourceExhausted { .. } => ErrorType::ResourceExhausted,
            Self::DuplicateTool { .. } => ErrorType::DuplicateTool,
            Self::ToolExecution { .. } => ErrorType::ToolExecution,
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::Processing { .. } => ErrorType::Processing,
        }
    }

    /// An unreachable or slow sandbox runtime may succeed on a later
    /// attempt; everything else is final for the current request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SandboxUnavailable { .. })
    }

    pub fn sandbox_unavailable(message: impl Into<String>) -> Self {
        Self::SandboxUnavailable {
            message: message.into(),
        }
    }

    /// A sandbox call that outlived its deadline. Reported as
    /// `SandboxUnavailable` so callers retry it like any other outage.
    pub fn sandbox_timed_out(operation: &str, limit_ms: u128) -> Self {
        Self::sandbox_unavailable(format!("sandbox {operation} timed out after {limit_ms}ms"))
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
        }
    }

    fn details(&self) -> Option<Value> {
        let mut map = Map::new();
        match self {
            Self::ResourceExhausted { limit } => {
                map.insert(
                    "limit".to_string(),
                    Value::Number(serde_json::Number::from(*limit as u64)),
                );
            }
            Self::DuplicateTool { name } => {
                map.insert("tool".to_string(), Value::String(name.clone()));
            }
            Self::ToolExecution { tool, message } => {
                map.insert("tool".to_string(), Value::String(tool.clone()));
                map.insert("message".to_string(), Value::String(message.clone()));
            }
            Self::TokenInvalid { message } => {
                if let Some(message) = message {
                    map.insert("message".to_string(), Value::String(message.clone()));
                }
            }
            Self::Initialization { .. }
            | Self::SandboxUnavailable { .. }
            | Self::InvalidRequest { .. }
            | Self::Processing { .. } => {}
        }
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        if let Some(details) = self.details() {
            problem.extensions.insert("details".to_string(), details);
        }
        if self.is_retryable() {
            problem
                .extensions
                .insert("retryable".to_string(), Value::Bool(true));
        }
        problem
    }
}

impl From<OrchestratorError> for ProblemDetails {
    fn from(value: OrchestratorError) -> Self {
        value.to_problem_details()
    }
}

impl From<&OrchestratorError> for ProblemDetails {
    fn from(value: &OrchestratorError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_are_flagged_in_problem_details() {
        let err = OrchestratorError::sandbox_unavailable("connection refused");
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 503);
        assert_eq!(problem.type_, "urn:sandbox-tools:error:sandbox_unavailable");
        assert_eq!(problem.extensions.get("retryable"), Some(&Value::Bool(true)));

        let err = OrchestratorError::DuplicateTool {
            name: "add".to_string(),
        };
        let problem = err.to_problem_details();
        assert!(problem.extensions.get("retryable").is_none());
        assert_eq!(problem.extensions["details"]["tool"], "add");
    }

    #[test]
    fn timeout_is_retryable_but_exhaustion_is_not() {
        let err = OrchestratorError::sandbox_timed_out("create", 30_000);
        assert!(err.is_retryable());
        assert_eq!(err.error_type(), ErrorType::SandboxUnavailable);
        assert!(err.to_string().contains("timed out after 30000ms"));
        assert!(!OrchestratorError::ResourceExhausted { limit: 5 }.is_retryable());
    }
}
