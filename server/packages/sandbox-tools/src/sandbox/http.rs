use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use sandbox_tools_error::OrchestratorError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use super::{SandboxHandle, SandboxKind, SandboxRuntime};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxRequest<'a> {
    kind: SandboxKind,
    user_id: &'a str,
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxResponse {
    id: String,
    #[serde(default)]
    desktop_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolCallResponse {
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for the sandbox-management service.
#[derive(Debug, Clone)]
pub struct HttpSandboxRuntime {
    base_url: Url,
    client: Client,
}

impl HttpSandboxRuntime {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, OrchestratorError> {
        let mut base_url = Url::parse(endpoint).map_err(|err| OrchestratorError::Initialization {
            message: format!("invalid sandbox endpoint {endpoint:?}: {err}"),
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(OrchestratorError::Initialization {
                message: format!(
                    "sandbox endpoint {endpoint:?} must use http or https, got {}",
                    base_url.scheme()
                ),
            });
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| OrchestratorError::Initialization {
                message: format!("failed to build sandbox HTTP client: {err}"),
            })?;
        Ok(Self { base_url, client })
    }

    pub fn endpoint(&self) -> &str {
        self.base_url.as_str()
    }

    fn url(&self, path: &str) -> Result<Url, OrchestratorError> {
        self.base_url
            .join(path)
            .map_err(|err| OrchestratorError::sandbox_unavailable(format!("invalid path {path}: {err}")))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response, OrchestratorError> {
        let mut request = self.client.request(method, self.url(path)?);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(map_status(status, path, detail))
    }

    async fn call_tool(
        &self,
        handle: &SandboxHandle,
        tool: &str,
        arguments: Value,
    ) -> Result<String, OrchestratorError> {
        let path = format!("sandboxes/{}/tools/{tool}", handle.id);
        let response = self
            .send(Method::POST, &path, Some(json!({ "arguments": arguments })))
            .await?;
        let body: ToolCallResponse = response.json().await.map_err(map_transport_error)?;
        match (body.output, body.error) {
            (_, Some(message)) => Err(OrchestratorError::ToolExecution {
                tool: tool.to_string(),
                message,
            }),
            (Some(output), None) => Ok(output),
            (None, None) => Ok(String::new()),
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> OrchestratorError {
    if err.is_timeout() {
        OrchestratorError::sandbox_unavailable(format!("sandbox service request timed out: {err}"))
    } else {
        OrchestratorError::sandbox_unavailable(format!("sandbox service request failed: {err}"))
    }
}

fn map_status(status: StatusCode, path: &str, detail: String) -> OrchestratorError {
    let detail = if detail.trim().is_empty() {
        status.to_string()
    } else {
        detail
    };
    match status {
        StatusCode::TOO_MANY_REQUESTS => OrchestratorError::ResourceExhausted {
            limit: limit_from_body(&detail).unwrap_or(0),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            OrchestratorError::sandbox_unavailable(format!("{path} timed out: {detail}"))
        }
        status if status.is_server_error() => {
            OrchestratorError::sandbox_unavailable(format!("{path} returned {status}: {detail}"))
        }
        _ => OrchestratorError::ToolExecution {
            tool: path.to_string(),
            message: format!("{status}: {detail}"),
        },
    }
}

fn limit_from_body(body: &str) -> Option<usize> {
    let value: Value = serde_json::from_str(body).ok()?;
    value.get("limit")?.as_u64().map(|limit| limit as usize)
}

#[async_trait]
impl SandboxRuntime for HttpSandboxRuntime {
    async fn connect(&self) -> Result<(), OrchestratorError> {
        self.send(Method::GET, "health", None).await.map(|_| ())
    }

    async fn create(
        &self,
        kind: SandboxKind,
        user_id: &str,
        session_id: &str,
    ) -> Result<SandboxHandle, OrchestratorError> {
        let request = CreateSandboxRequest {
            kind,
            user_id,
            session_id,
        };
        let body = serde_json::to_value(&request)
            .map_err(|err| OrchestratorError::processing(err.to_string()))?;
        let response = self.send(Method::POST, "sandboxes", Some(body)).await?;
        let created: CreateSandboxResponse = response.json().await.map_err(map_transport_error)?;
        Ok(SandboxHandle {
            id: created.id,
            desktop_url: created.desktop_url,
        })
    }

    async fn run_code(&self, handle: &SandboxHandle, code: &str) -> Result<String, OrchestratorError> {
        self.call_tool(handle, "run_code", json!({ "code": code })).await
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
    ) -> Result<String, OrchestratorError> {
        self.call_tool(handle, "run_command", json!({ "command": command }))
            .await
    }

    async fn navigate(&self, handle: &SandboxHandle, url: &str) -> Result<String, OrchestratorError> {
        self.call_tool(handle, "navigate", json!({ "url": url })).await
    }

    async fn snapshot(&self, handle: &SandboxHandle) -> Result<String, OrchestratorError> {
        self.call_tool(handle, "snapshot", json!({})).await
    }

    async fn teardown(&self, handle: &SandboxHandle) -> Result<(), OrchestratorError> {
        let path = format!("sandboxes/{}", handle.id);
        match self.send(Method::DELETE, &path, None).await {
            Ok(_) => Ok(()),
            // Already gone on the service side.
            Err(OrchestratorError::ToolExecution { message, .. }) if message.starts_with("404") => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
