//! Tool adapters over sandbox sessions.
//!
//! Adapters hold a `Weak` reference: the [`SandboxManager`] stays the only
//! owner, and a call made after the session was released fails with
//! `SandboxUnavailable` instead of keeping the container alive.
//!
//! [`SandboxManager`]: crate::sandbox::SandboxManager

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use sandbox_tools_error::OrchestratorError;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use super::{parse_arguments, schema_of, ToolCategory, ToolDescriptor, ToolHandler};
use crate::sandbox::{SandboxKind, SandboxSession};

pub struct CatalogueEntry {
    pub name: &'static str,
    pub description: &'static str,
    pub category: ToolCategory,
    pub kind: SandboxKind,
}

pub const RUN_PYTHON_CODE: &str = "runPythonCode";
pub const RUN_SHELL_COMMAND: &str = "runShellCommand";
pub const BROWSER_NAVIGATE: &str = "browserNavigate";
pub const BROWSER_SNAPSHOT: &str = "browserSnapshot";

pub const CATALOGUE: &[CatalogueEntry] = &[
    CatalogueEntry {
        name: RUN_PYTHON_CODE,
        description: "Execute Python code in sandbox",
        category: ToolCategory::Sandbox,
        kind: SandboxKind::Base,
    },
    CatalogueEntry {
        name: RUN_SHELL_COMMAND,
        description: "Execute shell command in sandbox",
        category: ToolCategory::Sandbox,
        kind: SandboxKind::Base,
    },
    CatalogueEntry {
        name: BROWSER_NAVIGATE,
        description: "Navigate browser to URL",
        category: ToolCategory::Browser,
        kind: SandboxKind::Browser,
    },
    CatalogueEntry {
        name: BROWSER_SNAPSHOT,
        description: "Capture an accessibility snapshot of the current browser page",
        category: ToolCategory::Browser,
        kind: SandboxKind::Browser,
    },
];

#[derive(Debug, Deserialize, JsonSchema)]
struct CodeInput {
    /// Python source to execute
    code: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CommandInput {
    /// Shell command line
    command: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct NavigateInput {
    /// Absolute http(s) URL
    url: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SnapshotInput {}

#[derive(Debug, Clone, Copy)]
enum Capability {
    RunCode,
    RunCommand,
    Navigate,
    Snapshot,
}

impl Capability {
    fn for_tool(name: &str) -> Option<Self> {
        match name {
            RUN_PYTHON_CODE => Some(Self::RunCode),
            RUN_SHELL_COMMAND => Some(Self::RunCommand),
            BROWSER_NAVIGATE => Some(Self::Navigate),
            BROWSER_SNAPSHOT => Some(Self::Snapshot),
            _ => None,
        }
    }

    fn schema(self) -> Value {
        match self {
            Self::RunCode => schema_of::<CodeInput>(),
            Self::RunCommand => schema_of::<CommandInput>(),
            Self::Navigate => schema_of::<NavigateInput>(),
            Self::Snapshot => schema_of::<SnapshotInput>(),
        }
    }
}

struct SessionTool {
    name: &'static str,
    capability: Capability,
    session: Weak<SandboxSession>,
}

impl SessionTool {
    fn session(&self) -> Result<Arc<SandboxSession>, OrchestratorError> {
        self.session
            .upgrade()
            .ok_or_else(|| OrchestratorError::sandbox_unavailable("sandbox session was released"))
    }
}

#[async_trait]
impl ToolHandler for SessionTool {
    async fn call(&self, arguments: Value) -> Result<String, OrchestratorError> {
        match self.capability {
            Capability::RunCode => {
                let input: CodeInput = parse_arguments(self.name, arguments)?;
                self.session()?.run_code(&input.code).await
            }
            Capability::RunCommand => {
                let input: CommandInput = parse_arguments(self.name, arguments)?;
                self.session()?.run_command(&input.command).await
            }
            Capability::Navigate => {
                let input: NavigateInput = parse_arguments(self.name, arguments)?;
                let url = validate_url(self.name, &input.url)?;
                self.session()?.navigate(url.as_str()).await
            }
            Capability::Snapshot => {
                let _: SnapshotInput = parse_arguments(self.name, arguments)?;
                self.session()?.snapshot().await
            }
        }
    }
}

fn validate_url(tool: &str, raw: &str) -> Result<url::Url, OrchestratorError> {
    let parsed = url::Url::parse(raw.trim()).map_err(|err| OrchestratorError::ToolExecution {
        tool: tool.to_string(),
        message: format!("invalid url {raw:?}: {err}"),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(OrchestratorError::ToolExecution {
            tool: tool.to_string(),
            message: format!("unsupported url scheme {other}"),
        }),
    }
}

/// Adapters for every catalogue entry served by a session of `session.kind()`.
pub fn tools_for(session: &Arc<SandboxSession>) -> Vec<ToolDescriptor> {
    CATALOGUE
        .iter()
        .filter(|entry| entry.kind == session.kind())
        .filter_map(|entry| {
            let capability = Capability::for_tool(entry.name)?;
            Some(ToolDescriptor::sandbox_backed(
                entry.name,
                entry.description,
                entry.category,
                capability.schema(),
                Arc::new(SessionTool {
                    name: entry.name,
                    capability,
                    session: Arc::downgrade(session),
                }),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::sandbox::{InMemorySandboxRuntime, SandboxManager, SandboxManagerConfig};

    async fn started_manager() -> SandboxManager {
        let manager = SandboxManager::new(
            Arc::new(InMemorySandboxRuntime::new()),
            SandboxManagerConfig {
                pool_size: 4,
                call_timeout: Duration::from_secs(5),
            },
        );
        manager.start().await.expect("start");
        manager
    }

    #[tokio::test]
    async fn base_session_serves_python_and_shell() {
        let manager = started_manager().await;
        let session = manager
            .create_session(SandboxKind::Base, "smoke-user", "s1")
            .await
            .expect("session");
        let tools = tools_for(&session);
        let names: Vec<&str> = tools.iter().map(|tool| tool.name()).collect();
        assert_eq!(names, vec![RUN_PYTHON_CODE, RUN_SHELL_COMMAND]);

        let out = tools[0]
            .invoke(json!({ "code": "print('PY_OK')" }))
            .await
            .expect("python");
        assert!(out.contains("PY_OK"));
        let out = tools[1]
            .invoke(json!({ "command": "echo SHELL_OK" }))
            .await
            .expect("shell");
        assert!(out.contains("SHELL_OK"));
    }

    #[tokio::test]
    async fn released_session_turns_into_unavailable_error() {
        let manager = started_manager().await;
        let session = manager
            .create_session(SandboxKind::Browser, "smoke-user", "s1")
            .await
            .expect("session");
        let tools = tools_for(&session);
        manager.release(&[session.id()]).await;
        drop(session);

        let err = tools[0]
            .invoke(json!({ "url": "https://example.com" }))
            .await
            .expect_err("released");
        assert!(matches!(err, OrchestratorError::SandboxUnavailable { .. }));
    }

    #[tokio::test]
    async fn navigate_rejects_non_http_urls() {
        let manager = started_manager().await;
        let session = manager
            .create_session(SandboxKind::Browser, "smoke-user", "s1")
            .await
            .expect("session");
        let navigate = tools_for(&session).remove(0);
        let err = navigate
            .invoke(json!({ "url": "file:///etc/passwd" }))
            .await
            .expect_err("scheme");
        assert!(err.to_string().contains("unsupported url scheme"));
    }
}
