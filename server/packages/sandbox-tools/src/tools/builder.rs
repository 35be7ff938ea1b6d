use std::sync::Arc;

use sandbox_tools_error::OrchestratorError;
use uuid::Uuid;

use super::{calculator, sandbox, weather, ToolDescriptor, ToolRegistry};
use crate::sandbox::{Availability, SandboxKind, SandboxManager, SandboxSession, SessionLease};
use crate::service::RequestContext;

/// Registry for one invocation plus the sandbox sessions created for it.
#[derive(Debug)]
pub struct BuiltRegistry {
    pub registry: ToolRegistry,
    /// Sessions created for this invocation. Released when the lease is
    /// released or dropped.
    pub lease: Option<SessionLease>,
    /// Why sandbox tools were left out, when they were.
    pub sandbox_error: Option<OrchestratorError>,
}

/// Assembles the tool set for each invocation.
///
/// In-process tools are always present. Sandbox tools are added only when a
/// code-execution and a browser session could both be created; any failure
/// there is logged and the registry is returned without them.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistryBuilder {
    extra_tools: Vec<ToolDescriptor>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an in-process tool after the built-in ones.
    pub fn with_tool(mut self, tool: ToolDescriptor) -> Self {
        self.extra_tools.push(tool);
        self
    }

    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %context.user_id))]
    pub async fn build(
        &self,
        manager: Option<&Arc<SandboxManager>>,
        context: &RequestContext,
    ) -> Result<BuiltRegistry, OrchestratorError> {
        let mut registry = ToolRegistry::new();
        for tool in calculator::tools()
            .into_iter()
            .chain(weather::tools())
            .chain(self.extra_tools.iter().cloned())
        {
            registry.register(tool)?;
        }

        let Some(manager) = manager else {
            return Ok(BuiltRegistry {
                registry,
                lease: None,
                sandbox_error: None,
            });
        };

        let availability = manager.availability().await;
        if availability != Availability::Ready {
            tracing::debug!(state = availability.label(), "sandbox tools skipped");
            return Ok(BuiltRegistry {
                registry,
                lease: None,
                sandbox_error: Some(OrchestratorError::sandbox_unavailable(format!(
                    "sandbox manager is {}",
                    availability.label()
                ))),
            });
        }

        let session_key = format!("{}-{}", context.session_id, Uuid::new_v4());
        let created = create_sessions(manager, &context.user_id, &session_key).await;
        let (lease, sessions) = match created {
            Ok(created) => created,
            Err(err) => {
                tracing::warn!(error = %err, "failed to create sandbox sessions, continuing without sandbox tools");
                return Ok(BuiltRegistry {
                    registry,
                    lease: None,
                    sandbox_error: Some(err),
                });
            }
        };
        for session in &sessions {
            for tool in sandbox::tools_for(session) {
                if let Err(err) = registry.register(tool) {
                    lease.release().await;
                    return Err(err);
                }
            }
        }

        Ok(BuiltRegistry {
            registry,
            lease: Some(lease),
            sandbox_error: None,
        })
    }
}

impl BuiltRegistry {
    pub fn session_ids(&self) -> &[Uuid] {
        self.lease.as_ref().map(SessionLease::ids).unwrap_or_default()
    }
}

async fn create_sessions(
    manager: &Arc<SandboxManager>,
    user_id: &str,
    session_key: &str,
) -> Result<(SessionLease, Vec<Arc<SandboxSession>>), OrchestratorError> {
    let mut lease = SessionLease::new(manager.clone());
    let base = manager
        .create_session(SandboxKind::Base, user_id, session_key)
        .await?;
    lease.track(&base);
    let browser = match manager
        .create_session(SandboxKind::Browser, user_id, session_key)
        .await
    {
        Ok(browser) => browser,
        Err(err) => {
            lease.release().await;
            return Err(err);
        }
    };
    lease.track(&browser);
    if let Some(url) = browser.desktop_url() {
        tracing::info!(desktop_url = url, "browser sandbox desktop available");
    }
    Ok((lease, vec![base, browser]))
}
