//! In-process sandbox runtime.
//!
//! Nothing is isolated here: `print(...)` and `echo ...` are interpreted
//! textually so that the full tool path can be exercised offline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sandbox_tools_error::OrchestratorError;

use super::{SandboxHandle, SandboxKind, SandboxRuntime};

#[derive(Debug, Default)]
struct LiveSandbox {
    kind: Option<SandboxKind>,
    current_url: Option<String>,
}

#[derive(Debug, Default)]
pub struct InMemorySandboxRuntime {
    reachable: bool,
    latency: Option<Duration>,
    fail_create: AtomicBool,
    fail_teardown: AtomicBool,
    next_id: AtomicU64,
    live: Mutex<HashMap<String, LiveSandbox>>,
}

impl InMemorySandboxRuntime {
    pub fn new() -> Self {
        Self {
            reachable: true,
            ..Self::default()
        }
    }

    /// A runtime whose `connect` always fails.
    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_teardown(&self, fail: bool) {
        self.fail_teardown.store(fail, Ordering::SeqCst);
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn with_sandbox<T>(
        &self,
        handle: &SandboxHandle,
        f: impl FnOnce(&mut LiveSandbox) -> T,
    ) -> Result<T, OrchestratorError> {
        let mut live = self
            .live
            .lock()
            .map_err(|_| OrchestratorError::sandbox_unavailable("sandbox table poisoned"))?;
        let sandbox = live.get_mut(&handle.id).ok_or_else(|| {
            OrchestratorError::sandbox_unavailable(format!("unknown sandbox {}", handle.id))
        })?;
        Ok(f(sandbox))
    }
}

#[async_trait]
impl SandboxRuntime for InMemorySandboxRuntime {
    async fn connect(&self) -> Result<(), OrchestratorError> {
        self.delay().await;
        if self.reachable {
            Ok(())
        } else {
            Err(OrchestratorError::sandbox_unavailable(
                "in-memory runtime configured as unreachable",
            ))
        }
    }

    async fn create(
        &self,
        kind: SandboxKind,
        user_id: &str,
        session_id: &str,
    ) -> Result<SandboxHandle, OrchestratorError> {
        self.delay().await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(OrchestratorError::sandbox_unavailable("container creation failed"));
        }
        let sequence = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("mem-{kind}-{user_id}-{session_id}-{sequence}");
        let desktop_url = match kind {
            SandboxKind::Browser => Some(format!("memory://{id}/desktop")),
            SandboxKind::Base => None,
        };
        let mut live = self
            .live
            .lock()
            .map_err(|_| OrchestratorError::sandbox_unavailable("sandbox table poisoned"))?;
        live.insert(
            id.clone(),
            LiveSandbox {
                kind: Some(kind),
                current_url: None,
            },
        );
        Ok(SandboxHandle { id, desktop_url })
    }

    async fn run_code(&self, handle: &SandboxHandle, code: &str) -> Result<String, OrchestratorError> {
        self.delay().await;
        self.with_sandbox(handle, |_| ())?;
        let printed: Vec<String> = code.lines().filter_map(printed_literal).collect();
        if printed.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!("{}\n", printed.join("\n")))
        }
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
    ) -> Result<String, OrchestratorError> {
        self.delay().await;
        self.with_sandbox(handle, |_| ())?;
        let command = command.trim();
        match command.strip_prefix("echo") {
            Some(rest) if rest.is_empty() || rest.starts_with(' ') => {
                Ok(format!("{}\n", rest.trim().trim_matches('"').trim_matches('\'')))
            }
            _ => Err(OrchestratorError::ToolExecution {
                tool: "run_command".to_string(),
                message: format!("command not found: {}", command.split_whitespace().next().unwrap_or("")),
            }),
        }
    }

    async fn navigate(&self, handle: &SandboxHandle, url: &str) -> Result<String, OrchestratorError> {
        self.delay().await;
        let is_browser = self.with_sandbox(handle, |sandbox| {
            if sandbox.kind == Some(SandboxKind::Browser) {
                sandbox.current_url = Some(url.to_string());
                true
            } else {
                false
            }
        })?;
        if !is_browser {
            return Err(OrchestratorError::ToolExecution {
                tool: "navigate".to_string(),
                message: "sandbox has no browser".to_string(),
            });
        }
        Ok(format!("Navigated to {url}"))
    }

    async fn snapshot(&self, handle: &SandboxHandle) -> Result<String, OrchestratorError> {
        self.delay().await;
        let current = self.with_sandbox(handle, |sandbox| sandbox.current_url.clone())?;
        Ok(match current {
            Some(url) => format!("- document \"{url}\"\n  - url: {url}"),
            None => "- document \"about:blank\"".to_string(),
        })
    }

    async fn teardown(&self, handle: &SandboxHandle) -> Result<(), OrchestratorError> {
        self.delay().await;
        let mut live = self
            .live
            .lock()
            .map_err(|_| OrchestratorError::sandbox_unavailable("sandbox table poisoned"))?;
        // The container is gone either way; the error only reports it.
        live.remove(&handle.id);
        if self.fail_teardown.load(Ordering::SeqCst) {
            return Err(OrchestratorError::sandbox_unavailable(format!(
                "failed to remove container {}",
                handle.id
            )));
        }
        Ok(())
    }
}

/// Extracts `X` from a `print('X')` or `print("X")` line.
fn printed_literal(line: &str) -> Option<String> {
    let inner = line.trim().strip_prefix("print(")?.strip_suffix(')')?.trim();
    let quote = inner.chars().next()?;
    if quote != '\'' && quote != '"' {
        return Some(inner.to_string());
    }
    inner
        .strip_prefix(quote)?
        .strip_suffix(quote)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn python_print_and_shell_echo_round_trip_markers() {
        let runtime = InMemorySandboxRuntime::new();
        let handle = runtime
            .create(SandboxKind::Base, "smoke-user", "session")
            .await
            .expect("create");
        let out = runtime.run_code(&handle, "print('PY_OK')").await.expect("code");
        assert!(out.contains("PY_OK"));
        let out = runtime.run_command(&handle, "echo SHELL_OK").await.expect("shell");
        assert!(out.contains("SHELL_OK"));
        assert!(runtime.run_command(&handle, "rm -rf /").await.is_err());
    }

    #[tokio::test]
    async fn browser_snapshot_reflects_navigation() {
        let runtime = InMemorySandboxRuntime::new();
        let handle = runtime
            .create(SandboxKind::Browser, "smoke-user", "session")
            .await
            .expect("create");
        assert!(handle.desktop_url.is_some());
        runtime
            .navigate(&handle, "https://example.com")
            .await
            .expect("navigate");
        let snapshot = runtime.snapshot(&handle).await.expect("snapshot");
        assert!(snapshot.contains("example.com"));
    }

    #[test]
    fn printed_literal_handles_both_quote_styles() {
        assert_eq!(printed_literal("print('a')").as_deref(), Some("a"));
        assert_eq!(printed_literal("  print(\"b\")  ").as_deref(), Some("b"));
        assert_eq!(printed_literal("print(1 + 2)").as_deref(), Some("1 + 2"));
        assert_eq!(printed_literal("x = 1"), None);
    }
}
