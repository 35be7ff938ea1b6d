//! Sandbox sessions and their lifecycle.
//!
//! The [`SandboxManager`] is the only owner of live sessions. Tool adapters
//! hold `Weak` references, so a session released by the manager stops
//! accepting calls even while an invocation still references it.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use sandbox_tools_error::OrchestratorError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;
use uuid::Uuid;

pub mod http;
pub mod memory;

pub use http::HttpSandboxRuntime;
pub use memory::InMemorySandboxRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    /// Python and shell execution.
    Base,
    /// Headless browser automation.
    Browser,
}

impl SandboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Browser => "browser",
        }
    }
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime-side identity of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
    pub desktop_url: Option<String>,
}

/// Boundary to the external sandbox-management service.
///
/// Every call may block on container or network latency; the manager wraps
/// each one in a timeout.
#[async_trait]
pub trait SandboxRuntime: Send + Sync + fmt::Debug {
    async fn connect(&self) -> Result<(), OrchestratorError>;

    async fn create(
        &self,
        kind: SandboxKind,
        user_id: &str,
        session_id: &str,
    ) -> Result<SandboxHandle, OrchestratorError>;

    async fn run_code(&self, handle: &SandboxHandle, code: &str) -> Result<String, OrchestratorError>;

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
    ) -> Result<String, OrchestratorError>;

    async fn navigate(&self, handle: &SandboxHandle, url: &str) -> Result<String, OrchestratorError>;

    async fn snapshot(&self, handle: &SandboxHandle) -> Result<String, OrchestratorError>;

    async fn teardown(&self, handle: &SandboxHandle) -> Result<(), OrchestratorError>;
}

async fn with_timeout<T, F>(
    limit: Duration,
    operation: &str,
    future: F,
) -> Result<T, OrchestratorError>
where
    F: Future<Output = Result<T, OrchestratorError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(OrchestratorError::sandbox_timed_out(
            operation,
            limit.as_millis(),
        )),
    }
}

/// Runs cleanup detached from the caller. Outside a tokio runtime there is
/// nothing left to run it on, so it is skipped with a warning.
fn spawn_cleanup<F>(task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(task);
        }
        Err(_) => tracing::warn!("no async runtime available, sandbox cleanup skipped"),
    }
}

/// A pool slot held while the runtime creates a container. Dropping it gives
/// the slot back, also when the creating future is cancelled.
struct Reservation<'a>(&'a AtomicUsize);

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A container the runtime created that the manager does not track yet.
/// If it is dropped before being claimed the container is torn down in the
/// background.
struct Unclaimed {
    handle: SandboxHandle,
    runtime: Arc<dyn SandboxRuntime>,
    armed: bool,
}

impl Unclaimed {
    fn claim(mut self) -> SandboxHandle {
        self.armed = false;
        std::mem::take(&mut self.handle)
    }
}

impl Drop for Unclaimed {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let handle = std::mem::take(&mut self.handle);
        let runtime = self.runtime.clone();
        tracing::debug!(handle = %handle.id, "tearing down sandbox abandoned during creation");
        spawn_cleanup(async move {
            if let Err(err) = runtime.teardown(&handle).await {
                tracing::warn!(handle = %handle.id, error = %err, "abandoned sandbox teardown failed");
            }
        });
    }
}

/// One isolated execution context.
pub struct SandboxSession {
    id: Uuid,
    kind: SandboxKind,
    user_id: String,
    session_id: String,
    created_at: DateTime<Utc>,
    alive: AtomicBool,
    handle: SandboxHandle,
    runtime: Arc<dyn SandboxRuntime>,
    call_timeout: Duration,
}

impl fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("handle", &self.handle.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl SandboxSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> SandboxKind {
        self.kind
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn desktop_url(&self) -> Option<&str> {
        self.handle.desktop_url.as_deref()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<(), OrchestratorError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(OrchestratorError::sandbox_unavailable(format!(
                "sandbox session {} has been released",
                self.id
            )))
        }
    }

    pub async fn run_code(&self, code: &str) -> Result<String, OrchestratorError> {
        self.ensure_alive()?;
        with_timeout(
            self.call_timeout,
            "run_code",
            self.runtime.run_code(&self.handle, code),
        )
        .await
    }

    pub async fn run_command(&self, command: &str) -> Result<String, OrchestratorError> {
        self.ensure_alive()?;
        with_timeout(
            self.call_timeout,
            "run_command",
            self.runtime.run_command(&self.handle, command),
        )
        .await
    }

    pub async fn navigate(&self, url: &str) -> Result<String, OrchestratorError> {
        self.ensure_alive()?;
        with_timeout(
            self.call_timeout,
            "navigate",
            self.runtime.navigate(&self.handle, url),
        )
        .await
    }

    pub async fn snapshot(&self) -> Result<String, OrchestratorError> {
        self.ensure_alive()?;
        with_timeout(self.call_timeout, "snapshot", self.runtime.snapshot(&self.handle)).await
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            kind: self.kind,
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            alive: self.is_alive(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: Uuid,
    pub kind: SandboxKind,
    pub user_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub alive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Availability {
    /// `start` has not been called yet.
    NotStarted,
    Ready,
    Unreachable { reason: String },
    /// `shutdown` has run; no new sessions are accepted.
    Stopped,
}

impl Availability {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Ready => "ready",
            Self::Unreachable { .. } => "unreachable",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseReport {
    pub released: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct SandboxManagerConfig {
    pub pool_size: usize,
    pub call_timeout: Duration,
}

impl Default for SandboxManagerConfig {
    fn default() -> Self {
        Self {
            pool_size: crate::config::DEFAULT_POOL_SIZE,
            call_timeout: crate::config::DEFAULT_SANDBOX_TIMEOUT,
        }
    }
}

#[derive(Debug)]
struct ManagerState {
    availability: Availability,
    sessions: Vec<Arc<SandboxSession>>,
}

#[derive(Debug)]
pub struct SandboxManager {
    runtime: Arc<dyn SandboxRuntime>,
    config: SandboxManagerConfig,
    state: Mutex<ManagerState>,
    /// Slots held by creations still waiting on the runtime. Only
    /// incremented under the `state` lock.
    reserved: AtomicUsize,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: SandboxManagerConfig) -> Self {
        Self {
            runtime,
            config,
            state: Mutex::new(ManagerState {
                availability: Availability::NotStarted,
                sessions: Vec::new(),
            }),
            reserved: AtomicUsize::new(0),
        }
    }

    /// Connects to the sandbox runtime.
    ///
    /// A failure leaves the manager `Unreachable`; callers log it and keep
    /// serving without sandbox tools.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        let result = with_timeout(self.config.call_timeout, "connect", self.runtime.connect()).await;
        let mut state = self.state.lock().await;
        match result {
            Ok(()) => {
                state.availability = Availability::Ready;
                tracing::info!(pool_size = self.config.pool_size, "sandbox runtime connected");
                Ok(())
            }
            Err(err) => {
                state.availability = Availability::Unreachable {
                    reason: err.to_string(),
                };
                Err(OrchestratorError::Initialization {
                    message: format!("failed to connect to sandbox runtime: {err}"),
                })
            }
        }
    }

    pub async fn availability(&self) -> Availability {
        self.state.lock().await.availability.clone()
    }

    pub async fn is_available(&self) -> bool {
        matches!(self.availability().await, Availability::Ready)
    }

    /// Creates a new session.
    ///
    /// The `(user_id, session_id)` pair is not deduplicated: a second call
    /// with the same key yields a second, independent session with its own
    /// [`SandboxSession::id`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn create_session(
        &self,
        kind: SandboxKind,
        user_id: &str,
        session_id: &str,
    ) -> Result<Arc<SandboxSession>, OrchestratorError> {
        let reservation = {
            let state = self.state.lock().await;
            match &state.availability {
                Availability::Ready => {}
                other => {
                    return Err(OrchestratorError::sandbox_unavailable(format!(
                        "sandbox manager is {}",
                        other.label()
                    )));
                }
            }
            let in_flight = self.reserved.load(Ordering::SeqCst);
            if state.sessions.len() + in_flight >= self.config.pool_size {
                return Err(OrchestratorError::ResourceExhausted {
                    limit: self.config.pool_size,
                });
            }
            self.reserved.fetch_add(1, Ordering::SeqCst);
            Reservation(&self.reserved)
        };

        let handle = with_timeout(
            self.config.call_timeout,
            "create",
            self.runtime.create(kind, user_id, session_id),
        )
        .await?;
        let unclaimed = Unclaimed {
            handle,
            runtime: self.runtime.clone(),
            armed: true,
        };

        let mut state = self.state.lock().await;
        let handle = unclaimed.claim();
        let session = Arc::new(SandboxSession {
            id: Uuid::new_v4(),
            kind,
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            alive: AtomicBool::new(true),
            handle,
            runtime: self.runtime.clone(),
            call_timeout: self.config.call_timeout,
        });

        if state.availability != Availability::Ready {
            // Shutdown raced this creation; the table was already drained.
            drop(reservation);
            drop(state);
            self.teardown_sessions(vec![session]).await;
            return Err(OrchestratorError::sandbox_unavailable(
                "sandbox manager stopped during session creation",
            ));
        }

        state.sessions.push(session.clone());
        drop(reservation);
        drop(state);
        tracing::info!(
            id = %session.id,
            kind = %kind,
            user_id,
            session_id,
            "sandbox session created"
        );
        Ok(session)
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let state = self.state.lock().await;
        state.sessions.iter().map(|session| session.info()).collect()
    }

    /// Tears down the listed sessions. Unknown ids are ignored.
    pub async fn release(&self, ids: &[Uuid]) -> ReleaseReport {
        let removed = {
            let mut state = self.state.lock().await;
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.sessions)
                .into_iter()
                .partition(|session| ids.contains(&session.id));
            state.sessions = kept;
            removed
        };
        self.teardown_sessions(removed).await
    }

    /// Tears down every tracked session but keeps accepting new ones.
    pub async fn release_all(&self) -> ReleaseReport {
        let drained = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.sessions)
        };
        self.teardown_sessions(drained).await
    }

    /// Stops the manager and tears down every tracked session.
    ///
    /// Idempotent. Individual teardown failures are logged and counted, the
    /// table is empty afterwards regardless.
    pub async fn shutdown(&self) -> ReleaseReport {
        let drained = {
            let mut state = self.state.lock().await;
            state.availability = Availability::Stopped;
            std::mem::take(&mut state.sessions)
        };
        if drained.is_empty() {
            return ReleaseReport::default();
        }
        tracing::info!(count = drained.len(), "shutting down sandbox sessions");
        let report = self.teardown_sessions(drained).await;
        tracing::info!(
            released = report.released,
            failed = report.failed,
            "sandbox shutdown complete"
        );
        report
    }

    async fn teardown_sessions(&self, sessions: Vec<Arc<SandboxSession>>) -> ReleaseReport {
        let outcomes = join_all(sessions.into_iter().map(|session| async move {
            session.alive.store(false, Ordering::SeqCst);
            let result = with_timeout(
                self.config.call_timeout,
                "teardown",
                self.runtime.teardown(&session.handle),
            )
            .await;
            if let Err(err) = &result {
                tracing::warn!(
                    id = %session.id,
                    handle = %session.handle.id,
                    error = %err,
                    "sandbox teardown failed"
                );
            }
            result.is_ok()
        }))
        .await;

        let released = outcomes.iter().filter(|ok| **ok).count();
        ReleaseReport {
            released,
            failed: outcomes.len() - released,
        }
    }
}

/// Sessions created on behalf of one request.
///
/// [`SessionLease::release`] tears them down and waits for the result. A
/// lease that is dropped instead, for example because the request was
/// cancelled, releases its sessions on a background task.
#[derive(Debug)]
pub struct SessionLease {
    manager: Arc<SandboxManager>,
    ids: Vec<Uuid>,
}

impl SessionLease {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self {
            manager,
            ids: Vec::new(),
        }
    }

    pub fn track(&mut self, session: &SandboxSession) {
        self.ids.push(session.id());
    }

    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }

    pub async fn release(mut self) -> ReleaseReport {
        let ids = std::mem::take(&mut self.ids);
        if ids.is_empty() {
            return ReleaseReport::default();
        }
        let count = ids.len();
        let manager = self.manager.clone();
        // The task finishes the teardown even if this future is dropped.
        match tokio::spawn(async move { manager.release(&ids).await }).await {
            Ok(report) => report,
            Err(err) => {
                tracing::warn!(error = %err, "sandbox release task failed");
                ReleaseReport {
                    released: 0,
                    failed: count,
                }
            }
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.ids);
        let manager = self.manager.clone();
        tracing::debug!(count = ids.len(), "releasing sandboxes of an abandoned request");
        spawn_cleanup(async move {
            let report = manager.release(&ids).await;
            if report.failed > 0 {
                tracing::warn!(failed = report.failed, "abandoned request sandboxes failed to release");
            }
        });
    }
}
