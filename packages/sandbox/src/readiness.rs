// ABOUTME: Deadline-bounded polling until a sandbox or its workspace is ready
// ABOUTME: Also provides ensure_sandbox_available: reuse, wait for, or create a sandbox

use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use superagent_core::constants::{SANDBOX_POLL_INTERVAL, SANDBOX_READY_TIMEOUT};
use superagent_core::ReadinessConfig;

use crate::agent::{SandboxAgent, WorkspaceStatus};
use crate::error::{Result, SandboxError};
use crate::gateway::{SandboxGateway, SandboxState};

/// Poll until the sandbox reports `Running`.
///
/// `Exited`/`Error` fail immediately with `InitFailed`. Each status call is bounded by the
/// time left before the deadline, so a hanging gateway cannot overrun it. Transient status
/// errors are logged and polling continues. Dropping the future cancels the wait.
pub async fn wait_ready(
    gateway: &dyn SandboxGateway,
    sandbox_id: &str,
    ready_timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let started = Instant::now();
    let deadline = started + ready_timeout;
    let mut polls = 0u32;

    info!(
        sandbox_id = %sandbox_id,
        timeout_secs = ready_timeout.as_secs(),
        "Waiting for sandbox to become ready"
    );

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        polls += 1;
        match timeout(remaining, gateway.get_status(sandbox_id)).await {
            Ok(Ok(info)) => match info.status {
                SandboxState::Running => {
                    info!(
                        sandbox_id = %sandbox_id,
                        polls,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Sandbox is ready"
                    );
                    return Ok(());
                }
                state if state.is_failed() => {
                    warn!(sandbox_id = %sandbox_id, status = ?state, "Sandbox failed to start");
                    return Err(SandboxError::InitFailed {
                        sandbox_id: sandbox_id.to_string(),
                        message: format!("sandbox reported {:?}", state),
                    });
                }
                state => {
                    debug!(sandbox_id = %sandbox_id, status = ?state, polls, "Sandbox not ready yet");
                }
            },
            Ok(Err(e)) => {
                warn!(sandbox_id = %sandbox_id, error = %e, "Status check failed, will retry");
            }
            Err(_) => {
                warn!(sandbox_id = %sandbox_id, "Status check did not finish before the deadline");
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(poll_interval.min(remaining)).await;
    }

    warn!(sandbox_id = %sandbox_id, polls, "Timed out waiting for sandbox");
    Err(SandboxError::ReadyTimeout {
        sandbox_id: sandbox_id.to_string(),
        waited: ready_timeout,
    })
}

/// How long a starting sandbox may take before it counts as failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartBudget {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for StartBudget {
    fn default() -> Self {
        Self {
            timeout: SANDBOX_READY_TIMEOUT,
            poll_interval: SANDBOX_POLL_INTERVAL,
        }
    }
}

impl From<&ReadinessConfig> for StartBudget {
    fn from(config: &ReadinessConfig) -> Self {
        Self {
            timeout: config.timeout,
            poll_interval: config.poll_interval,
        }
    }
}

/// Make sure `sandbox_id` exists and is running, creating it when needed.
///
/// Returns the sandbox id. A gateway that hands back a different id than requested is
/// rejected with `IdMismatch`.
pub async fn ensure_sandbox_available(
    gateway: &dyn SandboxGateway,
    sandbox_id: &str,
    project_id: &str,
    work_dir: &str,
    budget: StartBudget,
) -> Result<String> {
    match gateway.get_status(sandbox_id).await {
        Ok(info) if info.status.is_ready() => {
            info!(sandbox_id = %sandbox_id, "Reusing running sandbox");
            return Ok(sandbox_id.to_string());
        }
        Ok(info) if info.status == SandboxState::Pending => {
            info!(sandbox_id = %sandbox_id, "Sandbox is starting, waiting for it");
            match wait_ready(gateway, sandbox_id, budget.timeout, budget.poll_interval).await {
                Ok(()) => return Ok(sandbox_id.to_string()),
                Err(e) => {
                    warn!(sandbox_id = %sandbox_id, error = %e, "Pending sandbox never became ready, recreating");
                }
            }
        }
        Ok(info) => {
            debug!(sandbox_id = %sandbox_id, status = ?info.status, "Sandbox unavailable, creating");
        }
        Err(e) => {
            warn!(sandbox_id = %sandbox_id, error = %e, "Could not query sandbox, creating");
        }
    }

    let created = gateway
        .create_sandbox(project_id, sandbox_id, work_dir)
        .await?;
    if created != sandbox_id {
        return Err(SandboxError::IdMismatch {
            requested: sandbox_id.to_string(),
            returned: created,
        });
    }

    wait_ready(gateway, sandbox_id, budget.timeout, budget.poll_interval)
        .await
        .map_err(|e| match e {
            SandboxError::InitFailed { sandbox_id, .. } => SandboxError::Exited(sandbox_id),
            other => other,
        })?;

    Ok(created)
}

/// Poll the agent until the sandbox workspace is initialized
pub async fn wait_for_workspace_ready(
    agent: &dyn SandboxAgent,
    sandbox_id: &str,
    ready_timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + ready_timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        match timeout(remaining, agent.get_workspace_status(sandbox_id)).await {
            Ok(Ok(WorkspaceStatus::Ready)) => {
                info!(sandbox_id = %sandbox_id, "Workspace is ready");
                return Ok(());
            }
            Ok(Ok(WorkspaceStatus::Error)) => {
                return Err(SandboxError::WorkspaceInitFailed {
                    sandbox_id: sandbox_id.to_string(),
                    message: "workspace reported an initialization error".to_string(),
                });
            }
            Ok(Ok(status)) => {
                debug!(sandbox_id = %sandbox_id, status = ?status, "Workspace not ready yet");
            }
            Ok(Err(e)) => {
                warn!(sandbox_id = %sandbox_id, error = %e, "Workspace status check failed, will retry");
            }
            Err(_) => {}
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(poll_interval.min(remaining)).await;
    }

    Err(SandboxError::WorkspaceReadyTimeout {
        sandbox_id: sandbox_id.to_string(),
        waited: ready_timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingAgent, ScriptedGateway};
    use pretty_assertions::assert_eq;
    use SandboxState::*;

    const POLL: Duration = Duration::from_secs(2);

    #[tokio::test(start_paused = true)]
    async fn test_error_on_first_poll_fails_fast() {
        let gateway = ScriptedGateway::new([Error]);

        let err = wait_ready(&gateway, "sb-1", Duration::from_secs(600), POLL)
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::InitFailed { .. }));
        assert_eq!(gateway.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_not_found_times_out() {
        let gateway = ScriptedGateway::new([NotFound]);
        let started = Instant::now();

        let err = wait_ready(&gateway, "sb-1", Duration::from_secs(20), POLL)
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::ReadyTimeout { .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed <= Duration::from_secs(22));
        assert!(gateway.status_calls() >= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_pending_polls() {
        let gateway = ScriptedGateway::new([Pending, Pending, Running]);

        wait_ready(&gateway, "sb-1", Duration::from_secs(60), POLL)
            .await
            .unwrap();
        assert_eq!(gateway.status_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_reuses_running_sandbox() {
        let gateway = ScriptedGateway::new([Running]);

        let id = ensure_sandbox_available(&gateway, "sb-1", "proj-1", "/w", StartBudget::default())
            .await
            .unwrap();
        assert_eq!(id, "sb-1");
        assert!(gateway.created().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_creates_missing_sandbox() {
        let gateway = ScriptedGateway::new([NotFound, Pending, Running]);

        let id = ensure_sandbox_available(&gateway, "sb-1", "proj-1", "/w", StartBudget::default())
            .await
            .unwrap();
        assert_eq!(id, "sb-1");
        assert_eq!(gateway.created(), vec!["sb-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_rejects_id_mismatch() {
        let gateway = ScriptedGateway::new([NotFound]).returning_id("sb-other");

        let err = ensure_sandbox_available(&gateway, "sb-1", "proj-1", "/w", StartBudget::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), 2001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_reports_exit_while_starting() {
        let gateway = ScriptedGateway::new([Exited, Pending, Exited]);

        let err = ensure_sandbox_available(&gateway, "sb-1", "proj-1", "/w", StartBudget::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Exited(_)));
        assert_eq!(err.code(), 2002);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_times_out_with_start_budget() {
        let gateway = ScriptedGateway::new([NotFound, Pending]);
        let started = Instant::now();
        let budget = StartBudget {
            timeout: Duration::from_secs(30),
            poll_interval: POLL,
        };

        let err = ensure_sandbox_available(&gateway, "sb-1", "proj-1", "/w", budget)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 2003);
        assert!(started.elapsed() <= Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_budget_waits_out_a_slow_cold_start() {
        // Two minutes of PENDING before the sandbox comes up
        let mut states = vec![NotFound];
        states.extend(std::iter::repeat(Pending).take(60));
        states.push(Running);
        let gateway = ScriptedGateway::new(states);
        let config = superagent_core::Config::from_lookup(|_| None).unwrap();
        let started = Instant::now();

        let id = ensure_sandbox_available(
            &gateway,
            "sb-1",
            "proj-1",
            "/w",
            StartBudget::from(&config.readiness),
        )
        .await
        .unwrap();

        assert_eq!(id, "sb-1");
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workspace_ready_after_initializing() {
        let agent = RecordingAgent::with_workspace([
            WorkspaceStatus::Uninitialized,
            WorkspaceStatus::Initializing,
            WorkspaceStatus::Ready,
        ]);

        wait_for_workspace_ready(&agent, "sb-1", Duration::from_secs(600), POLL)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_workspace_error_and_timeout_codes() {
        let agent = RecordingAgent::with_workspace([WorkspaceStatus::Error]);
        let err = wait_for_workspace_ready(&agent, "sb-1", Duration::from_secs(600), POLL)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 3001);

        let agent = RecordingAgent::with_workspace([WorkspaceStatus::Initializing]);
        let err = wait_for_workspace_ready(&agent, "sb-1", Duration::from_secs(10), POLL)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 3003);
    }
}
