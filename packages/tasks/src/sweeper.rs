// ABOUTME: Periodic sweep that expires stale running tasks and reconciles stale topics
// ABOUTME: Runs as a background tokio task; a single pass is also exposed for external schedulers

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{error, info};

use superagent_core::SweeperConfig;
use superagent_sandbox::SandboxGateway;

use crate::error::Result;
use crate::service::{ReconcileReport, TaskDomainService};

/// Result of one sweep pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_tasks: usize,
    pub reconciled: ReconcileReport,
}

pub struct StaleTaskSweeper {
    service: TaskDomainService,
    gateway: Arc<dyn SandboxGateway>,
    config: SweeperConfig,
    running: Arc<RwLock<bool>>,
}

impl StaleTaskSweeper {
    pub fn new(
        service: TaskDomainService,
        gateway: Arc<dyn SandboxGateway>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            service,
            gateway,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// One pass: expire stale RUNNING tasks, then check stale topics against the gateway
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        sweep(&self.service, self.gateway.as_ref(), &self.config).await
    }

    /// Start the periodic sweep in the background
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let service = self.service.clone();
        let gateway = self.gateway.clone();
        let config = self.config.clone();
        let running_flag = self.running.clone();

        tokio::spawn(async move {
            info!(
                interval_secs = config.interval.as_secs(),
                threshold_secs = config.threshold.as_secs(),
                "Stale task sweeper started"
            );
            let mut ticker = time::interval(config.interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if !*running_flag.read().await {
                    info!("Stale task sweeper stopped");
                    break;
                }

                if let Err(e) = sweep(&service, gateway.as_ref(), &config).await {
                    error!(error = %e, "Stale task sweep failed");
                }
            }
        });
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

async fn sweep(
    service: &TaskDomainService,
    gateway: &dyn SandboxGateway,
    config: &SweeperConfig,
) -> Result<SweepReport> {
    let expired_tasks = service
        .update_stale_running_tasks(config.threshold, config.limit)
        .await?;
    let reconciled = service
        .reconcile_stale_topics(gateway, config.threshold, config.limit)
        .await?;

    Ok(SweepReport {
        expired_tasks,
        reconciled,
    })
}
