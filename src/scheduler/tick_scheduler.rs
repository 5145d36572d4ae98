//! Periodic tick scheduler
//!
//! Runs a retry pass followed by a tick every `tick_interval_secs`. The
//! interval and the on/off switch are re-read from settings on every
//! iteration, so changes apply without a restart.

use crate::error::Result;
use crate::services::orchestrator_service::{Orchestrator, RetryReport, TickReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Background loop driving the orchestrator
pub struct TickScheduler {
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl TickScheduler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            shutdown_tx: None,
        }
    }

    /// One scheduler iteration: requeue and recover, then tick
    pub fn run_once(orchestrator: &Orchestrator) -> Result<(RetryReport, TickReport)> {
        let retry = orchestrator.retry_failed()?;
        let tick = orchestrator.tick()?;
        Ok((retry, tick))
    }

    /// Spawn the loop; it runs until `stop` is called or the scheduler is dropped
    pub fn start(&mut self) -> JoinHandle<()> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        let orchestrator = self.orchestrator.clone();

        tokio::spawn(async move {
            info!("Tick scheduler started for {}", orchestrator.instance_id());

            loop {
                let settings = match orchestrator.state().settings() {
                    Ok(settings) => settings,
                    Err(e) => {
                        error!("Tick scheduler could not read settings: {}", e);
                        Default::default()
                    }
                };

                if settings.scheduler_enabled {
                    let pass = orchestrator.clone();
                    let outcome = tokio::task::spawn_blocking(move || Self::run_once(&pass)).await;
                    match outcome {
                        Ok(Ok((retry, tick))) => debug!(
                            "Tick complete: {} created, {} dispatched, {} requeued",
                            tick.runs_created.len(),
                            tick.dispatched.len(),
                            retry.requeued.len() + retry.watchdog_requeued.len()
                        ),
                        // A failed tick leaves the ledger consistent; try again next interval
                        Ok(Err(e)) => error!("Tick failed: {}", e),
                        Err(e) => error!("Tick task panicked: {}", e),
                    }
                } else {
                    debug!("Tick scheduler disabled in settings");
                }

                let interval = Duration::from_secs(settings.tick_interval_secs.max(1));
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }

            info!("Tick scheduler stopped");
        })
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderRegistry;
    use crate::state::{AppState, Clock};
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_start_and_stop() {
        let now = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();
        let state = Arc::new(AppState::in_memory(Arc::new(Clock::manual(now)), ProviderRegistry::new()).unwrap());
        let orchestrator = Arc::new(Orchestrator::new(state));

        let (retry, tick) = TickScheduler::run_once(&orchestrator).unwrap();
        assert!(retry.requeued.is_empty());
        assert_eq!(tick.definitions_scanned, 0);

        let mut scheduler = TickScheduler::new(orchestrator);
        let handle = scheduler.start();
        assert!(scheduler.is_running());
        scheduler.stop();
        assert!(!scheduler.is_running());
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
