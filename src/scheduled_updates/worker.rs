//! Periodic trigger for scheduled updates.

use std::sync::Arc;

use tokio::time::{Duration as TokioDuration, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{ScheduledUpdateRunStats, ScheduledUpdatesHandler};
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::singleton::SingletonRunner;

const JOB: &str = "scheduled_updates";

pub struct ScheduledUpdatesWorker {
    config: Arc<AppConfig>,
    handler: Arc<ScheduledUpdatesHandler>,
    clock: Arc<dyn Clock>,
    singleton: SingletonRunner<ScheduledUpdateRunStats>,
}

impl ScheduledUpdatesWorker {
    pub fn new(
        config: Arc<AppConfig>,
        handler: Arc<ScheduledUpdatesHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            handler,
            clock,
            singleton: SingletonRunner::new(JOB),
        }
    }

    /// Performs the updates due now, or joins the run already in flight.
    pub async fn update_custom_audience(&self) -> Result<ScheduledUpdateRunStats, PipelineError> {
        let config = Arc::clone(&self.config);
        let handler = Arc::clone(&self.handler);
        let before = self.clock.now();

        self.singleton
            .run(move |cancel| async move {
                if !config.scheduled_updates.enabled {
                    return Err(PipelineError::Disabled { job: JOB });
                }

                let max_runtime = config.scheduled_updates.max_runtime();
                match timeout(max_runtime, handler.perform(before, &cancel)).await {
                    Ok(result) => result,
                    Err(_) => {
                        metrics::counter!("scheduled_updates_timeouts_total").increment(1);
                        warn!(
                            timeout_secs = max_runtime.as_secs(),
                            "Scheduled updates exceeded their deadline; completed updates are kept"
                        );
                        Err(PipelineError::Timeout {
                            job: JOB,
                            timeout: max_runtime,
                        })
                    }
                }
            })
            .await
    }

    /// Leaves updates that have not been fetched yet pending.
    pub async fn stop_work(&self) -> bool {
        self.singleton.stop_work().await
    }

    pub async fn is_running(&self) -> bool {
        self.singleton.is_running().await
    }

    /// Run the periodic scheduled update loop until `shutdown` fires
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting scheduled updates worker");
        let tick_interval = TokioDuration::from_secs(self.config.scheduled_updates.tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduled updates worker shutdown requested");
                    self.stop_work().await;
                    break;
                }
                _ = sleep(tick_interval) => {
                    match self.update_custom_audience().await {
                        Ok(stats) => debug!(?stats, "Scheduled updates tick completed"),
                        Err(err) => error!(error = ?err, "Scheduled updates tick failed"),
                    }
                }
            }
        }

        info!("Scheduled updates worker stopped");
    }
}
