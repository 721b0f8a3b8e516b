//! # Background Fetch Worker
//!
//! Periodically garbage-collects stale audiences and refreshes those whose
//! eligible update time has passed. Eligible rows are split into batches that
//! run concurrently; rows inside a batch are updated one after another.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{Duration as TokioDuration, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::fetch_runner::BackgroundFetchRunner;
use crate::http_fetcher::HttpFetcher;
use crate::singleton::SingletonRunner;
use crate::store::{CustomAudienceStore, FetchBookkeeping};
use crate::updatable_data::UpdateResultType;

const JOB: &str = "background_fetch";

/// Outcome of one background fetch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct BackgroundFetchRunStats {
    pub expired_removed: u64,
    pub disallowed_owners_removed: u64,
    pub disallowed_buyers_removed: u64,
    pub app_install_entries_removed: u64,
    pub eligible: u64,
    pub batches: u64,
    pub attempted: u64,
    pub succeeded: u64,
    pub network_failures: u64,
    pub validation_failures: u64,
    pub unknown_failures: u64,
    pub store_failures: u64,
    /// A stop request arrived before every row was attempted.
    pub stopped_early: bool,
}

impl BackgroundFetchRunStats {
    fn record(&mut self, outcome: Result<UpdateResultType, ()>) {
        self.attempted += 1;
        match outcome {
            Ok(UpdateResultType::Success) => self.succeeded += 1,
            Ok(UpdateResultType::NetworkFailure) => self.network_failures += 1,
            Ok(UpdateResultType::ValidationFailure) => self.validation_failures += 1,
            Ok(UpdateResultType::Unknown) => self.unknown_failures += 1,
            Err(()) => self.store_failures += 1,
        }
    }

    fn merge(&mut self, other: BackgroundFetchRunStats) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.network_failures += other.network_failures;
        self.validation_failures += other.validation_failures;
        self.unknown_failures += other.unknown_failures;
        self.store_failures += other.store_failures;
        self.stopped_early |= other.stopped_early;
    }
}

/// Number of concurrent batches: two cores are left for the rest of the
/// process, at least one batch runs, and `max_workers` caps the result.
pub fn worker_count(available_parallelism: usize, max_workers: usize) -> usize {
    available_parallelism
        .saturating_sub(2)
        .max(1)
        .min(max_workers.max(1))
}

/// Splits `rows` into consecutive chunks of `ceil(len / workers)` rows.
pub fn partition<T>(rows: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    if rows.is_empty() {
        return Vec::new();
    }
    let chunk = rows.len().div_ceil(workers.max(1));

    let mut batches = Vec::new();
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        batches.push(rows.by_ref().take(chunk).collect());
    }
    batches
}

#[derive(Clone)]
struct FetchPipeline {
    config: Arc<AppConfig>,
    store: Arc<dyn CustomAudienceStore>,
    runner: Arc<BackgroundFetchRunner>,
    clock: Arc<dyn Clock>,
    available_parallelism: usize,
}

impl FetchPipeline {
    async fn execute(self, cancel: CancellationToken) -> Result<BackgroundFetchRunStats, PipelineError> {
        if !self.config.background_fetch.enabled {
            return Err(PipelineError::Disabled { job: JOB });
        }

        let max_runtime = self.config.background_fetch.max_runtime();
        let job_start = self.clock.now();
        let started = Instant::now();

        let outcome = timeout(max_runtime, self.process(job_start, cancel.clone())).await;
        histogram!("background_fetch_run_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        match outcome {
            Ok(result) => result,
            Err(_) => {
                // Dropping `process` aborted the batch tasks; no row starts after this.
                cancel.cancel();
                counter!("background_fetch_timeouts_total").increment(1);
                warn!(
                    timeout_secs = max_runtime.as_secs(),
                    "Background fetch exceeded its deadline; completed rows are kept"
                );
                Err(PipelineError::Timeout {
                    job: JOB,
                    timeout: max_runtime,
                })
            }
        }
    }

    #[instrument(skip_all, fields(job_start = %job_start))]
    async fn process(
        &self,
        job_start: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Result<BackgroundFetchRunStats, PipelineError> {
        let mut stats = BackgroundFetchRunStats::default();

        let expired = self.store.delete_expired(job_start).await?;
        stats.expired_removed = expired.audiences_removed;
        stats.disallowed_owners_removed = self.store.delete_disallowed_owners().await?.audiences_removed;
        stats.disallowed_buyers_removed = self.store.delete_disallowed_buyers().await?.audiences_removed;
        if self.config.features.app_install_filtering {
            stats.app_install_entries_removed =
                self.store.delete_disallowed_app_install_entries().await?;
        }
        counter!("background_fetch_gc_removed_total", "reason" => "expired")
            .increment(stats.expired_removed);
        counter!("background_fetch_gc_removed_total", "reason" => "owner")
            .increment(stats.disallowed_owners_removed);
        counter!("background_fetch_gc_removed_total", "reason" => "buyer")
            .increment(stats.disallowed_buyers_removed);

        let rows = self
            .store
            .get_eligible_for_update(job_start, self.config.background_fetch.max_num_updated)
            .await?;
        stats.eligible = rows.len() as u64;
        gauge!("background_fetch_eligible_gauge").set(stats.eligible as f64);

        if rows.is_empty() {
            debug!("No custom audiences eligible for update");
            return Ok(stats);
        }

        let workers = worker_count(
            self.available_parallelism,
            self.config.background_fetch.max_workers,
        );
        let batches = partition(rows, workers);
        stats.batches = batches.len() as u64;

        info!(
            eligible = stats.eligible,
            batches = stats.batches,
            workers,
            "Updating eligible custom audiences"
        );

        // Owned by this future: dropping it on timeout aborts every batch.
        let mut tasks = JoinSet::new();
        for batch in batches {
            if cancel.is_cancelled() {
                stats.stopped_early = true;
                break;
            }
            let runner = Arc::clone(&self.runner);
            let cancel = cancel.clone();
            tasks.spawn(run_batch(runner, batch, job_start, cancel));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(batch_stats) => stats.merge(batch_stats),
                Err(err) => error!(error = ?err, "Background fetch batch task failed"),
            }
        }

        counter!("background_fetch_attempts_total").increment(stats.attempted);
        counter!("background_fetch_success_total").increment(stats.succeeded);

        debug!(
            attempted = stats.attempted,
            succeeded = stats.succeeded,
            network_failures = stats.network_failures,
            validation_failures = stats.validation_failures,
            store_failures = stats.store_failures,
            stopped_early = stats.stopped_early,
            "Background fetch run completed"
        );

        Ok(stats)
    }
}

async fn run_batch(
    runner: Arc<BackgroundFetchRunner>,
    batch: Vec<FetchBookkeeping>,
    job_start: DateTime<Utc>,
    cancel: CancellationToken,
) -> BackgroundFetchRunStats {
    let mut stats = BackgroundFetchRunStats::default();
    for row in &batch {
        if cancel.is_cancelled() {
            stats.stopped_early = true;
            break;
        }
        let outcome = runner
            .update_custom_audience(row, job_start)
            .await
            .map_err(|_| ());
        stats.record(outcome);
    }
    stats
}

pub struct BackgroundFetchWorker {
    config: Arc<AppConfig>,
    pipeline: FetchPipeline,
    singleton: SingletonRunner<BackgroundFetchRunStats>,
}

impl BackgroundFetchWorker {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn CustomAudienceStore>,
        fetcher: Arc<dyn HttpFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let runner = Arc::new(BackgroundFetchRunner::new(&config, Arc::clone(&store), fetcher));
        let available_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            pipeline: FetchPipeline {
                config: Arc::clone(&config),
                store,
                runner,
                clock,
                available_parallelism,
            },
            config,
            singleton: SingletonRunner::new(JOB),
        }
    }

    /// Overrides the detected core count (primarily for tests).
    pub fn with_available_parallelism(mut self, available_parallelism: usize) -> Self {
        self.pipeline.available_parallelism = available_parallelism;
        self
    }

    /// Runs one background fetch, or joins the run already in flight.
    pub async fn run_background_fetch(&self) -> Result<BackgroundFetchRunStats, PipelineError> {
        let pipeline = self.pipeline.clone();
        self.singleton.run(move |cancel| pipeline.execute(cancel)).await
    }

    /// Stops the in-flight run from starting further batches or rows.
    pub async fn stop_work(&self) -> bool {
        self.singleton.stop_work().await
    }

    pub async fn is_running(&self) -> bool {
        self.singleton.is_running().await
    }

    /// Run the periodic background fetch loop until `shutdown` fires
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting background fetch worker");
        let tick_interval = TokioDuration::from_secs(self.config.background_fetch.tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Background fetch worker shutdown requested");
                    self.stop_work().await;
                    break;
                }
                _ = sleep(tick_interval) => {
                    match self.run_background_fetch().await {
                        Ok(stats) => debug!(?stats, "Background fetch tick completed"),
                        Err(err) => error!(error = ?err, "Background fetch tick failed"),
                    }
                }
            }
        }

        info!("Background fetch worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_leaves_two_cores_and_respects_cap() {
        assert_eq!(worker_count(8, 4), 4);
        assert_eq!(worker_count(8, 16), 6);
        assert_eq!(worker_count(2, 4), 1);
        assert_eq!(worker_count(1, 4), 1);
    }

    #[test]
    fn test_ten_rows_on_eight_cores_with_cap_four() {
        let rows: Vec<u32> = (0..10).collect();
        let batches = partition(rows, worker_count(8, 4));
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[0], vec![0, 1, 2]);
        assert_eq!(batches[3], vec![9]);
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 10);
    }

    #[test]
    fn test_partition_edge_cases() {
        assert!(partition(Vec::<u8>::new(), 4).is_empty());
        assert_eq!(partition(vec![1, 2], 4), vec![vec![1], vec![2]]);
        assert_eq!(partition(vec![1, 2, 3], 1), vec![vec![1, 2, 3]]);
    }
}
