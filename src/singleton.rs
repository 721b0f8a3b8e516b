//! # Single-Flight Job Runner
//!
//! At most one run of a named job is in flight. A trigger that arrives while
//! a run is active attaches to that run and receives its result instead of
//! starting another.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::PipelineError;

type SharedRun<T> = Shared<BoxFuture<'static, Result<T, PipelineError>>>;

struct InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    run_id: u64,
    cancel: CancellationToken,
    result: SharedRun<T>,
}

pub struct SingletonRunner<T>
where
    T: Clone + Send + Sync + 'static,
{
    job: &'static str,
    next_run_id: AtomicU64,
    slot: Arc<Mutex<Option<InFlight<T>>>>,
}

impl<T> SingletonRunner<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(job: &'static str) -> Self {
        Self {
            job,
            next_run_id: AtomicU64::new(1),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn job(&self) -> &'static str {
        self.job
    }

    /// Starts `work` unless a run is already in flight, then waits for
    /// whichever run is active.
    ///
    /// `work` receives the run's stop token. The run executes on its own task
    /// and completes even if every caller stops waiting.
    pub async fn run<F, Fut>(&self, work: F) -> Result<T, PipelineError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let result = {
            let mut slot = self.slot.lock().await;
            match slot.as_ref() {
                Some(in_flight) => {
                    debug!(
                        job = self.job,
                        run_id = in_flight.run_id,
                        "Joining in-flight run"
                    );
                    metrics::counter!("job_runs_joined_total", "job" => self.job).increment(1);
                    in_flight.result.clone()
                }
                None => {
                    let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
                    let cancel = CancellationToken::new();
                    let result = self.spawn(run_id, work(cancel.clone()));
                    *slot = Some(InFlight {
                        run_id,
                        cancel,
                        result: result.clone(),
                    });
                    info!(job = self.job, run_id, "Started run");
                    result
                }
            }
        };

        result.await
    }

    /// Asks the in-flight run to stop; returns false when idle.
    pub async fn stop_work(&self) -> bool {
        let slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(in_flight) => {
                info!(job = self.job, run_id = in_flight.run_id, "Stop requested");
                in_flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    fn spawn<Fut>(&self, run_id: u64, work: Fut) -> SharedRun<T>
    where
        Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let job = self.job;
        let slot = Arc::clone(&self.slot);

        let handle = tokio::spawn(async move {
            let result = work.await;
            let mut slot = slot.lock().await;
            if slot.as_ref().is_some_and(|f| f.run_id == run_id) {
                *slot = None;
            }
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(PipelineError::TaskFailed {
                    job,
                    message: err.to_string(),
                }),
            }
        }
        .boxed()
        .shared()
    }
}
