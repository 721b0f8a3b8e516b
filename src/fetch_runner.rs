//! # Background Fetch Runner
//!
//! Refreshes one audience from its daily update URI: fetch, classify the
//! outcome, parse and size-check the payload, then persist either the new
//! data with its bookkeeping or the bookkeeping alone.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::audience::AdReadOptions;
use crate::config::AppConfig;
use crate::error::StoreError;
use crate::http_fetcher::{DevContext, HttpFetcher};
use crate::store::{CustomAudienceStore, FetchBookkeeping};
use crate::updatable_data::{UpdatableData, UpdateResultType};
use crate::validation::UpdatableDataValidator;

pub struct BackgroundFetchRunner {
    store: Arc<dyn CustomAudienceStore>,
    fetcher: Arc<dyn HttpFetcher>,
    ad_options: AdReadOptions,
    validator: UpdatableDataValidator,
    update_interval: Duration,
}

impl BackgroundFetchRunner {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn CustomAudienceStore>,
        fetcher: Arc<dyn HttpFetcher>,
    ) -> Self {
        Self {
            store,
            fetcher,
            ad_options: AdReadOptions::from_config(config),
            validator: UpdatableDataValidator::new(config.limits.clone()),
            update_interval: Duration::seconds(
                config.background_fetch.update_interval_seconds as i64,
            ),
        }
    }

    /// Fetches the daily update for one audience and parses it.
    ///
    /// Never fails: transport problems become a network failure or unknown
    /// result carrying no payload.
    pub async fn fetch_and_validate(
        &self,
        job_start_time: DateTime<Utc>,
        buyer: &str,
        daily_update_uri: &str,
        is_debuggable: bool,
    ) -> UpdatableData {
        let dev = DevContext::for_debuggable(is_debuggable);
        let started = Instant::now();

        let data = match self.fetcher.get(daily_update_uri, dev).await {
            Ok(body) => UpdatableData::from_response(
                job_start_time,
                UpdateResultType::Success,
                &body,
                &self.ad_options,
            ),
            Err(err) => {
                let result = if err.is_network_failure() {
                    UpdateResultType::NetworkFailure
                } else {
                    UpdateResultType::Unknown
                };
                debug!(
                    buyer = %buyer,
                    uri = %daily_update_uri,
                    error = ?err,
                    result = result.as_str(),
                    "Daily update fetch failed"
                );
                UpdatableData::failed(job_start_time, result)
            }
        };

        histogram!("background_fetch_latency_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        if !data.contains_successful_update {
            return data;
        }

        match self.validator.validate(&data, buyer) {
            Ok(()) => data,
            Err(err) => {
                debug!(buyer = %buyer, error = %err, "Fetched update exceeds limits");
                data.into_validation_failure()
            }
        }
    }

    /// Refreshes the audience behind `row` and records the attempt.
    pub async fn update_custom_audience(
        &self,
        row: &FetchBookkeeping,
        job_start_time: DateTime<Utc>,
    ) -> Result<UpdateResultType, StoreError> {
        let data = self
            .fetch_and_validate(
                job_start_time,
                &row.buyer,
                &row.daily_update_uri,
                row.is_debuggable,
            )
            .await;

        let next = row.after_attempt(&data, self.update_interval);
        let result = data.result_type();

        let stored = if data.contains_successful_update {
            self.store.overwrite_audience_and_bookkeeping(&next, &data).await
        } else {
            self.store.overwrite_bookkeeping_only(&next).await
        };

        if let Err(err) = stored {
            warn!(
                owner = %row.owner,
                buyer = %row.buyer,
                name = %row.name,
                error = ?err,
                "Failed to persist background fetch result"
            );
            return Err(err);
        }

        counter!("background_fetch_updates_total", "result" => result.as_str()).increment(1);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_fetcher::FetchError;
    use async_trait::async_trait;
    use serde_json::json;

    struct CannedFetcher(fn() -> Result<String, FetchError>);

    #[async_trait]
    impl HttpFetcher for CannedFetcher {
        async fn get(&self, _uri: &str, _dev: DevContext) -> Result<String, FetchError> {
            (self.0)()
        }

        async fn post(
            &self,
            _uri: &str,
            _body: &serde_json::Value,
            _dev: DevContext,
        ) -> Result<String, FetchError> {
            (self.0)()
        }
    }

    async fn runner(fetch: fn() -> Result<String, FetchError>) -> BackgroundFetchRunner {
        let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&db).await.unwrap();
        let store = Arc::new(crate::repositories::CustomAudienceRepository::new(db));
        BackgroundFetchRunner::new(&AppConfig::default(), store, Arc::new(CannedFetcher(fetch)))
    }

    #[tokio::test]
    async fn test_transport_failures_are_classified() {
        let now = Utc::now();

        let timeout = runner(|| Err(FetchError::Timeout)).await;
        let data = timeout
            .fetch_and_validate(now, "buyer.com", "https://buyer.com/d", false)
            .await;
        assert_eq!(data.result_type(), UpdateResultType::NetworkFailure);

        let cancelled = runner(|| Err(FetchError::Cancelled)).await;
        let data = cancelled
            .fetch_and_validate(now, "buyer.com", "https://buyer.com/d", false)
            .await;
        assert_eq!(data.result_type(), UpdateResultType::Unknown);
        assert!(data.ads.is_none());
    }

    #[tokio::test]
    async fn test_oversized_payload_becomes_validation_failure() {
        let runner = runner(|| {
            let ads: Vec<_> = (0..101)
                .map(|i| json!({"render_uri": format!("https://buyer.com/{i}"), "metadata": {}}))
                .collect();
            Ok(json!({ "ads": ads }).to_string())
        })
        .await;

        let data = runner
            .fetch_and_validate(Utc::now(), "buyer.com", "https://buyer.com/d", false)
            .await;
        assert!(!data.contains_successful_update);
        assert!(data.ads.is_none());
        assert_eq!(data.result_type(), UpdateResultType::ValidationFailure);
    }
}
