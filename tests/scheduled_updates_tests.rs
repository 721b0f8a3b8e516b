//! Scheduled update pipeline against a mock buyer.

use std::sync::Arc;

use anyhow::Result;
use audience_sync::access::StaticAccessPolicy;
use audience_sync::audience::PartialCustomAudience;
use audience_sync::clock::{Clock, FixedClock};
use audience_sync::config::AppConfig;
use audience_sync::error::PipelineError;
use audience_sync::http_fetcher::ReqwestFetcher;
use audience_sync::repositories::{CustomAudienceRepository, ScheduledUpdateRepository};
use audience_sync::scheduled_updates::{ScheduledUpdatesHandler, ScheduledUpdatesWorker};
use audience_sync::store::{CustomAudienceStore, ScheduledUpdate, ScheduledUpdateStore};
use chrono::{Duration, SubsecRound, Utc};
use serde_json::{Value, json};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{buyer_of, join_entry, setup_test_db, stored_audience, test_config};

const OWNER: &str = "com.example.shoes";

struct Harness {
    config: Arc<AppConfig>,
    clock: Arc<FixedClock>,
    audiences: Arc<CustomAudienceRepository>,
    updates: Arc<ScheduledUpdateRepository>,
    handler: Arc<ScheduledUpdatesHandler>,
}

impl Harness {
    async fn new(config: AppConfig) -> Result<Self> {
        let db = setup_test_db().await?;
        let config = Arc::new(config);
        let clock = Arc::new(FixedClock::new(Utc::now().trunc_subsecs(3)));
        let audiences = Arc::new(CustomAudienceRepository::new(db.clone()));
        let updates = Arc::new(ScheduledUpdateRepository::new(db));
        let fetcher = Arc::new(ReqwestFetcher::new(&config.fetcher)?);

        let handler = Arc::new(ScheduledUpdatesHandler::new(
            Arc::clone(&config),
            audiences.clone(),
            updates.clone(),
            fetcher,
            Arc::new(StaticAccessPolicy::default()),
            clock.clone(),
        ));

        Ok(Self {
            config,
            clock,
            audiences,
            updates,
            handler,
        })
    }

    /// Stores a debuggable update for `base` that is already due.
    async fn schedule(
        &self,
        base: &str,
        overrides: &[PartialCustomAudience],
        leave: &[String],
    ) -> Result<ScheduledUpdate> {
        let now = self.clock.now();
        let mut update = ScheduledUpdate::new(
            OWNER,
            buyer_of(base),
            format!("{base}/update"),
            now - Duration::hours(1),
            now - Duration::minutes(1),
        );
        update.is_debuggable = true;
        update.allow_schedule_in_response = true;
        self.updates
            .insert_scheduled_update(&update, overrides, leave, false)
            .await?;
        Ok(update)
    }

    fn worker(&self) -> ScheduledUpdatesWorker {
        ScheduledUpdatesWorker::new(
            Arc::clone(&self.config),
            Arc::clone(&self.handler),
            self.clock.clone(),
        )
    }
}

async fn buyer_responds(server: &MockServer, body: Value) {
    Mock::given(method("POST"))
        .and(path("/update"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn joins_and_leaves_from_the_response() -> Result<()> {
    let server = MockServer::start().await;
    let base = server.uri();
    let harness = Harness::new(test_config()).await?;
    let now = harness.clock.now();
    let buyer = buyer_of(&base);

    harness
        .audiences
        .overwrite_audience(&stored_audience(OWNER, &base, "old", now), &format!("{base}/daily/old"), true, now)
        .await?;

    let partial = PartialCustomAudience {
        name: "shoes".to_string(),
        user_bidding_signals: Some(json!({"source": "partial"})),
        ..Default::default()
    };
    harness
        .schedule(&base, &[partial], &["gone".to_string()])
        .await?;

    buyer_responds(
        &server,
        json!({"leave": ["old"], "join": [join_entry(&base, "shoes", now)]}),
    )
    .await;

    let stats = harness.handler.perform_scheduled_updates(now).await?;
    assert_eq!(stats.updates_found, 1);
    assert_eq!(stats.updates_succeeded, 1);
    assert_eq!(stats.audiences_joined, 1);
    assert_eq!(stats.audiences_left, 1);

    assert!(harness.audiences.find_audience(OWNER, &buyer, "old").await?.is_none());
    let shoes = harness
        .audiences
        .find_audience(OWNER, &buyer, "shoes")
        .await?
        .expect("shoes joined");
    assert_eq!(shoes.user_bidding_signals, Some(json!({"source": "partial"})));

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 1);
    let sent: Value = serde_json::from_slice(&requests[0].body)?;
    assert_eq!(sent["partial_custom_audience_data"][0]["name"], "shoes");
    assert_eq!(sent["leave"], json!(["gone"]));

    assert!(harness.updates.get_due_scheduled_updates(now).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn leave_runs_before_join() -> Result<()> {
    let server = MockServer::start().await;
    let base = server.uri();
    let harness = Harness::new(test_config()).await?;
    let now = harness.clock.now();
    let buyer = buyer_of(&base);

    harness
        .audiences
        .overwrite_audience(&stored_audience(OWNER, &base, "shoes", now), &format!("{base}/daily/shoes"), true, now)
        .await?;
    harness.schedule(&base, &[], &[]).await?;

    buyer_responds(
        &server,
        json!({"leave": ["shoes", "never-joined"], "join": [join_entry(&base, "shoes", now)]}),
    )
    .await;

    let stats = harness.handler.perform_scheduled_updates(now).await?;
    assert_eq!(stats.audiences_left, 1);
    assert_eq!(stats.audiences_joined, 1);

    let shoes = harness
        .audiences
        .find_audience(OWNER, &buyer, "shoes")
        .await?
        .expect("rejoined after leaving");
    assert_eq!(shoes.user_bidding_signals, Some(json!({"source": "buyer"})));
    Ok(())
}

#[tokio::test]
async fn bad_join_entries_are_skipped_individually() -> Result<()> {
    let server = MockServer::start().await;
    let base = server.uri();
    let mut config = test_config();
    config.limits.max_custom_audience_size_bytes = 1_500;
    let harness = Harness::new(config).await?;
    let now = harness.clock.now();
    let buyer = buyer_of(&base);

    harness.schedule(&base, &[], &[]).await?;

    let mut oversized = join_entry(&base, "oversized", now);
    oversized["ads"][0]["metadata"] = json!({"blob": "x".repeat(3_000)});
    let mut wrong_host = join_entry(&base, "wrong-host", now);
    wrong_host["bidding_logic_uri"] = json!("https://elsewhere.example/bid");

    buyer_responds(
        &server,
        json!({"join": [
            {"name": "incomplete"},
            oversized,
            wrong_host,
            "not an object",
            join_entry(&base, "shoes", now)
        ]}),
    )
    .await;

    let stats = harness.handler.perform_scheduled_updates(now).await?;
    assert_eq!(stats.updates_succeeded, 1);
    assert_eq!(stats.audiences_joined, 1);
    assert_eq!(stats.join_failures, 4);

    assert!(harness.audiences.find_audience(OWNER, &buyer, "shoes").await?.is_some());
    for name in ["incomplete", "oversized", "wrong-host"] {
        assert!(harness.audiences.find_audience(OWNER, &buyer, name).await?.is_none());
    }
    Ok(())
}

#[tokio::test]
async fn joins_are_pinned_to_the_update_owner_and_buyer() -> Result<()> {
    let server = MockServer::start().await;
    let base = server.uri();
    let harness = Harness::new(test_config()).await?;
    let now = harness.clock.now();
    let buyer = buyer_of(&base);

    harness.schedule(&base, &[], &[]).await?;

    let mut entry = join_entry(&base, "shoes", now);
    entry["owner"] = json!("com.someone.else");
    entry["buyer"] = json!("other-buyer.example");
    buyer_responds(&server, json!({"join": [entry]})).await;

    harness.handler.perform_scheduled_updates(now).await?;

    assert!(harness.audiences.find_audience(OWNER, &buyer, "shoes").await?.is_some());
    assert!(
        harness
            .audiences
            .find_audience("com.someone.else", "other-buyer.example", "shoes")
            .await?
            .is_none()
    );
    Ok(())
}

#[tokio::test]
async fn join_entry_without_identity_is_incomplete() -> Result<()> {
    let server = MockServer::start().await;
    let base = server.uri();
    let harness = Harness::new(test_config()).await?;
    let now = harness.clock.now();
    let buyer = buyer_of(&base);

    // The override only covers "hats", so nothing supplies the identity of "shoes".
    let partial = PartialCustomAudience {
        name: "hats".to_string(),
        ..Default::default()
    };
    harness.schedule(&base, &[partial], &[]).await?;

    let mut anonymous = join_entry(&base, "shoes", now);
    let fields = anonymous.as_object_mut().expect("entry is an object");
    fields.remove("owner");
    fields.remove("buyer");
    let mut hats = join_entry(&base, "hats", now);
    let fields = hats.as_object_mut().expect("entry is an object");
    fields.remove("owner");
    fields.remove("buyer");
    buyer_responds(&server, json!({"join": [anonymous, hats]})).await;

    let stats = harness.handler.perform_scheduled_updates(now).await?;
    assert_eq!(stats.updates_succeeded, 1);
    assert_eq!(stats.audiences_joined, 1);
    assert_eq!(stats.join_failures, 1);

    assert!(harness.audiences.find_audience(OWNER, &buyer, "shoes").await?.is_none());
    assert!(harness.audiences.find_audience(OWNER, &buyer, "hats").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn malformed_leave_entries_count_as_failures() -> Result<()> {
    let server = MockServer::start().await;
    let base = server.uri();
    let harness = Harness::new(test_config()).await?;
    let now = harness.clock.now();
    let buyer = buyer_of(&base);

    harness
        .audiences
        .overwrite_audience(&stored_audience(OWNER, &base, "old", now), &format!("{base}/daily/old"), true, now)
        .await?;
    harness.schedule(&base, &[], &[]).await?;

    buyer_responds(&server, json!({"leave": [7, {"name": "old"}, "old"]})).await;

    let stats = harness.handler.perform_scheduled_updates(now).await?;
    assert_eq!(stats.updates_succeeded, 1);
    assert_eq!(stats.audiences_left, 1);
    assert_eq!(stats.leave_failures, 2);
    assert!(harness.audiences.find_audience(OWNER, &buyer, "old").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn response_schedule_requests_are_validated_individually() -> Result<()> {
    let server = MockServer::start().await;
    let base = server.uri();
    let harness = Harness::new(test_config()).await?;
    let now = harness.clock.now();

    harness.schedule(&base, &[], &[]).await?;

    let port = url::Url::parse(&base)?.port().unwrap_or(80);
    let next_uri = format!("http://localhost:{port}/next");
    buyer_responds(
        &server,
        json!({"schedule": {"requests": [
            {"update_uri": format!("http://localhost:{port}/too-soon"), "min_delay": 10},
            {"update_uri": "not a uri", "min_delay": 60},
            {
                "update_uri": next_uri,
                "min_delay": 60,
                "partial_custom_audience_data": [{"name": "hats"}],
                "leave": ["shoes"]
            }
        ]}}),
    )
    .await;

    let stats = harness.handler.perform_scheduled_updates(now).await?;
    assert_eq!(stats.updates_succeeded, 1);
    assert_eq!(stats.schedule_requests_inserted, 1);

    harness.clock.advance(Duration::minutes(61));
    let due = harness
        .updates
        .get_due_scheduled_updates(harness.clock.now())
        .await?;
    assert_eq!(due.len(), 1);
    let next = &due[0];
    assert_eq!(next.update_uri, next_uri);
    assert_eq!(next.buyer, "localhost");
    assert_eq!(next.owner, OWNER);
    assert!(!next.allow_schedule_in_response);
    assert!(next.is_debuggable);
    assert_eq!(next.scheduled_time, now + Duration::minutes(60));

    let overrides = harness.updates.get_overrides_for(next.id).await?;
    assert_eq!(overrides.len(), 1);
    assert_eq!(overrides[0].name, "hats");
    assert_eq!(harness.updates.get_leave_names_for(next.id).await?, vec!["shoes"]);
    Ok(())
}

#[tokio::test]
async fn schedule_requests_are_ignored_when_disabled() -> Result<()> {
    let server = MockServer::start().await;
    let base = server.uri();
    let mut config = test_config();
    config.scheduled_updates.additional_schedule_requests_enabled = false;
    let harness = Harness::new(config).await?;
    let now = harness.clock.now();

    harness.schedule(&base, &[], &[]).await?;

    let port = url::Url::parse(&base)?.port().unwrap_or(80);
    buyer_responds(
        &server,
        json!({"schedule": {"requests": [
            {"update_uri": format!("http://localhost:{port}/next"), "min_delay": 60}
        ]}}),
    )
    .await;

    let stats = harness.handler.perform_scheduled_updates(now).await?;
    assert_eq!(stats.updates_succeeded, 1);
    assert_eq!(stats.schedule_requests_inserted, 0);

    let requests = server.received_requests().await.unwrap_or_default();
    let sent: Value = serde_json::from_slice(&requests[0].body)?;
    assert!(sent.is_array(), "bare override array without nested scheduling");
    Ok(())
}

#[tokio::test]
async fn failed_fetch_leaves_update_pending() -> Result<()> {
    let server = MockServer::start().await;
    let base = server.uri();
    let harness = Harness::new(test_config()).await?;
    let now = harness.clock.now();

    let update = harness.schedule(&base, &[], &[]).await?;
    Mock::given(method("POST"))
        .and(path("/update"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let stats = harness.handler.perform_scheduled_updates(now).await?;
    assert_eq!(stats.updates_found, 1);
    assert_eq!(stats.updates_failed, 1);
    assert_eq!(stats.updates_succeeded, 0);

    let due = harness.updates.get_due_scheduled_updates(now).await?;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, update.id);
    Ok(())
}

#[tokio::test]
async fn stale_updates_are_discarded_without_fetching() -> Result<()> {
    let server = MockServer::start().await;
    let base = server.uri();
    let harness = Harness::new(test_config()).await?;
    let now = harness.clock.now();

    let mut stale = ScheduledUpdate::new(
        OWNER,
        buyer_of(&base),
        format!("{base}/update"),
        now - Duration::hours(25),
        now - Duration::hours(24),
    );
    stale.is_debuggable = true;
    harness
        .updates
        .insert_scheduled_update(&stale, &[], &[], false)
        .await?;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let stats = harness.handler.perform_scheduled_updates(now).await?;
    assert_eq!(stats.stale_removed, 1);
    assert_eq!(stats.updates_found, 0);
    Ok(())
}

#[tokio::test]
async fn worker_run_past_deadline_times_out() -> Result<()> {
    let server = MockServer::start().await;
    let base = server.uri();
    let mut config = test_config();
    config.scheduled_updates.max_runtime_seconds = 1;
    let harness = Harness::new(config).await?;
    let now = harness.clock.now();

    harness.schedule(&base, &[], &[]).await?;
    Mock::given(method("POST"))
        .and(path("/update"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(std::time::Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let err = harness
        .worker()
        .update_custom_audience()
        .await
        .expect_err("run exceeds its deadline");
    assert!(matches!(err, PipelineError::Timeout { .. }));

    assert_eq!(harness.updates.get_due_scheduled_updates(now).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn disabled_worker_does_nothing() -> Result<()> {
    let mut config = test_config();
    config.scheduled_updates.enabled = false;
    let harness = Harness::new(config).await?;

    let err = harness
        .worker()
        .update_custom_audience()
        .await
        .expect_err("disabled job refuses to run");
    assert!(matches!(err, PipelineError::Disabled { .. }));
    Ok(())
}
