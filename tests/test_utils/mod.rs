//! Test utilities for database and pipeline testing.
//!
//! This module provides utilities for setting up in-memory SQLite databases
//! with migrations, plus audience and update fixtures that target a mock buyer.

use anyhow::Result;
use audience_sync::audience::{AdData, CustomAudience, TrustedBiddingData};
use audience_sync::config::AppConfig;
use chrono::{DateTime, Duration, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::{Value, json};

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Configuration with every job enabled and the default limits.
#[allow(dead_code)]
pub fn test_config() -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        ..AppConfig::default()
    }
}

/// Host of a wiremock server URI, which is also the buyer it stands for.
#[allow(dead_code)]
pub fn buyer_of(server_uri: &str) -> String {
    url::Url::parse(server_uri)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Owner the join fixtures are issued for.
#[allow(dead_code)]
pub const JOIN_OWNER: &str = "com.example.shoes";

/// A complete join entry for [`JOIN_OWNER`] served by `base` (the mock buyer's URI).
#[allow(dead_code)]
pub fn join_entry(base: &str, name: &str, now: DateTime<Utc>) -> Value {
    json!({
        "owner": JOIN_OWNER,
        "buyer": buyer_of(base),
        "name": name,
        "activation_time": now.timestamp_millis(),
        "expiration_time": (now + Duration::days(7)).timestamp_millis(),
        "daily_update_uri": format!("{base}/daily/{name}"),
        "bidding_logic_uri": format!("{base}/bidding"),
        "user_bidding_signals": {"source": "buyer"},
        "trusted_bidding_data": {
            "trusted_bidding_uri": format!("{base}/trusted"),
            "trusted_bidding_keys": ["k1"]
        },
        "ads": [
            {"render_uri": format!("{base}/ad/1"), "metadata": {"slot": 1}}
        ]
    })
}

/// An audience as the store would hold it after a join from `base`.
#[allow(dead_code)]
pub fn stored_audience(
    owner: &str,
    base: &str,
    name: &str,
    now: DateTime<Utc>,
) -> CustomAudience {
    CustomAudience {
        owner: owner.to_string(),
        buyer: buyer_of(base),
        name: name.to_string(),
        activation_time: now,
        expiration_time: now + Duration::days(7),
        bidding_logic_uri: format!("{base}/bidding"),
        user_bidding_signals: Some(json!({"source": "stored"})),
        trusted_bidding_data: Some(TrustedBiddingData {
            trusted_bidding_uri: format!("{base}/trusted"),
            trusted_bidding_keys: vec!["k1".to_string()],
        }),
        ads: Some(vec![AdData {
            render_uri: format!("{base}/ad/0"),
            metadata: json!({"slot": 0}),
            ad_counter_keys: Vec::new(),
            ad_filters: None,
            ad_render_id: None,
        }]),
        auction_server_request_flags: Default::default(),
        priority: 0.0,
    }
}
