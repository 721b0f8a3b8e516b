//! # Audience Sync Library
//!
//! Custom audience storage, the daily background fetch, and the owner-scheduled
//! update pipeline, exposed through an operator HTTP API.

pub mod access;
pub mod audience;
pub mod audience_blob;
pub mod auth;
pub mod background_fetch;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch_runner;
pub mod handlers;
pub mod http_fetcher;
pub mod models;
pub mod repositories;
pub mod schedule_update;
pub mod scheduled_updates;
pub mod server;
pub mod singleton;
pub mod store;
pub mod telemetry;
pub mod throttle;
pub mod updatable_data;
pub mod validation;
pub use migration;
