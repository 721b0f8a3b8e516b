//! Database migrations for the audience sync service.

pub use sea_orm_migration::prelude::*;

mod m2026_01_10_000001_create_custom_audiences;
mod m2026_01_10_000002_create_background_fetch_data;
mod m2026_01_10_000003_create_scheduled_updates;
mod m2026_01_10_000004_create_partial_custom_audiences;
mod m2026_01_10_000005_create_custom_audiences_to_leave;
mod m2026_01_10_000006_create_app_install_entries;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_10_000001_create_custom_audiences::Migration),
            Box::new(m2026_01_10_000002_create_background_fetch_data::Migration),
            Box::new(m2026_01_10_000003_create_scheduled_updates::Migration),
            Box::new(m2026_01_10_000004_create_partial_custom_audiences::Migration),
            Box::new(m2026_01_10_000005_create_custom_audiences_to_leave::Migration),
            Box::new(m2026_01_10_000006_create_app_install_entries::Migration),
        ]
    }
}
