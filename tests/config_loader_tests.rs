use audience_sync::config::ConfigLoader;
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    unsafe {
        env::remove_var("AUDIENCE_SYNC_PROFILE");
        env::remove_var("AUDIENCE_SYNC_API_BIND_ADDR");
        env::remove_var("AUDIENCE_SYNC_LOG_LEVEL");
        env::remove_var("AUDIENCE_SYNC_SCHEDULED_UPDATES_MIN_DELAY_MINS_OVERRIDE");
        env::remove_var("AUDIENCE_SYNC_ALLOWED_OWNERS");
        env::remove_var("AUDIENCE_SYNC_FEATURE_AD_RENDER_ID");
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.scheduled_updates.min_delay_mins_override, 30);
    assert!(cfg.scheduled_updates.additional_schedule_requests_enabled);
    assert!(cfg.allowed_owners.is_empty());
    assert!(!cfg.features.ad_render_id);
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "AUDIENCE_SYNC_API_BIND_ADDR=127.0.0.1:3000\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test",
        "AUDIENCE_SYNC_API_BIND_ADDR=192.168.0.10:5000\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "AUDIENCE_SYNC_API_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "AUDIENCE_SYNC_PROFILE=test\nAUDIENCE_SYNC_API_BIND_ADDR=127.0.0.1:4000\nAUDIENCE_SYNC_ALLOWED_OWNERS=com.shoes, com.hats\n",
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.allowed_owners, vec!["com.shoes", "com.hats"]);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "AUDIENCE_SYNC_API_BIND_ADDR=127.0.0.1:3000\nAUDIENCE_SYNC_SCHEDULED_UPDATES_MIN_DELAY_MINS_OVERRIDE=45\n",
    );

    unsafe {
        env::set_var("AUDIENCE_SYNC_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("AUDIENCE_SYNC_FEATURE_AD_RENDER_ID", "true");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.scheduled_updates.min_delay_mins_override, 45);
    assert!(cfg.features.ad_render_id);

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("AUDIENCE_SYNC_API_BIND_ADDR", "not-an-addr");
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}

#[test]
fn out_of_range_min_delay_override_is_rejected() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var(
            "AUDIENCE_SYNC_SCHEDULED_UPDATES_MIN_DELAY_MINS_OVERRIDE",
            "301",
        );
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("override above the maximum delay fails");
    assert!(format!("{}", err).contains("min delay override"));

    clear_env();
}
