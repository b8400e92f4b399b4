use super::*;
use serial_test::serial;
use std::env;

fn cleanup_test_env() {
    env::remove_var("REDIS_URL");
    env::remove_var("AGENTCOORD_FALLBACK_DIR");
    env::remove_var("AGENTCOORD_HEARTBEAT_SECONDS");
    env::remove_var("AGENTCOORD_HUNG_SECONDS");
    env::remove_var("AGENTCOORD_LOCK_TTL_SECONDS");
}

#[test]
#[serial]
fn defaults_with_no_env_set() {
    cleanup_test_env();

    let config = Config::load().unwrap();

    assert_eq!(config.kv.redis_url, None);
    assert_eq!(config.heartbeat.interval_seconds, DEFAULT_HEARTBEAT_SECONDS);
    assert_eq!(config.heartbeat.hung_seconds, DEFAULT_HUNG_SECONDS);
    assert_eq!(config.lock.default_ttl_seconds, DEFAULT_LOCK_TTL_SECONDS);

    cleanup_test_env();
}

#[test]
#[serial]
fn redis_url_blank_is_treated_as_unset() {
    cleanup_test_env();
    env::set_var("REDIS_URL", " ");

    let config = Config::load().unwrap();
    assert_eq!(config.kv.redis_url, None);

    cleanup_test_env();
}

#[test]
#[serial]
fn redis_url_is_picked_up() {
    cleanup_test_env();
    env::set_var("REDIS_URL", "redis://localhost:6379");

    let config = Config::load().unwrap();
    assert_eq!(config.kv.redis_url.as_deref(), Some("redis://localhost:6379"));

    cleanup_test_env();
}

#[test]
#[serial]
fn fallback_dir_override_is_honored() {
    cleanup_test_env();
    env::set_var("AGENTCOORD_FALLBACK_DIR", "/tmp/agentcoord-test-state");

    let config = Config::load().unwrap();
    assert_eq!(
        config.kv.fallback_dir,
        std::path::PathBuf::from("/tmp/agentcoord-test-state")
    );

    cleanup_test_env();
}

#[test]
#[serial]
fn rejects_zero_heartbeat_interval() {
    cleanup_test_env();
    env::set_var("AGENTCOORD_HEARTBEAT_SECONDS", "0");

    let result = Config::load();
    assert!(result.is_err());

    cleanup_test_env();
}

#[test]
#[serial]
fn rejects_nonpositive_hung_seconds() {
    cleanup_test_env();
    env::set_var("AGENTCOORD_HUNG_SECONDS", "-5");

    let result = Config::load();
    assert!(result.is_err());

    cleanup_test_env();
}

#[test]
#[serial]
fn rejects_zero_lock_ttl() {
    cleanup_test_env();
    env::set_var("AGENTCOORD_LOCK_TTL_SECONDS", "0");

    let result = Config::load();
    assert!(result.is_err());

    cleanup_test_env();
}

#[test]
#[serial]
fn custom_heartbeat_and_hung_thresholds() {
    cleanup_test_env();
    env::set_var("AGENTCOORD_HEARTBEAT_SECONDS", "10");
    env::set_var("AGENTCOORD_HUNG_SECONDS", "60");

    let config = Config::load().unwrap();
    assert_eq!(config.heartbeat.interval_seconds, 10);
    assert_eq!(config.heartbeat.hung_seconds, 60);

    cleanup_test_env();
}

#[test]
fn autoscaler_defaults_are_sane() {
    let ac = AutoScalerConfig::default();
    assert!(ac.min_workers <= ac.max_workers);
    assert!(ac.tasks_per_worker > 0);
}
