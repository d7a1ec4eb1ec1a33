use super::load_config;
use super::settings::Settings;
use serial_test::serial;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.host, "localhost");
    assert_eq!(settings.broker.port, 5672);
    assert_eq!(settings.broker.vhost, "/");
    assert_eq!(settings.broker.username, "guest");
    assert_eq!(settings.queue.name, "my-queue");
    assert!(settings.queue.durable);
    assert_eq!(settings.consumer.concurrency, 1);
    assert_eq!(settings.consumer.max_retries, 3);
    assert_eq!(settings.connection.retry_base_ms, 1000);
    assert_eq!(settings.connection.retry_cap_ms, 30_000);
    assert_eq!(settings.connection.max_reconnect_attempts, None);
    assert!(!settings.connection.fail_fast);
}

#[test]
#[serial]
fn test_load_config_falls_back_to_defaults() {
    temp_env::with_vars_unset(["BROKER__HOST", "BROKER__PORT", "QUEUE__NAME"], || {
        let settings = load_config().expect("load_config failed");
        assert_eq!(settings.broker.host, "localhost");
        assert_eq!(settings.queue.name, "my-queue");
    });
}

#[test]
#[serial]
fn test_environment_overrides() {
    temp_env::with_vars(
        [
            ("BROKER__HOST", Some("rabbit.internal")),
            ("BROKER__PORT", Some("5673")),
            ("QUEUE__NAME", Some("orders")),
            ("CONSUMER__CONCURRENCY", Some("8")),
        ],
        || {
            let settings = load_config().expect("load_config failed");
            assert_eq!(settings.broker.host, "rabbit.internal");
            assert_eq!(settings.broker.port, 5673);
            assert_eq!(settings.queue.name, "orders");
            assert_eq!(settings.consumer.concurrency, 8);
            // untouched values keep their defaults
            assert_eq!(settings.broker.vhost, "/");
        },
    );
}

#[test]
#[serial]
fn test_environment_overrides_multi_word_fields() {
    // Fields whose names contain underscores must survive the env key
    // split: the section separator is the double underscore.
    temp_env::with_vars(
        [
            ("CONSUMER__MAX_RETRIES", Some("9")),
            ("CONSUMER__DRAIN_TIMEOUT_MS", Some("750")),
            ("CONNECTION__RETRY_BASE_MS", Some("50")),
            ("CONNECTION__MAX_RECONNECT_ATTEMPTS", Some("4")),
        ],
        || {
            let settings = load_config().expect("load_config failed");
            assert_eq!(settings.consumer.max_retries, 9);
            assert_eq!(settings.consumer.drain_timeout_ms, 750);
            assert_eq!(settings.connection.retry_base_ms, 50);
            assert_eq!(settings.connection.max_reconnect_attempts, Some(4));
        },
    );
}
