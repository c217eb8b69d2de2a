//! Config module tests

use super::*;
use pretty_assertions::assert_eq;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("RELAYMQ_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${RELAYMQ_TEST_VAR_SIMPLE}\"").unwrap();
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("RELAYMQ_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("RELAYMQ_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${RELAYMQ_TEST_VAR_UNSET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"fallback\"");

    std::env::set_var("RELAYMQ_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${RELAYMQ_TEST_VAR_SET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("RELAYMQ_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("RELAYMQ_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${RELAYMQ_TEST_VAR_MISSING}\"").unwrap();
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("relaymq.toml");

    std::env::set_var("RELAYMQ_TEST_BIND_HOST", "127.0.0.1");
    std::env::set_var("RELAYMQ_TEST_BIND_PORT", "1885");

    let config_content = r#"
[server]
bind = "${RELAYMQ_TEST_BIND_HOST}:${RELAYMQ_TEST_BIND_PORT}"

[delivery]
ack_timeout = "${RELAYMQ_TEST_ACK_TIMEOUT:-5s}"
max_retries = 7
"#;
    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:1885");
    assert_eq!(config.delivery.ack_timeout, Duration::from_secs(5));
    assert_eq!(config.delivery.max_retries, 7);
    assert_eq!(config.limits.max_queued_messages, 1000);

    std::env::remove_var("RELAYMQ_TEST_BIND_HOST");
    std::env::remove_var("RELAYMQ_TEST_BIND_PORT");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.delivery.ack_timeout, Duration::from_secs(20));
    assert_eq!(config.limits.overflow_policy, OverflowPolicy::DropOldest);
}

#[test]
fn test_load_rejects_invalid_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("bad.toml");
    std::fs::write(&config_path, "[mqtt]\nmax_qos = 3\n").unwrap();

    assert!(matches!(
        Config::load(&config_path),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.limits.max_connections, 10_000);
    assert_eq!(config.limits.max_inflight, 32);
    assert_eq!(config.mqtt.max_qos, 2);
    assert!(config.mqtt.retain_available);
}

#[test]
fn test_parse_minimal_config() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.session.connect_timeout, Duration::from_secs(10));
}

#[test]
fn test_parse_full_config() {
    let toml = r#"
[log]
level = "debug"

[server]
bind = "127.0.0.1:1884"

[limits]
max_connections = 500
max_packet_size = 65536
max_inflight = 8
max_queued_messages = 50
overflow_policy = "reject_newest"
max_awaiting_rel = 16

[delivery]
ack_timeout = "1m 30s"
max_retries = 5

[session]
connect_timeout = "3s"
default_keep_alive = 30
max_keep_alive = 300
max_topic_aliases = 10

[mqtt]
max_qos = 1
retain_available = false
"#;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:1884");
    assert_eq!(config.limits.max_connections, 500);
    assert_eq!(config.limits.overflow_policy, OverflowPolicy::RejectNewest);
    assert_eq!(config.delivery.ack_timeout, Duration::from_secs(90));
    assert_eq!(config.session.max_keep_alive, 300);

    let broker = config.broker_config();
    assert_eq!(broker.max_connections, 500);
    assert_eq!(broker.max_packet_size, 65536);
    assert_eq!(broker.connect_timeout, Duration::from_secs(3));
    assert_eq!(broker.ack_timeout, Duration::from_secs(90));
    assert_eq!(broker.max_retries, 5);
    assert_eq!(broker.default_keep_alive, 30);
    assert_eq!(broker.max_topic_alias, 10);
    assert!(!broker.retain_available);
    assert_eq!(broker.max_qos(), QoS::AtLeastOnce);
    assert_eq!(broker.session_limits.max_inflight, 8);
    assert_eq!(broker.session_limits.max_queued_messages, 50);
    assert_eq!(broker.session_limits.overflow_policy, OverflowPolicy::RejectNewest);
    assert_eq!(broker.session_limits.max_awaiting_rel, 16);
}

#[test]
fn test_invalid_max_qos() {
    let result = Config::parse("[mqtt]\nmax_qos = 3\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_invalid_max_inflight() {
    let result = Config::parse("[limits]\nmax_inflight = 0\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_invalid_max_queued_messages() {
    let result = Config::parse("[limits]\nmax_queued_messages = 0\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_unknown_overflow_policy() {
    let result = Config::parse("[limits]\noverflow_policy = \"drop_everything\"\n");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_bad_duration() {
    let result = Config::parse("[delivery]\nack_timeout = \"soon\"\n");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}
