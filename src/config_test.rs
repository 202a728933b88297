use super::*;

#[test]
fn defaults_are_consistent() {
    let cfg = RealtimeConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.outbound_buffer, DEFAULT_OUTBOUND_BUFFER);
    assert_eq!(cfg.presence_stale, Duration::from_secs(60));
    assert!(cfg.snapshot_on_join);
    assert!(!cfg.htmx_fragments);
}

#[test]
fn validate_rejects_zero_buffer() {
    let cfg = RealtimeConfig { outbound_buffer: 0, ..RealtimeConfig::default() };
    assert!(matches!(cfg.validate(), Err(ConfigError::Inconsistent(_))));
}

#[test]
fn validate_rejects_timeout_not_exceeding_interval() {
    let cfg = RealtimeConfig {
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_timeout: Duration::from_secs(30),
        ..RealtimeConfig::default()
    };
    assert!(matches!(cfg.validate(), Err(ConfigError::Inconsistent(_))));
}

#[test]
fn validate_rejects_zero_sweep_interval() {
    let cfg = RealtimeConfig { sweep_interval: Duration::ZERO, ..RealtimeConfig::default() };
    assert!(cfg.validate().is_err());
}

#[test]
fn parse_bool_accepts_common_spellings() {
    for raw in ["1", "true", "YES", " on "] {
        assert_eq!(parse_bool(raw), Some(true), "{raw}");
    }
    for raw in ["0", "false", "No", "off"] {
        assert_eq!(parse_bool(raw), Some(false), "{raw}");
    }
    assert_eq!(parse_bool("maybe"), None);
}

/// The only test that touches process env; keys are cleared afterwards.
#[test]
fn from_env_reads_overrides_and_falls_back_on_garbage() {
    // SAFETY: no other test in this crate reads or writes these keys.
    unsafe {
        std::env::set_var("WS_OUTBOUND_BUFFER", "8");
        std::env::set_var("WS_HEARTBEAT_INTERVAL_SECS", "5");
        std::env::set_var("WS_HEARTBEAT_TIMEOUT_SECS", "not-a-number");
        std::env::set_var("HTMX_FRAGMENTS", "yes");
    }

    let cfg = RealtimeConfig::from_env().expect("config should parse");
    assert_eq!(cfg.outbound_buffer, 8);
    assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
    assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS));
    assert!(cfg.htmx_fragments);

    unsafe {
        std::env::remove_var("WS_OUTBOUND_BUFFER");
        std::env::remove_var("WS_HEARTBEAT_INTERVAL_SECS");
        std::env::remove_var("WS_HEARTBEAT_TIMEOUT_SECS");
        std::env::remove_var("HTMX_FRAGMENTS");
    }
}
