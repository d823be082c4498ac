use clap::Parser;

use super::*;

#[test]
fn defaults_are_applied() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.environment, RuntimeEnvironment::Development);
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.cache.default_ttl, Duration::from_secs(300));
    assert_eq!(settings.cache.max_entries.get(), 1000);
    assert_eq!(settings.cache.sweep_interval, Some(Duration::from_secs(60)));
    assert_eq!(settings.cache.key_prefix, "concierge:");
    assert_eq!(settings.cache.remote_timeout, Duration::from_millis(250));
    assert!(!settings.cache.remote_enabled);
    assert_eq!(settings.pagination.default_limit.get(), 20);
    assert_eq!(settings.pagination.max_limit.get(), 100);
    assert_eq!(settings.monitor.slow_threshold, Duration::from_millis(500));
    assert_eq!(settings.monitor.sample_limit.get(), 1000);
    assert_eq!(settings.monitor.repetition_threshold.get(), 10);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.cache.max_entries = Some(50);
    raw.logging.level = Some("info".to_string());

    let overrides = SettingsOverrides {
        cache_max_entries: Some(75),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.max_entries.get(), 75);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn remote_tier_requires_production() {
    let mut raw = RawSettings::default();
    raw.cache.remote_url = Some("redis://127.0.0.1:6379/".to_string());

    let development = Settings::from_raw(raw.clone()).expect("valid settings");
    assert!(!development.cache.remote_enabled);
    assert!(development.cache.remote_url.is_some());

    raw.environment = Some("production".to_string());
    let production = Settings::from_raw(raw).expect("valid settings");
    assert!(production.cache.remote_enabled);
}

#[test]
fn blank_remote_url_is_ignored() {
    let mut raw = RawSettings::default();
    raw.environment = Some("production".to_string());
    raw.cache.remote_url = Some("   ".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.cache.remote_url.is_none());
    assert!(!settings.cache.remote_enabled);
}

#[test]
fn remote_url_scheme_is_validated() {
    let mut raw = RawSettings::default();
    raw.cache.remote_url = Some("http://cache.internal".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid scheme");
    assert!(matches!(err, LoadError::Invalid { key: "cache.remote_url", .. }));
}

#[test]
fn zero_bounds_are_rejected() {
    let cases: [(&str, fn(&mut RawSettings)); 4] = [
        ("cache.max_entries", |raw| raw.cache.max_entries = Some(0)),
        ("cache.default_ttl_seconds", |raw| {
            raw.cache.default_ttl_seconds = Some(0)
        }),
        ("pagination.max_limit", |raw| raw.pagination.max_limit = Some(0)),
        ("monitor.sample_limit", |raw| raw.monitor.sample_limit = Some(0)),
    ];

    for (expected_key, mutate) in cases {
        let mut raw = RawSettings::default();
        mutate(&mut raw);
        match Settings::from_raw(raw) {
            Err(LoadError::Invalid { key, .. }) => assert_eq!(key, expected_key),
            other => panic!("expected invalid `{expected_key}`, got {other:?}"),
        }
    }
}

#[test]
fn zero_sweep_interval_disables_sweeping() {
    let mut raw = RawSettings::default();
    raw.cache.sweep_interval_seconds = Some(0);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.cache.sweep_interval.is_none());
}

#[test]
fn default_limit_cannot_exceed_max_limit() {
    let mut raw = RawSettings::default();
    raw.pagination.default_limit = Some(50);
    raw.pagination.max_limit = Some(25);

    let err = Settings::from_raw(raw).expect_err("default above max");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "pagination.default_limit",
            ..
        }
    ));
}

#[test]
fn unknown_environment_and_level_are_rejected() {
    let mut raw = RawSettings::default();
    raw.environment = Some("staging".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "environment", .. })
    ));

    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "logging.level", .. })
    ));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = SettingsOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_check_command() {
    let args = CliArgs::parse_from(["concierge"]);
    let command = args.command.unwrap_or_default();
    assert!(matches!(command, Command::Check(_)));
}

#[test]
fn parse_check_overrides() {
    let args = CliArgs::parse_from([
        "concierge",
        "check",
        "--environment",
        "production",
        "--cache-remote-url",
        "redis://cache:6379/",
        "--log-json",
        "yes",
        "--probe-requests",
        "5",
    ]);

    match args.command.expect("check command") {
        Command::Check(check) => {
            assert_eq!(check.overrides.environment.as_deref(), Some("production"));
            assert_eq!(
                check.overrides.cache_remote_url.as_deref(),
                Some("redis://cache:6379/")
            );
            assert_eq!(check.overrides.log_json, Some(true));
            assert_eq!(check.probe_requests, 5);
        }
    }
}

#[test]
fn with_overrides_skips_files_and_environment() {
    let settings = Settings::with_overrides(&SettingsOverrides {
        environment: Some("prod".to_string()),
        cache_remote_url: Some("rediss://cache:6380/".to_string()),
        ..Default::default()
    })
    .expect("valid settings");

    assert_eq!(settings.environment, RuntimeEnvironment::Production);
    assert!(settings.cache.remote_enabled);
}

#[test]
fn zero_remote_timeout_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.remote_timeout_ms = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero timeout");
    assert!(matches!(
        err,
        LoadError::Invalid { key: "cache.remote_timeout_ms", .. }
    ));
}
