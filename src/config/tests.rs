use std::io::Write;
use std::time::Duration;

use crate::cache::{ExpirationPolicy, RegionPolicies};

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.cache.lock_timeout_ms = 1000;
    raw.logging.level = Some("info".to_string());

    let overrides = Overrides {
        lock_timeout_ms: Some(250),
        log_level: Some("debug".to_string()),
        strategy: Some("lock_free".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides).expect("valid overrides");
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.lock_timeout_ms, 250);
    assert_eq!(settings.cache.strategy, StrategyKind::LockFree);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert_eq!(settings.cache.strategy, StrategyKind::LockTable);
    assert_eq!(settings.cache.lock_timeout(), Duration::from_secs(15));
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = Overrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides).expect("valid overrides");
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn unknown_strategy_is_rejected() {
    let mut raw = RawSettings::default();
    let overrides = Overrides {
        strategy: Some("spinlock".to_string()),
        ..Default::default()
    };

    let err = raw.apply_overrides(&overrides).expect_err("invalid strategy");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.strategy",
            ..
        }
    ));
}

#[test]
fn zero_timeouts_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.lock_timeout_ms = 0;
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.cache.spin_timeout_ms = 0;
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn config_file_supplies_cache_settings() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config file");
    writeln!(
        file,
        r#"
[logging]
level = "warn"

[cache]
strategy = "lock_free"
spin_timeout_ms = 20
default_expiration_secs = 90

[cache.regions]
Page = 60
EntityModel = {{ sliding = 120 }}
"#
    )
    .expect("write config");

    let cli = CliArgs::try_parse_from([
        "regioncache",
        "--config-file",
        file.path().to_str().expect("utf-8 path"),
    ])
    .expect("parse cli");
    let settings = load(&cli).expect("load settings");

    assert_eq!(settings.logging.level, LevelFilter::WARN);
    assert_eq!(settings.cache.strategy, StrategyKind::LockFree);
    assert_eq!(settings.cache.spin_timeout(), Duration::from_millis(20));

    let policies = RegionPolicies::from_config(&settings.cache);
    assert_eq!(
        policies.resolve("Page"),
        ExpirationPolicy::Absolute(Duration::from_secs(60))
    );
    assert_eq!(
        policies.resolve("EntityModel"),
        ExpirationPolicy::Sliding(Duration::from_secs(120))
    );
    assert_eq!(
        policies.resolve("Unconfigured"),
        ExpirationPolicy::Absolute(Duration::from_secs(90))
    );
}

#[test]
fn cli_flag_beats_config_file() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config file");
    writeln!(file, "[cache]\nstrategy = \"lock_free\"").expect("write config");

    let cli = CliArgs::try_parse_from([
        "regioncache",
        "--config-file",
        file.path().to_str().expect("utf-8 path"),
        "--cache-strategy",
        "lock_table",
    ])
    .expect("parse cli");
    let settings = load(&cli).expect("load settings");

    assert_eq!(settings.cache.strategy, StrategyKind::LockTable);
}

#[test]
fn no_subcommand_is_accepted() {
    let cli = CliArgs::try_parse_from(["regioncache"]).expect("parse cli");
    assert!(cli.command.is_none());
}

#[test]
fn parse_soak_arguments() {
    let cli = CliArgs::try_parse_from([
        "regioncache",
        "soak",
        "--threads",
        "32",
        "--keys",
        "4",
        "--work-ms",
        "1",
        "--cache-strategy",
        "lock_free",
    ])
    .expect("parse cli");

    match cli.command {
        Some(Command::Soak(args)) => {
            assert_eq!(args.threads, 32);
            assert_eq!(args.keys, 4);
            assert_eq!(args.rounds, 4);
            assert_eq!(args.work_ms, 1);
            assert_eq!(args.region, "Page");
        }
        other => panic!("unexpected command: {other:?}"),
    }
    assert_eq!(cli.overrides.strategy.as_deref(), Some("lock_free"));
}

#[test]
fn parse_invalidate_arguments() {
    let cli = CliArgs::try_parse_from(["regioncache", "invalidate", "--identifier", "item-42"])
        .expect("parse cli");

    match cli.command {
        Some(Command::Invalidate(args)) => {
            assert_eq!(args.identifier, "item-42");
            assert_eq!(args.entries, 3);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}
