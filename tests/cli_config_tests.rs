//! Command line and environment parsing into a run configuration.

use std::env;
use std::io::Write;
use std::time::Duration;

use clap::Parser;
use serial_test::serial;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;

use ws_loadtest::client::{Dialer, DEFAULT_USER_AGENT};
use ws_loadtest::config::{CliArgs, Config};
use ws_loadtest::errors::ConfigError;
use ws_loadtest::report::ReportFormat;
use ws_loadtest::utils::normalize_long_flags;

/// Clear all env vars that could affect flag parsing.
fn clean_env() {
    for var in [
        "TARGET_URL",
        "NUM_CONNECTIONS",
        "RAMP_RATE",
        "TEST_DURATION",
        "SKIP_TLS_VERIFY",
        "RESOLVE_TARGET_ADDR",
        "DIAL_TIMEOUT_SECS",
        "REPORT_FORMAT",
        "METRICS_PORT",
    ] {
        env::remove_var(var);
    }
}

fn parse(args: &[&str]) -> Result<Config, ConfigError> {
    let argv = std::iter::once("ws_loadtest")
        .chain(args.iter().copied())
        .map(Into::into);
    let cli = CliArgs::try_parse_from(normalize_long_flags(argv)).expect("flags should parse");
    Config::from_args(cli)
}

#[test]
#[serial]
fn defaults_apply_when_only_url_given() {
    clean_env();
    let config = parse(&["ws://localhost:8080/feed"]).unwrap();

    assert_eq!(config.target_url, "ws://localhost:8080/feed");
    assert_eq!(config.num_connections, 50);
    assert_eq!(config.ramp_rate, 50);
    assert_eq!(config.test_duration, Duration::from_secs(300));
    assert_eq!(config.dial_timeout, Duration::from_secs(20));
    assert_eq!(config.report_format, ReportFormat::Text);
    assert!(config.payload.is_none());
    assert!(config.resolve.is_none());
    assert!(!config.skip_tls_verify);
}

#[test]
#[serial]
fn short_flags_are_applied() {
    clean_env();
    let config = parse(&[
        "-c", "10", "-q", "3", "-z", "1m30s", "-k", "-vv", "-t", "7",
        "-H", "Authorization: Bearer abc", "-H", "X-Trace: on",
        "wss://stream.example.com/",
    ])
    .unwrap();

    assert_eq!(config.num_connections, 10);
    assert_eq!(config.ramp_rate, 3);
    assert_eq!(config.test_duration, Duration::from_secs(90));
    assert!(config.skip_tls_verify);
    assert!(config.very_verbose());
    assert_eq!(config.dial_timeout, Duration::from_secs(7));
    assert_eq!(config.headers.get("authorization").unwrap(), "Bearer abc");
    assert_eq!(config.headers.get("x-trace").unwrap(), "on");
}

#[test]
#[serial]
fn single_dash_resolve_is_accepted() {
    clean_env();
    let config = parse(&["-resolve", "example.com:443:10.0.0.1,10.0.0.2", "ws://example.com/"])
        .unwrap();

    let ao = config.address_override().unwrap().unwrap();
    assert_eq!(ao.host(), "example.com");
    assert_eq!(ao.addresses(), ["10.0.0.1", "10.0.0.2"]);
}

#[test]
#[serial]
fn env_vars_fill_in_missing_flags() {
    clean_env();
    env::set_var("TARGET_URL", "ws://env.example.com/");
    env::set_var("NUM_CONNECTIONS", "4");
    env::set_var("TEST_DURATION", "10s");
    env::set_var("REPORT_FORMAT", "json");

    let config = parse(&[]).unwrap();
    clean_env();

    assert_eq!(config.target_url, "ws://env.example.com/");
    assert_eq!(config.num_connections, 4);
    assert_eq!(config.test_duration, Duration::from_secs(10));
    assert_eq!(config.report_format, ReportFormat::Json);
}

#[test]
#[serial]
fn flags_win_over_env_vars() {
    clean_env();
    env::set_var("NUM_CONNECTIONS", "4");

    let config = parse(&["-c", "9", "ws://localhost/"]).unwrap();
    clean_env();

    assert_eq!(config.num_connections, 9);
}

#[test]
#[serial]
fn payload_file_wins_over_inline_data() {
    clean_env();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"{\"subscribe\":\"ticker\"}").unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let config = parse(&["-d", "inline", "-D", &path, "ws://localhost/"]).unwrap();
    assert_eq!(config.payload.as_deref(), Some(&b"{\"subscribe\":\"ticker\"}"[..]));

    let config = parse(&["-d", "inline", "ws://localhost/"]).unwrap();
    assert_eq!(config.payload.as_deref(), Some(&b"inline"[..]));
}

#[test]
#[serial]
fn missing_payload_file_is_a_config_error() {
    clean_env();
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.bin");

    let err = parse(&["-D", missing.to_str().unwrap(), "ws://localhost/"]).unwrap_err();
    assert!(matches!(err, ConfigError::PayloadFile { .. }), "got {:?}", err);
}

#[test]
#[serial]
fn malformed_inputs_are_rejected() {
    clean_env();
    assert!(matches!(
        parse(&["-H", "no colon here", "ws://localhost/"]).unwrap_err(),
        ConfigError::InvalidHeader(_)
    ));
    assert!(matches!(
        parse(&["-z", "5 parsecs", "ws://localhost/"]).unwrap_err(),
        ConfigError::InvalidDuration { .. }
    ));
    assert!(matches!(
        parse(&["--resolve", "example.com:443", "ws://localhost/"]).unwrap_err(),
        ConfigError::InvalidResolve { .. }
    ));
    assert!(matches!(
        parse(&["-c", "0", "ws://localhost/"]).unwrap_err(),
        ConfigError::InvalidValue { .. }
    ));
}

#[test]
#[serial]
fn user_agent_precedence() {
    clean_env();

    let config = parse(&["ws://localhost/"]).unwrap();
    let dialer = Dialer::new(&config.target_url, config.to_dialer_config().unwrap()).unwrap();
    assert_eq!(dialer.headers().get(USER_AGENT).unwrap(), DEFAULT_USER_AGENT);

    let config = parse(&["-H", "User-Agent: from-header", "ws://localhost/"]).unwrap();
    let dialer = Dialer::new(&config.target_url, config.to_dialer_config().unwrap()).unwrap();
    assert_eq!(dialer.headers().get(USER_AGENT).unwrap(), "from-header");

    let config = parse(&[
        "-H", "User-Agent: from-header", "-U", "from-flag", "ws://localhost/",
    ])
    .unwrap();
    let dialer = Dialer::new(&config.target_url, config.to_dialer_config().unwrap()).unwrap();
    assert_eq!(dialer.headers().get(USER_AGENT).unwrap(), "from-flag");
}
