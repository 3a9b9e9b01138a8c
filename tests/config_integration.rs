use serial_test::serial;
use std::env;
use std::fs;
use std::io::Write;
use tool_gateway::config::{AppConfig, LogFormat};

const ARGV0: &str = "tool-gateway";

// Helper to clear environment variables that might interfere with tests
fn clear_env_vars() {
    unsafe {
        for var in [
            "TOOLGW_SERVER__PORT",
            "TOOLGW_GATEWAY__DEV_MODE",
            "TOOLGW_GATEWAY__MAX_TIMEOUT_SECS",
            "TOOLGW_SECURITY__JWT_REQUIRED",
            "TOOLGW_MONITORING__ENABLED",
            "CONFIG_FILE",
            "PORT",
            "DEV_MODE",
            "JWT_REQUIRED",
            "RATE_LIMIT_ENABLED",
            "LOG_FORMAT",
        ] {
            env::remove_var(var);
        }
    }
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();

    let config = AppConfig::load_from_args([ARGV0]).expect("defaults should load");
    assert_eq!(config.server.port, 3000);
    assert!(!config.gateway.dev_mode);
    assert_eq!(config.logging.format, LogFormat::Compact);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_env_override() {
    clear_env_vars();
    unsafe {
        env::set_var("TOOLGW_SERVER__PORT", "9090");
        env::set_var("TOOLGW_GATEWAY__DEV_MODE", "true");
        env::set_var("TOOLGW_MONITORING__ENABLED", "false");
    }

    let config = AppConfig::load_from_args([ARGV0]).expect("Failed to load config");
    assert_eq!(config.server.port, 9090);
    assert!(config.gateway.dev_mode);
    assert!(!config.monitoring.enabled);

    clear_env_vars();
}

#[test]
#[serial]
fn test_cli_beats_env() {
    clear_env_vars();
    unsafe {
        env::set_var("TOOLGW_SERVER__PORT", "9090");
    }

    let config = AppConfig::load_from_args([
        ARGV0,
        "--port",
        "8181",
        "--dev-mode",
        "true",
        "--log-format",
        "json",
    ])
    .expect("Failed to load config");
    assert_eq!(config.server.port, 8181);
    assert!(config.gateway.dev_mode);
    assert_eq!(config.logging.format, LogFormat::Json);

    clear_env_vars();
}

#[test]
#[serial]
fn test_file_load() {
    clear_env_vars();

    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("Failed to create temp config");
    writeln!(
        file,
        r#"
server:
  port: 7070
gateway:
  dev_mode: true
  default_timeout_secs: 10
  max_timeout_secs: 60
monitoring:
  max_execution_time_ms: 250
"#
    )
    .unwrap();

    let path = file.path().to_str().unwrap().to_string();
    let config =
        AppConfig::load_from_args([ARGV0, "--config", path.as_str()]).expect("Failed to load config");
    assert_eq!(config.server.port, 7070);
    assert!(config.gateway.dev_mode);
    assert_eq!(config.gateway.default_timeout_secs, 10);
    assert_eq!(config.gateway.max_timeout_secs, 60);
    assert_eq!(config.monitoring.max_execution_time_ms, 250);
    // Untouched sections keep their defaults.
    assert_eq!(config.monitoring.max_concurrent_executions, 50);
}

#[test]
#[serial]
fn test_missing_explicit_file_fails() {
    clear_env_vars();
    let result = AppConfig::load_from_args([ARGV0, "--config", "/nonexistent/gateway.yaml"]);
    assert!(result.is_err());
}

#[test]
#[serial]
fn test_file_values_fail_validation() {
    clear_env_vars();

    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("Failed to create temp config");
    writeln!(
        file,
        "gateway:\n  default_timeout_secs: 600\n  max_timeout_secs: 300\n"
    )
    .unwrap();

    let path = file.path().to_str().unwrap().to_string();
    let config = AppConfig::load_from_args([ARGV0, "--config", path.as_str()]).unwrap();
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn test_cwd_config_fallback() {
    clear_env_vars();

    let cwd_path = "config.yaml";
    fs::write(cwd_path, "server:\n  port: 6060\n").expect("Failed to write ./config.yaml");

    let config = AppConfig::load_from_args([ARGV0]);
    fs::remove_file(cwd_path).unwrap();

    assert_eq!(config.expect("Failed to load config").server.port, 6060);
}
