use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;

/// Prefix for environment overrides, e.g. `TOOLGW_GATEWAY__DEV_MODE=true`.
pub const ENV_PREFIX: &str = "TOOLGW";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Mount the tool execution endpoints
    #[arg(long, env = "DEV_MODE")]
    pub dev_mode: Option<bool>,

    /// Require JWT authentication
    #[arg(long, env = "JWT_REQUIRED")]
    pub jwt_required: Option<bool>,

    /// Enable rate limiting
    #[arg(long, env = "RATE_LIMIT_ENABLED")]
    pub rate_limit_enabled: Option<bool>,

    /// Log output format (compact or json)
    #[arg(long, env = "LOG_FORMAT")]
    pub log_format: Option<LogFormat>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub resilience: ResilienceConfig,
    pub gateway: GatewayConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub jwt_required: bool,
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ResilienceConfig {
    pub rate_limit_enabled: bool,
    pub requests_per_second: f32,
    pub burst_size: f32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            rate_limit_enabled: true,
            requests_per_second: 20.0,
            burst_size: 40.0,
        }
    }
}

/// Tool execution surface.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    /// The `/api/tools` routes exist only when this is set.
    pub dev_mode: bool,
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub max_request_bytes: usize,
    pub max_parallel_executions: usize,
    pub max_pending_executions: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            default_timeout_secs: 30,
            max_timeout_secs: 300,
            max_request_bytes: 1024 * 1024,
            max_parallel_executions: 64,
            max_pending_executions: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub max_execution_time_ms: u64,
    pub max_concurrent_executions: u64,
    pub max_queue_depth: u64,
    pub max_error_rate_percent: f64,
    pub max_timeout_rate_percent: f64,
    pub alert_retention_hours: u64,
    pub cleanup_interval_secs: u64,
    pub alert_queue_capacity: usize,
    pub max_stored_alerts: usize,
    /// Address for the Prometheus scrape endpoint, e.g. `0.0.0.0:9000`.
    pub prometheus_listen: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_execution_time_ms: 5_000,
            max_concurrent_executions: 50,
            max_queue_depth: 100,
            max_error_rate_percent: 10.0,
            max_timeout_rate_percent: 5.0,
            alert_retention_hours: 24,
            cleanup_interval_secs: 300,
            alert_queue_capacity: 256,
            max_stored_alerts: 1_000,
            prometheus_listen: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    fn as_str(self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Layers defaults, config file, `TOOLGW_` environment and CLI flags,
    /// in increasing priority.
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder();

        // Explicit file must exist; ./config.{yaml,toml,json} is optional.
        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("config").required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(dev_mode) = cli.dev_mode {
            builder = builder.set_override("gateway.dev_mode", dev_mode)?;
        }
        if let Some(jwt) = cli.jwt_required {
            builder = builder.set_override("security.jwt_required", jwt)?;
        }
        if let Some(rl) = cli.rate_limit_enabled {
            builder = builder.set_override("resilience.rate_limit_enabled", rl)?;
        }
        if let Some(format) = cli.log_format {
            builder = builder.set_override("logging.format", format.as_str())?;
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }

    /// Rejects combinations the gateway cannot run with.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let fail = |msg: &str| Err(config::ConfigError::Message(msg.to_string()));
        let gateway = &self.gateway;

        if gateway.default_timeout_secs == 0 {
            return fail("gateway.default_timeout_secs must be positive");
        }
        if gateway.default_timeout_secs > gateway.max_timeout_secs {
            return fail("gateway.default_timeout_secs exceeds gateway.max_timeout_secs");
        }
        if gateway.max_parallel_executions == 0 {
            return fail("gateway.max_parallel_executions must be positive");
        }
        if gateway.max_request_bytes == 0 {
            return fail("gateway.max_request_bytes must be positive");
        }
        if self.security.jwt_required && self.security.jwt_secret.is_empty() {
            return fail("security.jwt_secret is required when security.jwt_required is set");
        }
        if self.resilience.rate_limit_enabled
            && !(self.resilience.requests_per_second > 0.0 && self.resilience.burst_size >= 1.0)
        {
            return fail("resilience limits must be positive when rate limiting is enabled");
        }
        if self.monitoring.alert_queue_capacity == 0 {
            return fail("monitoring.alert_queue_capacity must be positive");
        }
        if self.monitoring.cleanup_interval_secs == 0 {
            return fail("monitoring.cleanup_interval_secs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_closed() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.gateway.dev_mode);
        assert_eq!(config.gateway.default_timeout_secs, 30);
        assert_eq!(config.gateway.max_timeout_secs, 300);
        assert!(config.monitoring.enabled);
    }

    #[test]
    fn validate_rejects_inconsistent_values() {
        let mut config = AppConfig::default();
        config.gateway.default_timeout_secs = 600;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.gateway.max_parallel_executions = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.security.jwt_required = true;
        assert!(config.validate().is_err());
        config.security.jwt_secret = "s3cret".into();
        assert!(config.validate().is_ok());
    }
}
