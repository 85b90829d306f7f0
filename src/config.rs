use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

const DEFAULT_ENV: &str = "development";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] ConfigError),
    #[error("configuration validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Application configuration with validation.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Deployment environment name (development, staging, production)
    pub environment: String,

    /// Default log filter level
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Create tables from entity definitions on startup (sqlite/dev)
    #[serde(default)]
    pub auto_schema: bool,

    /// JWT secret used to verify admin bearer tokens
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Payment processor secret API key
    pub stripe_secret_key: String,

    /// Shared secret for verifying inbound payment webhooks
    pub stripe_webhook_secret: String,

    /// Maximum accepted webhook timestamp skew in seconds
    #[serde(default = "default_webhook_tolerance")]
    pub webhook_tolerance_secs: u64,

    /// Customer-facing base URL for checkout redirects
    pub storefront_base_url: String,

    /// Transactional email HTTP endpoint; empty disables outbound email
    #[serde(default)]
    pub email_endpoint: String,

    /// Sender address stamped on outbound email
    #[serde(default = "default_email_from")]
    pub email_from: String,

    /// ISO currency code used for all orders
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Max DB pool connections
    #[serde(default = "default_max_connections")]
    pub db_max_connections: u32,
}

fn default_webhook_tolerance() -> u64 {
    300
}

fn default_email_from() -> String {
    "orders@example.com".to_string()
}

fn default_currency() -> String {
    "EUR".to_string()
}

fn default_max_connections() -> u32 {
    10
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Loads configuration from `config/{default,<env>}.toml` with `APP__`
/// environment overrides.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // jwt_secret and the Stripe keys have no defaults on purpose: they must
    // come from the environment or a config file.
    let builder = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("auto_schema", false)?
        .set_default("storefront_base_url", "http://localhost:3000")?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false));

    let config = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET with a secure random string.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    Ok(app_config)
}

/// Initializes tracing using the provided log level as the default filter.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::try_new(filter_directive)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}
