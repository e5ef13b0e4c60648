//! Server configuration loaded from the environment

use std::time::Duration;

use photovault_billing::ProcessorSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    /// Direct (non-pooled) URL used for migrations when set
    pub database_direct_url: Option<String>,
    pub run_migrations: bool,
    pub stripe_webhook_secret: String,
    pub app_base_url: String,
    pub beta_coupon_id: String,
    pub beta_locked_price_cents: i64,
    pub churn_stats_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = ProcessorSettings::default();

        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: required("DATABASE_URL")?,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            run_migrations: parse_or("RUN_MIGRATIONS", false)?,
            stripe_webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            app_base_url: std::env::var("APP_BASE_URL").unwrap_or(defaults.app_base_url),
            beta_coupon_id: std::env::var("BETA_COUPON_ID").unwrap_or(defaults.beta_coupon_id),
            beta_locked_price_cents: parse_or(
                "BETA_LOCKED_PRICE_CENTS",
                defaults.beta_locked_price_cents,
            )?,
            churn_stats_timeout: Duration::from_millis(parse_or(
                "CHURN_STATS_TIMEOUT_MS",
                defaults.churn_stats_timeout.as_millis() as u64,
            )?),
        })
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            app_base_url: self.app_base_url.clone(),
            beta_coupon_id: self.beta_coupon_id.clone(),
            beta_locked_price_cents: self.beta_locked_price_cents,
            churn_stats_timeout: self.churn_stats_timeout,
        }
    }
}

// Secrets stay out of logs
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("database_url", &"[REDACTED]")
            .field("run_migrations", &self.run_migrations)
            .field("stripe_webhook_secret", &"[REDACTED]")
            .field("app_base_url", &self.app_base_url)
            .field("beta_coupon_id", &self.beta_coupon_id)
            .field("beta_locked_price_cents", &self.beta_locked_price_cents)
            .field("churn_stats_timeout", &self.churn_stats_timeout)
            .finish()
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        _ => Ok(default),
    }
}
