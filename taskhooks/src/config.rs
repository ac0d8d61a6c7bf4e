//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `TASKHOOKS_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `TASKHOOKS_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `TASKHOOKS_WEBHOOKS__MAX_ATTEMPTS=3` sets the `webhooks.max_attempts` field.
//!
//! ## Usage
//!
//! ```no_run
//! use clap::Parser;
//! use taskhooks::config::{Args, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let args = Args::parse();
//! let config = Config::load(&args)?;
//!
//! println!("Server will bind to {}:{}", config.host, config.port);
//! # Ok(())
//! # }
//! ```
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Override server port
//! TASKHOOKS_PORT=8080
//!
//! # Tighten the outbound request timeout
//! TASKHOOKS_WEBHOOKS__REQUEST_TIMEOUT=10s
//!
//! # Accept duplicate URLs within an account
//! TASKHOOKS_WEBHOOKS__DUPLICATE_URLS=allow
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "TASKHOOKS_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have sensible defaults defined in the `Default` implementation, so an empty
/// (or missing) config file yields a runnable service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Install a Prometheus recorder and serve `/metrics`
    pub enable_metrics: bool,
    /// Export traces over OTLP (configured through the standard `OTEL_*` environment variables)
    pub enable_otel_export: bool,
    /// Webhook registration and delivery settings
    pub webhooks: WebhookConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            enable_metrics: true,
            enable_otel_export: false,
            webhooks: WebhookConfig::default(),
        }
    }
}

/// What to do when an account registers a URL it already has an endpoint for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateUrlPolicy {
    /// Registration fails with a conflict
    Reject,
    /// Each registration creates an independent endpoint with its own secret
    Allow,
}

/// Webhook delivery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    /// Timeout for each outbound delivery request (default: 30s)
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Timeout for the registration test probe (default: 10s)
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Total attempts per (event, endpoint) pair, including the first (default: 5)
    pub max_attempts: u32,
    /// Delay schedule between attempts
    pub backoff: BackoffConfig,
    /// Consecutive exhausted deliveries before an endpoint is disabled automatically.
    /// `null` turns automatic disabling off (default: 5)
    pub failure_threshold: Option<u32>,
    /// Maximum concurrent outbound HTTP requests (default: 20)
    pub max_concurrent_sends: usize,
    /// Policy for registering a URL twice on the same account (default: reject)
    pub duplicate_urls: DuplicateUrlPolicy,
    /// Accept plain `http://` endpoint URLs. Only meant for local development (default: false)
    pub allow_insecure_urls: bool,
    /// Number of delivery records kept for inspection (default: 10000)
    pub delivery_log_capacity: u64,
    /// How long delivery records are kept for inspection (default: 24h)
    #[serde(with = "humantime_serde")]
    pub delivery_retention: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_attempts: 5,
            backoff: BackoffConfig::default(),
            failure_threshold: Some(5),
            max_concurrent_sends: 20,
            duplicate_urls: DuplicateUrlPolicy::Reject,
            allow_insecure_urls: false,
            delivery_log_capacity: 10_000,
            delivery_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Exponential backoff between delivery attempts.
///
/// The delay before retry `n` (1-based) is `initial_delay * multiplier^(n-1)`, capped at
/// `max_delay` and then spread by up to `jitter` (a fraction of the delay) in either direction.
/// With the defaults the nominal schedule is 5s, 20s, 80s, 320s.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            multiplier: 4.0,
            max_delay: Duration::from_secs(600),
            jitter: 0.1,
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables override specific values; TASKHOOKS_CONFIG names the file itself
            .merge(Env::prefixed("TASKHOOKS_").ignore(&["config"]).split("__"))
    }

    pub fn validate(&self) -> Result<(), Error> {
        let webhooks = &self.webhooks;

        if webhooks.max_attempts < 1 {
            return Err(Error::Validation {
                message: "Config validation: webhooks.max_attempts must be at least 1".to_string(),
            });
        }

        if webhooks.max_concurrent_sends < 1 {
            return Err(Error::Validation {
                message: "Config validation: webhooks.max_concurrent_sends must be at least 1".to_string(),
            });
        }

        if webhooks.request_timeout.is_zero() || webhooks.probe_timeout.is_zero() {
            return Err(Error::Validation {
                message: "Config validation: webhook request and probe timeouts must be non-zero".to_string(),
            });
        }

        if webhooks.failure_threshold == Some(0) {
            return Err(Error::Validation {
                message: "Config validation: webhooks.failure_threshold must be at least 1 (or null to disable)".to_string(),
            });
        }

        let backoff = &webhooks.backoff;
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(Error::Validation {
                message: format!(
                    "Config validation: webhooks.backoff.multiplier ({}) must be a finite number >= 1.0",
                    backoff.multiplier
                ),
            });
        }

        if !(0.0..1.0).contains(&backoff.jitter) {
            return Err(Error::Validation {
                message: format!(
                    "Config validation: webhooks.backoff.jitter ({}) must be in the range [0.0, 1.0)",
                    backoff.jitter
                ),
            });
        }

        if backoff.initial_delay > backoff.max_delay {
            return Err(Error::Validation {
                message: format!(
                    "Config validation: webhooks.backoff.initial_delay ({:?}) cannot be greater than max_delay ({:?})",
                    backoff.initial_delay, backoff.max_delay
                ),
            });
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
