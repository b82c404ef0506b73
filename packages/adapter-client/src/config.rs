use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::channel::ChannelOptions;
use crate::metrics::{DEFAULT_EVENT_LIMIT, DEFAULT_REPORT_INTERVAL};
use crate::model::DEFAULT_MODEL_CHANNEL;

/// Client configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub principal: Option<String>,
    pub password: Option<String>,
    pub model_channel: String,
    /// `None` when requests never time out.
    pub request_timeout: Option<Duration>,
    pub metrics_event_limit: usize,
    pub metrics_report_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            secure: false,
            principal: None,
            password: None,
            model_channel: DEFAULT_MODEL_CHANNEL.to_string(),
            request_timeout: ChannelOptions::default().request_timeout,
            metrics_event_limit: DEFAULT_EVENT_LIMIT,
            metrics_report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let request_timeout = match lookup("REQUEST_TIMEOUT_MS") {
            Some(value) => {
                let millis: u64 = value
                    .parse()
                    .context("REQUEST_TIMEOUT_MS must be a number of milliseconds")?;
                (millis > 0).then(|| Duration::from_millis(millis))
            }
            None => defaults.request_timeout,
        };

        let metrics_report_interval = match lookup("METRICS_REPORT_INTERVAL_SECS") {
            Some(value) => {
                let secs: u64 = value
                    .parse()
                    .context("METRICS_REPORT_INTERVAL_SECS must be a number of seconds")?;
                anyhow::ensure!(secs > 0, "METRICS_REPORT_INTERVAL_SECS must be positive");
                Duration::from_secs(secs)
            }
            None => defaults.metrics_report_interval,
        };

        Ok(Self {
            host: lookup("ADAPTER_HOST").unwrap_or(defaults.host),
            port: match lookup("ADAPTER_PORT") {
                Some(port) => port.parse().context("ADAPTER_PORT must be a valid port")?,
                None => defaults.port,
            },
            secure: match lookup("ADAPTER_SECURE") {
                Some(secure) => secure
                    .parse()
                    .context("ADAPTER_SECURE must be true or false")?,
                None => defaults.secure,
            },
            principal: lookup("ADAPTER_PRINCIPAL"),
            password: lookup("ADAPTER_PASSWORD"),
            model_channel: lookup("MODEL_CHANNEL").unwrap_or(defaults.model_channel),
            request_timeout,
            metrics_event_limit: match lookup("METRICS_EVENT_LIMIT") {
                Some(limit) => limit
                    .parse()
                    .context("METRICS_EVENT_LIMIT must be a number")?,
                None => defaults.metrics_event_limit,
            },
            metrics_report_interval,
        })
    }

    /// URL of the adapter's server.
    pub fn server_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Options for request channels.
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            request_timeout: self.request_timeout,
        }
    }
}
