use config::{Config as ConfigBuilder, Environment, File};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

use crate::error::Result;
use crate::session::{Credentials, Transport};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
}

/// Downstream push server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Shared-secret gate for subscriber connections; `None` disables
    /// authentication
    pub basic_auth: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            basic_auth: None,
        }
    }
}

/// Upstream platform settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Gateway endpoint template; `{room_id}` is substituted per room
    pub gateway_url: String,
    /// Platform session cookie; may arrive URL-encoded from the
    /// environment
    pub sess_data: String,
    /// Upstream transport: "ws" or "tcp"; unknown values fall back to ws
    pub transport: String,
    /// Cron schedule (with seconds field) for the fleet reconnect sweep;
    /// absent disables sweeps
    pub reconnect_cron: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            gateway_url: "ws://127.0.0.1:3100/feed/{room_id}".to_string(),
            sess_data: String::new(),
            transport: "ws".to_string(),
            reconnect_cron: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" for development, "json" for production
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional file overlaid with
    /// `DMRELAY_`-prefixed environment variables
    /// (e.g. `DMRELAY_UPSTREAM__SESS_DATA`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("DMRELAY").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Validate configuration, collecting every problem rather than
    /// stopping at the first.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if !self.upstream.gateway_url.contains("{room_id}") {
            errors.push("upstream.gateway_url must contain a {room_id} placeholder".to_string());
        }
        if let Some(expr) = &self.upstream.reconnect_cron {
            if let Err(e) = cron::Schedule::from_str(expr) {
                errors.push(format!("upstream.reconnect_cron is not a valid cron expression: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Platform credentials derived from the upstream section. The session
    /// cookie is percent-decoded when it arrives URL-encoded.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        let sess_data = if self.upstream.sess_data.contains('%') {
            match percent_decode_str(&self.upstream.sess_data).decode_utf8() {
                Ok(decoded) => decoded.into_owned(),
                Err(e) => {
                    warn!("Failed to percent-decode sess_data, using raw value: {e}");
                    self.upstream.sess_data.clone()
                }
            }
        } else {
            self.upstream.sess_data.clone()
        };

        if sess_data.is_empty() {
            warn!("No sess_data configured, upstream user information may be limited");
        }

        Credentials::new(sess_data, Transport::parse_or_default(&self.upstream.transport))
    }

    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
