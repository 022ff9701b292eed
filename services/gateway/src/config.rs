//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The service password is read from GATEWAY_PASSWORD or `auth.password_file`,
//! never from the TOML directly, so the file can be shared without leaking it.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{Error, Secret};
use gateway_auth::AuthConfig;
use gateway_client::PollConfig;
use serde::Deserialize;

pub const PASSWORD_ENV: &str = "GATEWAY_PASSWORD";
pub const DEFAULT_CONFIG_FILE: &str = "audit-gateway.toml";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthSection,
    pub platform: PlatformConfig,
    #[serde(default)]
    pub polling: PollConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Auth provider endpoints and the service account
#[derive(Debug, Deserialize)]
pub struct AuthSection {
    pub signin_url: String,
    pub refresh_url: String,
    pub email: String,
    #[serde(skip)]
    pub password: Option<Secret<String>>,
    /// Path to a file holding the password (alternative to GATEWAY_PASSWORD)
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer_secs: u64,
    /// Where to persist the credential record; in-memory only when unset
    #[serde(default)]
    pub credential_path: Option<PathBuf>,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

/// Document platform settings
#[derive(Debug, Deserialize)]
pub struct PlatformConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_max_connections() -> usize {
    256
}

fn default_token_ttl() -> u64 {
    gateway_auth::DEFAULT_TOKEN_TTL.as_secs()
}

fn default_refresh_buffer() -> u64 {
    gateway_auth::DEFAULT_REFRESH_BUFFER.as_secs()
}

fn default_keepalive() -> u64 {
    60
}

fn default_timeout() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve the password.
    ///
    /// Password resolution order:
    /// 1. GATEWAY_PASSWORD env var
    /// 2. password_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Some(password) = std::env::var(PASSWORD_ENV).ok().map(Secret::new) {
            if !password.is_blank() {
                config.auth.password = Some(password);
            }
        }
        if config.auth.password.is_none() {
            if let Some(ref file) = config.auth.password_file {
                let raw = std::fs::read_to_string(file).map_err(|e| {
                    Error::Config(format!(
                        "failed to read password_file {}: {e}",
                        file.display()
                    ))
                })?;
                let password = Secret::new(raw.trim().to_owned());
                if !password.is_blank() {
                    config.auth.password = Some(password);
                }
            }
        }
        if config.auth.password.is_none() {
            return Err(Error::Config(format!(
                "no service password: set {PASSWORD_ENV} or auth.password_file"
            )));
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        for (field, url) in [
            ("auth.signin_url", &self.auth.signin_url),
            ("auth.refresh_url", &self.auth.refresh_url),
            ("platform.base_url", &self.platform.base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::invalid(
                    field,
                    format!("must start with http:// or https://, got: {url}"),
                ));
            }
        }
        if self.auth.email.trim().is_empty() {
            return Err(Error::invalid("auth.email", "must not be empty"));
        }
        if self.server.max_connections == 0 {
            return Err(Error::invalid("server.max_connections", "must be greater than 0"));
        }
        if self.platform.timeout_secs == 0 {
            return Err(Error::invalid("platform.timeout_secs", "must be greater than 0"));
        }
        if self.auth.keepalive_secs == 0 {
            return Err(Error::invalid("auth.keepalive_secs", "must be greater than 0"));
        }
        if self.auth.refresh_buffer_secs >= self.auth.token_ttl_secs {
            return Err(Error::invalid(
                "auth.refresh_buffer_secs",
                format!(
                    "must be less than token_ttl_secs ({})",
                    self.auth.token_ttl_secs
                ),
            ));
        }

        let polling = &self.polling;
        if polling.max_attempts == 0 {
            return Err(Error::invalid("polling.max_attempts", "must be greater than 0"));
        }
        if polling.max_consecutive_errors == 0 {
            return Err(Error::invalid(
                "polling.max_consecutive_errors",
                "must be greater than 0",
            ));
        }
        if polling.short_tier_attempts > polling.medium_tier_attempts {
            return Err(Error::invalid(
                "polling.short_tier_attempts",
                "must not exceed medium_tier_attempts",
            ));
        }
        if polling.error_backoff_ms > polling.max_error_backoff_ms {
            return Err(Error::invalid(
                "polling.error_backoff_ms",
                "must not exceed max_error_backoff_ms",
            ));
        }
        Ok(())
    }

    /// Token manager settings built from the `[auth]` section.
    pub fn auth_config(&self) -> common::Result<AuthConfig> {
        let password = self
            .auth
            .password
            .clone()
            .ok_or_else(|| Error::Config("service password not resolved".into()))?;
        Ok(AuthConfig {
            signin_url: self.auth.signin_url.clone(),
            refresh_url: self.auth.refresh_url.clone(),
            email: self.auth.email.clone(),
            password,
            token_ttl: Duration::from_secs(self.auth.token_ttl_secs),
            refresh_buffer: Duration::from_secs(self.auth.refresh_buffer_secs),
        })
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }
}
