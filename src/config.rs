//! Static, process-wide configuration loaded once from the environment at
//! startup (§6.5). Distinct from `settings::SettingsManager`, which owns the
//! mutable, DB-backed, hot-reloadable tunables (`max_retries`,
//! `blacklist_threshold`, ...).

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub is_slave: bool,
    pub auth_key: String,
    pub database_dsn: String,
    pub redis_dsn: Option<String>,
    pub max_concurrent_requests: u32,
    pub enable_cors: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub log_level: String,
    pub log_format: String,
    pub log_enable_file: bool,
    pub log_file_path: Option<String>,
}

impl AppConfig {
    /// Loads `.env` (if present) then parses and validates every variable in
    /// §6.5. A missing or malformed required variable is a `Validation`
    /// error and must abort startup before any listener binds (T1).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let host = env_or("HOST", "0.0.0.0");
        let port = parse_env("PORT", "8080")?;

        let read_timeout = parse_secs("SERVER_READ_TIMEOUT", 30)?;
        let write_timeout = parse_secs("SERVER_WRITE_TIMEOUT", 30)?;
        let idle_timeout = parse_secs("SERVER_IDLE_TIMEOUT", 120)?;
        let graceful_shutdown_timeout = parse_secs("SERVER_GRACEFUL_SHUTDOWN_TIMEOUT", 30)?;

        let is_slave = parse_bool("IS_SLAVE", false)?;

        let auth_key = require_env("AUTH_KEY")?;
        if auth_key.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "AUTH_KEY",
                value: auth_key,
                reason: "must not be empty",
            });
        }

        let database_dsn = require_env("DATABASE_DSN")?;
        let redis_dsn = std::env::var("REDIS_DSN").ok().filter(|s| !s.is_empty());

        let max_concurrent_requests = parse_env("MAX_CONCURRENT_REQUESTS", "256")?;
        let enable_cors = parse_bool("ENABLE_CORS", true)?;
        let allowed_origins = split_csv_env("ALLOWED_ORIGINS", "*");
        let allowed_methods = split_csv_env("ALLOWED_METHODS", "GET,POST,PUT,DELETE,OPTIONS");
        let allowed_headers = split_csv_env("ALLOWED_HEADERS", "*");
        let allow_credentials = parse_bool("ALLOW_CREDENTIALS", false)?;

        let log_level = env_or("LOG_LEVEL", "info");
        let log_format = env_or("LOG_FORMAT", "text");
        let log_enable_file = parse_bool("LOG_ENABLE_FILE", true)?;
        let log_file_path = std::env::var("LOG_FILE_PATH").ok();

        Ok(Self {
            host,
            port,
            read_timeout,
            write_timeout,
            idle_timeout,
            graceful_shutdown_timeout,
            is_slave,
            auth_key,
            database_dsn,
            redis_dsn,
            max_concurrent_requests,
            enable_cors,
            allowed_origins,
            allowed_methods,
            allowed_headers,
            allow_credentials,
            log_level,
            log_format,
            log_enable_file,
            log_file_path,
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn split_csv_env(name: &str, default: &str) -> Vec<String> {
    env_or(name, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError> {
    let raw = env_or(name, default);
    raw.parse::<T>().map_err(|_| ConfigError::Invalid {
        name,
        value: raw,
        reason: "could not parse value",
    })
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                value: raw,
                reason: "expected a boolean",
            }),
        },
    }
}

fn parse_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let raw = env_or(name, &default_secs.to_string());
    raw.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::Invalid {
            name,
            value: raw,
            reason: "expected an integer number of seconds",
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_env() {
        for key in [
            "HOST", "PORT", "IS_SLAVE", "AUTH_KEY", "DATABASE_DSN", "REDIS_DSN",
            "MAX_CONCURRENT_REQUESTS", "ENABLE_CORS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn missing_auth_key_is_an_error() {
        clear_env();
        std::env::set_var("DATABASE_DSN", "postgres://localhost/test");
        let err = AppConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("AUTH_KEY")));
        clear_env();
    }

    #[test]
    fn malformed_port_is_an_error() {
        clear_env();
        std::env::set_var("AUTH_KEY", "secret");
        std::env::set_var("DATABASE_DSN", "postgres://localhost/test");
        std::env::set_var("PORT", "not-a-port");
        let err = AppConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PORT", .. }));
        clear_env();
    }
}
