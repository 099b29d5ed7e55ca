//! Process configuration, read once from the environment (after `.env` is loaded) and
//! passed explicitly into every component.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::logging::LogFormat;
use crate::store::{RetryPolicy, Scope, MAX_PAGE_LIMIT};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },
}

/// Typed reads over a key lookup, so tests can supply a map instead of the process env.
struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
    }

    fn parsed<T: FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError> {
        match self.get(name) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    name: name.to_string(),
                    value,
                }),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &str) -> Result<bool, ConfigError> {
        match self.get(name) {
            None => Ok(false),
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    value,
                }),
            },
        }
    }

    fn log_format(&self) -> Result<LogFormat, ConfigError> {
        self.parsed("LOG_FORMAT", LogFormat::Json)
    }
}

pub struct ClientConfig {
    /// Source (cloud) MySQL database. Required. TLS is enabled through the URL's query string,
    /// e.g. `mysql://user:pw@host/feature?require_ssl=true`.
    pub db_url: String,
    /// Base URL of the target command API, without the `/feature` path. Required.
    pub target_url: String,
    pub scope: Scope,
    /// Default: 60s
    pub interval: Duration,
    pub run_once: bool,
    /// Default and maximum: 1000
    pub page_limit: usize,
    pub retry: RetryPolicy,
    /// Default: 30s
    pub request_timeout: Duration,
    /// Default: 0.0.0.0:3000
    pub metrics_addr: SocketAddr,
    /// Default: 4
    pub db_pool_size: usize,
    pub log_format: LogFormat,
    /// Default: info
    pub log_level: String,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(lookup);

        let scope = Scope::new(
            vars.required("SYNC_PROVINCE_CODE")?,
            vars.required("SYNC_CITY_CODE")?,
            vars.get("SYNC_TOWN_CODE"),
        );

        let page_limit: usize = vars.parsed("SYNC_PAGE_LIMIT", MAX_PAGE_LIMIT)?;
        if page_limit == 0 || page_limit > MAX_PAGE_LIMIT {
            return Err(ConfigError::InvalidValue {
                name: "SYNC_PAGE_LIMIT".to_string(),
                value: page_limit.to_string(),
            });
        }

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: vars.parsed("RETRY_MAX_ATTEMPTS", defaults.max_attempts)?.max(1),
            initial_backoff: Duration::from_millis(vars.parsed(
                "RETRY_INITIAL_BACKOFF_MS",
                defaults.initial_backoff.as_millis() as u64,
            )?),
            ..defaults
        };

        Ok(Self {
            db_url: vars.required("DATABASE_URL")?,
            target_url: vars.required("TARGET_URL")?,
            scope,
            interval: Duration::from_secs(vars.parsed("SYNC_INTERVAL_SECS", 60u64)?),
            run_once: vars.flag("SYNC_RUN_ONCE")?,
            page_limit,
            retry,
            request_timeout: Duration::from_secs(vars.parsed("REQUEST_TIMEOUT_SECS", 30u64)?),
            metrics_addr: vars.parsed("METRICS_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            db_pool_size: vars.parsed("DB_POOL_SIZE", 4usize)?,
            log_format: vars.log_format()?,
            log_level: vars.get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

pub struct ServerConfig {
    /// Target MySQL database. Required. Takes the same `require_ssl=true` style TLS
    /// parameters as the client's `DATABASE_URL`.
    pub db_url: String,
    /// Default: 0.0.0.0
    pub host: String,
    /// Default: 8000
    pub port: u16,
    /// Default: 16
    pub db_pool_size: usize,
    pub retry: RetryPolicy,
    pub log_format: LogFormat,
    /// Default: info
    pub log_level: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(lookup);
        let defaults = RetryPolicy::default();
        Ok(Self {
            db_url: vars.required("DATABASE_URL")?,
            host: vars.get("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: vars.parsed("SERVER_PORT", 8000u16)?,
            db_pool_size: vars.parsed("DB_POOL_SIZE", 16usize)?,
            retry: RetryPolicy {
                max_attempts: vars.parsed("RETRY_MAX_ATTEMPTS", defaults.max_attempts)?.max(1),
                ..defaults
            },
            log_format: vars.log_format()?,
            log_level: vars.get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse().map_err(|_| ConfigError::InvalidValue {
            name: "SERVER_HOST".to_string(),
            value: self.host.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const CLIENT_REQUIRED: [(&str, &str); 4] = [
        ("DATABASE_URL", "mysql://root:pw@cloud/feature"),
        ("TARGET_URL", "http://10.0.0.2:8000"),
        ("SYNC_PROVINCE_CODE", "510000"),
        ("SYNC_CITY_CODE", "511100"),
    ];

    #[test]
    fn client_defaults_apply() {
        let config = ClientConfig::from_lookup(lookup(&CLIENT_REQUIRED)).unwrap();
        assert_eq!(config.scope.town_filter(), None);
        assert_eq!(config.interval, Duration::from_secs(60));
        assert!(!config.run_once);
        assert_eq!(config.page_limit, MAX_PAGE_LIMIT);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.metrics_addr.port(), 3000);
    }

    #[test]
    fn client_overrides_are_parsed() {
        let mut pairs = CLIENT_REQUIRED.to_vec();
        pairs.extend([
            ("SYNC_TOWN_CODE", "511102"),
            ("SYNC_INTERVAL_SECS", "5"),
            ("SYNC_RUN_ONCE", "1"),
            ("SYNC_PAGE_LIMIT", "250"),
            ("RETRY_MAX_ATTEMPTS", "3"),
            ("LOG_FORMAT", "text"),
        ]);
        let config = ClientConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.scope.town_filter(), Some("511102"));
        assert_eq!(config.interval, Duration::from_secs(5));
        assert!(config.run_once);
        assert_eq!(config.page_limit, 250);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn missing_target_url_is_reported() {
        let pairs: Vec<_> = CLIENT_REQUIRED
            .into_iter()
            .filter(|(k, _)| *k != "TARGET_URL")
            .collect();
        assert_eq!(
            ClientConfig::from_lookup(lookup(&pairs)).err(),
            Some(ConfigError::MissingEnvVar("TARGET_URL".to_string()))
        );
    }

    #[test]
    fn oversized_page_limit_is_rejected() {
        let mut pairs = CLIENT_REQUIRED.to_vec();
        pairs.push(("SYNC_PAGE_LIMIT", "5000"));
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&pairs)),
            Err(ConfigError::InvalidValue { ref name, .. }) if name == "SYNC_PAGE_LIMIT"
        ));
    }

    #[test]
    fn server_bind_addr_combines_host_and_port() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "mysql://edge/feature"),
            ("SERVER_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(
            config.bind_addr().unwrap(),
            SocketAddr::from(([0, 0, 0, 0], 9100))
        );
    }

    #[test]
    fn tls_parameters_stay_on_the_database_url() {
        let url = "mysql://sync:pw@cloud:3306/feature?require_ssl=true&verify_ca=false";
        let mut pairs = CLIENT_REQUIRED.to_vec();
        pairs[0] = ("DATABASE_URL", url);
        let config = ClientConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.db_url, url);
    }
}
