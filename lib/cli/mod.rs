use crate::build_info;
use crate::config::{ClientConfig, ServerConfig};
use crate::logging::LogFormat;
use crate::store::{clamp_limit, Scope};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

/// Flags override the matching environment variables.
#[derive(Parser, Debug)]
#[command(
    name = "feature_sync_client",
    about = "Mirrors user and feature_model_0330 rows from the cloud database to an edge server",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct ClientCli {
    #[clap(long)]
    /// Run a single reconciliation cycle and exit
    pub run_once: bool,

    #[clap(long)]
    /// Seconds between cycle starts (SYNC_INTERVAL_SECS)
    pub interval_secs: Option<u64>,

    #[clap(long)]
    /// Province code of the sync scope (SYNC_PROVINCE_CODE)
    pub province_code: Option<String>,

    #[clap(long)]
    /// City code of the sync scope (SYNC_CITY_CODE)
    pub city_code: Option<String>,

    #[clap(long)]
    /// Town code of the sync scope; -1 syncs the whole city (SYNC_TOWN_CODE)
    pub town_code: Option<String>,

    #[clap(long)]
    /// Base URL of the target command API (TARGET_URL)
    pub target_url: Option<String>,

    #[clap(long)]
    /// Rows per range query, at most 1000 (SYNC_PAGE_LIMIT)
    pub page_limit: Option<usize>,

    #[clap(long)]
    /// Address for /health and /metrics (METRICS_ADDR)
    pub metrics_addr: Option<SocketAddr>,

    #[clap(long, value_enum)]
    /// Log output format (LOG_FORMAT)
    pub log_format: Option<LogFormatArg>,
}

impl ClientCli {
    pub fn apply(self, config: &mut ClientConfig) {
        if self.run_once {
            config.run_once = true;
        }
        if let Some(secs) = self.interval_secs {
            config.interval = Duration::from_secs(secs);
        }
        if self.province_code.is_some() || self.city_code.is_some() || self.town_code.is_some() {
            config.scope = Scope::new(
                self.province_code
                    .unwrap_or_else(|| config.scope.province_code.clone()),
                self.city_code
                    .unwrap_or_else(|| config.scope.city_code.clone()),
                self.town_code.or_else(|| Some(config.scope.town_code.clone())),
            );
        }
        if let Some(url) = self.target_url {
            config.target_url = url;
        }
        if let Some(limit) = self.page_limit {
            config.page_limit = clamp_limit(limit);
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics_addr = addr;
        }
        if let Some(format) = self.log_format {
            config.log_format = format.into();
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "feature_sync_server",
    about = "Command API over the edge feature database",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct ServerCli {
    #[clap(long)]
    /// Interface to bind (SERVER_HOST)
    pub host: Option<String>,

    #[clap(short, long)]
    /// Port to listen on (SERVER_PORT)
    pub port: Option<u16>,

    #[clap(long, value_enum)]
    /// Log output format (LOG_FORMAT)
    pub log_format: Option<LogFormatArg>,
}

impl ServerCli {
    pub fn apply(self, config: &mut ServerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(format) = self.log_format {
            config.log_format = format.into();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn version_short_circuits_other_flags() {
        let err = ClientCli::try_parse_from([
            "feature_sync_client",
            "--version",
            "--this-flag-does-not-exist",
        ])
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
        assert!(err.to_string().contains(build_info::VERSION_WITH_COMMIT));
    }

    #[test]
    fn flags_override_environment() {
        let mut config = ClientConfig::from_lookup(|name| {
            match name {
                "DATABASE_URL" => Some("mysql://cloud/feature"),
                "TARGET_URL" => Some("http://edge:8000"),
                "SYNC_PROVINCE_CODE" => Some("510000"),
                "SYNC_CITY_CODE" => Some("511100"),
                "SYNC_TOWN_CODE" => Some("511102"),
                _ => None,
            }
            .map(str::to_string)
        })
        .unwrap();

        ClientCli::try_parse_from([
            "feature_sync_client",
            "--run-once",
            "--city-code",
            "511200",
            "--log-format",
            "text",
        ])
        .unwrap()
        .apply(&mut config);

        assert!(config.run_once);
        assert_eq!(config.scope.province_code, "510000");
        assert_eq!(config.scope.city_code, "511200");
        assert_eq!(config.scope.town_code, "511102");
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn server_port_flag() {
        let cli = ServerCli::try_parse_from(["feature_sync_server", "-p", "9000"]).unwrap();
        assert_eq!(cli.port, Some(9000));
    }
}
