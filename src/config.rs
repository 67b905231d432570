//! Environment-driven configuration.

use std::env;
use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {source}")]
    Parse {
        var: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugLevel {
    Off,
    Info,
    Debug,
    Super,
}

impl DebugLevel {
    fn from_env(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "info" => DebugLevel::Info,
            "debug" => DebugLevel::Debug,
            "super" => DebugLevel::Super,
            _ => DebugLevel::Off,
        }
    }

    /// `super` triggers a full-stack boot at startup.
    pub fn is_super(&self) -> bool {
        matches!(self, DebugLevel::Super)
    }
}

/// Immutable process-wide configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct WardenConfig {
    pub debug: DebugLevel,
    pub host_service_url: String,
    pub service_name: String,
    pub host_docker_sockets: Vec<String>,
    pub docker_host: Option<String>,
    pub vault_base_url: Option<String>,
    pub vault_token: Option<String>,
    pub publisher_token: Option<String>,
    pub history_capacity: usize,
    pub api_host: IpAddr,
    pub api_port: u16,
    pub health_timeout_secs: u64,
    pub publisher_timeout_secs: u64,
    pub publisher_retries: u32,
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.is_empty())
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

impl WardenConfig {
    /// Reads configuration from the process environment. Missing variables
    /// fall back to documented defaults; malformed ones are reported.
    pub fn from_env() -> Result<Self, ConfigError> {
        let debug = env_var("DEBUG")
            .map(|v| DebugLevel::from_env(&v))
            .unwrap_or(DebugLevel::Off);

        let host_service_url =
            env_var("HOST_SERVICE_URL").unwrap_or_else(|| "http://localhost".to_owned());

        let service_name = env_var("SERVICE_NAME").unwrap_or_else(|| "warden".to_owned());

        let mut host_docker_sockets = Vec::new();
        for var in ["NOONA_HOST_DOCKER_SOCKETS", "HOST_DOCKER_SOCKETS"] {
            if let Some(raw) = env_var(var) {
                host_docker_sockets.extend(split_csv(&raw));
            }
        }

        let docker_host = env_var("DOCKER_HOST");

        let vault_base_url = env_var("VAULT_BASE_URL");
        let vault_token = env_var("VAULT_TOKEN");
        let publisher_token = env_var("WIZARD_PUBLISHER_TOKEN").or_else(|| env_var("HOST_SERVICE_TOKEN"));

        let history_capacity = env_var("HISTORY_CAPACITY")
            .map(|v| {
                v.parse::<usize>().map_err(|e| ConfigError::Parse {
                    var: "HISTORY_CAPACITY",
                    source: Box::new(e),
                })
            })
            .transpose()?
            .unwrap_or(500);

        let api_host = env_var("API_HOST")
            .map(|v| {
                v.parse::<IpAddr>().map_err(|e| ConfigError::Parse {
                    var: "API_HOST",
                    source: Box::new(e),
                })
            })
            .transpose()?
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));

        let api_port = env_var("API_PORT")
            .map(|v| {
                v.parse::<u16>().map_err(|e| ConfigError::Parse {
                    var: "API_PORT",
                    source: Box::new(e),
                })
            })
            .transpose()?
            .unwrap_or(8080);

        Ok(Self {
            debug,
            host_service_url,
            service_name,
            host_docker_sockets,
            docker_host,
            vault_base_url,
            vault_token,
            publisher_token,
            history_capacity,
            api_host,
            api_port,
            health_timeout_secs: 10,
            publisher_timeout_secs: 10,
            publisher_retries: 3,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_level_parses_known_values() {
        assert_eq!(DebugLevel::from_env("super"), DebugLevel::Super);
        assert_eq!(DebugLevel::from_env("Debug"), DebugLevel::Debug);
        assert_eq!(DebugLevel::from_env("garbage"), DebugLevel::Off);
    }

    #[test]
    fn split_csv_trims_and_drops_empties() {
        assert_eq!(
            split_csv(" /a/b.sock, ,/c/d.sock"),
            vec!["/a/b.sock".to_owned(), "/c/d.sock".to_owned()]
        );
    }
}
