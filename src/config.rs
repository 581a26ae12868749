use dotenvy::dotenv;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_COMMAND: &str = "/usr/local/bin/r10k deploy environment -pv";
pub const DEFAULT_LOG_FILE: &str = "/var/log/gitlab-webhook-r10k-deployer.log";
pub const DEFAULT_LOG_MAX_BYTES: u64 = 25_165_824; // 24 MiB
pub const DEFAULT_LOG_BACKUPS: usize = 4;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_MAX_BODY_BYTES: u64 = 26_214_400; // 25 MiB

/// Runtime settings loaded once at startup from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub deploy_command: String,
    pub log_file: PathBuf,
    pub log_max_bytes: u64,
    pub log_backups: usize,
    pub read_timeout: Duration,
    pub max_body_bytes: u64,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required value for environment variable: {0}")]
    MissingValue(String),
    #[error("Invalid value for {variable}: {value}")]
    InvalidValue { variable: String, value: String },
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            deploy_command: DEFAULT_COMMAND.to_string(),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            log_max_bytes: DEFAULT_LOG_MAX_BYTES,
            log_backups: DEFAULT_LOG_BACKUPS,
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary variable source. Unset variables fall
    /// back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();

        let deploy_command = lookup("DEPLOY_HOOK_COMMAND").unwrap_or(defaults.deploy_command);

        let log_file = lookup("DEPLOY_HOOK_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.log_file);

        let log_max_bytes = parse_var(&lookup, "DEPLOY_HOOK_LOG_MAX_BYTES")?
            .unwrap_or(defaults.log_max_bytes);

        let log_backups =
            parse_var(&lookup, "DEPLOY_HOOK_LOG_BACKUPS")?.unwrap_or(defaults.log_backups);

        let read_timeout = parse_var::<u64, _>(&lookup, "DEPLOY_HOOK_READ_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.read_timeout);

        let max_body_bytes = parse_var(&lookup, "DEPLOY_HOOK_MAX_BODY_BYTES")?
            .unwrap_or(defaults.max_body_bytes);

        let settings = Settings {
            deploy_command,
            log_file,
            log_max_bytes,
            log_backups,
            read_timeout,
            max_body_bytes,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deploy_command.trim().is_empty() {
            return Err(ConfigError::MissingValue("DEPLOY_HOOK_COMMAND".to_string()));
        }

        if self.log_file.as_os_str().is_empty() {
            return Err(ConfigError::MissingValue("DEPLOY_HOOK_LOG_FILE".to_string()));
        }

        if self.read_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                variable: "DEPLOY_HOOK_READ_TIMEOUT_SECS".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, variable: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(variable) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                variable: variable.to_string(),
                value,
            }),
    }
}

/// Address the listener binds to, given on the command line as `PORT` or
/// `HOST:PORT`. IPv6 hosts must be bracketed (`[::1]:8000`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ListenAddrError {
    #[error("address is empty")]
    Empty,
    #[error("invalid port '{0}': expected a number between 0 and 65535")]
    InvalidPort(String),
    #[error("invalid host '{0}': IPv6 addresses must be written as [addr]:port")]
    InvalidHost(String),
}

impl Default for ListenAddr {
    fn default() -> Self {
        ListenAddr {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl FromStr for ListenAddr {
    type Err = ListenAddrError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ListenAddrError::Empty);
        }

        let (host, port) = match value.rsplit_once(':') {
            None => (DEFAULT_HOST, value),
            Some((host, port)) => (host, port),
        };

        let port = port
            .parse::<u16>()
            .map_err(|_| ListenAddrError::InvalidPort(port.to_string()))?;

        let host = if host.is_empty() {
            DEFAULT_HOST
        } else if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            if inner.is_empty() {
                return Err(ListenAddrError::InvalidHost(host.to_string()));
            }
            inner
        } else if host.contains(':') || host.contains('[') || host.contains(']') {
            return Err(ListenAddrError::InvalidHost(host.to_string()));
        } else {
            host
        };

        Ok(ListenAddr {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// `clap` value parser for `--port`.
pub fn parse_listen_addr(value: &str) -> Result<ListenAddr, String> {
    value.parse().map_err(|e: ListenAddrError| e.to_string())
}
