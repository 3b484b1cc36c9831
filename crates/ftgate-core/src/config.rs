use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SECURE_COMMANDS: [&str; 2] = ["PASS", "ACCT"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

impl TlsVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tls12 => "1.2",
            Self::Tls13 => "1.3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub listen_address: String,
    pub default_origin_address: String,
    pub idle_timeout_seconds: u64,
    pub max_connections: usize,
    pub tls: Option<TlsSettings>,
    pub proxy_protocol_enabled: bool,
    pub secure_commands: Vec<String>,
    pub routes: BTreeMap<String, String>,
    pub event_log_path: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_address: "0.0.0.0:21".to_string(),
            default_origin_address: String::new(),
            idle_timeout_seconds: 30,
            max_connections: 0,
            tls: None,
            proxy_protocol_enabled: false,
            secure_commands: DEFAULT_SECURE_COMMANDS
                .iter()
                .map(|name| name.to_string())
                .collect(),
            routes: BTreeMap::new(),
            event_log_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    #[serde(default = "default_min_version")]
    pub min_version: TlsVersion,
    #[serde(default = "default_max_version")]
    pub max_version: TlsVersion,
}

fn default_min_version() -> TlsVersion {
    TlsVersion::Tls12
}

fn default_max_version() -> TlsVersion {
    TlsVersion::Tls13
}

impl ProxyConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ProxyConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_address
            .parse::<SocketAddr>()
            .map_err(|error| {
                ConfigError::Invalid(format!(
                    "listen_address {:?} is not a socket address: {error}",
                    self.listen_address
                ))
            })?;

        if self.default_origin_address.is_empty() {
            return Err(ConfigError::Invalid(
                "default_origin_address must be set".to_string(),
            ));
        }
        parse_host_port(&self.default_origin_address)?;

        if let Some(tls) = &self.tls {
            if tls.cert_file.as_os_str().is_empty() || tls.key_file.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "tls.cert_file and tls.key_file must both be set".to_string(),
                ));
            }
            if tls.min_version > tls.max_version {
                return Err(ConfigError::Invalid(format!(
                    "tls.min_version {} is newer than tls.max_version {}",
                    tls.min_version.as_str(),
                    tls.max_version.as_str()
                )));
            }
        }

        for name in &self.secure_commands {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "secure_commands entries must not be empty".to_string(),
                ));
            }
        }

        for (user, origin) in &self.routes {
            if user.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "routes keys must not be empty".to_string(),
                ));
            }
            parse_host_port(origin)?;
        }

        Ok(())
    }
}

pub fn parse_host_port(address: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| {
        ConfigError::Invalid(format!("address {address:?} is missing a :port suffix"))
    })?;
    // IPv6 literals arrive bracketed, e.g. "[2001:db8::2]:21"
    let host = host
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "address {address:?} has an empty host"
        )));
    }
    let port = port.parse::<u16>().map_err(|error| {
        ConfigError::Invalid(format!("address {address:?} has an invalid port: {error}"))
    })?;
    Ok((host.to_string(), port))
}
