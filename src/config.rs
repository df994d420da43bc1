use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_IMAP_HOST: &str = "imap.gmail.com";
pub const DEFAULT_IMAP_PORT: u16 = 993;
pub const DEFAULT_RETRY_TIMES: u32 = 10;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5000;
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IMAP configuration incomplete: {0} is not set")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Invalid alias address: '{0}'")]
    InvalidAlias(String),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Credentials for one mailbox connection attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct MailboxCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    pub use_tls: bool,
    pub tls_insecure_skip_verify: bool,
    pub io_timeout: Duration,
}

impl fmt::Debug for MailboxCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("use_tls", &self.use_tls)
            .field("tls_insecure_skip_verify", &self.tls_insecure_skip_verify)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

/// IMAP part of a settings layer. Every field is optional so layers can be merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: Option<bool>,
    pub accept_invalid_certs: Option<bool>,
    pub io_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub times: Option<u32>,
    pub delay_ms: Option<u64>,
}

/// One layer of relay configuration: environment, config file, or per-call overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub imap: ImapSettings,
    pub polling: PollingSettings,
    pub domain: Option<String>,
}

/// Fully resolved configuration for a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub credentials: MailboxCredentials,
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RelaySettings {
    /// Build the default layer from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build a layer from `IMAP_*` style variables. Unparsable numbers are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();

        let get = |key: &str| vars.get(key).map(|v| v.trim().to_string());

        Self {
            imap: ImapSettings {
                host: get("IMAP_HOST"),
                port: get("IMAP_PORT").and_then(|v| v.parse().ok()),
                username: get("IMAP_USER"),
                password: vars.get("IMAP_PASS").cloned(),
                use_tls: get("IMAP_TLS").and_then(|v| parse_flag(&v)),
                accept_invalid_certs: get("IMAP_INSECURE").and_then(|v| parse_flag(&v)),
                io_timeout_secs: get("IMAP_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            },
            polling: PollingSettings {
                times: get("IMAP_RETRY_TIMES").and_then(|v| v.parse().ok()),
                delay_ms: get("IMAP_RETRY_DELAY").and_then(|v| v.parse().ok()),
            },
            domain: get("EMAIL_DOMAIN"),
        }
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = Path::new(path);

        // A missing file is an empty layer
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&content)?;

        Ok(settings)
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let path = Path::new(path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    /// Field-by-field merge where values set in `overrides` win.
    pub fn merged_with(&self, overrides: &RelaySettings) -> RelaySettings {
        let base = &self.imap;
        let over = &overrides.imap;

        RelaySettings {
            imap: ImapSettings {
                host: over.host.clone().or_else(|| base.host.clone()),
                port: over.port.or(base.port),
                username: over.username.clone().or_else(|| base.username.clone()),
                password: over.password.clone().or_else(|| base.password.clone()),
                use_tls: over.use_tls.or(base.use_tls),
                accept_invalid_certs: over.accept_invalid_certs.or(base.accept_invalid_certs),
                io_timeout_secs: over.io_timeout_secs.or(base.io_timeout_secs),
            },
            polling: PollingSettings {
                times: overrides.polling.times.or(self.polling.times),
                delay_ms: overrides.polling.delay_ms.or(self.polling.delay_ms),
            },
            domain: overrides.domain.clone().or_else(|| self.domain.clone()),
        }
    }

    /// Copy safe to display: the password is masked.
    pub fn redacted(&self) -> RelaySettings {
        let mut copy = self.clone();
        if copy.imap.password.is_some() {
            copy.imap.password = Some("***".to_string());
        }
        copy
    }
}

/// Resolve environment defaults and per-call overrides into the configuration of one poll.
///
/// Fails before any network activity when the username or password is missing.
pub fn resolve(
    env_defaults: &RelaySettings,
    call_overrides: &RelaySettings,
) -> Result<EffectiveConfig, ConfigError> {
    let merged = env_defaults.merged_with(call_overrides);
    let imap = merged.imap;

    let username = imap
        .username
        .filter(|u| !u.is_empty())
        .ok_or(ConfigError::MissingField("IMAP username"))?;
    let secret = imap
        .password
        .filter(|p| !p.is_empty())
        .ok_or(ConfigError::MissingField("IMAP password"))?;

    let host = imap
        .host
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_IMAP_HOST.to_string());

    let port = imap.port.unwrap_or(DEFAULT_IMAP_PORT);
    if port == 0 {
        return Err(ConfigError::InvalidValue {
            field: "IMAP port",
            value: port.to_string(),
        });
    }

    let io_timeout = imap
        .io_timeout_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_IO_TIMEOUT);

    Ok(EffectiveConfig {
        credentials: MailboxCredentials {
            host,
            port,
            username,
            secret,
            use_tls: imap.use_tls.unwrap_or(true),
            tls_insecure_skip_verify: imap.accept_invalid_certs.unwrap_or(false),
            io_timeout,
        },
        max_attempts: merged.polling.times.unwrap_or(DEFAULT_RETRY_TIMES),
        delay: Duration::from_millis(merged.polling.delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS)),
    })
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
