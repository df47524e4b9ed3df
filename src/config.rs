//! Environment-driven configuration. Every variable is prefixed `ROOMBOOK_`.

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

const PREFIX: &str = "ROOMBOOK_";
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ROOMBOOK_{0} must be set")]
    Missing(&'static str),
    #[error("ROOMBOOK_{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Credentials for the admin account created on first start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapAdmin {
    pub username: String,
    pub password: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Connection password; gates transport only.
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub jwt_secret: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    pub urge_window_secs: u64,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup; `lookup` receives the full variable
    /// name including the prefix.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str| lookup(&format!("{PREFIX}{var}")).filter(|v| !v.is_empty());

        let jwt_secret = get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid {
                var: "JWT_SECRET",
                value: "<redacted>".into(),
                reason: format!("must be at least {MIN_SECRET_LEN} bytes"),
            });
        }

        let bootstrap_admin = match (get("ADMIN_USERNAME"), get("ADMIN_PASSWORD"), get("ADMIN_EMAIL")) {
            (Some(username), Some(password), Some(email)) => Some(BootstrapAdmin {
                username,
                password,
                email,
            }),
            (None, None, None) => None,
            _ => {
                return Err(ConfigError::Invalid {
                    var: "ADMIN_USERNAME",
                    value: String::new(),
                    reason: "ADMIN_USERNAME, ADMIN_PASSWORD and ADMIN_EMAIL must be set together".into(),
                });
            }
        };

        let max_connections: usize = parsed(&get, "MAX_CONNECTIONS", 256)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            port: parsed(&get, "PORT", 5433)?,
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("PASSWORD").unwrap_or_else(|| "roombook".into()),
            max_connections,
            compact_threshold: parsed(&get, "COMPACT_THRESHOLD", 1000)?,
            tls_cert: get("TLS_CERT"),
            tls_key: get("TLS_KEY"),
            metrics_port: optional(&get, "METRICS_PORT")?,
            jwt_secret,
            access_ttl_secs: parsed(&get, "ACCESS_TTL_SECS", 30 * 60)?,
            refresh_ttl_secs: parsed(&get, "REFRESH_TTL_SECS", 7 * 24 * 3600)?,
            urge_window_secs: parsed(&get, "URGE_WINDOW_SECS", 30 * 60)?,
            bootstrap_admin,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roombook.wal")
    }
}

fn optional<T: FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|value| {
            value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

fn parsed<T: FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    Ok(optional(get, var)?.unwrap_or(default))
}
