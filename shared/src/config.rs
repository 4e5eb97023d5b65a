use crate::retry::RetryPolicy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_URL_EXPIRY_SECS: u64 = 3600;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_SCRATCH_ROOT: &str = "s3_temp";
pub const DEFAULT_BUCKET_GRACE_SECS: u64 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set when S3_ENDPOINT is set")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Connection settings for the remote store. Without an endpoint the remote
/// store is disabled.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub bucket: String,
    pub prefix: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: Option<String>,
    pub url_expiry: Duration,
    pub chunk_size: usize,
    pub scratch_root: PathBuf,
    pub bucket_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: String::new(),
            prefix: String::new(),
            access_key: None,
            secret_key: None,
            region: None,
            url_expiry: Duration::from_secs(DEFAULT_URL_EXPIRY_SECS),
            chunk_size: DEFAULT_CHUNK_SIZE,
            scratch_root: PathBuf::from(DEFAULT_SCRATCH_ROOT),
            bucket_grace: Duration::from_secs(DEFAULT_BUCKET_GRACE_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = non_empty_var("S3_ENDPOINT");

        let bucket = non_empty_var("S3_BUCKET").unwrap_or_default();
        if endpoint.is_some() && bucket.is_empty() {
            return Err(ConfigError::Missing("S3_BUCKET"));
        }

        let config = Self {
            endpoint,
            bucket,
            prefix: env::var("S3_PREFIX").unwrap_or_default(),
            access_key: non_empty_var("S3_ACCESS_KEY"),
            secret_key: non_empty_var("S3_SECRET_KEY"),
            region: non_empty_var("S3_REGION"),
            url_expiry: Duration::from_secs(parse_var(
                "S3_URL_EXPIRY",
                DEFAULT_URL_EXPIRY_SECS,
            )?),
            chunk_size: parse_var("S3_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            scratch_root: env::var("S3_SCRATCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SCRATCH_ROOT)),
            bucket_grace: Duration::from_secs(parse_var(
                "S3_BUCKET_GRACE_SECS",
                DEFAULT_BUCKET_GRACE_SECS,
            )?),
            retry: RetryPolicy::from_env()?,
        };

        if config.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                name: "S3_CHUNK_SIZE",
                value: "0".to_string(),
            });
        }

        Ok(config)
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Scratch directories of other instances older than this are reclaimed.
    pub fn stale_scratch_age(&self) -> Duration {
        self.url_expiry * 2
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an optional variable. Unset or blank is `None`; anything else must parse.
pub(crate) fn parse_opt_var<T: std::str::FromStr>(
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        _ => Ok(None),
    }
}

pub(crate) fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt_var(name)?.unwrap_or(default))
}
