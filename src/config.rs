//! Service configuration loaded from the environment
use log::{debug, info};
use std::collections::HashSet;
use std::env;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::models::{DeviceAddress, ParseAddressError};
use crate::utils::parse_duration;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),
    #[error("GOVEE_ADDRESSES lists no devices")]
    EmptyAllowList,
    #[error("GOVEE_ADDRESSES: {0}")]
    Address(#[from] ParseAddressError),
    #[error("set exactly one of DATABASE_URL or SENSOR_API_URL")]
    AmbiguousSink,
    #[error("{0} is not a valid URL: {1}")]
    Url(&'static str, url::ParseError),
    #[error("RETRY_INTERVAL: {0}")]
    RetryInterval(String),
}

/// The fixed set of device addresses the monitor is permitted to watch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllowList(HashSet<DeviceAddress>);

impl AllowList {
    pub fn new(addresses: impl IntoIterator<Item = DeviceAddress>) -> Self {
        AllowList(addresses.into_iter().collect())
    }

    /// Parse a comma separated address list, ignoring empty entries.
    pub fn parse(src: &str) -> Result<Self, ParseAddressError> {
        src.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::parse)
            .collect::<Result<HashSet<_>, _>>()
            .map(AllowList)
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.0.contains(address)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceAddress> {
        self.0.iter()
    }
}

/// Where decoded readings are forwarded to. Only one backend is active.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkTarget {
    /// PostgreSQL connection string, optionally carrying `sslrootcert`
    Database(String),
    /// Base URL of the sensor collection API
    Api(Url),
}

#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub allow_list: AllowList,
    pub sink: SinkTarget,
    pub retry_interval: Duration,
    pub adapter: Option<String>,
}

impl SensorConfig {
    /// Load configuration from the process environment and an optional `.env` file
    pub fn new() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let config = Self::from_lookup(|key| env::var(key).ok())?;

        info!(
            "Monitoring {} device(s), forwarding to {}",
            config.allow_list.len(),
            config.sink.describe()
        );
        for address in config.allow_list.iter() {
            debug!("Allow-listed device: {}", address);
        }

        Ok(config)
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let addresses = get("GOVEE_ADDRESSES").ok_or(ConfigError::Missing("GOVEE_ADDRESSES"))?;
        let allow_list = AllowList::parse(&addresses)?;
        if allow_list.is_empty() {
            return Err(ConfigError::EmptyAllowList);
        }

        let sink = match (get("DATABASE_URL"), get("SENSOR_API_URL")) {
            (Some(database_url), None) => {
                Url::parse(&database_url).map_err(|e| ConfigError::Url("DATABASE_URL", e))?;
                SinkTarget::Database(database_url.trim().to_string())
            }
            (None, Some(api_url)) => {
                let url = Url::parse(api_url.trim())
                    .map_err(|e| ConfigError::Url("SENSOR_API_URL", e))?;
                SinkTarget::Api(url)
            }
            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousSink),
            (None, None) => return Err(ConfigError::Missing("DATABASE_URL or SENSOR_API_URL")),
        };

        let retry_interval = match get("RETRY_INTERVAL") {
            Some(value) => match parse_duration(&value).map_err(ConfigError::RetryInterval)? {
                interval if interval.is_zero() => {
                    return Err(ConfigError::RetryInterval(format!(
                        "{} must be greater than zero",
                        value.trim()
                    )))
                }
                interval => interval,
            },
            None => DEFAULT_RETRY_INTERVAL,
        };

        let adapter = get("BLUETOOTH_ADAPTER").map(|name| name.trim().to_string());

        Ok(SensorConfig {
            allow_list,
            sink,
            retry_interval,
            adapter,
        })
    }
}

impl SinkTarget {
    /// Log-safe description that never includes credentials
    pub fn describe(&self) -> String {
        match self {
            SinkTarget::Database(url) => match Url::parse(url) {
                Ok(url) => format!(
                    "database at {}{}",
                    url.host_str().unwrap_or("localhost"),
                    url.path()
                ),
                Err(_) => "database".to_string(),
            },
            SinkTarget::Api(url) => format!("collection API at {}", url.origin().ascii_serialization()),
        }
    }
}
