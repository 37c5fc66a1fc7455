use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::HostAddress;

/// Capacity used by [`Config::from_url`].
pub const DEFAULT_URL_CAPACITY: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Applied to the wait for a free slot and to every exchange.
    #[serde(default, with = "timeout_secs")]
    pub timeout: Option<Duration>,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Wait for a free slot instead of opening an overflow connection.
    #[serde(default)]
    pub block: bool,
}

fn default_capacity() -> usize {
    1
}

impl Config {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            timeout: None,
            capacity: default_capacity(),
            block: false,
        }
    }

    pub fn from_url(url: &str) -> Result<Self, Error> {
        let address = HostAddress::from_url(url)?;
        Ok(Self {
            host: address.host,
            port: address.port,
            timeout: None,
            capacity: DEFAULT_URL_CAPACITY,
            block: false,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn blocking(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    pub fn address(&self) -> HostAddress {
        HostAddress::new(self.host.clone(), self.port)
    }

    /// Read a TOML file, overridden by `HTTP_POOL__*` environment variables.
    pub fn read<D>(config_file: D) -> Result<Self, Error>
    where
        D: AsRef<OsStr>,
    {
        let config_file = Path::new(&config_file);

        let config = config::Config::builder()
            .add_source(config::File::from(config_file))
            .add_source(config::Environment::with_prefix("HTTP_POOL").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Timeouts are written as fractional seconds, e.g. `timeout = 2.5`.
mod timeout_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(timeout) => serializer.serialize_some(&timeout.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        secs.map(|secs| {
            Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}
