use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

/// Port used when a pool is created without one.
pub const DEFAULT_PORT: u16 = 80;

/// The single host a pool talks to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAddress {
    pub host: String,
    pub port: Option<u16>,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse the host and optional port out of a url, see [`split_host_port`].
    pub fn from_url(url: &str) -> Result<Self, Error> {
        let (host, port) = split_host_port(url)?;
        Ok(Self { host, port })
    }

    /// Port the socket is opened on.
    pub fn socket_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Value for the `Host` request header.
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.socket_port())
    }
}

/// Split a url into its host and port (`None` if it has no explicit port).
///
/// This is deliberately simpler than a full url parser. It accepts
/// `scheme://host/path`, `host:port`, `host:port/path` and a bare `host`.
///
/// ```
/// use http_pool::split_host_port;
///
/// assert_eq!(
///     split_host_port("http://example.com/mail/").unwrap(),
///     ("example.com".to_string(), None)
/// );
/// assert_eq!(
///     split_host_port("example.com:80").unwrap(),
///     ("example.com".to_string(), Some(80))
/// );
/// ```
pub fn split_host_port(url: &str) -> Result<(String, Option<u16>), Error> {
    let rest = match url.split_once("//") {
        Some((_scheme, rest)) => rest,
        None => url,
    };

    let authority = match rest.split_once('/') {
        Some((authority, _path)) => authority,
        None => rest,
    };

    match authority.split_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|e| Error::InvalidUrl {
                url: url.to_string(),
                reason: format!("invalid port {:?}: {}", port, e),
            })?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((authority.to_string(), None)),
    }
}
