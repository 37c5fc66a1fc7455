use std::time::Duration;

/// A failure of a single exchange on one connection.
///
/// These never reach callers directly. The request loop retries them and, once
/// the retry budget is spent, attaches the last one to
/// [`Error::MaxRetriesExceeded`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("Failed to send request: {0}")]
    Send(String),
    #[error("Failed to read response body: {0}")]
    Body(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Request timed out after {} seconds while waiting for a free connection", .timeout.as_secs_f64())]
    AcquireTimeout { timeout: Duration },
    #[error("Request timed out after {} seconds", .timeout.as_secs_f64())]
    ExchangeTimeout { timeout: Duration },
    #[error("Max retries exceeded for url: {url}")]
    MaxRetriesExceeded {
        url: String,
        #[source]
        last_error: Option<TransportError>,
    },
    #[error("Invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Invalid request")]
    InvalidRequest(#[from] hyper::http::Error),
    #[error("Failed to load pool configuration")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Both the slot wait and the socket wait report as a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::AcquireTimeout { .. } | Error::ExchangeTimeout { .. }
        )
    }
}
