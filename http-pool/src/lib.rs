//! A client-side HTTP/1 connection pool for a single host.
//!
//! ```no_run
//! use http_pool::{ConnectionPool, RequestOptions};
//!
//! # async fn run() -> Result<(), http_pool::Error> {
//! let pool = ConnectionPool::from_url("http://127.0.0.1:8080/", None, 10)?;
//! let response = pool
//!     .get("/search", &[("q", "pool")], RequestOptions::default())
//!     .await?;
//! println!("{} {}", response.status, response.text());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection_pool;
pub mod error;
pub mod request;
pub mod response;
pub mod slots;
pub mod transport;
pub mod types;

pub use config::Config;
pub use connection_pool::{Connection, ConnectionPool, PoolStats};
pub use error::{Error, TransportError};
pub use request::{RequestOptions, DEFAULT_RETRIES};
pub use response::Response;
pub use transport::{HttpTransport, Transport};
pub use types::{split_host_port, HostAddress};

pub use hyper::body::Bytes;
pub use hyper::header::HeaderMap;
pub use hyper::Method;
