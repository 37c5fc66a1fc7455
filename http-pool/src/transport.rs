//! The socket side of a pool: opening a connection to the host and performing
//! one request/response exchange on it.
//!
//! [`HttpTransport`] speaks plain HTTP/1.1 over TCP. We cache hyper's
//! `SendRequest` handle rather than the raw socket, because the socket belongs
//! to the `Connection` future once the handshake is done. That future is
//! driven by a background task until the peer closes it, at which point any
//! further `send_request` errors and the pool drops the handle.

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::error::TransportError;
use crate::response::Response;
use crate::types::HostAddress;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// An established connection. Only ever used by one request at a time.
    type Stream: Send + 'static;
    /// A response whose head has arrived but whose body is still on the wire.
    type Incoming: Send + 'static;

    async fn connect(&self, address: &HostAddress) -> Result<Self::Stream, TransportError>;

    async fn send_request(
        &self,
        stream: &mut Self::Stream,
        request: hyper::Request<Bytes>,
    ) -> Result<Self::Incoming, TransportError>;

    /// Read the full body. Completing this leaves the stream ready for reuse.
    async fn read_response(&self, incoming: Self::Incoming) -> Result<Response, TransportError>;

    async fn close(&self, stream: Self::Stream) {
        drop(stream);
    }
}

/// Alias for hyper's HTTP/1 sender.
pub type HttpSender = http1::SendRequest<Full<Bytes>>;

/// Plain HTTP/1.1 over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTransport;

#[async_trait]
impl Transport for HttpTransport {
    type Stream = HttpSender;
    type Incoming = hyper::Response<Incoming>;

    async fn connect(&self, address: &HostAddress) -> Result<HttpSender, TransportError> {
        let connect_error = |reason: String| TransportError::Connect {
            address: address.to_string(),
            reason,
        };

        let stream = TcpStream::connect((address.host.as_str(), address.socket_port()))
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        // Drive the connection in the background.
        let address = address.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::trace!(%address, error = %e, "HTTP connection closed with error");
            }
        });

        Ok(sender)
    }

    async fn send_request(
        &self,
        sender: &mut HttpSender,
        request: hyper::Request<Bytes>,
    ) -> Result<hyper::Response<Incoming>, TransportError> {
        sender
            .ready()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;

        sender
            .send_request(request.map(Full::new))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn read_response(
        &self,
        incoming: hyper::Response<Incoming>,
    ) -> Result<Response, TransportError> {
        let (parts, body) = incoming.into_parts();

        // Buffer the entire body, this is what frees the connection for the
        // next request.
        let body = body
            .collect()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?
            .to_bytes();

        Ok(Response::from_parts(parts, body))
    }
}
