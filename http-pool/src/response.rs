use hyper::body::Bytes;
use hyper::ext::ReasonPhrase;
use hyper::header::HeaderMap;
use hyper::http::response::Parts;
use hyper::{StatusCode, Version};

/// Status codes that are followed when redirects are enabled.
const REDIRECT_STATUSES: [StatusCode; 4] = [
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::SEE_OTHER,
    StatusCode::TEMPORARY_REDIRECT,
];

/// A completed HTTP response with its body already read.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            version: Version::HTTP_11,
            headers,
            body: body.into(),
        }
    }

    /// Build from the head of a transport response and its collected body.
    ///
    /// The reason phrase is the one sent on the wire when hyper kept it (it
    /// only does for non-canonical phrases), otherwise the canonical one.
    pub fn from_parts(parts: Parts, body: Bytes) -> Self {
        let reason = parts
            .extensions
            .get::<ReasonPhrase>()
            .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
            .unwrap_or_else(|| {
                parts
                    .status
                    .canonical_reason()
                    .unwrap_or_default()
                    .to_string()
            });

        Self {
            status: parts.status,
            reason,
            version: parts.version,
            headers: parts.headers,
            body,
        }
    }

    /// Case-insensitive header lookup. A repeated header yields its last value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .last()
    }

    pub fn header_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.header(name).unwrap_or(default)
    }

    pub fn is_redirect(&self) -> bool {
        REDIRECT_STATUSES.contains(&self.status)
    }

    /// Target of a redirect response, if it is one and names a target.
    pub fn redirect_location(&self) -> Option<&str> {
        if self.is_redirect() {
            self.header("location")
        } else {
            None
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK, HeaderMap::new(), Bytes::new())
    }
}
