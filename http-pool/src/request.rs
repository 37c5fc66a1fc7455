//! Driving one logical request to completion over a [`ConnectionPool`].
//!
//! Every broken connection and every followed redirect costs one unit of the
//! same retry budget. Timeouts end the call immediately.

use std::sync::atomic::Ordering;

use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::Method;

use crate::connection_pool::{Connection, ConnectionPool};
use crate::error::{Error, TransportError};
use crate::response::Response;
use crate::transport::Transport;

pub const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    /// Shared budget for retries after broken connections and followed
    /// redirects.
    pub retries: u32,
    /// Follow 301, 302, 303 and 307 responses carrying a `location` header.
    pub redirect: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            headers: HeaderMap::new(),
            retries: DEFAULT_RETRIES,
            redirect: true,
        }
    }
}

impl RequestOptions {
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn redirect(mut self, redirect: bool) -> Self {
        self.redirect = redirect;
        self
    }
}

/// Why a single attempt did not produce a response.
enum AttemptError {
    /// The connection broke, worth another attempt.
    Broken(TransportError),
    /// Ends the whole call.
    Fatal(Error),
}

impl<T: Transport> ConnectionPool<T> {
    /// Get a connection from the pool and perform an HTTP request.
    ///
    /// `url` is sent as the request target, so it may be a path (`/search`)
    /// or an absolute url on this pool's host. Redirects keep the method,
    /// body and headers of the original request.
    pub async fn urlopen(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        let mut url = url.to_string();
        let mut retries = options.retries;

        loop {
            match self
                .attempt(&method, &url, body.clone(), &options.headers)
                .await
            {
                Ok(response) => {
                    let location = match response.redirect_location() {
                        Some(location) if options.redirect => location.to_string(),
                        _ => return Ok(response),
                    };

                    tracing::debug!(from = %url, to = %location, retries, "Redirecting");
                    url = location;
                    retries = match retries.checked_sub(1) {
                        Some(retries) => retries,
                        None => {
                            return Err(Error::MaxRetriesExceeded {
                                url,
                                last_error: None,
                            })
                        }
                    };
                }
                Err(AttemptError::Broken(error)) => {
                    tracing::warn!(
                        %url,
                        retries,
                        %error,
                        "Retrying after connection was broken"
                    );
                    retries = match retries.checked_sub(1) {
                        Some(retries) => retries,
                        None => {
                            return Err(Error::MaxRetriesExceeded {
                                url,
                                last_error: Some(error),
                            })
                        }
                    };
                }
                Err(AttemptError::Fatal(error)) => return Err(error),
            }
        }
    }

    /// GET `url`, appending `fields` as an urlencoded query string.
    pub async fn get<K, V>(
        &self,
        url: &str,
        fields: &[(K, V)],
        options: RequestOptions,
    ) -> Result<Response, Error>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let url = with_query(url, fields);
        self.urlopen(Method::GET, &url, None, options).await
    }

    pub async fn post(
        &self,
        url: &str,
        body: Option<Bytes>,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        self.urlopen(Method::POST, url, body, options).await
    }

    /// One exchange on one pooled connection.
    async fn attempt(
        &self,
        method: &Method,
        url: &str,
        body: Option<Bytes>,
        headers: &HeaderMap,
    ) -> Result<Response, AttemptError> {
        let request = self
            .build_request(method, url, body, headers)
            .map_err(AttemptError::Fatal)?;

        let mut conn = self
            .acquire(self.inner.timeout)
            .await
            .map_err(AttemptError::Fatal)?;

        self.inner.requests_served.fetch_add(1, Ordering::Relaxed);

        let exchanged = match self.inner.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.exchange(&mut conn, request))
                .await
                .map_err(|_| timeout),
            None => Ok(self.exchange(&mut conn, request).await),
        };

        match exchanged {
            Ok(Ok(response)) => {
                tracing::trace!(
                    %method,
                    %url,
                    status = response.status.as_u16(),
                    connection = conn.id(),
                    "Request completed"
                );
                self.release(conn);
                Ok(response)
            }
            Ok(Err(error)) => {
                self.discard(conn).await;
                Err(AttemptError::Broken(error))
            }
            Err(timeout) => {
                self.discard(conn).await;
                Err(AttemptError::Fatal(Error::ExchangeTimeout { timeout }))
            }
        }
    }

    async fn exchange(
        &self,
        conn: &mut Connection<T::Stream>,
        request: hyper::Request<Bytes>,
    ) -> Result<Response, TransportError> {
        let transport = &self.inner.transport;

        let stream = match conn.stream.take() {
            Some(stream) => stream,
            None => transport.connect(&self.inner.address).await?,
        };
        let stream = conn.stream.insert(stream);

        let incoming = transport.send_request(stream, request).await?;
        transport.read_response(incoming).await
    }

    fn build_request(
        &self,
        method: &Method,
        url: &str,
        body: Option<Bytes>,
        headers: &HeaderMap,
    ) -> Result<hyper::Request<Bytes>, Error> {
        let mut request = hyper::Request::builder()
            .method(method.clone())
            .uri(url)
            .body(body.unwrap_or_default())?;

        *request.headers_mut() = headers.clone();
        if !request.headers().contains_key(HOST) {
            let host = HeaderValue::from_str(&self.inner.address.authority())
                .map_err(hyper::http::Error::from)?;
            request.headers_mut().insert(HOST, host);
        }

        Ok(request)
    }
}

fn with_query<K, V>(url: &str, fields: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    if fields.is_empty() {
        return url.to_string();
    }

    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))
        .finish();

    format!("{}?{}", url, query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::HostAddress;
    use async_trait::async_trait;
    use hyper::header::LOCATION;
    use hyper::StatusCode;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_test::assert_ok;

    enum Outcome {
        Respond(Response),
        Break,
        Hang,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Seen {
        method: Method,
        target: String,
        body: Bytes,
        host: Option<String>,
    }

    /// Plays back a fixed list of outcomes, answering 200 once it runs out.
    #[derive(Default)]
    struct Scripted {
        outcomes: Mutex<VecDeque<Outcome>>,
        seen: Mutex<Vec<Seen>>,
        connects: AtomicUsize,
    }

    impl Scripted {
        fn new(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        type Stream = usize;
        type Incoming = Response;

        async fn connect(&self, _: &HostAddress) -> Result<usize, TransportError> {
            Ok(self.connects.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn send_request(
            &self,
            _: &mut usize,
            request: hyper::Request<Bytes>,
        ) -> Result<Response, TransportError> {
            let host = request
                .headers()
                .get(HOST)
                .and_then(|host| host.to_str().ok())
                .map(str::to_string);
            let (parts, body) = request.into_parts();
            self.seen.lock().unwrap().push(Seen {
                method: parts.method,
                target: parts.uri.to_string(),
                body,
                host,
            });

            let outcome = self.outcomes.lock().unwrap().pop_front();
            match outcome {
                Some(Outcome::Respond(response)) => Ok(response),
                Some(Outcome::Break) => Err(TransportError::Send("connection reset".to_string())),
                Some(Outcome::Hang) => std::future::pending().await,
                None => Ok(Response::default()),
            }
        }

        async fn read_response(&self, incoming: Response) -> Result<Response, TransportError> {
            Ok(incoming)
        }
    }

    fn ok() -> Outcome {
        Outcome::Respond(Response::new(StatusCode::OK, HeaderMap::new(), "done"))
    }

    fn redirect(status: StatusCode, location: &'static str) -> Outcome {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static(location));
        Outcome::Respond(Response::new(status, headers, ""))
    }

    fn pool(config: Config, outcomes: impl IntoIterator<Item = Outcome>) -> ConnectionPool<Scripted> {
        ConnectionPool::with_transport(config, Scripted::new(outcomes))
    }

    fn seen(pool: &ConnectionPool<Scripted>) -> Vec<Seen> {
        pool.inner.transport.seen.lock().unwrap().clone()
    }

    fn targets(pool: &ConnectionPool<Scripted>) -> Vec<String> {
        seen(pool).into_iter().map(|seen| seen.target).collect()
    }

    #[tokio::test]
    async fn follows_redirect_to_final_response() {
        let pool = pool(
            Config::new("localhost"),
            [redirect(StatusCode::FOUND, "/ok"), ok()],
        );

        let response = assert_ok!(
            pool.urlopen(Method::GET, "/start", None, RequestOptions::default())
                .await
        );

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "done");
        assert_eq!(targets(&pool), ["/start", "/ok"]);
    }

    #[tokio::test]
    async fn redirect_consumes_exactly_one_retry() {
        let pool = pool(
            Config::new("localhost"),
            [redirect(StatusCode::FOUND, "/ok"), ok()],
        );
        let response = pool
            .urlopen(Method::GET, "/", None, RequestOptions::default().retries(1))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let pool = self::pool(
            Config::new("localhost"),
            [redirect(StatusCode::FOUND, "/ok"), ok()],
        );
        let err = pool
            .urlopen(Method::GET, "/", None, RequestOptions::default().retries(0))
            .await
            .unwrap_err();
        match err {
            Error::MaxRetriesExceeded { url, last_error } => {
                assert_eq!(url, "/ok");
                assert!(last_error.is_none());
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(targets(&pool), ["/"]);
    }

    #[tokio::test]
    async fn redirect_keeps_method_and_body() {
        let pool = pool(
            Config::new("localhost"),
            [redirect(StatusCode::SEE_OTHER, "/created"), ok()],
        );

        pool.post(
            "/submit",
            Some(Bytes::from_static(b"payload")),
            RequestOptions::default(),
        )
        .await
        .unwrap();

        let seen = seen(&pool);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].method, Method::POST);
        assert_eq!(seen[1].target, "/created");
        assert_eq!(seen[1].body, Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn disabled_redirects_return_the_redirect_response() {
        let pool = pool(
            Config::new("localhost"),
            [redirect(StatusCode::MOVED_PERMANENTLY, "/elsewhere")],
        );

        let response = pool
            .urlopen(Method::GET, "/", None, RequestOptions::default().redirect(false))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.header("location"), Some("/elsewhere"));
        assert_eq!(targets(&pool), ["/"]);
    }

    #[tokio::test]
    async fn redirect_loop_is_bounded_by_the_retry_budget() {
        let pool = pool(
            Config::new("localhost"),
            (0..10).map(|_| redirect(StatusCode::TEMPORARY_REDIRECT, "/loop")),
        );

        let err = pool
            .urlopen(Method::GET, "/loop", None, RequestOptions::default().retries(2))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MaxRetriesExceeded { .. }));
        assert_eq!(targets(&pool).len(), 3);
    }

    #[tokio::test]
    async fn no_retries_left_fails_after_a_single_broken_exchange() {
        let pool = pool(Config::new("localhost"), [Outcome::Break, ok()]);

        let err = pool
            .urlopen(Method::GET, "/", None, RequestOptions::default().retries(0))
            .await
            .unwrap_err();

        match err {
            Error::MaxRetriesExceeded { url, last_error } => {
                assert_eq!(url, "/");
                assert_eq!(
                    last_error,
                    Some(TransportError::Send("connection reset".to_string()))
                );
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(targets(&pool).len(), 1);
    }

    #[tokio::test]
    async fn broken_connection_is_replaced_and_retried() {
        let pool = pool(
            Config::new("localhost").with_capacity(1).blocking(true),
            [Outcome::Break, ok()],
        );

        let response = pool
            .urlopen(Method::GET, "/", None, RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(pool.inner.transport.connects.load(Ordering::SeqCst), 2);

        let stats = pool.stats();
        assert_eq!(stats.connections_created, 2);
        assert_eq!(stats.requests_served, 2);
        assert_eq!(stats.idle_slots, 1);
    }

    #[tokio::test]
    async fn connections_are_reused_between_requests() {
        let pool = pool(Config::new("localhost").with_capacity(1), [ok(), ok(), ok()]);

        for _ in 0..3 {
            pool.urlopen(Method::GET, "/", None, RequestOptions::default())
                .await
                .unwrap();
        }

        assert_eq!(pool.inner.transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().requests_served, 3);
    }

    #[tokio::test]
    async fn exchange_timeout_is_not_retried() {
        let timeout = Duration::from_millis(50);
        let pool = pool(
            Config::new("localhost").with_timeout(timeout),
            [Outcome::Hang, ok()],
        );

        let err = pool
            .urlopen(Method::GET, "/slow", None, RequestOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ExchangeTimeout { timeout: t } if t == timeout));
        assert_eq!(targets(&pool), ["/slow"]);
    }

    #[tokio::test]
    async fn acquire_timeout_surfaces_without_sending() {
        let timeout = Duration::from_millis(30);
        let pool = pool(
            Config::new("localhost")
                .with_capacity(1)
                .blocking(true)
                .with_timeout(timeout),
            [ok()],
        );
        let _held = pool.acquire(None).await.unwrap();

        let err = pool
            .urlopen(Method::GET, "/", None, RequestOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AcquireTimeout { .. }));
        assert!(targets(&pool).is_empty());
    }

    #[tokio::test]
    async fn cancelled_request_gives_its_slot_back() {
        let pool = pool(
            Config::new("localhost").with_capacity(1).blocking(true),
            [Outcome::Hang],
        );

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            pool.urlopen(Method::GET, "/", None, RequestOptions::default()),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(targets(&pool), ["/"]);
        assert_eq!(pool.stats().idle_slots, 1);

        assert_ok!(pool.acquire(Some(Duration::from_millis(200))).await);
    }

    #[tokio::test]
    async fn get_encodes_fields_and_sets_host() {
        let pool = pool(Config::new("localhost").with_port(8080), [ok()]);

        pool.get(
            "/search",
            &[("q", "rust pool"), ("lang", "en&fr")],
            RequestOptions::default(),
        )
        .await
        .unwrap();

        let seen = seen(&pool);
        assert_eq!(seen[0].method, Method::GET);
        assert_eq!(seen[0].target, "/search?q=rust+pool&lang=en%26fr");
        assert_eq!(seen[0].host.as_deref(), Some("localhost:8080"));
    }

    #[tokio::test]
    async fn caller_host_header_is_kept() {
        let pool = pool(Config::new("localhost"), [ok()]);
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("virtual.example"));

        pool.get::<&str, &str>("/", &[], RequestOptions::default().headers(headers))
            .await
            .unwrap();

        assert_eq!(seen(&pool)[0].host.as_deref(), Some("virtual.example"));
    }

    #[tokio::test]
    async fn invalid_target_is_rejected_before_acquiring() {
        let pool = pool(Config::new("localhost"), [ok()]);

        let err = pool
            .urlopen(Method::GET, "not a uri", None, RequestOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(pool.stats().connections_created, 0);
    }
}
