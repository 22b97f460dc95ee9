//! Per-request context shared by the middleware chain.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, Method, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use tracing::{Span, info_span};

use crate::error::BoxError;
use crate::middleware::capture::RequestCapture;
use crate::writer::ResponseWriter;

/// Single-pass request body as it arrives from the transport.
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

const REQUEST_ID: &str = "x-request-id";
const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// Everything one request carries through the pipeline.
///
/// Owned by the task serving the request and never shared with another
/// one. Middleware reads the request head, stashes values in the typed
/// key-value store, reports errors and writes the response through it.
pub struct Context {
    pub(crate) parts: http::request::Parts,
    pub(crate) body: Option<RequestBody>,
    pub(crate) capture: Option<RequestCapture>,
    pub(crate) writer: ResponseWriter,
    remote_addr: Option<SocketAddr>,
    request_id: String,
    span: Span,
    route: Option<Arc<str>>,
    errors: Vec<BoxError>,
    aborted: bool,
}

impl Context {
    pub fn new(
        request: http::Request<RequestBody>,
        remote_addr: Option<SocketAddr>,
        writer: ResponseWriter,
    ) -> Self {
        let (parts, body) = request.into_parts();

        let request_id = parts
            .headers
            .get(REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_owned);

        let span = info_span!(
            "request",
            request_id = %request_id,
            method = %parts.method,
            path = %parts.uri.path(),
        );

        Self {
            parts,
            body: Some(body),
            capture: None,
            writer,
            remote_addr,
            request_id,
            span,
            route: None,
            errors: Vec::new(),
            aborted: false,
        }
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.parts.uri.query()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Header value as a string, if present and visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.parts.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.parts.headers.get(USER_AGENT).and_then(|v| v.to_str().ok())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Best guess at the client address behind the reverse proxy.
    pub fn client_ip(&self) -> String {
        if let Some(first) = self
            .header(FORWARDED_FOR)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return first.to_owned();
        }
        if let Some(ip) = self.header(REAL_IP).map(str::trim).filter(|v| !v.is_empty()) {
            return ip.to_owned();
        }
        self.remote_addr.map(|a| a.ip().to_string()).unwrap_or_default()
    }

    /// Correlation id: `x-request-id` when the client sent one.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Request-scoped logger handle.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Route template the router matched, e.g. `/users/{id}`.
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub(crate) fn set_route(&mut self, route: Arc<str>) {
        self.route = Some(route);
    }

    /// Stores a value in the request's key-value store, returning the old one.
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.parts.extensions.insert(value)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.parts.extensions.get::<T>()
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.parts.extensions.remove::<T>()
    }

    /// Takes the request body stream, leaving nothing behind.
    pub fn take_body(&mut self) -> Option<RequestBody> {
        self.body.take()
    }

    /// Replaces the request body stream.
    pub fn set_body(&mut self, body: RequestBody) {
        self.body = Some(body);
    }

    /// Errors reported while handling this request.
    pub fn errors(&self) -> &[BoxError] {
        &self.errors
    }

    /// Records an error against this request.
    pub fn error(&mut self, err: impl Into<BoxError>) {
        self.errors.push(err.into());
    }

    /// Stops the chain: layers not yet entered are skipped.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn writer(&self) -> &ResponseWriter {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut ResponseWriter {
        &mut self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::TestRequest;

    #[test]
    fn request_id_prefers_header() {
        let (ctx, _) = TestRequest::get("/").header(REQUEST_ID, "req-7").build();
        assert_eq!(ctx.request_id(), "req-7");

        let (ctx, _) = TestRequest::get("/").build();
        assert_eq!(ctx.request_id().len(), 36);
    }

    #[test]
    fn client_ip_walks_proxy_headers() {
        let (ctx, _) = TestRequest::get("/")
            .header(FORWARDED_FOR, "203.0.113.9, 10.0.0.1")
            .header(REAL_IP, "10.0.0.2")
            .build();
        assert_eq!(ctx.client_ip(), "203.0.113.9");

        let (ctx, _) = TestRequest::get("/").header(REAL_IP, "10.0.0.2").build();
        assert_eq!(ctx.client_ip(), "10.0.0.2");

        let (ctx, _) = TestRequest::get("/").build();
        assert_eq!(ctx.client_ip(), "127.0.0.1");
    }

    #[test]
    fn key_value_store_round_trips() {
        #[derive(Clone, Debug, PartialEq)]
        struct Tenant(&'static str);

        let (mut ctx, _) = TestRequest::get("/").build();
        assert!(ctx.get::<Tenant>().is_none());
        ctx.insert(Tenant("acme"));
        assert_eq!(ctx.get::<Tenant>(), Some(&Tenant("acme")));
        assert_eq!(ctx.remove::<Tenant>(), Some(Tenant("acme")));
    }

    #[test]
    fn uri_parts_are_exposed() {
        let (ctx, _) = TestRequest::get("/search?q=rust&page=2").build();
        assert_eq!(ctx.path(), "/search");
        assert_eq!(ctx.query(), Some("q=rust&page=2"));
        assert_eq!(ctx.method(), Method::GET);
    }
}
