//! Radix-tree request router: the end of every middleware chain.
//!
//! One tree per HTTP method, O(path-length) lookup. The matched route
//! template is recorded on the context so metrics can label by route rather
//! than by raw path.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use matchit::Router as MatchitRouter;
use tracing::debug;

use crate::context::Context;
use crate::error::BoxError;
use crate::handler::{BoxedHandler, Handler};
use crate::request::Request;
use crate::response::Response;

const NOT_FOUND_BODY: &str = "404 page not found";

struct Route {
    template: Arc<str>,
    handler: BoxedHandler,
}

/// The application router.
///
/// Build it once at startup and hand it to [`Pipeline`](crate::Pipeline).
/// Registrations chain:
///
/// ```rust
/// # use kiln::{Request, Response, Router};
/// # async fn get_user(_: Request) -> Response { Response::text("") }
/// # async fn create_user(_: Request) -> Response { Response::text("") }
/// # async fn delete_user(_: Request) -> Response { Response::text("") }
/// Router::new()
///     .delete("/users/{id}", delete_user)
///     .get("/users/{id}", get_user)
///     .post("/users", create_user);
/// ```
pub struct Router {
    routes: HashMap<Method, MatchitRouter<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Registers a handler for a method + path pair.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid route or conflicts with an existing one.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        let route = Route { template: Arc::from(path), handler: handler.into_boxed_handler() };
        self.routes
            .entry(method)
            .or_default()
            .insert(path, route)
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::GET, path, handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::POST, path, handler)
    }

    pub fn put(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::PUT, path, handler)
    }

    pub fn patch(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::PATCH, path, handler)
    }

    pub fn delete(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::DELETE, path, handler)
    }

    fn lookup(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<(Arc<str>, BoxedHandler, HashMap<String, String>)> {
        let matched = self.routes.get(method)?.at(path).ok()?;
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((Arc::clone(&matched.value.template), Arc::clone(&matched.value.handler), params))
    }

    /// Runs the matching handler and writes its response to `ctx`.
    pub(crate) async fn dispatch(&self, ctx: &mut Context) {
        let Some((template, handler, params)) = self.lookup(ctx.method(), ctx.path()) else {
            let res = Response::builder().status(StatusCode::NOT_FOUND).text(NOT_FOUND_BODY);
            write(ctx, res);
            return;
        };
        ctx.set_route(template);

        let body = match read_body(ctx).await {
            Ok(body) => body,
            Err(e) => {
                ctx.error(e);
                write(ctx, Response::status(StatusCode::BAD_REQUEST));
                return;
            }
        };

        let req = Request {
            method: ctx.method().clone(),
            path: ctx.path().to_owned(),
            query: ctx.query().map(str::to_owned),
            headers: ctx.headers().clone(),
            body,
            params,
        };
        let res = handler.call(req).await;
        write(ctx, res);
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

/// Reads the request body, through the capture buffer when one is installed
/// so later readers still find it.
async fn read_body(ctx: &mut Context) -> Result<Bytes, BoxError> {
    if ctx.has_capture() {
        return Ok(ctx.request_bytes().await?);
    }
    match ctx.take_body() {
        Some(body) => Ok(body.collect().await?.to_bytes()),
        None => Ok(Bytes::new()),
    }
}

fn write(ctx: &mut Context, mut res: Response) {
    if let Some(err) = res.error.take() {
        ctx.error(err);
    }
    if let Err(e) = res.write_to(ctx.writer_mut()) {
        debug!(parent: ctx.span(), "writing response: {e}");
        ctx.error(e);
    }
}
