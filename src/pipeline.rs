//! The per-request middleware chain.

use std::sync::Arc;

use crate::config::Config;
use crate::context::Context;
use crate::middleware::{AccessLog, BodyCapture, Metrics, Middleware, Next, Recovery};
use crate::pool::{BufferPool, EventPool};
use crate::router::Router;

/// Layers plus router, shared by every request.
///
/// [`Pipeline::new`] installs the standard layers, outermost first:
/// body capture, recovery, access log, metrics. Layers added with
/// [`layer`](Self::layer) go inside them, in the order added.
///
/// ```rust
/// use kiln::{Config, Pipeline, Request, Response, Router};
///
/// async fn hello(_: Request) -> Response { Response::text("hello") }
///
/// let pipeline = Pipeline::new(&Config::default(), Router::new().get("/", hello));
/// let mut registry = prometheus_client::registry::Registry::default();
/// pipeline.metrics().register(&mut registry);
/// ```
pub struct Pipeline {
    layers: Vec<Arc<dyn Middleware>>,
    router: Router,
    buffers: Arc<BufferPool>,
    events: Arc<EventPool>,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(config: &Config, router: Router) -> Self {
        let buffers = Arc::new(BufferPool::new(config.max_idle_buffers));
        let events = Arc::new(EventPool::new(config.max_idle_events));
        let metrics = Arc::new(Metrics::new(
            config.metrics_prefix.clone(),
            config.label_cache_capacity,
        ));

        let capture = BodyCapture::new(Arc::clone(&buffers), Arc::clone(&config.body_filter));
        let recovery = Recovery::new(
            Arc::clone(&events),
            Arc::clone(&config.failure_log),
            Arc::clone(&config.body_filter),
        );
        let access = AccessLog::new(
            Arc::clone(&events),
            Arc::clone(&config.access_log),
            Arc::clone(&config.body_filter),
            config.skip_paths.clone(),
        );

        Self { layers: Vec::new(), router, buffers, events, metrics: Arc::clone(&metrics) }
            .layer(capture)
            .layer(recovery)
            .layer(access)
            .layer(metrics)
    }

    /// A pipeline with no layers at all; requests go straight to the router.
    pub fn bare(router: Router) -> Self {
        Self {
            layers: Vec::new(),
            router,
            buffers: Arc::default(),
            events: Arc::default(),
            metrics: Arc::default(),
        }
    }

    /// Appends a layer inside the ones already installed.
    pub fn layer(mut self, middleware: impl Middleware) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Runs the chain for one request.
    pub async fn run(&self, ctx: &mut Context) {
        Next::new(&self.layers, &self.router).run(ctx).await;
    }

    /// Runs the chain, then sends a head-only response if nothing was written.
    pub async fn handle(&self, mut ctx: Context) {
        self.run(&mut ctx).await;
        ctx.writer_mut().finish();
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    pub fn events(&self) -> &Arc<EventPool> {
        &self.events
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::StatusCode;

    use crate::middleware::BoxFuture;
    use crate::testing::TestRequest;
    use crate::{Request, Response};

    async fn ok(_req: Request) -> Response {
        Response::text("ok")
    }

    async fn no_content(_req: Request) -> StatusCode {
        StatusCode::NO_CONTENT
    }

    struct Deny;

    impl Middleware for Deny {
        fn call<'a>(&'a self, ctx: &'a mut Context, _next: Next<'a>) -> BoxFuture<'a> {
            Box::pin(async move {
                ctx.writer_mut().write_header(StatusCode::FORBIDDEN);
            })
        }
    }

    struct Abort;

    impl Middleware for Abort {
        fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a> {
            Box::pin(async move {
                ctx.abort();
                next.run(ctx).await;
            })
        }
    }

    #[tokio::test]
    async fn standard_layers_return_buffers() {
        let pipeline = Pipeline::new(&Config::default(), Router::new().get("/", ok));
        let (mut ctx, sent) = TestRequest::get("/").header("content-type", "application/json").build();

        pipeline.run(&mut ctx).await;

        assert_eq!(sent.body_text(), "ok");
        assert_eq!(pipeline.buffers().idle()[0], 2);
        assert!(pipeline.metrics().labels().contains("GET", "/", 200));
        assert!(pipeline.events().idle() >= 1);
    }

    #[tokio::test]
    async fn short_circuit_skips_router() {
        let pipeline = Pipeline::bare(Router::new().get("/", ok)).layer(Deny);
        let (ctx, sent) = TestRequest::get("/").build();

        pipeline.handle(ctx).await;

        assert_eq!(sent.status(), Some(StatusCode::FORBIDDEN));
        assert!(sent.body().is_empty());
    }

    #[tokio::test]
    async fn aborted_chain_stops() {
        let pipeline = Pipeline::bare(Router::new().get("/", ok)).layer(Abort);
        let (mut ctx, sent) = TestRequest::get("/").build();

        pipeline.run(&mut ctx).await;

        assert!(sent.head().is_none());
        assert_eq!(ctx.route(), None);
    }

    #[tokio::test]
    async fn handle_sends_head_for_empty_responses() {
        let pipeline = Pipeline::bare(Router::new().delete("/users/{id}", no_content));
        let (ctx, sent) = TestRequest::new("DELETE", "/users/1").build();

        pipeline.handle(ctx).await;

        assert_eq!(sent.status(), Some(StatusCode::NO_CONTENT));
    }
}
