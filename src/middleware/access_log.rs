//! One structured event per completed request.

use std::sync::Arc;
use std::time::Instant;

use http::header::CONTENT_TYPE;

use super::{BoxFuture, Middleware, Next};
use crate::config::{ContentTypeFilter, path_skipped};
use crate::context::Context;
use crate::log::LogSink;
use crate::pool::EventPool;

const ACCESS_MESSAGE: &str = "request";

/// Access logging layer.
///
/// Paths under a skip prefix are not logged. Bodies are logged only for
/// content types the filter admits and only when body capture is installed
/// further out.
pub struct AccessLog {
    events: Arc<EventPool>,
    sink: LogSink,
    body_filter: ContentTypeFilter,
    skip_paths: Vec<String>,
}

impl AccessLog {
    pub fn new(
        events: Arc<EventPool>,
        sink: LogSink,
        body_filter: ContentTypeFilter,
        skip_paths: Vec<String>,
    ) -> Self {
        Self { events, sink, body_filter, skip_paths }
    }

    async fn log(&self, ctx: &mut Context, started: Instant) {
        let latency = started.elapsed();
        let mut event = self.events.get();

        if (self.body_filter)(ctx.content_type()) {
            if let Ok(body) = ctx.read_request_body().await {
                event.body.push_str(&String::from_utf8_lossy(body));
            }
        }
        let response_type = ctx
            .writer()
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        if (self.body_filter)(response_type) {
            if let Ok(body) = ctx.response_body() {
                event.response.push_str(&String::from_utf8_lossy(body));
            }
        }

        let status = ctx.writer().status();
        event.message.push_str(ACCESS_MESSAGE);
        event.request_id.push_str(ctx.request_id());
        event.client_ip.push_str(&ctx.client_ip());
        event.method.push_str(ctx.method().as_str());
        event.path.push_str(ctx.path());
        event.query.push_str(ctx.query().unwrap_or_default());
        event.status = status.as_u16();
        event.status_text = status.canonical_reason().unwrap_or_default();
        event.latency = latency;
        event.user_agent.push_str(ctx.user_agent().unwrap_or_default());
        event.content_type.push_str(ctx.content_type().unwrap_or_default());

        (self.sink)(ctx.span(), &event);
        self.events.put(event);
    }
}

impl Middleware for AccessLog {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a> {
        Box::pin(async move {
            let started = Instant::now();
            next.run(ctx).await;
            if path_skipped(&self.skip_paths, ctx.path()) {
                return;
            }
            self.log(ctx, started).await;
        })
    }
}
