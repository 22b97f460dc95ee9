//! Panic recovery.
//!
//! [`Recovery`] polls the rest of the chain inside `catch_unwind`. A caught
//! panic is classified into a [`Failure`]:
//!
//! - [`Failure::BrokenConnection`]: the payload is an I/O error meaning the
//!   peer went away. Logged once at error level, recorded on the context,
//!   the request is aborted and nothing more is written.
//! - [`Failure::HandlerFault`]: anything else. A pooled [`LogEvent`] with
//!   the request details, the panic message and a backtrace goes to the
//!   failure sink, then the client gets a fixed 500 naming only the method
//!   and path.
//!
//! Backtraces are captured by a panic hook at the panic site; the hook stays
//! silent for panics raised under a guard so recovered panics are not also
//! printed to stderr.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use http::StatusCode;
use http::header::CONTENT_TYPE;
use http::HeaderValue;
use tracing::{debug, error};

use super::{BoxFuture, Middleware, Next};
use crate::config::ContentTypeFilter;
use crate::context::Context;
use crate::error::Panic;
use crate::log::LogSink;
use crate::pool::{EventPool, LogEvent};

const FAILURE_MESSAGE: &str = "panic recovered";

thread_local! {
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Installs the backtrace-recording hook once per process, chaining to the
/// hook that was in place for panics outside any guard.
fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARD_DEPTH.with(Cell::get) == 0 {
                previous(info);
                return;
            }
            let trace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
        }));
    });
}

/// Backtrace recorded for the last guarded panic on this thread.
fn take_backtrace() -> String {
    LAST_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| Backtrace::force_capture().to_string())
}

struct GuardScope;

impl GuardScope {
    fn enter() -> Self {
        GUARD_DEPTH.with(|d| d.set(d.get() + 1));
        Self
    }
}

impl Drop for GuardScope {
    fn drop(&mut self) {
        GUARD_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Polls `inner` with panics caught and marked as guarded.
struct Guarded<F> {
    inner: F,
}

impl<F: Future + Unpin> Future for Guarded<F> {
    type Output = Result<F::Output, Box<dyn Any + Send>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let _scope = GuardScope::enter();
        let inner = &mut self.inner;
        match panic::catch_unwind(AssertUnwindSafe(|| Pin::new(inner).poll(cx))) {
            Ok(Poll::Ready(out)) => Poll::Ready(Ok(out)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

/// What a caught panic turned out to be.
#[derive(Debug)]
pub enum Failure {
    /// The client disconnected mid-response.
    BrokenConnection(io::Error),
    /// Any other panic; holds the original payload.
    HandlerFault(Box<dyn Any + Send>),
}

impl Failure {
    /// Classifies a panic payload. Unknown payloads are handler faults.
    pub fn classify(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<io::Error>() {
            Ok(err) if is_broken_connection(&err) => return Self::BrokenConnection(*err),
            Ok(err) => return Self::HandlerFault(err),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<hyper::Error>() {
            Ok(err) => match broken_io_source(&*err) {
                Some(kind) => return Self::BrokenConnection(io::Error::new(kind, *err)),
                None => return Self::HandlerFault(err),
            },
            Err(payload) => payload,
        };
        Self::HandlerFault(payload)
    }
}

fn is_broken_connection(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    ) {
        return true;
    }
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("broken pipe") || msg.contains("connection reset by peer")
}

fn broken_io_source(err: &(dyn std::error::Error + 'static)) -> Option<io::ErrorKind> {
    let mut source = Some(err);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            if is_broken_connection(io) {
                return Some(io.kind());
            }
        }
        source = err.source();
    }
    None
}

/// Human-readable text for a panic payload.
fn describe(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(e) = payload.downcast_ref::<io::Error>() {
        e.to_string()
    } else if let Some(e) = payload.downcast_ref::<hyper::Error>() {
        e.to_string()
    } else {
        format!("{payload:?}")
    }
}

/// Failure boundary around the rest of the chain.
pub struct Recovery {
    events: Arc<EventPool>,
    sink: LogSink,
    body_filter: ContentTypeFilter,
}

impl Recovery {
    pub fn new(events: Arc<EventPool>, sink: LogSink, body_filter: ContentTypeFilter) -> Self {
        install_hook();
        Self { events, sink, body_filter }
    }

    async fn recover(&self, ctx: &mut Context, started: Instant, payload: Box<dyn Any + Send>) {
        match Failure::classify(payload) {
            Failure::BrokenConnection(err) => {
                // Nothing can reach the client any more.
                error!(parent: ctx.span(), error = %err, "broken connection");
                ctx.writer_mut().close();
                ctx.error(err);
                ctx.abort();
            }
            Failure::HandlerFault(payload) => {
                let stack = take_backtrace();
                let message = describe(&*payload);
                self.report(ctx, started, message, stack).await;
                ctx.abort();
                self.respond(ctx);
            }
        }
    }

    async fn report(&self, ctx: &mut Context, started: Instant, message: String, stack: String) {
        let mut event = self.events.get();
        if (self.body_filter)(ctx.content_type()) {
            if let Ok(body) = ctx.read_request_body().await {
                event.body.push_str(&String::from_utf8_lossy(body));
            }
        }

        event.message.push_str(FAILURE_MESSAGE);
        event.request_id.push_str(ctx.request_id());
        event.client_ip.push_str(&ctx.client_ip());
        event.method.push_str(ctx.method().as_str());
        event.path.push_str(ctx.path());
        event.query.push_str(ctx.query().unwrap_or_default());
        event.status = StatusCode::INTERNAL_SERVER_ERROR.as_u16();
        event.status_text = StatusCode::INTERNAL_SERVER_ERROR.canonical_reason().unwrap_or_default();
        event.latency = started.elapsed();
        event.user_agent.push_str(ctx.user_agent().unwrap_or_default());
        event.content_type.push_str(ctx.content_type().unwrap_or_default());
        event.error = Some(Box::new(Panic(message)));
        event.stack.push_str(&stack);

        (self.sink)(ctx.span(), &event);
        self.events.put(event);
    }

    fn respond(&self, ctx: &mut Context) {
        let body = format!(
            "[500] http server internal error, method: {}, path: {}",
            ctx.method(),
            ctx.path()
        );
        let writer = ctx.writer_mut();
        if writer.written() {
            debug!("response already started, cannot send 500");
            return;
        }
        writer.write_header(StatusCode::INTERNAL_SERVER_ERROR);
        writer
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        if let Err(e) = writer.write(body.as_bytes()) {
            debug!("writing 500 response: {e}");
        }
    }
}

impl Middleware for Recovery {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a> {
        Box::pin(async move {
            let started = Instant::now();
            let outcome = Guarded { inner: next.run(ctx) }.await;
            if let Err(payload) = outcome {
                self.recover(ctx, started, payload).await;
            }
        })
    }
}
