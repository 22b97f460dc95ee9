//! Middleware layer.
//!
//! A middleware wraps the rest of the chain: it gets the request's
//! [`Context`] and a [`Next`] handle, does its work before and after calling
//! [`Next::run`], or skips the call to short-circuit. The chain ends at the
//! [`Router`], which dispatches to the user's handler.
//!
//! The layers shipped here, outermost first, as [`Pipeline`](crate::Pipeline)
//! installs them:
//!
//! - [`BodyCapture`]: leases pooled buffers for the request and response
//!   bodies and releases them when the request is done
//! - [`Recovery`]: turns a panic anywhere below it into a log event and a
//!   generic 500
//! - [`AccessLog`]: one structured event per request
//! - [`Metrics`]: request counter, latency histogram and gauge per
//!   method, route and status

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::router::Router;

mod access_log;
pub(crate) mod capture;
mod metrics;
mod recovery;

pub use access_log::AccessLog;
pub use capture::BodyCapture;
pub use metrics::{LabelCache, Labels, Metrics};
pub use recovery::{Failure, Recovery};

/// A boxed, sendable future borrowing from the request.
pub type BoxFuture<'a, T = ()> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One layer of the request chain.
///
/// ```rust
/// use kiln::middleware::{BoxFuture, Middleware, Next};
/// use kiln::Context;
///
/// struct Tag;
///
/// impl Middleware for Tag {
///     fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a> {
///         Box::pin(async move {
///             ctx.writer_mut().headers_mut().insert("x-served-by", "kiln".parse().unwrap());
///             next.run(ctx).await;
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a>;
}

impl<M: Middleware + ?Sized> Middleware for Arc<M> {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a> {
        (**self).call(ctx, next)
    }
}

/// The remainder of the chain after the current layer.
pub struct Next<'a> {
    layers: &'a [Arc<dyn Middleware>],
    router: &'a Router,
}

impl<'a> Next<'a> {
    pub(crate) fn new(layers: &'a [Arc<dyn Middleware>], router: &'a Router) -> Self {
        Self { layers, router }
    }

    /// Runs the next layer, or the router once the layers are exhausted.
    /// Does nothing if the request has been aborted.
    pub fn run<'b>(self, ctx: &'b mut Context) -> BoxFuture<'b>
    where
        'a: 'b,
    {
        Box::pin(async move {
            if ctx.is_aborted() {
                return;
            }
            match self.layers.split_first() {
                Some((layer, rest)) => layer.call(ctx, Next::new(rest, self.router)).await,
                None => self.router.dispatch(ctx).await,
            }
        })
    }
}
