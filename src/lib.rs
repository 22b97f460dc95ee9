//! # kiln
//!
//! The request-scoped resource core of an HTTP service behind a reverse
//! proxy: pooled buffers, re-readable request bodies, captured responses,
//! panic recovery and bounded-cardinality metrics.
//!
//! ## What one request goes through
//!
//! [`Pipeline::new`] wraps the [`Router`] in four layers, outermost first:
//!
//! - **Body capture**: request and response buffers leased from a
//!   size-classed [`BufferPool`], returned when the request ends, panic or
//!   not
//! - **Recovery**: a panic anywhere below becomes either a broken-connection
//!   notice or a logged failure event plus a plain 500
//! - **Access log**: one pooled [`LogEvent`] per request, handed to a sink
//! - **Metrics**: counter, histogram and gauge per method, route and status
//!
//! TLS, rate limiting and body-size limits stay with the proxy.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use http::StatusCode;
//! use kiln::{Config, Pipeline, Request, Response, Router, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = Router::new()
//!         .get("/users/{id}", get_user)
//!         .post("/users", create_user);
//!
//!     let pipeline = Pipeline::new(&Config::default(), app);
//!     Server::bind("0.0.0.0:3000").serve(pipeline).await.unwrap();
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//!
//! async fn create_user(req: Request) -> Response {
//!     if req.body().is_empty() {
//!         return Response::status(StatusCode::BAD_REQUEST);
//!     }
//!     Response::builder()
//!         .status(StatusCode::CREATED)
//!         .header("location", "/users/99")
//!         .json(r#"{"id":"99"}"#)
//! }
//! ```

mod config;
mod context;
mod error;
mod handler;
mod log;
mod pipeline;
mod request;
mod response;
mod router;
mod server;
mod writer;

pub mod middleware;
pub mod pool;

#[cfg(test)]
mod testing;

pub use config::{Config, ContentTypeFilter};
pub use context::{Context, RequestBody};
pub use error::{BoxError, CaptureError, Error, Panic};
pub use handler::Handler;
pub use log::{LogSink, default_access_log, default_failure_log};
pub use pipeline::Pipeline;
pub use pool::{BufferPool, EventPool, LogEvent, PooledBuf};
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;
pub use writer::{ResponseWriter, Transport};
