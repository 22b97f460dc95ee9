//! JSON endpoints behind the full pipeline, plus a metrics endpoint.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice"}'
//!   curl http://localhost:3000/panic
//!   curl http://localhost:3000/metrics

use std::sync::{Arc, OnceLock};

use http::StatusCode;
use kiln::{Config, Pipeline, Request, Response, Router, Server};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

static REGISTRY: OnceLock<Arc<Registry>> = OnceLock::new();

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let app = Router::new()
        .get("/users/{id}", get_user)
        .post("/users", create_user)
        .get("/panic", explode)
        .get("/metrics", metrics);

    let pipeline = Pipeline::new(&Config::default(), app);
    let mut registry = Registry::default();
    pipeline.metrics().register(&mut registry);
    let _ = REGISTRY.set(Arc::new(registry));
    let metrics = Arc::clone(pipeline.metrics());

    Server::bind("0.0.0.0:3000")
        .serve(pipeline)
        .await
        .expect("server error");

    metrics.unregister();
}

// GET /users/{id}
async fn get_user(req: Request) -> Response {
    let id = req.param("id").unwrap_or("unknown");
    Response::json(format!(r#"{{"id":"{id}","name":"alice"}}"#))
}

// POST /users
async fn create_user(req: Request) -> Response {
    if req.body().is_empty() {
        return Response::status(StatusCode::BAD_REQUEST);
    }
    Response::builder()
        .status(StatusCode::CREATED)
        .header("location", "/users/99")
        .json(r#"{"id":"99","name":"new_user"}"#)
}

// GET /panic → logged failure event, client sees a plain 500
async fn explode(_req: Request) -> Response {
    panic!("something went very wrong")
}

// GET /metrics (skipped by the access log)
async fn metrics(_req: Request) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    if let Some(registry) = REGISTRY.get() {
        encode(&mut out, registry)?;
    }
    Ok(out)
}
