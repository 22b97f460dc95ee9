//! Request and response body capture.
//!
//! A transport body can be read once. The capture layer buffers the request
//! body on first read, puts a fresh stream over the copy back on the
//! context, and answers every later read from the buffer. On the response
//! side it attaches a tee to the [`ResponseWriter`](crate::ResponseWriter)
//! that receives a copy of every byte sent to the client.
//!
//! Only bodies whose content type passes the configured filter are
//! captured; anything else streams straight through. Buffers are leased
//! from the [`BufferPool`] and go back when the layer is left. They are
//! also returned if the context is dropped while unwinding.

use std::sync::Arc;

use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http_body_util::{BodyExt, Full};

use super::{BoxFuture, Middleware, Next};
use crate::config::ContentTypeFilter;
use crate::context::Context;
use crate::error::CaptureError;
use crate::pool::{BufferPool, PooledBuf, SIZE_CLASSES};

/// Request-side capture state stored on the [`Context`].
pub(crate) struct RequestCapture {
    buf: PooledBuf,
    filled: bool,
    // Shared by the replay stream and the handler's `Request`.
    replay: Bytes,
}

/// Middleware installing body capture for the duration of a request.
pub struct BodyCapture {
    buffers: Arc<BufferPool>,
    filter: ContentTypeFilter,
}

impl BodyCapture {
    /// Captures bodies whose content type `filter` admits.
    pub fn new(buffers: Arc<BufferPool>, filter: ContentTypeFilter) -> Self {
        Self { buffers, filter }
    }

    /// Installs capture on `ctx`.
    ///
    /// The request buffer is leased only for an admitted request content
    /// type and is sized from `content-length`, capped at the largest size
    /// class. The response tee decides when the head is sent. Installing
    /// twice keeps the first capture.
    pub fn install(&self, ctx: &mut Context) {
        if ctx.capture.is_some() || ctx.writer.is_capturing() {
            return;
        }
        if (self.filter)(ctx.content_type()) {
            let hint = ctx
                .header(CONTENT_LENGTH.as_str())
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0)
                .min(SIZE_CLASSES[SIZE_CLASSES.len() - 1]);
            ctx.capture = Some(RequestCapture {
                buf: self.buffers.lease(hint),
                filled: false,
                replay: Bytes::new(),
            });
        }
        ctx.writer.attach_capture(Arc::clone(&self.buffers), Arc::clone(&self.filter));
    }

    /// Returns both buffers to the pool. Captured data is gone afterwards.
    pub fn remove(&self, ctx: &mut Context) {
        drop(ctx.capture.take());
        ctx.writer.detach_capture();
    }
}

impl Middleware for BodyCapture {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a> {
        Box::pin(async move {
            self.install(ctx);
            next.run(ctx).await;
            self.remove(ctx);
        })
    }
}

impl Context {
    /// Returns the full request body, buffering it on the first call.
    ///
    /// The transport stream is consumed exactly once. Afterwards the request
    /// carries a fresh body over the buffered copy for downstream readers,
    /// and every later call returns the same bytes.
    ///
    /// Fails with [`CaptureError::NotFound`] if no capture is installed. A
    /// transport error is reported once; whatever arrived before it stays
    /// buffered.
    pub async fn read_request_body(&mut self) -> Result<&[u8], CaptureError> {
        let capture = self.capture.as_mut().ok_or(CaptureError::NotFound)?;
        if !capture.filled {
            capture.filled = true;

            let mut outcome = Ok(());
            if let Some(mut body) = self.body.take() {
                while let Some(frame) = body.frame().await {
                    match frame {
                        Ok(frame) => {
                            if let Ok(data) = frame.into_data() {
                                capture.buf.extend_from_slice(&data);
                            }
                        }
                        Err(e) => {
                            outcome = Err(CaptureError::Read(e));
                            break;
                        }
                    }
                }
            }

            capture.replay = Bytes::copy_from_slice(&capture.buf);
            let replay = Full::new(capture.replay.clone());
            self.body = Some(replay.map_err(|never| match never {}).boxed_unsync());
            outcome?;
        }
        Ok(&capture.buf)
    }

    /// Returns what has been written to the client so far.
    ///
    /// [`CaptureError::NotFound`] if no capture is installed,
    /// [`CaptureError::Empty`] if nothing has been written yet.
    pub fn response_body(&self) -> Result<&[u8], CaptureError> {
        match self.writer.captured() {
            None => Err(CaptureError::NotFound),
            Some([]) => Err(CaptureError::Empty),
            Some(bytes) => Ok(bytes),
        }
    }

    /// The buffered request body as shared [`Bytes`], without another copy.
    pub(crate) async fn request_bytes(&mut self) -> Result<Bytes, CaptureError> {
        self.read_request_body().await?;
        self.capture
            .as_ref()
            .map(|capture| capture.replay.clone())
            .ok_or(CaptureError::NotFound)
    }

    pub(crate) fn has_capture(&self) -> bool {
        self.capture.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::Ordering;

    use futures::FutureExt;

    use crate::testing::{CountingBody, TestRequest};
    use crate::{Config, ContentType, Pipeline, Request, Response, Router};

    fn body_capture(pool: &Arc<BufferPool>) -> BodyCapture {
        BodyCapture::new(Arc::clone(pool), Config::default().body_filter)
    }

    async fn echo(req: Request) -> Response {
        Response::builder().bytes(ContentType::Text, req.body().to_vec())
    }

    async fn explode(_req: Request) -> Response {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn request_body_is_read_from_transport_once() {
        let pool = Arc::new(BufferPool::default());
        let capture = body_capture(&pool);
        let (body, reads) = CountingBody::new(b"{\"id\":1}");
        let (mut ctx, _) = TestRequest::post("/")
            .header("content-type", "application/json")
            .raw_body(body)
            .build();
        capture.install(&mut ctx);

        for _ in 0..5 {
            assert_eq!(ctx.read_request_body().await.unwrap(), b"{\"id\":1}");
        }
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        let replay = ctx.take_body().unwrap().collect().await.unwrap().to_bytes();
        assert_eq!(&replay[..], b"{\"id\":1}");
        assert_eq!(ctx.read_request_body().await.unwrap(), b"{\"id\":1}");
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_bytes_share_one_copy() {
        let pool = Arc::new(BufferPool::default());
        let (mut ctx, _) = TestRequest::post("/")
            .header("content-type", "application/json")
            .body(b"{\"id\":2}")
            .build();
        body_capture(&pool).install(&mut ctx);

        let first = ctx.request_bytes().await.unwrap();
        let second = ctx.request_bytes().await.unwrap();
        assert_eq!(&first[..], b"{\"id\":2}");
        assert_eq!(first.as_ptr(), second.as_ptr());
    }

    #[tokio::test]
    async fn binary_request_is_not_captured() {
        let pool = Arc::new(BufferPool::default());
        let capture = body_capture(&pool);
        let (mut ctx, _) = TestRequest::post("/upload")
            .header("content-type", "application/octet-stream")
            .header("content-length", "200000")
            .body(&[0xff; 16])
            .build();
        capture.install(&mut ctx);

        assert!(!ctx.has_capture());
        assert!(matches!(ctx.read_request_body().await, Err(CaptureError::NotFound)));
        let body = ctx.take_body().unwrap().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], &[0xff; 16]);

        capture.remove(&mut ctx);
        assert_eq!(pool.idle(), [0; 6]);
    }

    #[tokio::test]
    async fn binary_bodies_stream_through_the_pipeline() {
        async fn download(req: Request) -> Response {
            Response::builder().bytes(ContentType::OctetStream, req.body().to_vec())
        }

        let pool = Arc::new(BufferPool::default());
        let pipeline = Pipeline::bare(Router::new().post("/blob", download)).layer(body_capture(&pool));
        let (mut ctx, sent) = TestRequest::post("/blob")
            .header("content-type", "application/octet-stream")
            .body(&[1, 2, 3])
            .build();

        pipeline.run(&mut ctx).await;

        assert_eq!(sent.body(), [1, 2, 3]);
        assert!(matches!(ctx.response_body(), Err(CaptureError::NotFound)));
        assert_eq!(pool.idle(), [0; 6]);
    }

    #[tokio::test]
    async fn uncaptured_request_reports_not_found() {
        let (mut ctx, _) = TestRequest::post("/").body(b"data").build();
        assert!(matches!(ctx.read_request_body().await, Err(CaptureError::NotFound)));
        assert!(matches!(ctx.response_body(), Err(CaptureError::NotFound)));
    }

    #[test]
    fn response_body_tracks_writes() {
        let pool = Arc::new(BufferPool::default());
        let capture = body_capture(&pool);
        let (mut ctx, sent) = TestRequest::get("/").build();
        capture.install(&mut ctx);
        ctx.writer_mut().headers_mut().insert("content-type", "text/plain".parse().unwrap());

        assert!(matches!(ctx.response_body(), Err(CaptureError::Empty)));
        ctx.writer_mut().write(b"first,").unwrap();
        ctx.writer_mut().write(b"second").unwrap();
        assert_eq!(ctx.response_body().unwrap(), b"first,second");
        assert_eq!(sent.body(), b"first,second");

        capture.remove(&mut ctx);
        assert!(matches!(ctx.response_body(), Err(CaptureError::NotFound)));
    }

    #[test]
    fn content_length_sizes_the_request_buffer() {
        let pool = Arc::new(BufferPool::default());
        let capture = body_capture(&pool);
        let (mut ctx, _) = TestRequest::post("/")
            .header("content-type", "application/json")
            .header("content-length", "20000")
            .build();
        capture.install(&mut ctx);
        capture.remove(&mut ctx);

        let idle = pool.idle();
        assert_eq!(idle[0], 0);
        assert_eq!(idle[2], 1);
    }

    #[tokio::test]
    async fn buffers_return_after_normal_completion() {
        let pool = Arc::new(BufferPool::default());
        let pipeline = Pipeline::bare(Router::new().post("/echo", echo))
            .layer(body_capture(&pool));
        let (mut ctx, sent) = TestRequest::post("/echo")
            .header("content-type", "text/plain")
            .body(b"ping")
            .build();

        pipeline.run(&mut ctx).await;

        assert_eq!(sent.body(), b"ping");
        assert!(!ctx.has_capture());
        assert_eq!(pool.idle()[0], 2);
    }

    #[tokio::test]
    async fn buffers_return_when_a_panic_escapes() {
        let pool = Arc::new(BufferPool::default());
        let pipeline = Pipeline::bare(Router::new().get("/", explode))
            .layer(body_capture(&pool));
        let (mut ctx, _) = TestRequest::get("/").header("content-type", "application/json").build();

        let outcome = AssertUnwindSafe(pipeline.run(&mut ctx)).catch_unwind().await;
        assert!(outcome.is_err());
        assert_eq!(pool.idle()[0], 0);

        drop(ctx);
        assert_eq!(pool.idle()[0], 1);
    }
}
