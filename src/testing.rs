//! Test doubles: an in-memory transport, a poll-counting body and a
//! request builder.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame};

use crate::context::{Context, RequestBody};
use crate::writer::{ResponseWriter, Transport};

#[derive(Default)]
struct Recorded {
    head: Option<(StatusCode, HeaderMap)>,
    body: Vec<u8>,
    disconnected: bool,
}

/// What a [`MemoryTransport`] received.
#[derive(Clone, Default)]
pub(crate) struct Sent(Arc<Mutex<Recorded>>);

impl Sent {
    pub(crate) fn head(&self) -> Option<(StatusCode, HeaderMap)> {
        self.0.lock().unwrap().head.clone()
    }

    pub(crate) fn status(&self) -> Option<StatusCode> {
        self.head().map(|(status, _)| status)
    }

    pub(crate) fn body(&self) -> Vec<u8> {
        self.0.lock().unwrap().body.clone()
    }

    pub(crate) fn body_text(&self) -> String {
        String::from_utf8(self.body()).unwrap()
    }

    /// Makes every later send fail as if the client hung up.
    pub(crate) fn disconnect(&self) {
        self.0.lock().unwrap().disconnected = true;
    }
}

pub(crate) struct MemoryTransport(Sent);

impl MemoryTransport {
    pub(crate) fn new() -> (Self, Sent) {
        let sent = Sent::default();
        (Self(sent.clone()), sent)
    }
}

impl Transport for MemoryTransport {
    fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()> {
        let mut rec = self.0.0.lock().unwrap();
        if rec.disconnected {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        rec.head = Some((status, headers));
        Ok(())
    }

    fn send_data(&mut self, data: Bytes) -> io::Result<()> {
        let mut rec = self.0.0.lock().unwrap();
        if rec.disconnected {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        rec.body.extend_from_slice(&data);
        Ok(())
    }
}

/// A body yielding one chunk, counting how often it hands out data.
pub(crate) struct CountingBody {
    chunk: Option<Bytes>,
    reads: Arc<AtomicUsize>,
}

impl CountingBody {
    pub(crate) fn new(data: &'static [u8]) -> (Self, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let body = Self { chunk: Some(Bytes::from_static(data)), reads: Arc::clone(&reads) };
        (body, reads)
    }
}

impl Body for CountingBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        match self.chunk.take() {
            Some(chunk) => {
                self.reads.fetch_add(1, Ordering::SeqCst);
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            None => Poll::Ready(None),
        }
    }
}

/// Builder for a [`Context`] backed by a [`MemoryTransport`].
pub(crate) struct TestRequest {
    builder: http::request::Builder,
    body: RequestBody,
}

impl TestRequest {
    pub(crate) fn new(method: &str, uri: &str) -> Self {
        Self {
            builder: http::Request::builder().method(method).uri(uri),
            body: boxed(Full::new(Bytes::new())),
        }
    }

    pub(crate) fn get(uri: &str) -> Self {
        Self::new("GET", uri)
    }

    pub(crate) fn post(uri: &str) -> Self {
        Self::new("POST", uri)
    }

    pub(crate) fn header(mut self, name: &str, value: &str) -> Self {
        self.builder = self.builder.header(name, value);
        self
    }

    pub(crate) fn body(mut self, data: &'static [u8]) -> Self {
        self.body = boxed(Full::new(Bytes::from_static(data)));
        self
    }

    pub(crate) fn raw_body(mut self, body: impl Body<Data = Bytes, Error = Infallible> + Send + 'static) -> Self {
        self.body = boxed(body);
        self
    }

    pub(crate) fn build(self) -> (Context, Sent) {
        let (transport, sent) = MemoryTransport::new();
        let request = self.builder.body(self.body).unwrap();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        (Context::new(request, Some(peer), ResponseWriter::new(transport)), sent)
    }
}

fn boxed(body: impl Body<Data = Bytes, Error = Infallible> + Send + 'static) -> RequestBody {
    body.map_err(|never| match never {}).boxed_unsync()
}
