//! Response writing.
//!
//! Handlers never see the connection. They write through a [`ResponseWriter`],
//! which holds the status and headers until the first body write (or the end
//! of the request), then forwards everything to a [`Transport`]. The writer
//! can carry a capture tee: once the head goes out with a content type the
//! tee admits, every byte that reaches the transport is also appended to a
//! pooled buffer, without changing what the client receives or when.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use tracing::debug;

use crate::config::ContentTypeFilter;
use crate::pool::{BufferPool, PooledBuf};

/// The real sink for a response: a connection, a channel, a test recorder.
pub trait Transport: Send {
    /// Sends the status line and headers. Called at most once.
    fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()>;

    /// Sends one chunk of the body.
    fn send_data(&mut self, data: Bytes) -> io::Result<()>;
}

/// Per-request response writer.
pub struct ResponseWriter {
    transport: Box<dyn Transport>,
    status: StatusCode,
    headers: HeaderMap,
    head_sent: bool,
    closed: bool,
    size: usize,
    capture: Option<Tee>,
}

// The buffer is leased when the head is sent, and only for admitted types.
struct Tee {
    buffers: Arc<BufferPool>,
    filter: ContentTypeFilter,
    buf: Option<PooledBuf>,
}

impl ResponseWriter {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head_sent: false,
            closed: false,
            size: 0,
            capture: None,
        }
    }

    /// The status that was (or will be) sent.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Sets the status. Ignored once the head has gone out.
    pub fn write_header(&mut self, status: StatusCode) {
        if self.head_sent {
            debug!(%status, current = %self.status, "response head already sent");
            return;
        }
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable headers. Changes after the head is sent are not transmitted.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Whether the head has been sent.
    pub fn written(&self) -> bool {
        self.head_sent
    }

    /// Body bytes forwarded so far.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Writes `data` to the client, sending the head first if needed.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.flush_head()?;
        if data.is_empty() {
            return Ok(0);
        }
        self.transport.send_data(Bytes::copy_from_slice(data))?;
        if let Some(buf) = self.capture.as_mut().and_then(|tee| tee.buf.as_mut()) {
            buf.extend_from_slice(data);
        }
        self.size += data.len();
        Ok(data.len())
    }

    /// Sends the head now if it has not been sent.
    pub fn flush_head(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "response writer closed"));
        }
        if !self.head_sent {
            self.head_sent = true;
            self.admit_capture();
            self.transport.send_head(self.status, self.headers.clone())?;
        }
        Ok(())
    }

    fn admit_capture(&mut self) {
        let Some(tee) = self.capture.as_mut() else {
            return;
        };
        let content_type = self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        if (tee.filter)(content_type) {
            tee.buf = Some(tee.buffers.lease(0));
        } else {
            self.capture = None;
        }
    }

    /// Stops all further output; the connection is considered gone.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Sends a head-only response if nothing was written.
    pub(crate) fn finish(&mut self) {
        if self.closed || self.head_sent {
            return;
        }
        if let Err(e) = self.flush_head() {
            debug!("finishing response: {e}");
        }
    }

    /// Tees the body into a buffer from `buffers` if `filter` admits the
    /// response content type.
    pub(crate) fn attach_capture(&mut self, buffers: Arc<BufferPool>, filter: ContentTypeFilter) {
        self.capture = Some(Tee { buffers, filter, buf: None });
        if self.head_sent {
            self.admit_capture();
        }
    }

    /// Drops the tee; its buffer goes back to the pool.
    pub(crate) fn detach_capture(&mut self) {
        self.capture = None;
    }

    pub(crate) fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Bytes captured so far, or `None` when no capture is attached or the
    /// response content type was not admitted.
    pub fn captured(&self) -> Option<&[u8]> {
        self.capture
            .as_ref()
            .map(|tee| tee.buf.as_deref().map_or(&[][..], Vec::as_slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::Config;
    use crate::testing::MemoryTransport;

    fn text_writer(transport: MemoryTransport) -> ResponseWriter {
        let mut writer = ResponseWriter::new(transport);
        writer.headers_mut().insert(CONTENT_TYPE, "text/plain".parse().unwrap());
        writer
    }

    #[test]
    fn head_is_deferred_until_first_write() {
        let (transport, sent) = MemoryTransport::new();
        let mut writer = ResponseWriter::new(transport);
        writer.write_header(StatusCode::CREATED);
        writer.headers_mut().insert("x-one", "1".parse().unwrap());
        assert!(sent.head().is_none());

        writer.write(b"hello").unwrap();
        writer.write_header(StatusCode::NOT_FOUND);

        let (status, headers) = sent.head().unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers["x-one"], "1");
        assert_eq!(writer.status(), StatusCode::CREATED);
        assert_eq!(sent.body(), b"hello");
    }

    #[test]
    fn capture_duplicates_forwarded_bytes() {
        let pool = Arc::new(BufferPool::default());
        let (transport, sent) = MemoryTransport::new();
        let mut writer = text_writer(transport);
        assert!(writer.captured().is_none());

        writer.attach_capture(Arc::clone(&pool), Config::default().body_filter);
        assert_eq!(writer.captured(), Some(&b""[..]));
        writer.write(b"abc").unwrap();
        writer.write(b"def").unwrap();

        assert_eq!(writer.captured(), Some(&b"abcdef"[..]));
        assert_eq!(sent.body(), b"abcdef");
        assert_eq!(writer.size(), 6);

        writer.detach_capture();
        assert_eq!(pool.idle()[0], 1);
    }

    #[test]
    fn binary_response_is_not_teed() {
        let pool = Arc::new(BufferPool::default());
        let (transport, sent) = MemoryTransport::new();
        let mut writer = ResponseWriter::new(transport);
        writer
            .headers_mut()
            .insert(CONTENT_TYPE, "application/octet-stream".parse().unwrap());
        writer.attach_capture(Arc::clone(&pool), Config::default().body_filter);

        writer.write(&[0xde, 0xad, 0xbe, 0xef]).unwrap();

        assert!(writer.captured().is_none());
        assert!(!writer.is_capturing());
        assert_eq!(sent.body(), [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(pool.idle(), [0; 6]);
    }

    #[test]
    fn failed_writes_are_not_captured() {
        let pool = Arc::new(BufferPool::default());
        let (transport, sent) = MemoryTransport::new();
        let mut writer = text_writer(transport);
        writer.attach_capture(Arc::clone(&pool), Config::default().body_filter);
        writer.write(b"ok").unwrap();

        sent.disconnect();
        let err = writer.write(b"lost").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(writer.captured(), Some(&b"ok"[..]));
    }

    #[test]
    fn closed_writer_sends_nothing() {
        let (transport, sent) = MemoryTransport::new();
        let mut writer = ResponseWriter::new(transport);
        writer.close();
        writer.finish();
        assert!(writer.write(b"x").is_err());
        assert!(sent.head().is_none());
    }

    #[test]
    fn finish_sends_empty_head() {
        let (transport, sent) = MemoryTransport::new();
        let mut writer = ResponseWriter::new(transport);
        writer.write_header(StatusCode::NO_CONTENT);
        writer.finish();
        assert_eq!(sent.head().unwrap().0, StatusCode::NO_CONTENT);
        assert!(sent.body().is_empty());
    }
}
