//! Reusable structured log events.

use std::time::Duration;

use super::{Pool, Recycle};
use crate::error::BoxError;

const DEFAULT_MAX_IDLE: usize = 1024;

/// One access or failure occurrence, handed to a [`LogSink`](crate::LogSink).
///
/// Field names double as the stable keys the default sinks emit:
/// `message`, `request_id`, `client_ip`, `method`, `path`, `query`,
/// `status`, `status_text`, `latency`, `user_agent`, `content_type`,
/// `body`, `response`, `error` and `stack`.
#[derive(Debug, Default)]
pub struct LogEvent {
    pub message: String,
    pub request_id: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub query: String,
    pub status: u16,
    pub status_text: &'static str,
    pub latency: Duration,
    pub user_agent: String,
    pub content_type: String,
    /// Captured request body, lossily decoded.
    pub body: String,
    /// Captured response body, lossily decoded.
    pub response: String,
    pub error: Option<BoxError>,
    pub stack: String,
}

impl Recycle for LogEvent {
    fn recycle(&mut self) {
        self.message.clear();
        self.request_id.clear();
        self.client_ip.clear();
        self.method.clear();
        self.path.clear();
        self.query.clear();
        self.status = 0;
        self.status_text = "";
        self.latency = Duration::ZERO;
        self.user_agent.clear();
        self.content_type.clear();
        self.body.clear();
        self.response.clear();
        // Dropping here releases whatever the error points at.
        self.error = None;
        self.stack.clear();
    }
}

/// Pool of [`LogEvent`]s, one per in-flight log action.
pub struct EventPool(Pool<LogEvent>);

impl EventPool {
    /// Creates a pool retaining at most `max_idle` events.
    pub fn new(max_idle: usize) -> Self {
        Self(Pool::new(max_idle, LogEvent::default))
    }

    /// Returns a cleared event.
    pub fn get(&self) -> LogEvent {
        self.0.get()
    }

    /// Clears `event` and keeps it for reuse.
    pub fn put(&self, event: LogEvent) {
        self.0.put(event);
    }

    /// Number of events waiting for reuse.
    pub fn idle(&self) -> usize {
        self.0.idle()
    }
}

impl Default for EventPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::Panic;

    #[test]
    fn put_clears_every_field() {
        let pool = EventPool::default();
        let mut event = pool.get();
        event.message.push_str("panic recovered");
        event.request_id.push_str("abc");
        event.path.push_str("/orders");
        event.status = 500;
        event.status_text = "Internal Server Error";
        event.latency = Duration::from_millis(12);
        event.body.push_str(r#"{"secret":true}"#);
        event.error = Some(Box::new(Panic("boom".into())));
        event.stack.push_str("frame 0");
        pool.put(event);

        let event = pool.get();
        assert!(event.message.is_empty());
        assert!(event.request_id.is_empty());
        assert!(event.path.is_empty());
        assert!(event.body.is_empty());
        assert!(event.stack.is_empty());
        assert!(event.error.is_none());
        assert_eq!(event.status, 0);
        assert_eq!(event.status_text, "");
        assert_eq!(event.latency, Duration::ZERO);
    }

    #[test]
    fn recycled_event_keeps_allocations() {
        let pool = EventPool::new(1);
        let mut event = pool.get();
        event.body.push_str(&"x".repeat(4096));
        pool.put(event);

        assert!(pool.get().body.capacity() >= 4096);
    }
}
