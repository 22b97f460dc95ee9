//! Log sinks for access and failure events.

use std::sync::Arc;

use tracing::{Span, error, info};

use crate::pool::LogEvent;

/// Receives one [`LogEvent`] with the request's span as the logger handle.
///
/// The event goes back to its pool when the sink returns; copy out anything
/// that must outlive the call.
pub type LogSink = Arc<dyn Fn(&Span, &LogEvent) + Send + Sync>;

/// Emits access events at `INFO`.
pub fn default_access_log() -> LogSink {
    Arc::new(|span: &Span, event: &LogEvent| {
        info!(
            parent: span,
            request_id = %event.request_id,
            client_ip = %event.client_ip,
            method = %event.method,
            path = %event.path,
            query = %event.query,
            status = event.status,
            status_text = event.status_text,
            latency = ?event.latency,
            user_agent = %event.user_agent,
            content_type = %event.content_type,
            body = %event.body,
            response = %event.response,
            "{}",
            event.message,
        );
    })
}

/// Emits failure events at `ERROR`, with the error and stack.
pub fn default_failure_log() -> LogSink {
    Arc::new(|span: &Span, event: &LogEvent| {
        let err = event.error.as_ref().map(ToString::to_string).unwrap_or_default();
        error!(
            parent: span,
            request_id = %event.request_id,
            client_ip = %event.client_ip,
            method = %event.method,
            path = %event.path,
            query = %event.query,
            status = event.status,
            status_text = event.status_text,
            latency = ?event.latency,
            user_agent = %event.user_agent,
            content_type = %event.content_type,
            body = %event.body,
            error = %err,
            stack = %event.stack,
            "{}",
            event.message,
        );
    })
}
